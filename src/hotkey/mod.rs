use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HotkeyPhase {
    Pressed,
    Released,
}

#[derive(Debug, thiserror::Error)]
pub enum HotkeyError {
    #[error("push-to-talk hotkey cannot be empty")]
    EmptyBinding,
    #[error("push-to-talk hotkey has invalid token '{token}'")]
    InvalidToken { token: String },
    #[error("push-to-talk hotkey must include exactly one non-modifier key")]
    MissingMainKey,
}

/// A parsed push-to-talk combination such as `Space` or `Ctrl+Alt+V`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushToTalkBinding {
    ctrl: bool,
    shift: bool,
    alt: bool,
    super_key: bool,
    key: String,
    normalized: String,
}

impl PushToTalkBinding {
    pub fn parse(combo: &str) -> Result<Self, HotkeyError> {
        let normalized = normalize_combo(combo)?;
        let mut binding = Self {
            ctrl: false,
            shift: false,
            alt: false,
            super_key: false,
            key: String::new(),
            normalized: normalized.clone(),
        };
        for token in normalized.split('+') {
            match token {
                "CTRL" => binding.ctrl = true,
                "SHIFT" => binding.shift = true,
                "ALT" => binding.alt = true,
                "SUPER" => binding.super_key = true,
                key => binding.key = key.to_string(),
            }
        }
        Ok(binding)
    }

    pub fn as_str(&self) -> &str {
        &self.normalized
    }

    fn matches_key(&self, event: &KeyEvent) -> bool {
        normalize_key(&event.key).is_some_and(|key| key == self.key)
    }

    fn matches(&self, event: &KeyEvent) -> bool {
        self.matches_key(event)
            && event.ctrl == self.ctrl
            && event.shift == self.shift
            && event.alt == self.alt
            && event.super_key == self.super_key
    }
}

/// A keyboard event as delivered by the host UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: String,
    pub ctrl: bool,
    pub shift: bool,
    pub alt: bool,
    pub super_key: bool,
    /// OS auto-repeat while the key is held.
    pub repeat: bool,
    /// Focus is in a text input, where the key belongs to the user.
    pub typing_in_input: bool,
}

impl KeyEvent {
    pub fn key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            ..Self::default()
        }
    }

    pub fn with_ctrl(mut self) -> Self {
        self.ctrl = true;
        self
    }

    pub fn with_alt(mut self) -> Self {
        self.alt = true;
        self
    }

    pub fn repeated(mut self) -> Self {
        self.repeat = true;
        self
    }

    pub fn in_text_input(mut self) -> Self {
        self.typing_in_input = true;
        self
    }
}

/// Turns raw key-down/key-up traffic into one press and one release per hold.
#[derive(Debug, Clone)]
pub struct PushToTalkTracker {
    binding: PushToTalkBinding,
    held: bool,
}

impl PushToTalkTracker {
    pub fn new(binding: PushToTalkBinding) -> Self {
        Self {
            binding,
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn key_down(&mut self, event: &KeyEvent) -> Option<HotkeyPhase> {
        if self.held || event.repeat || event.typing_in_input || !self.binding.matches(event) {
            return None;
        }
        self.held = true;
        Some(HotkeyPhase::Pressed)
    }

    /// Modifiers may already be up when the main key is released.
    pub fn key_up(&mut self, event: &KeyEvent) -> Option<HotkeyPhase> {
        if !self.held || !self.binding.matches_key(event) {
            return None;
        }
        self.held = false;
        Some(HotkeyPhase::Released)
    }

    /// Focus loss: the key-up will never arrive.
    pub fn reset(&mut self) -> Option<HotkeyPhase> {
        if !self.held {
            return None;
        }
        self.held = false;
        Some(HotkeyPhase::Released)
    }
}

fn normalize_combo(combo: &str) -> Result<String, HotkeyError> {
    if combo.trim().is_empty() {
        return Err(HotkeyError::EmptyBinding);
    }

    let modifier_aliases = [
        ("CTRL", "CTRL"),
        ("CONTROL", "CTRL"),
        ("SHIFT", "SHIFT"),
        ("ALT", "ALT"),
        ("OPTION", "ALT"),
        ("WIN", "SUPER"),
        ("WINDOWS", "SUPER"),
        ("META", "SUPER"),
        ("CMD", "SUPER"),
        ("SUPER", "SUPER"),
    ];

    let mut modifiers = BTreeSet::new();
    let mut main_keys = Vec::new();

    for raw in combo.split('+') {
        let token = raw.trim().to_uppercase();
        if token.is_empty() {
            return Err(HotkeyError::InvalidToken {
                token: raw.to_string(),
            });
        }

        if let Some((_, normalized)) = modifier_aliases.iter().find(|(alias, _)| *alias == token) {
            modifiers.insert(*normalized);
            continue;
        }

        match normalize_key(&token) {
            Some(key) => main_keys.push(key),
            None => return Err(HotkeyError::InvalidToken { token }),
        }
    }

    if main_keys.len() != 1 {
        return Err(HotkeyError::MissingMainKey);
    }

    let mut ordered = modifiers.into_iter().map(str::to_string).collect::<Vec<_>>();
    ordered.push(main_keys.remove(0));
    Ok(ordered.join("+"))
}

fn normalize_key(raw: &str) -> Option<String> {
    if raw == " " {
        return Some("SPACE".to_string());
    }
    let token = raw.trim().to_uppercase();
    let token = match token.as_str() {
        "SPACEBAR" => "SPACE".to_string(),
        _ => token
            .strip_prefix("KEY")
            .filter(|suffix| suffix.len() == 1)
            .map(str::to_string)
            .unwrap_or(token),
    };

    let is_function_key = token
        .strip_prefix('F')
        .and_then(|suffix| suffix.parse::<u8>().ok())
        .is_some_and(|n| (1..=24).contains(&n));
    let is_single_alnum = token.len() == 1 && token.chars().all(|c| c.is_ascii_alphanumeric());

    (token == "SPACE" || is_function_key || is_single_alnum).then_some(token)
}
