mod rules;

pub use rules::{canonical_rules, compact_secret, spoken_email};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::{cmp::Reverse, collections::BTreeMap, fmt};
use tracing::debug;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const MATCH_CONFIDENCE: f32 = 0.95;

// Spoken punctuation the recognizer inserts between words.
const SEPARATORS: [char; 6] = ['¿', '¡', '?', '!', ',', ';'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    FillEmail,
    FillPassword,
    FillConfirmPassword,
    ClearForm,
    SubmitForm,
    SubmitLogin,
    CreateAccount,
    CapturePhoto,
    UploadImage,
    NavigateLogin,
    NavigateRegister,
    NavigateCamera,
    PlayAudio,
    PauseAudio,
    ReplayAudio,
    EndSession,
    StopListening,
    ShowHelp,
    Unknown,
}

pub type CommandParameters = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("capture group '{0}' did not match")]
    MissingGroup(&'static str),
    #[error("extracted value is empty")]
    EmptyValue,
    #[error("utterance rejected: {0}")]
    Rejected(&'static str),
}

/// A successful matcher hit handed to an extractor.
pub struct RuleMatch<'t> {
    text: &'t str,
    captures: Option<Captures<'t>>,
}

impl<'t> RuleMatch<'t> {
    /// The full normalized utterance, not just the matched span.
    pub fn text(&self) -> &'t str {
        self.text
    }

    pub fn group(&self, name: &'static str) -> Result<&'t str, ExtractError> {
        let value = self
            .captures
            .as_ref()
            .and_then(|captures| captures.name(name))
            .map(|found| found.as_str().trim())
            .ok_or(ExtractError::MissingGroup(name))?;
        if value.is_empty() {
            return Err(ExtractError::EmptyValue);
        }
        Ok(value)
    }
}

pub type Extractor = fn(&RuleMatch<'_>) -> Result<CommandParameters, ExtractError>;

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Substring of the normalized utterance.
    Literal(String),
    Pattern(Regex),
}

impl Matcher {
    pub fn literal(text: &str) -> Self {
        Matcher::Literal(normalize(text))
    }

    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Matcher::Pattern)
    }

    fn find<'t>(&self, text: &'t str) -> Option<RuleMatch<'t>> {
        match self {
            Matcher::Literal(needle) => (!needle.is_empty() && text.contains(needle.as_str()))
                .then_some(RuleMatch {
                    text,
                    captures: None,
                }),
            Matcher::Pattern(regex) => regex.captures(text).map(|captures| RuleMatch {
                text,
                captures: Some(captures),
            }),
        }
    }
}

#[derive(Clone)]
pub struct CommandRule {
    id: &'static str,
    matcher: Matcher,
    action_kind: ActionKind,
    extractor: Option<Extractor>,
    priority: i32,
    requires_confirmation: bool,
    description: &'static str,
}

impl CommandRule {
    pub fn new(id: &'static str, matcher: Matcher, action_kind: ActionKind) -> Self {
        Self {
            id,
            matcher,
            action_kind,
            extractor: None,
            priority: 0,
            requires_confirmation: false,
            description: "",
        }
    }

    pub fn literal(id: &'static str, text: &str, action_kind: ActionKind) -> Self {
        Self::new(id, Matcher::literal(text), action_kind)
    }

    pub fn pattern(
        id: &'static str,
        pattern: &str,
        action_kind: ActionKind,
    ) -> Result<Self, regex::Error> {
        Ok(Self::new(id, Matcher::pattern(pattern)?, action_kind))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn described(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn action_kind(&self) -> ActionKind {
        self.action_kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn requires_confirmation(&self) -> bool {
        self.requires_confirmation
    }
}

impl fmt::Debug for CommandRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRule")
            .field("id", &self.id)
            .field("matcher", &self.matcher)
            .field("action_kind", &self.action_kind)
            .field("has_extractor", &self.extractor.is_some())
            .field("priority", &self.priority)
            .field("requires_confirmation", &self.requires_confirmation)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedCommand {
    pub action_kind: ActionKind,
    pub parameters: CommandParameters,
    pub confidence: f32,
    pub original_text: String,
    pub normalized_text: String,
    pub rule_id: Option<&'static str>,
    pub requires_confirmation: bool,
}

impl ParsedCommand {
    pub fn unknown(original_text: &str, normalized_text: String) -> Self {
        Self {
            action_kind: ActionKind::Unknown,
            parameters: CommandParameters::new(),
            confidence: 0.0,
            original_text: original_text.to_string(),
            normalized_text,
            rule_id: None,
            requires_confirmation: false,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.action_kind == ActionKind::Unknown
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDescription {
    pub id: &'static str,
    pub action_kind: ActionKind,
    pub description: &'static str,
    pub priority: i32,
    pub requires_confirmation: bool,
}

/// Ordered, immutable rule table. Evaluation is priority-descending and
/// first-match-wins; equal priorities keep registration order.
#[derive(Debug, Clone)]
pub struct CommandInterpreter {
    rules: Vec<CommandRule>,
}

impl CommandInterpreter {
    pub fn new(mut rules: Vec<CommandRule>) -> Self {
        // sort_by_key is stable, which keeps ties in registration order.
        rules.sort_by_key(|rule| Reverse(rule.priority));
        Self { rules }
    }

    pub fn canonical() -> Result<Self, regex::Error> {
        Ok(Self::new(canonical_rules()?))
    }

    pub fn rules(&self) -> &[CommandRule] {
        &self.rules
    }

    pub fn interpret(&self, text: &str) -> ParsedCommand {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return ParsedCommand::unknown(text, normalized);
        }

        for rule in &self.rules {
            let Some(found) = rule.matcher.find(&normalized) else {
                continue;
            };
            let parameters = match rule.extractor {
                None => CommandParameters::new(),
                Some(extract) => match extract(&found) {
                    Ok(parameters) => parameters,
                    Err(err) => {
                        debug!(rule = rule.id, error = %err, "extractor declined match");
                        continue;
                    }
                },
            };
            return ParsedCommand {
                action_kind: rule.action_kind,
                parameters,
                confidence: MATCH_CONFIDENCE,
                original_text: text.to_string(),
                normalized_text: normalized,
                rule_id: Some(rule.id),
                requires_confirmation: rule.requires_confirmation,
            };
        }

        ParsedCommand::unknown(text, normalized)
    }

    pub fn describe(&self) -> Vec<RuleDescription> {
        self.rules
            .iter()
            .map(|rule| RuleDescription {
                id: rule.id,
                action_kind: rule.action_kind,
                description: rule.description,
                priority: rule.priority,
                requires_confirmation: rule.requires_confirmation,
            })
            .collect()
    }

    /// One line per described rule, for spoken or on-screen help.
    pub fn help_text(&self) -> String {
        self.rules
            .iter()
            .filter(|rule| !rule.description.is_empty())
            .map(|rule| rule.description)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Lower-cases, strips diacritics, turns spoken punctuation into spaces,
/// collapses whitespace and trims trailing periods. Idempotent.
pub fn normalize(text: &str) -> String {
    let stripped = text
        .to_lowercase()
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .map(|ch| if SEPARATORS.contains(&ch) { ' ' } else { ch })
        .collect::<String>();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|ch: char| ch == '.' || ch == ':' || ch.is_whitespace())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interpreter() -> CommandInterpreter {
        CommandInterpreter::canonical().expect("canonical rules should compile")
    }

    #[test]
    fn normalize_strips_case_accents_and_punctuation() {
        assert_eq!(normalize("  ¿Ir a la Cámara?  "), "ir a la camara");
        assert_eq!(normalize("Repetir contraseña, 1234."), "repetir contrasena 1234");
        assert_eq!(normalize("...:"), "");
    }

    #[test]
    fn normalize_is_idempotent() {
        for sample in [
            "Escribir Juan arroba Gmail punto com en E-mail.",
            "¡Capturar!",
            " ÁÉÍÓÚ ñ  ü ",
            "a . b",
            "İstanbul",
        ] {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "sample {sample:?}");
        }
    }

    #[test]
    fn ties_keep_registration_order() {
        let interpreter = CommandInterpreter::new(vec![
            CommandRule::literal("first", "foto", ActionKind::CapturePhoto).with_priority(10),
            CommandRule::literal("second", "foto", ActionKind::UploadImage).with_priority(10),
        ]);
        let parsed = interpreter.interpret("foto");
        assert_eq!(parsed.rule_id, Some("first"));
        assert_eq!(parsed.action_kind, ActionKind::CapturePhoto);
    }

    #[test]
    fn higher_priority_wins_regardless_of_registration() {
        let interpreter = CommandInterpreter::new(vec![
            CommandRule::literal("nav", "camara", ActionKind::NavigateCamera).with_priority(30),
            CommandRule::literal("capture", "capturar", ActionKind::CapturePhoto).with_priority(60),
        ]);
        assert_eq!(
            interpreter.interpret("capturar camara").action_kind,
            ActionKind::CapturePhoto
        );
        assert_eq!(
            interpreter.interpret("ir a camara").action_kind,
            ActionKind::NavigateCamera
        );
    }

    #[test]
    fn extractor_failure_falls_through_to_next_rule() {
        fn always_reject(_: &RuleMatch<'_>) -> Result<CommandParameters, ExtractError> {
            Err(ExtractError::Rejected("test"))
        }
        let interpreter = CommandInterpreter::new(vec![
            CommandRule::literal("rejecting", "ok", ActionKind::SubmitForm)
                .with_priority(50)
                .with_extractor(always_reject),
            CommandRule::literal("fallback", "ok", ActionKind::SubmitLogin).with_priority(10),
        ]);
        assert_eq!(interpreter.interpret("ok").rule_id, Some("fallback"));
    }

    #[test]
    fn unknown_keeps_original_text() {
        let parsed = interpreter().interpret("¿Qué hora es?");
        assert!(parsed.is_unknown());
        assert_eq!(parsed.original_text, "¿Qué hora es?");
        assert_eq!(parsed.confidence, 0.0);
        assert!(parsed.parameters.is_empty());
    }

    #[test]
    fn empty_text_is_unknown() {
        assert!(interpreter().interpret("").is_unknown());
        assert!(interpreter().interpret("   ¿?  ").is_unknown());
    }

    #[test]
    fn empty_literal_never_matches() {
        let interpreter =
            CommandInterpreter::new(vec![CommandRule::literal("blank", "  ", ActionKind::ShowHelp)]);
        assert!(interpreter.interpret("cualquier cosa").is_unknown());
    }

    #[test]
    fn matches_report_rule_confidence() {
        let parsed = interpreter().interpret("Ayuda");
        assert_eq!(parsed.action_kind, ActionKind::ShowHelp);
        assert_eq!(parsed.confidence, MATCH_CONFIDENCE);
    }

    #[test]
    fn describe_lists_rules_in_evaluation_order() {
        let described = interpreter().describe();
        assert!(!described.is_empty());
        assert!(described
            .windows(2)
            .all(|pair| pair[0].priority >= pair[1].priority));
        assert!(described
            .iter()
            .any(|rule| rule.action_kind == ActionKind::EndSession && rule.requires_confirmation));
        assert!(interpreter().help_text().contains("ayuda"));
    }
}
