use crate::capture::CaptureMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const TRANSCRIPTION_URL_ENV: &str = "VISIONVOICE_TRANSCRIPTION_URL";
pub const CAPTURE_MODE_ENV: &str = "VISIONVOICE_CAPTURE_MODE";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct VoiceSettings {
    pub transcription_base_url: String,
    pub audio_field_name: String,
    pub language: String,
    pub capture_mode: CaptureMode,
    pub clip_duration_ms: u64,
    pub push_to_talk_max_ms: u64,
    pub cooldown_ms: u64,
    pub min_retry_backoff_ms: u64,
    pub max_retry_backoff_ms: u64,
    pub request_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub feedback_cooldown_ms: u64,
    pub capture_settle_ms: u64,
    pub input_device: Option<String>,
    pub push_to_talk_hotkey: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            transcription_base_url: "http://127.0.0.1:5000".to_string(),
            audio_field_name: "audio".to_string(),
            language: "es-AR".to_string(),
            capture_mode: CaptureMode::PushToTalk,
            clip_duration_ms: 3_000,
            push_to_talk_max_ms: 30_000,
            cooldown_ms: 100,
            min_retry_backoff_ms: 1_000,
            max_retry_backoff_ms: 15_000,
            request_timeout_ms: 15_000,
            health_timeout_ms: 2_000,
            feedback_cooldown_ms: 180,
            capture_settle_ms: 1_500,
            input_device: None,
            push_to_talk_hotkey: "Space".to_string(),
        }
    }
}

impl VoiceSettings {
    /// Returns a copy with every numeric field pulled into its supported range.
    pub fn clamped(mut self) -> Self {
        self.transcription_base_url = self
            .transcription_base_url
            .trim()
            .trim_end_matches('/')
            .to_string();
        if self.transcription_base_url.is_empty() {
            self.transcription_base_url = Self::default().transcription_base_url;
        }
        self.audio_field_name = self.audio_field_name.trim().to_string();
        if self.audio_field_name.is_empty() {
            self.audio_field_name = Self::default().audio_field_name;
        }
        self.language = self.language.trim().to_string();
        self.clip_duration_ms = self.clip_duration_ms.clamp(250, 15_000);
        self.push_to_talk_max_ms = self.push_to_talk_max_ms.clamp(1_000, 60_000);
        self.cooldown_ms = self.cooldown_ms.min(2_000);
        self.min_retry_backoff_ms = self.min_retry_backoff_ms.clamp(50, 30_000);
        self.max_retry_backoff_ms = self
            .max_retry_backoff_ms
            .clamp(self.min_retry_backoff_ms, 60_000);
        self.request_timeout_ms = self.request_timeout_ms.clamp(1_000, 120_000);
        self.health_timeout_ms = self.health_timeout_ms.clamp(200, 30_000);
        self.feedback_cooldown_ms = self.feedback_cooldown_ms.clamp(50, 1_000);
        self.capture_settle_ms = self.capture_settle_ms.min(5_000);
        self.input_device = self
            .input_device
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        self
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(url) = env_value(TRANSCRIPTION_URL_ENV) {
            self.transcription_base_url = url;
        }
        if let Some(mode) = env_value(CAPTURE_MODE_ENV).and_then(|raw| parse_capture_mode(&raw)) {
            self.capture_mode = mode;
        }
        self.clamped()
    }

    pub fn clip_duration(&self) -> Duration {
        Duration::from_millis(self.clip_duration_ms)
    }

    pub fn push_to_talk_max(&self) -> Duration {
        Duration::from_millis(self.push_to_talk_max_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn min_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.min_retry_backoff_ms)
    }

    pub fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn feedback_cooldown(&self) -> Duration {
        Duration::from_millis(self.feedback_cooldown_ms)
    }

    pub fn capture_settle(&self) -> Duration {
        Duration::from_millis(self.capture_settle_ms)
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn parse_capture_mode(raw: &str) -> Option<CaptureMode> {
    match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "continuous" => Some(CaptureMode::Continuous),
        "push-to-talk" | "pushtotalk" | "ptt" => Some(CaptureMode::PushToTalk),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Read(std::io::Error),
    #[error("failed to write settings file: {0}")]
    Write(std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Parse(serde_json::Error),
    #[error("cannot resolve app config directory")]
    AppData,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new() -> Result<Self, SettingsError> {
        let proj_dirs =
            ProjectDirs::from("com", "visionvoice", "assistant").ok_or(SettingsError::AppData)?;
        let path = proj_dirs.config_dir().join("settings.json");
        Ok(Self { path })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<VoiceSettings, SettingsError> {
        if !self.path.exists() {
            return Ok(VoiceSettings::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(SettingsError::Read)?;
        let settings: VoiceSettings = serde_json::from_str(&raw).map_err(SettingsError::Parse)?;
        Ok(settings.clamped())
    }

    pub fn save(&self, settings: &VoiceSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(SettingsError::Write)?;
        }
        let raw = serde_json::to_string_pretty(settings).map_err(SettingsError::Parse)?;
        fs::write(&self.path, raw).map_err(SettingsError::Write)?;
        Ok(())
    }
}
