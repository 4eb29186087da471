use crate::{
    audio::AudioClip,
    settings::VoiceSettings,
    transcript::{is_silent_transcript, sanitize_user_transcript},
};
use reqwest::{
    multipart::{Form, Part},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptResult {
    pub text: String,
    pub language_hint: Option<String>,
    pub confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("transcription service unavailable: {0}")]
    Unavailable(String),
    #[error("transcription returned no usable text")]
    EmptyTranscript,
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub base_url: String,
    pub audio_field_name: String,
    pub language: Option<String>,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
}

impl TranscriptionConfig {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            base_url: settings.transcription_base_url.clone(),
            audio_field_name: settings.audio_field_name.clone(),
            language: Some(settings.language.clone()).filter(|lang| !lang.is_empty()),
            request_timeout: settings.request_timeout(),
            health_timeout: settings.health_timeout(),
        }
    }
}

/// Client for the remote speech-to-text service. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct TranscriptionClient {
    http: reqwest::Client,
    config: TranscriptionConfig,
}

impl TranscriptionClient {
    pub fn new(mut config: TranscriptionConfig) -> Result<Self, TranscriptionError> {
        config.base_url = config.base_url.trim().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(TranscriptionError::Client)?;
        Ok(Self { http, config })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// `GET {base}/health`. Any non-success status or network failure is `Unavailable`.
    pub async fn health_check(&self) -> Result<(), TranscriptionError> {
        let url = format!("{}/health", self.config.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.config.health_timeout)
            .send()
            .await
            .map_err(|err| TranscriptionError::Unavailable(describe_request_error(&err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscriptionError::Unavailable(format!(
                "health probe returned HTTP {}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    /// Sends one clip as a single multipart audio field. The clip is consumed:
    /// whatever the outcome, the same bytes are never sent twice.
    pub async fn transcribe(
        &self,
        clip: AudioClip,
    ) -> Result<TranscriptResult, TranscriptionError> {
        let url = format!("{}/transcribe", self.config.base_url);
        let file_name = clip.file_name();
        let mime_type = clip.mime_type().to_string();
        let clip_bytes = clip.bytes().len();
        debug!(%url, clip_bytes, %mime_type, "sending clip for transcription");

        let part = Part::bytes(clip.into_bytes())
            .file_name(file_name)
            .mime_str(&mime_type)
            .map_err(|err| {
                TranscriptionError::Unavailable(format!("invalid clip mime type: {err}"))
            })?;
        let form = Form::new().part(self.config.audio_field_name.clone(), part);

        let response = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| TranscriptionError::Unavailable(describe_request_error(&err)))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Unavailable(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&body, 160)
            )));
        }

        let body: TranscribeResponse = response.json().await.map_err(|err| {
            TranscriptionError::Unavailable(format!("malformed transcription response: {err}"))
        })?;

        let text = body
            .text
            .as_deref()
            .map(sanitize_user_transcript)
            .unwrap_or_default();
        if is_silent_transcript(&text) {
            return Err(TranscriptionError::EmptyTranscript);
        }

        Ok(TranscriptResult {
            text,
            language_hint: body.language.or_else(|| self.config.language.clone()),
            confidence: body.confidence,
        })
    }
}

fn describe_request_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut out = trimmed.chars().take(max_chars).collect::<String>();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_trims_trailing_slash() {
        let client = TranscriptionClient::new(TranscriptionConfig {
            base_url: "http://localhost:5000/".to_string(),
            audio_field_name: "audio".to_string(),
            language: None,
            request_timeout: Duration::from_secs(1),
            health_timeout: Duration::from_secs(1),
        })
        .expect("client should build");
        assert_eq!(client.base_url(), "http://localhost:5000");
    }

    #[test]
    fn config_from_settings_drops_empty_language() {
        let settings = VoiceSettings {
            language: String::new(),
            ..VoiceSettings::default()
        };
        let config = TranscriptionConfig::from_settings(&settings);
        assert!(config.language.is_none());
        assert_eq!(config.audio_field_name, "audio");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(500);
        assert_eq!(truncate(&body, 10).chars().count(), 11);
        assert_eq!(truncate("  short  ", 10), "short");
    }
}
