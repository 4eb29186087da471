use crate::audio::{AudioClip, AudioError, CaptureOptions, CaptureSignals, ClipRecorder};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMode {
    Continuous,
    #[default]
    PushToTalk,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CaptureState {
    Idle,
    Recording,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub session_id: u64,
    pub mode: CaptureMode,
    pub state: CaptureState,
    pub started_at: Instant,
    pub max_duration_ms: u64,
    stop_flag: Arc<AtomicBool>,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("a capture session is already recording")]
    AlreadyRecording,
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("microphone stream failed: {0}")]
    Stream(String),
    #[error("capture task failed: {0}")]
    Join(String),
}

/// Claim on the microphone returned by [`AudioCaptureCycle::begin_session`].
/// Must be handed back through `record` or `abandon`.
#[derive(Debug)]
pub struct CaptureTicket {
    session_id: u64,
    stop_flag: Arc<AtomicBool>,
    options: CaptureOptions,
}

impl CaptureTicket {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub clip_duration: Duration,
    pub push_to_talk_max: Duration,
}

pub struct AudioCaptureCycle {
    recorder: Arc<dyn ClipRecorder>,
    limits: CaptureLimits,
    session: Mutex<Option<CaptureSession>>,
    session_counter: AtomicU64,
}

impl AudioCaptureCycle {
    pub fn new(recorder: Arc<dyn ClipRecorder>, limits: CaptureLimits) -> Self {
        Self {
            recorder,
            limits,
            session: Mutex::new(None),
            session_counter: AtomicU64::new(0),
        }
    }

    pub async fn state(&self) -> CaptureState {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(CaptureState::Idle)
    }

    /// Checks that the microphone can be opened without recording.
    pub async fn probe(&self) -> Result<(), CaptureError> {
        let recorder = Arc::clone(&self.recorder);
        match tokio::task::spawn_blocking(move || recorder.probe()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(classify(err)),
            Err(err) => Err(CaptureError::Join(err.to_string())),
        }
    }

    /// Opens the single CaptureSession this cycle allows.
    pub async fn begin_session(&self, mode: CaptureMode) -> Result<CaptureTicket, CaptureError> {
        let max_duration = match mode {
            CaptureMode::Continuous => self.limits.clip_duration,
            CaptureMode::PushToTalk => self.limits.push_to_talk_max,
        };
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let stop_flag = Arc::new(AtomicBool::new(false));

        {
            let mut session = self.session.lock().await;
            if session.is_some() {
                return Err(CaptureError::AlreadyRecording);
            }
            *session = Some(CaptureSession {
                session_id,
                mode,
                state: CaptureState::Recording,
                started_at: Instant::now(),
                max_duration_ms: max_duration.as_millis() as u64,
                stop_flag: stop_flag.clone(),
            });
        }
        debug!(session_id, ?mode, "capture session opened");

        Ok(CaptureTicket {
            session_id,
            stop_flag,
            options: CaptureOptions {
                max_capture_duration: max_duration,
            },
        })
    }

    /// Records until stop, cancel or the session's max duration. Cancelled or
    /// zero-byte sessions yield `None`.
    pub async fn record(
        &self,
        ticket: CaptureTicket,
        cancel: &CancellationToken,
    ) -> Result<Option<AudioClip>, CaptureError> {
        let recorder = Arc::clone(&self.recorder);
        let signals = CaptureSignals::new(cancel.clone(), ticket.stop_flag.clone());
        let options = ticket.options;
        let result =
            tokio::task::spawn_blocking(move || recorder.record_clip(options, &signals)).await;
        self.finish_session(ticket.session_id).await;

        match result {
            Err(err) => Err(CaptureError::Join(err.to_string())),
            Ok(Err(AudioError::Cancelled)) => Ok(None),
            Ok(Err(err)) => Err(classify(err)),
            Ok(Ok(_)) if cancel.is_cancelled() => Ok(None),
            Ok(Ok(clip)) => Ok(clip.filter(|clip| !clip.is_empty())),
        }
    }

    /// Releases a ticket that will never be recorded.
    pub async fn abandon(&self, ticket: CaptureTicket) {
        self.finish_session(ticket.session_id).await;
    }

    pub async fn start_listening(
        &self,
        mode: CaptureMode,
        cancel: &CancellationToken,
    ) -> Result<Option<AudioClip>, CaptureError> {
        let ticket = self.begin_session(mode).await?;
        self.record(ticket, cancel).await
    }

    /// Finalizes the active recording. Returns false when nothing was recording.
    pub async fn stop_listening(&self) -> bool {
        let mut session = self.session.lock().await;
        let Some(active) = session.as_mut() else {
            return false;
        };
        if active.state != CaptureState::Recording {
            return false;
        }
        active.state = CaptureState::Stopping;
        active.stop_flag.store(true, Ordering::Relaxed);
        true
    }

    async fn finish_session(&self, session_id: u64) {
        let mut session = self.session.lock().await;
        if session
            .as_ref()
            .is_some_and(|active| active.session_id == session_id)
        {
            *session = None;
        }
    }
}

fn classify(err: AudioError) -> CaptureError {
    if err.is_device_unavailable() {
        warn!(error = %err, "microphone unavailable");
        CaptureError::DeviceUnavailable(err.to_string())
    } else {
        CaptureError::Stream(err.to_string())
    }
}

/// Delay before the next continuous-mode session.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    cooldown: Duration,
    min_backoff: Duration,
    max_backoff: Duration,
    consecutive_failures: u32,
}

impl RestartPolicy {
    pub fn new(cooldown: Duration, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            cooldown,
            min_backoff,
            max_backoff: max_backoff.max(min_backoff),
            consecutive_failures: 0,
        }
    }

    pub fn after_success(&mut self) -> Duration {
        self.consecutive_failures = 0;
        self.cooldown
    }

    pub fn after_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let exponent = (self.consecutive_failures - 1).min(16);
        let backoff = self
            .min_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        backoff.max(self.cooldown)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
