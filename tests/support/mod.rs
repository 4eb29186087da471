#![allow(dead_code)]

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use visionvoice_core_lib::{
    audio::{AudioClip, AudioError, CaptureOptions, CaptureSignals, ClipRecorder},
    capture::CaptureMode,
    command::ParsedCommand,
    dispatch::{ActionSurface, ConfirmationGate, MediaOp, SurfaceTarget},
    settings::VoiceSettings,
    VoiceEvent, VoiceEventKind, VoiceSessionController,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_settings(base_url: &str, mode: CaptureMode) -> VoiceSettings {
    VoiceSettings {
        transcription_base_url: base_url.to_string(),
        capture_mode: mode,
        clip_duration_ms: 250,
        push_to_talk_max_ms: 3_000,
        cooldown_ms: 10,
        min_retry_backoff_ms: 50,
        max_retry_backoff_ms: 200,
        request_timeout_ms: 3_000,
        health_timeout_ms: 500,
        feedback_cooldown_ms: 50,
        capture_settle_ms: 20,
        ..VoiceSettings::default()
    }
}

pub fn speech_clip() -> AudioClip {
    AudioClip::new(
        vec![0x52, 0x49, 0x46, 0x46, 1, 2, 3, 4],
        "audio/wav",
        Duration::from_millis(800),
    )
}

/// Waits until stop, cancel or the session limit; polled like a real stream.
fn wait_for_signal(
    options: CaptureOptions,
    signals: &CaptureSignals,
) -> Result<bool, AudioError> {
    let deadline = Instant::now() + options.max_capture_duration;
    while Instant::now() < deadline {
        if signals.is_cancelled() {
            return Err(AudioError::Cancelled);
        }
        if signals.stop_requested() {
            return Ok(true);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(false)
}

/// Hands out queued clips one per recording, then records silence.
pub struct ScriptedRecorder {
    clips: Mutex<VecDeque<AudioClip>>,
    microphone_present: bool,
    recordings: AtomicUsize,
}

impl ScriptedRecorder {
    pub fn new(clips: Vec<AudioClip>) -> Arc<Self> {
        Arc::new(Self {
            clips: Mutex::new(clips.into()),
            microphone_present: true,
            recordings: AtomicUsize::new(0),
        })
    }

    pub fn without_microphone() -> Arc<Self> {
        Arc::new(Self {
            clips: Mutex::new(VecDeque::new()),
            microphone_present: false,
            recordings: AtomicUsize::new(0),
        })
    }

    pub fn recordings(&self) -> usize {
        self.recordings.load(Ordering::SeqCst)
    }
}

impl ClipRecorder for ScriptedRecorder {
    fn probe(&self) -> Result<(), AudioError> {
        if self.microphone_present {
            Ok(())
        } else {
            Err(AudioError::MissingInputDevice)
        }
    }

    fn record_clip(
        &self,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Option<AudioClip>, AudioError> {
        self.recordings.fetch_add(1, Ordering::SeqCst);
        if !self.microphone_present {
            return Err(AudioError::MissingInputDevice);
        }
        let next = self.clips.lock().expect("clips lock").pop_front();
        if let Some(clip) = next {
            return Ok(Some(clip));
        }
        wait_for_signal(options, signals)?;
        Ok(None)
    }
}

/// Records for as long as the key is held and returns `clip` on release.
pub struct HoldRecorder {
    clip: AudioClip,
}

impl HoldRecorder {
    pub fn new(clip: AudioClip) -> Arc<Self> {
        Arc::new(Self { clip })
    }
}

impl ClipRecorder for HoldRecorder {
    fn probe(&self) -> Result<(), AudioError> {
        Ok(())
    }

    fn record_clip(
        &self,
        options: CaptureOptions,
        signals: &CaptureSignals,
    ) -> Result<Option<AudioClip>, AudioError> {
        wait_for_signal(options, signals)?;
        Ok(Some(self.clip.clone()))
    }
}

/// Records every call; eligibility can be withheld per target.
#[derive(Default)]
pub struct RecordingSurface {
    calls: Mutex<Vec<String>>,
    ineligible: Mutex<HashSet<SurfaceTarget>>,
}

impl RecordingSurface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn withhold(&self, target: SurfaceTarget) {
        self.ineligible.lock().expect("ineligible lock").insert(target);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn record(&self, call: String) -> bool {
        self.calls.lock().expect("calls lock").push(call);
        true
    }
}

impl ActionSurface for RecordingSurface {
    fn is_eligible(&self, target: &SurfaceTarget) -> bool {
        !self.ineligible.lock().expect("ineligible lock").contains(target)
    }

    fn navigate(&self, route: &str) -> bool {
        self.record(format!("navigate:{route}"))
    }

    fn fill_field(&self, field_id: &str, text: &str) -> bool {
        self.record(format!("fill:{field_id}={text}"))
    }

    fn click_control(&self, control_id: &str) -> bool {
        self.record(format!("click:{control_id}"))
    }

    fn control_media(&self, op: MediaOp) -> bool {
        self.record(format!("media:{op:?}"))
    }

    fn end_session(&self) -> bool {
        self.record("end-session".to_string())
    }
}

pub struct FixedGate(pub bool);

impl ConfirmationGate for FixedGate {
    fn confirm(&self, _command: &ParsedCommand, _prompt: &str) -> bool {
        self.0
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<VoiceEvent>) -> VoiceEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event should arrive before the timeout")
        .expect("event channel should stay open")
}

pub async fn wait_for_kind(
    events: &mut broadcast::Receiver<VoiceEvent>,
    kind: VoiceEventKind,
) -> VoiceEvent {
    loop {
        let event = next_event(events).await;
        if event.kind == kind {
            return event;
        }
    }
}

/// Events for one cycle, from its listening event through its terminal one.
pub async fn cycle_events(
    events: &mut broadcast::Receiver<VoiceEvent>,
    cycle_id: u64,
) -> Vec<VoiceEvent> {
    let mut collected = Vec::new();
    loop {
        let event = next_event(events).await;
        if event.cycle_id != Some(cycle_id) {
            continue;
        }
        let terminal = event.kind.is_terminal();
        collected.push(event);
        if terminal {
            return collected;
        }
    }
}

pub fn drain(events: &mut broadcast::Receiver<VoiceEvent>) -> Vec<VoiceEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => return drained,
        }
    }
}

/// The run is over once it released its slot and cleared the mode.
pub async fn wait_until_stopped(controller: &VoiceSessionController) {
    let deadline = Instant::now() + EVENT_TIMEOUT;
    while controller.is_running().await || controller.snapshot().await.mode.is_some() {
        assert!(Instant::now() < deadline, "controller should finish its run");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
