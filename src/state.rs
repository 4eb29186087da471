use crate::{
    audio::ClipRecorder,
    capture::{
        AudioCaptureCycle, CaptureError, CaptureLimits, CaptureMode, CaptureState, CaptureTicket,
        RestartPolicy,
    },
    command::{ActionKind, CommandInterpreter, ParsedCommand},
    dispatch::{
        ActionSurface, CommandDispatcher, ConfirmationGate, DispatchOutcome, SkipReason,
        SurfaceLayout,
    },
    feedback::{CuePlayer, FeedbackCue, FeedbackCues, SilentCuePlayer},
    hotkey::{HotkeyError, HotkeyPhase, KeyEvent, PushToTalkBinding, PushToTalkTracker},
    permissions::{probe_microphone, PermissionSnapshot},
    settings::{SettingsError, VoiceSettings},
    transcription::{
        TranscriptResult, TranscriptionClient, TranscriptionConfig, TranscriptionError,
    },
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum VoiceEventKind {
    Listening,
    Transcribing,
    Transcribed,
    Stopped,
    Error,
    CommandExecuted,
    CommandSkipped,
    CommandUnrecognized,
}

impl VoiceEventKind {
    /// Every cycle ends with exactly one terminal event.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VoiceEventKind::Stopped
                | VoiceEventKind::Error
                | VoiceEventKind::CommandExecuted
                | VoiceEventKind::CommandSkipped
                | VoiceEventKind::CommandUnrecognized
        )
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VoiceEventPayload {
    Transcript {
        text: String,
        language_hint: Option<String>,
    },
    Command {
        command: ParsedCommand,
        outcome: Option<DispatchOutcome>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceEvent {
    pub kind: VoiceEventKind,
    /// `None` for events outside a listening cycle, such as startup failures.
    pub cycle_id: Option<u64>,
    pub message: String,
    pub payload: Option<VoiceEventPayload>,
    pub at_utc_ms: u64,
}

impl VoiceEvent {
    pub fn command(&self) -> Option<&ParsedCommand> {
        match &self.payload {
            Some(VoiceEventPayload::Command { command, .. }) => Some(command),
            _ => None,
        }
    }

    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        match &self.payload {
            Some(VoiceEventPayload::Command { outcome, .. }) => outcome.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VoiceHudState {
    Disabled,
    Idle,
    Listening,
    Transcribing,
    Dispatching,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Availability {
    Unknown,
    Available,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSnapshot {
    pub state: VoiceHudState,
    pub mode: Option<CaptureMode>,
    pub availability: Availability,
    pub permission: PermissionSnapshot,
    pub last_transcript: Option<String>,
    pub last_action: Option<ActionKind>,
    pub last_error: Option<String>,
    pub cycles_completed: u64,
}

impl Default for VoiceSnapshot {
    fn default() -> Self {
        Self {
            state: VoiceHudState::Idle,
            mode: None,
            availability: Availability::Unknown,
            permission: PermissionSnapshot::default(),
            last_transcript: None,
            last_action: None,
            last_error: None,
            cycles_completed: 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("voice control is already running")]
    AlreadyRunning,
    #[error("transcription backend unreachable: {0}")]
    BackendUnreachable(String),
    #[error("microphone unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("transcription client error: {0}")]
    Transcription(#[from] TranscriptionError),
    #[error("hotkey config error: {0}")]
    Hotkey(#[from] HotkeyError),
    #[error("command rules failed to compile: {0}")]
    Rules(#[from] regex::Error),
}

/// The snapshot plus the cycle allowed to move the HUD state. A superseded
/// cycle still reports its terminal event but leaves the HUD alone.
struct Hud {
    snapshot: VoiceSnapshot,
    owner_cycle: Option<u64>,
}

struct ActiveRun {
    run_id: u64,
    mode: CaptureMode,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleOutcome {
    Completed,
    Failed,
    Cancelled,
    DeviceLost,
    StopRequested,
}

/// Owns the listen → transcribe → interpret → dispatch loop. At most one run
/// (continuous loop or push-to-talk hold) is active at a time.
pub struct VoiceSessionController {
    settings: VoiceSettings,
    capture: AudioCaptureCycle,
    transcription: TranscriptionClient,
    interpreter: CommandInterpreter,
    dispatcher: CommandDispatcher,
    feedback: FeedbackCues,
    events: broadcast::Sender<VoiceEvent>,
    hud: Mutex<Hud>,
    active_run: Mutex<Option<ActiveRun>>,
    pending_confirmation: Mutex<Option<ParsedCommand>>,
    push_to_talk: Mutex<PushToTalkTracker>,
    run_counter: AtomicU64,
    cycle_counter: AtomicU64,
}

impl VoiceSessionController {
    pub fn new(
        settings: VoiceSettings,
        recorder: Arc<dyn ClipRecorder>,
        surface: Arc<dyn ActionSurface>,
    ) -> Result<Self, ControllerError> {
        let settings = settings.clamped();
        let binding = PushToTalkBinding::parse(&settings.push_to_talk_hotkey)?;
        let transcription =
            TranscriptionClient::new(TranscriptionConfig::from_settings(&settings))?;
        let capture = AudioCaptureCycle::new(
            recorder,
            CaptureLimits {
                clip_duration: settings.clip_duration(),
                push_to_talk_max: settings.push_to_talk_max(),
            },
        );
        let dispatcher = CommandDispatcher::new(surface, SurfaceLayout::default())
            .with_capture_settle(settings.capture_settle());
        let feedback = FeedbackCues::new(Arc::new(SilentCuePlayer), settings.feedback_cooldown());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            capture,
            transcription,
            interpreter: CommandInterpreter::canonical()?,
            dispatcher,
            feedback,
            events,
            hud: Mutex::new(Hud {
                snapshot: VoiceSnapshot::default(),
                owner_cycle: None,
            }),
            active_run: Mutex::new(None),
            pending_confirmation: Mutex::new(None),
            push_to_talk: Mutex::new(PushToTalkTracker::new(binding)),
            run_counter: AtomicU64::new(0),
            cycle_counter: AtomicU64::new(0),
            settings,
        })
    }

    pub fn with_confirmation_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.dispatcher = self.dispatcher.with_confirmation_gate(gate);
        self
    }

    pub fn with_cue_player(mut self, player: Arc<dyn CuePlayer>) -> Self {
        self.feedback = FeedbackCues::new(player, self.settings.feedback_cooldown());
        self
    }

    pub fn with_surface_layout(mut self, layout: SurfaceLayout) -> Self {
        self.dispatcher = self.dispatcher.with_layout(layout);
        self
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.settings
    }

    pub fn interpreter(&self) -> &CommandInterpreter {
        &self.interpreter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    pub async fn snapshot(&self) -> VoiceSnapshot {
        self.hud.lock().await.snapshot.clone()
    }

    pub async fn is_running(&self) -> bool {
        self.active_run.lock().await.is_some()
    }

    /// Probes the microphone and disables voice control when it is denied.
    pub async fn check_microphone(&self) -> PermissionSnapshot {
        let permission = self.refresh_permission().await;
        if permission.is_denied() {
            self.disable(permission.message.clone().unwrap_or_default())
                .await;
        } else {
            self.update_snapshot(|snapshot| {
                if snapshot.availability == Availability::Unknown {
                    snapshot.availability = Availability::Available;
                }
            })
            .await;
        }
        permission
    }

    /// Health-checks the backend and probes the microphone, then spawns the
    /// continuous loop. Either failure disables voice control and emits one
    /// error event. The run slot is claimed first, so a `stop` that arrives
    /// while the checks are pending cancels the start.
    pub async fn start_continuous(self: &Arc<Self>) -> Result<(), ControllerError> {
        let cancel = CancellationToken::new();
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut active = self.active_run.lock().await;
            if active.is_some() {
                return Err(ControllerError::AlreadyRunning);
            }
            *active = Some(ActiveRun {
                run_id,
                mode: CaptureMode::Continuous,
                cancel: cancel.clone(),
            });
        }

        let health = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            health = self.transcription.health_check() => Some(health),
        };
        let Some(health) = health else {
            self.abort_start(run_id).await;
            return Ok(());
        };
        if let Err(err) = health {
            self.release_run(run_id).await;
            self.disable(format!(
                "Control por voz desactivado: el servicio de transcripción no responde ({err})."
            ))
            .await;
            return Err(ControllerError::BackendUnreachable(err.to_string()));
        }

        let permission = self.refresh_permission().await;
        if cancel.is_cancelled() {
            self.abort_start(run_id).await;
            return Ok(());
        }
        if permission.is_denied() {
            let message = permission.message.unwrap_or_default();
            self.release_run(run_id).await;
            self.disable(message.clone()).await;
            return Err(ControllerError::DeviceUnavailable(message));
        }

        self.update_snapshot(|snapshot| {
            snapshot.availability = Availability::Available;
            snapshot.mode = Some(CaptureMode::Continuous);
            snapshot.state = VoiceHudState::Idle;
        })
        .await;
        info!(run_id, "continuous voice control started");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.run_continuous(run_id, cancel).await;
        });
        Ok(())
    }

    async fn abort_start(&self, run_id: u64) {
        info!(run_id, "continuous start cancelled before listening");
        self.release_run(run_id).await;
        self.emit(VoiceEventKind::Stopped, None, "Control por voz detenido.", None);
    }

    /// Cancels the active run. A pending transcription is discarded and its
    /// command never dispatched. Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let Some(run) = self.active_run.lock().await.take() else {
            return false;
        };
        info!(run_id = run.run_id, mode = ?run.mode, "stopping voice control");
        run.cancel.cancel();
        true
    }

    /// Starts a push-to-talk capture. A press while continuous mode runs, or
    /// while a hold is still recording, is ignored. A press while an earlier
    /// hold is still transcribing supersedes it.
    pub async fn push_to_talk_pressed(self: &Arc<Self>) -> Result<bool, ControllerError> {
        if self.hud.lock().await.snapshot.availability == Availability::Disabled {
            let permission = self.refresh_permission().await;
            if permission.is_denied() {
                let message = permission.message.unwrap_or_default();
                self.disable(message.clone()).await;
                return Err(ControllerError::DeviceUnavailable(message));
            }
            self.update_snapshot(|snapshot| {
                snapshot.availability = Availability::Available;
                snapshot.state = VoiceHudState::Idle;
            })
            .await;
        }

        let mut active = self.active_run.lock().await;
        if let Some(run) = active.as_ref() {
            if run.mode == CaptureMode::Continuous {
                debug!("push-to-talk ignored while continuous mode runs");
                return Ok(false);
            }
            if self.capture.state().await != CaptureState::Idle {
                debug!(run_id = run.run_id, "push-to-talk ignored while a hold is recording");
                return Ok(false);
            }
            info!(run_id = run.run_id, "superseding pending push-to-talk cycle");
            run.cancel.cancel();
        }

        let ticket = match self.capture.begin_session(CaptureMode::PushToTalk).await {
            Ok(ticket) => ticket,
            Err(CaptureError::AlreadyRecording) => return Ok(false),
            Err(err) => return Err(ControllerError::DeviceUnavailable(err.to_string())),
        };
        let cancel = CancellationToken::new();
        let run_id = self.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        *active = Some(ActiveRun {
            run_id,
            mode: CaptureMode::PushToTalk,
            cancel: cancel.clone(),
        });
        drop(active);

        self.update_snapshot(|snapshot| snapshot.mode = Some(CaptureMode::PushToTalk))
            .await;

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = controller
                .run_cycle(CaptureMode::PushToTalk, Some(ticket), &cancel)
                .await;
            if outcome == CycleOutcome::DeviceLost {
                controller.mark_disabled().await;
            }
            controller.release_run(run_id).await;
        });
        Ok(true)
    }

    /// Finalizes the held recording. Returns false when no hold is recording.
    pub async fn push_to_talk_released(&self) -> bool {
        let holding = self
            .active_run
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| run.mode == CaptureMode::PushToTalk);
        if !holding {
            return false;
        }
        self.capture.stop_listening().await
    }

    /// The command waiting for the user's answer, if any.
    pub async fn pending_confirmation(&self) -> Option<ParsedCommand> {
        self.pending_confirmation.lock().await.clone()
    }

    /// Runs the command that was held for confirmation. Returns `None` when
    /// nothing was pending.
    pub async fn confirm_pending(&self) -> Option<DispatchOutcome> {
        let command = self.pending_confirmation.lock().await.take()?;
        info!(action = ?command.action_kind, "pending command confirmed");
        let outcome = self.dispatcher.dispatch_confirmed(&command).await;
        self.report_resolution(command, outcome.clone());
        Some(outcome)
    }

    /// Drops the command that was held for confirmation.
    pub async fn decline_pending(&self) -> Option<DispatchOutcome> {
        let command = self.pending_confirmation.lock().await.take()?;
        info!(action = ?command.action_kind, "pending command declined");
        let outcome = DispatchOutcome::Skipped {
            reason: SkipReason::Declined,
        };
        self.report_resolution(command, outcome.clone());
        Some(outcome)
    }

    fn report_resolution(&self, command: ParsedCommand, outcome: DispatchOutcome) {
        let (kind, message) = match &outcome {
            DispatchOutcome::Executed { .. } => {
                self.feedback.play(FeedbackCue::Executed);
                (
                    VoiceEventKind::CommandExecuted,
                    format!("Comando ejecutado: {}", command.original_text),
                )
            }
            DispatchOutcome::Skipped { reason } => (
                VoiceEventKind::CommandSkipped,
                skip_message(*reason).to_string(),
            ),
            DispatchOutcome::ConfirmationRequired => (
                VoiceEventKind::CommandSkipped,
                "El comando requiere confirmación.".to_string(),
            ),
        };
        self.emit(
            kind,
            None,
            message,
            Some(VoiceEventPayload::Command {
                command,
                outcome: Some(outcome),
            }),
        );
    }

    pub async fn handle_key_down(
        self: &Arc<Self>,
        event: &KeyEvent,
    ) -> Result<bool, ControllerError> {
        let phase = self.push_to_talk.lock().await.key_down(event);
        match phase {
            Some(HotkeyPhase::Pressed) => self.push_to_talk_pressed().await,
            _ => Ok(false),
        }
    }

    pub async fn handle_key_up(&self, event: &KeyEvent) -> bool {
        let phase = self.push_to_talk.lock().await.key_up(event);
        match phase {
            Some(HotkeyPhase::Released) => self.push_to_talk_released().await,
            _ => false,
        }
    }

    /// The window lost focus mid-hold; treat it as a release.
    pub async fn handle_focus_lost(&self) -> bool {
        let phase = self.push_to_talk.lock().await.reset();
        match phase {
            Some(HotkeyPhase::Released) => self.push_to_talk_released().await,
            _ => false,
        }
    }

    async fn run_continuous(self: Arc<Self>, run_id: u64, cancel: CancellationToken) {
        let mut restart = RestartPolicy::new(
            self.settings.cooldown(),
            self.settings.min_retry_backoff(),
            self.settings.max_retry_backoff(),
        );

        loop {
            let delay = match self.run_cycle(CaptureMode::Continuous, None, &cancel).await {
                CycleOutcome::Completed => restart.after_success(),
                CycleOutcome::Failed => {
                    let delay = restart.after_failure();
                    warn!(
                        run_id,
                        failures = restart.consecutive_failures(),
                        backoff_ms = delay.as_millis() as u64,
                        "listening cycle failed; backing off"
                    );
                    delay
                }
                CycleOutcome::Cancelled | CycleOutcome::StopRequested => break,
                CycleOutcome::DeviceLost => {
                    self.mark_disabled().await;
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.emit(VoiceEventKind::Stopped, None, "Control por voz detenido.", None);
                    break;
                }
                _ = sleep(delay) => {}
            }
        }

        self.release_run(run_id).await;
        info!(run_id, "continuous voice control finished");
    }

    async fn run_cycle(
        &self,
        mode: CaptureMode,
        ticket: Option<CaptureTicket>,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        let cycle_id = self.cycle_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let ticket = match ticket {
            Some(ticket) => ticket,
            None => match self.capture.begin_session(mode).await {
                Ok(ticket) => ticket,
                Err(err) => {
                    self.finish_cycle(
                        cycle_id,
                        VoiceEventKind::Error,
                        format!("No se pudo iniciar la captura: {err}"),
                        None,
                    )
                    .await;
                    return CycleOutcome::Failed;
                }
            },
        };

        self.claim_hud(cycle_id).await;
        self.feedback.play(FeedbackCue::Listening);
        self.emit(VoiceEventKind::Listening, Some(cycle_id), "Escuchando…", None);

        let clip = match self.capture.record(ticket, cancel).await {
            Ok(Some(clip)) => clip,
            Ok(None) if cancel.is_cancelled() => {
                self.finish_stopped(cycle_id).await;
                return CycleOutcome::Cancelled;
            }
            Ok(None) => {
                self.finish_cycle(
                    cycle_id,
                    VoiceEventKind::Stopped,
                    "No se capturó audio.".to_string(),
                    None,
                )
                .await;
                return CycleOutcome::Completed;
            }
            Err(CaptureError::DeviceUnavailable(detail)) => {
                self.feedback.play(FeedbackCue::Error);
                self.finish_cycle(
                    cycle_id,
                    VoiceEventKind::Error,
                    format!("Micrófono no disponible: {detail}"),
                    None,
                )
                .await;
                return CycleOutcome::DeviceLost;
            }
            Err(err) => {
                self.feedback.play(FeedbackCue::Error);
                self.finish_cycle(
                    cycle_id,
                    VoiceEventKind::Error,
                    format!("Falló la captura de audio: {err}"),
                    None,
                )
                .await;
                return CycleOutcome::Failed;
            }
        };

        self.set_cycle_state(cycle_id, VoiceHudState::Transcribing)
            .await;
        self.emit(VoiceEventKind::Transcribing, Some(cycle_id), "Transcribiendo…", None);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.transcription.transcribe(clip) => Some(result),
        };
        let Some(result) = result.filter(|_| !cancel.is_cancelled()) else {
            info!(cycle_id, "pending transcription discarded after stop");
            self.finish_stopped(cycle_id).await;
            return CycleOutcome::Cancelled;
        };

        let transcript = match result {
            Ok(transcript) => transcript,
            Err(TranscriptionError::EmptyTranscript) => {
                self.finish_cycle(
                    cycle_id,
                    VoiceEventKind::Stopped,
                    "No se detectó voz.".to_string(),
                    None,
                )
                .await;
                return CycleOutcome::Completed;
            }
            Err(err) => {
                self.feedback.play(FeedbackCue::Error);
                self.finish_cycle(
                    cycle_id,
                    VoiceEventKind::Error,
                    format!("No se pudo transcribir el audio: {err}"),
                    None,
                )
                .await;
                return CycleOutcome::Failed;
            }
        };

        self.record_transcript(cycle_id, &transcript).await;
        self.interpret_and_dispatch(cycle_id, &transcript).await
    }

    async fn record_transcript(&self, cycle_id: u64, transcript: &TranscriptResult) {
        let text = transcript.text.clone();
        self.update_snapshot(|snapshot| snapshot.last_transcript = Some(text))
            .await;
        self.emit(
            VoiceEventKind::Transcribed,
            Some(cycle_id),
            format!("Escuché: \"{}\"", transcript.text),
            Some(VoiceEventPayload::Transcript {
                text: transcript.text.clone(),
                language_hint: transcript.language_hint.clone(),
            }),
        );
    }

    async fn interpret_and_dispatch(
        &self,
        cycle_id: u64,
        transcript: &TranscriptResult,
    ) -> CycleOutcome {
        let command = self.interpreter.interpret(&transcript.text);
        let action = command.action_kind;
        if let Some(stale) = self.pending_confirmation.lock().await.take() {
            debug!(
                cycle_id,
                action = ?stale.action_kind,
                "pending confirmation dropped by a newer command"
            );
        }
        self.update_snapshot(|snapshot| snapshot.last_action = Some(action))
            .await;
        debug!(cycle_id, ?action, rule = ?command.rule_id, "transcript interpreted");

        match action {
            ActionKind::Unknown => {
                self.feedback.play(FeedbackCue::Unrecognized);
                let message = format!("Comando no reconocido: \"{}\"", command.original_text);
                self.finish_command(
                    cycle_id,
                    VoiceEventKind::CommandUnrecognized,
                    message,
                    command,
                    None,
                )
                .await;
                return CycleOutcome::Completed;
            }
            ActionKind::StopListening => {
                self.feedback.play(FeedbackCue::Executed);
                self.finish_command(
                    cycle_id,
                    VoiceEventKind::CommandExecuted,
                    "Escucha detenida.".to_string(),
                    command,
                    None,
                )
                .await;
                return CycleOutcome::StopRequested;
            }
            ActionKind::ShowHelp => {
                self.feedback.play(FeedbackCue::Executed);
                let message = format!("Comandos disponibles: {}", self.interpreter.help_text());
                self.finish_command(
                    cycle_id,
                    VoiceEventKind::CommandExecuted,
                    message,
                    command,
                    None,
                )
                .await;
                return CycleOutcome::Completed;
            }
            _ => {}
        }

        self.set_cycle_state(cycle_id, VoiceHudState::Dispatching)
            .await;
        let outcome = self.dispatcher.dispatch(&command).await;
        let (kind, message) = match &outcome {
            DispatchOutcome::Executed { .. } => {
                self.feedback.play(FeedbackCue::Executed);
                (
                    VoiceEventKind::CommandExecuted,
                    format!("Comando ejecutado: {}", command.original_text),
                )
            }
            DispatchOutcome::Skipped { reason } => (
                VoiceEventKind::CommandSkipped,
                skip_message(*reason).to_string(),
            ),
            DispatchOutcome::ConfirmationRequired => {
                *self.pending_confirmation.lock().await = Some(command.clone());
                (
                    VoiceEventKind::CommandSkipped,
                    "El comando requiere confirmación.".to_string(),
                )
            }
        };
        self.finish_command(cycle_id, kind, message, command, Some(outcome))
            .await;
        CycleOutcome::Completed
    }

    async fn finish_command(
        &self,
        cycle_id: u64,
        kind: VoiceEventKind,
        message: String,
        command: ParsedCommand,
        outcome: Option<DispatchOutcome>,
    ) {
        self.finish_cycle(
            cycle_id,
            kind,
            message,
            Some(VoiceEventPayload::Command { command, outcome }),
        )
        .await;
    }

    async fn finish_stopped(&self, cycle_id: u64) {
        self.finish_cycle(
            cycle_id,
            VoiceEventKind::Stopped,
            "Control por voz detenido.".to_string(),
            None,
        )
        .await;
    }

    async fn finish_cycle(
        &self,
        cycle_id: u64,
        kind: VoiceEventKind,
        message: String,
        payload: Option<VoiceEventPayload>,
    ) {
        let failed = kind == VoiceEventKind::Error;
        let error_message = failed.then(|| message.clone());
        {
            let mut hud = self.hud.lock().await;
            let owns_hud = hud.owner_cycle == Some(cycle_id);
            let snapshot = &mut hud.snapshot;
            snapshot.cycles_completed += 1;
            if owns_hud && snapshot.state != VoiceHudState::Disabled {
                snapshot.state = if failed {
                    VoiceHudState::Error
                } else {
                    VoiceHudState::Idle
                };
            }
            if error_message.is_some() {
                snapshot.last_error = error_message;
            }
        }
        self.emit(kind, Some(cycle_id), message, payload);
    }

    async fn release_run(&self, run_id: u64) {
        {
            let mut active = self.active_run.lock().await;
            match active.as_ref() {
                Some(run) if run.run_id == run_id => {
                    if let Some(run) = active.take() {
                        run.cancel.cancel();
                    }
                }
                Some(_) => return,
                None => {}
            }
        }
        self.update_snapshot(|snapshot| {
            snapshot.mode = None;
            if matches!(
                snapshot.state,
                VoiceHudState::Listening | VoiceHudState::Transcribing | VoiceHudState::Dispatching
            ) {
                snapshot.state = VoiceHudState::Idle;
            }
        })
        .await;
    }

    async fn refresh_permission(&self) -> PermissionSnapshot {
        let permission = probe_microphone(&self.capture).await;
        let stored = permission.clone();
        self.update_snapshot(|snapshot| snapshot.permission = stored)
            .await;
        permission
    }

    async fn disable(&self, message: String) {
        warn!(reason = %message, "voice control disabled");
        self.mark_disabled().await;
        let error_message = message.clone();
        self.update_snapshot(|snapshot| snapshot.last_error = Some(error_message))
            .await;
        self.emit(VoiceEventKind::Error, None, message, None);
    }

    async fn mark_disabled(&self) {
        self.update_snapshot(|snapshot| {
            snapshot.availability = Availability::Disabled;
            snapshot.state = VoiceHudState::Disabled;
            snapshot.mode = None;
        })
        .await;
    }

    async fn claim_hud(&self, cycle_id: u64) {
        let mut hud = self.hud.lock().await;
        hud.owner_cycle = Some(cycle_id);
        if hud.snapshot.state != VoiceHudState::Disabled {
            hud.snapshot.state = VoiceHudState::Listening;
        }
    }

    async fn set_cycle_state(&self, cycle_id: u64, state: VoiceHudState) {
        let mut hud = self.hud.lock().await;
        if hud.owner_cycle == Some(cycle_id) {
            hud.snapshot.state = state;
        }
    }

    async fn update_snapshot(&self, update: impl FnOnce(&mut VoiceSnapshot)) {
        let mut hud = self.hud.lock().await;
        update(&mut hud.snapshot);
    }

    fn emit(
        &self,
        kind: VoiceEventKind,
        cycle_id: Option<u64>,
        message: impl Into<String>,
        payload: Option<VoiceEventPayload>,
    ) {
        let event = VoiceEvent {
            kind,
            cycle_id,
            message: message.into(),
            payload,
            at_utc_ms: now_utc_ms(),
        };
        if kind == VoiceEventKind::Error {
            warn!(?cycle_id, message = %event.message, "voice event");
        } else {
            info!(?kind, ?cycle_id, message = %event.message, "voice event");
        }
        // No subscribers is fine; the snapshot still reflects the change.
        let _ = self.events.send(event);
    }
}

fn skip_message(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::Ineligible => "El elemento no está disponible en esta pantalla.",
        SkipReason::Declined => "Comando cancelado.",
        SkipReason::Unsupported => "Comando no disponible en esta pantalla.",
        SkipReason::Busy => "Hay una navegación en curso; intentá de nuevo.",
    }
}

fn now_utc_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_kinds_close_a_cycle() {
        assert!(!VoiceEventKind::Listening.is_terminal());
        assert!(!VoiceEventKind::Transcribing.is_terminal());
        assert!(!VoiceEventKind::Transcribed.is_terminal());
        assert!(VoiceEventKind::Stopped.is_terminal());
        assert!(VoiceEventKind::Error.is_terminal());
        assert!(VoiceEventKind::CommandExecuted.is_terminal());
        assert!(VoiceEventKind::CommandSkipped.is_terminal());
        assert!(VoiceEventKind::CommandUnrecognized.is_terminal());
    }

    #[test]
    fn event_kinds_serialize_in_kebab_case() {
        let json = serde_json::to_string(&VoiceEventKind::CommandUnrecognized)
            .expect("event kind should serialize");
        assert_eq!(json, "\"command-unrecognized\"");
    }

    #[test]
    fn transcript_payload_is_tagged() {
        let event = VoiceEvent {
            kind: VoiceEventKind::Transcribed,
            cycle_id: Some(3),
            message: "Escuché".to_string(),
            payload: Some(VoiceEventPayload::Transcript {
                text: "ayuda".to_string(),
                language_hint: Some("es".to_string()),
            }),
            at_utc_ms: 0,
        };
        let value = serde_json::to_value(&event).expect("event should serialize");
        assert_eq!(value["cycleId"], 3);
        assert_eq!(value["payload"]["type"], "transcript");
        assert_eq!(value["payload"]["languageHint"], "es");
        assert!(event.command().is_none());
    }

    #[test]
    fn every_skip_reason_has_a_message() {
        for reason in [
            SkipReason::Ineligible,
            SkipReason::Declined,
            SkipReason::Unsupported,
            SkipReason::Busy,
        ] {
            assert!(!skip_message(reason).is_empty());
        }
    }
}
