//! Headless front-end for the voice controller.
//!
//! Voice events are written to stdout as newline-delimited JSON. Stdin takes
//! one command per line (`press`, `release`, `start`, `stop`, `confirm`,
//! `cancel`, `snapshot`, `devices`, `help`, `quit`). Tracing output belongs on stderr so stdout stays a clean
//! event stream.

use crate::{
    audio::{ClipRecorder, MicrophoneRecorder},
    capture::CaptureMode,
    dispatch::{ActionSurface, MediaOp, SurfaceLayout, SurfaceTarget},
    settings::{SettingsError, SettingsStore},
    state::{ControllerError, VoiceEvent, VoiceSessionController},
};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("controller error: {0}")]
    Controller(#[from] ControllerError),
    #[error("console io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Press,
    Release,
    Start,
    Stop,
    Confirm,
    Decline,
    Snapshot,
    Devices,
    Help,
    Quit,
}

pub fn parse_console_command(line: &str) -> Option<ConsoleCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "press" | "p" => Some(ConsoleCommand::Press),
        "release" | "r" => Some(ConsoleCommand::Release),
        "start" => Some(ConsoleCommand::Start),
        "stop" | "s" => Some(ConsoleCommand::Stop),
        "confirm" | "yes" | "y" | "si" | "sí" => Some(ConsoleCommand::Confirm),
        "cancel" | "no" | "n" => Some(ConsoleCommand::Decline),
        "snapshot" | "status" => Some(ConsoleCommand::Snapshot),
        "devices" | "d" => Some(ConsoleCommand::Devices),
        "help" | "h" | "?" => Some(ConsoleCommand::Help),
        "quit" | "q" | "exit" => Some(ConsoleCommand::Quit),
        _ => None,
    }
}

/// A stand-in for the web app: three screens, each exposing its own fields
/// and buttons. Actions are logged instead of performed.
pub struct ConsoleSurface {
    layout: SurfaceLayout,
    route: StdMutex<String>,
}

impl ConsoleSurface {
    pub fn new(layout: SurfaceLayout) -> Self {
        let route = layout.login_route.clone();
        Self {
            layout,
            route: StdMutex::new(route),
        }
    }

    pub fn current_route(&self) -> String {
        self.route
            .lock()
            .map(|route| route.clone())
            .unwrap_or_default()
    }

    fn on_screen(&self, id: &str) -> bool {
        let route = self.current_route();
        let layout = &self.layout;
        if route == layout.login_route {
            id == layout.login_button
                || layout.email_fields.first().is_some_and(|field| field == id)
                || layout.password_fields.first().is_some_and(|field| field == id)
        } else if route == layout.register_route {
            id == layout.register_button
                || layout.email_fields.iter().skip(1).any(|field| field == id)
                || layout.password_fields.iter().skip(1).any(|field| field == id)
                || layout.confirm_password_fields.iter().any(|field| field == id)
        } else if route == layout.camera_route {
            id == layout.capture_button || id == layout.upload_button
        } else {
            false
        }
    }
}

impl ActionSurface for ConsoleSurface {
    fn is_eligible(&self, target: &SurfaceTarget) -> bool {
        match target {
            SurfaceTarget::Field(id) | SurfaceTarget::Control(id) => self.on_screen(id),
            SurfaceTarget::Route(_) | SurfaceTarget::Media | SurfaceTarget::Session => true,
        }
    }

    fn navigate(&self, route: &str) -> bool {
        let Ok(mut current) = self.route.lock() else {
            return false;
        };
        info!(from = %current, to = route, "surface navigate");
        *current = route.to_string();
        true
    }

    fn fill_field(&self, field_id: &str, text: &str) -> bool {
        // Values may be passwords; only the length is logged.
        info!(field = field_id, chars = text.chars().count(), "surface fill");
        true
    }

    fn click_control(&self, control_id: &str) -> bool {
        info!(control = control_id, "surface click");
        true
    }

    fn control_media(&self, op: MediaOp) -> bool {
        info!(?op, "surface media");
        true
    }

    fn end_session(&self) -> bool {
        info!("surface end session");
        self.navigate(&self.layout.login_route)
    }
}

/// Loads settings, wires the microphone and console surface into a
/// controller, and runs until stdin closes or `quit` arrives.
pub async fn run() -> Result<(), ConsoleError> {
    let store = SettingsStore::new()?;
    let settings = store.load()?.with_env_overrides();
    info!(
        path = %store.path().display(),
        mode = ?settings.capture_mode,
        backend = %settings.transcription_base_url,
        "visionvoice starting"
    );

    let recorder = Arc::new(MicrophoneRecorder::with_input_device(
        settings.input_device.clone(),
    ));
    let surface = Arc::new(ConsoleSurface::new(SurfaceLayout::default()));
    let controller = Arc::new(VoiceSessionController::new(
        settings.clone(),
        Arc::clone(&recorder) as Arc<dyn ClipRecorder>,
        surface,
    )?);

    let writer = Arc::new(Mutex::new(tokio::io::stdout()));
    let forwarder = tokio::spawn(forward_events(controller.subscribe(), Arc::clone(&writer)));

    match settings.capture_mode {
        CaptureMode::Continuous => {
            if let Err(err) = controller.start_continuous().await {
                warn!(error = %err, "continuous mode did not start; send `start` to retry");
            }
        }
        CaptureMode::PushToTalk => {
            controller.check_microphone().await;
        }
    }

    let result = read_commands(&controller, &recorder, &writer).await;

    controller.stop().await;
    forwarder.abort();
    let _ = forwarder.await;
    info!("visionvoice shut down");
    result
}

async fn read_commands<W>(
    controller: &Arc<VoiceSessionController>,
    recorder: &Arc<MicrophoneRecorder>,
    writer: &Arc<Mutex<W>>,
) -> Result<(), ConsoleError>
where
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(command) = parse_console_command(&line) else {
            warn!(input = %line.trim(), "unknown console command");
            continue;
        };
        match command {
            ConsoleCommand::Press => {
                if let Err(err) = controller.push_to_talk_pressed().await {
                    warn!(error = %err, "push-to-talk press rejected");
                }
            }
            ConsoleCommand::Release => {
                controller.push_to_talk_released().await;
            }
            ConsoleCommand::Start => {
                if let Err(err) = controller.start_continuous().await {
                    warn!(error = %err, "continuous mode did not start");
                }
            }
            ConsoleCommand::Stop => {
                controller.stop().await;
            }
            ConsoleCommand::Confirm => {
                if controller.confirm_pending().await.is_none() {
                    warn!("no command is waiting for confirmation");
                }
            }
            ConsoleCommand::Decline => {
                if controller.decline_pending().await.is_none() {
                    warn!("no command is waiting for confirmation");
                }
            }
            ConsoleCommand::Snapshot => {
                let snapshot = controller.snapshot().await;
                write_json(writer, &snapshot).await?;
            }
            ConsoleCommand::Devices => {
                let recorder = Arc::clone(recorder);
                let devices = tokio::task::spawn_blocking(move || recorder.list_input_devices())
                    .await
                    .unwrap_or_default();
                write_json(writer, &devices).await?;
            }
            ConsoleCommand::Help => {
                let rules = controller.interpreter().describe();
                write_json(writer, &rules).await?;
            }
            ConsoleCommand::Quit => break,
        }
    }
    Ok(())
}

/// Copies controller events to `writer` as JSON lines until the channel
/// closes or the writer fails.
pub async fn forward_events<W>(
    mut events: broadcast::Receiver<VoiceEvent>,
    writer: Arc<Mutex<W>>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(err) = write_json(&writer, &event).await {
                    warn!(error = %err, "failed to write voice event; stopping forwarder");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event forwarder lagged; some events were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn write_json<W, T>(writer: &Arc<Mutex<W>>, value: &T) -> Result<(), ConsoleError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)
        .map_err(|err| ConsoleError::Io(std::io::Error::other(err)))?;
    line.push(b'\n');
    let mut writer = writer.lock().await;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
