use crate::command::{ActionKind, ParsedCommand};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaOp {
    Play,
    Pause,
    Replay,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "camelCase")]
pub enum SurfaceTarget {
    Field(String),
    Control(String),
    Route(String),
    Media,
    Session,
}

/// The UI the assistant drives. Shared with the human user: implementations
/// must answer eligibility from current state and never block on it.
pub trait ActionSurface: Send + Sync {
    /// Whether `target` is currently present and enabled.
    fn is_eligible(&self, target: &SurfaceTarget) -> bool;
    fn navigate(&self, route: &str) -> bool;
    fn fill_field(&self, field_id: &str, text: &str) -> bool;
    fn click_control(&self, control_id: &str) -> bool;
    fn control_media(&self, op: MediaOp) -> bool;
    fn end_session(&self) -> bool;
}

/// Asks the user before a command flagged `requires_confirmation` runs.
/// Called on the blocking pool, so implementations may wait on a prompt.
pub trait ConfirmationGate: Send + Sync {
    fn confirm(&self, command: &ParsedCommand, prompt: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    Ineligible,
    Declined,
    Unsupported,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DispatchOutcome {
    Executed { targets: Vec<String> },
    Skipped { reason: SkipReason },
    ConfirmationRequired,
}

impl DispatchOutcome {
    pub fn is_executed(&self) -> bool {
        matches!(self, DispatchOutcome::Executed { .. })
    }

    fn from_targets(targets: Vec<String>) -> Self {
        if targets.is_empty() {
            DispatchOutcome::Skipped {
                reason: SkipReason::Ineligible,
            }
        } else {
            DispatchOutcome::Executed { targets }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NavigationState {
    Idle,
    Navigating,
}

/// Control and route ids the dispatcher addresses on the surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SurfaceLayout {
    pub email_fields: Vec<String>,
    pub password_fields: Vec<String>,
    pub confirm_password_fields: Vec<String>,
    pub login_button: String,
    pub register_button: String,
    pub capture_button: String,
    pub upload_button: String,
    pub login_route: String,
    pub register_route: String,
    pub camera_route: String,
}

impl Default for SurfaceLayout {
    fn default() -> Self {
        Self {
            email_fields: vec!["loginEmail".to_string(), "regEmail".to_string()],
            password_fields: vec!["loginPassword".to_string(), "regPassword".to_string()],
            confirm_password_fields: vec!["regPassword2".to_string()],
            login_button: "loginBtn".to_string(),
            register_button: "registerBtn".to_string(),
            capture_button: "captureBtn".to_string(),
            upload_button: "uploadBtn".to_string(),
            login_route: "login".to_string(),
            register_route: "register".to_string(),
            camera_route: "camera".to_string(),
        }
    }
}

impl SurfaceLayout {
    fn all_fields(&self) -> impl Iterator<Item = &String> {
        self.email_fields
            .iter()
            .chain(self.password_fields.iter())
            .chain(self.confirm_password_fields.iter())
    }
}

pub struct CommandDispatcher {
    surface: Arc<dyn ActionSurface>,
    layout: SurfaceLayout,
    gate: Option<Arc<dyn ConfirmationGate>>,
    capture_settle: Duration,
    navigation: Mutex<NavigationState>,
}

impl CommandDispatcher {
    pub fn new(surface: Arc<dyn ActionSurface>, layout: SurfaceLayout) -> Self {
        Self {
            surface,
            layout,
            gate: None,
            capture_settle: Duration::from_millis(1_500),
            navigation: Mutex::new(NavigationState::Idle),
        }
    }

    pub fn with_confirmation_gate(mut self, gate: Arc<dyn ConfirmationGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_capture_settle(mut self, settle: Duration) -> Self {
        self.capture_settle = settle;
        self
    }

    pub fn with_layout(mut self, layout: SurfaceLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub async fn navigation_state(&self) -> NavigationState {
        *self.navigation.lock().await
    }

    pub async fn dispatch(&self, command: &ParsedCommand) -> DispatchOutcome {
        if command.requires_confirmation {
            let Some(gate) = self.gate.clone() else {
                return DispatchOutcome::ConfirmationRequired;
            };
            let prompt = confirmation_prompt(command.action_kind);
            let pending = command.clone();
            let confirmed = tokio::task::spawn_blocking(move || gate.confirm(&pending, prompt))
                .await
                .unwrap_or_else(|err| {
                    warn!(error = %err, "confirmation prompt failed");
                    false
                });
            if !confirmed {
                info!(action = ?command.action_kind, "confirmation declined");
                return DispatchOutcome::Skipped {
                    reason: SkipReason::Declined,
                };
            }
        }
        self.execute(command).await
    }

    /// Runs a command whose confirmation was obtained out of band.
    pub async fn dispatch_confirmed(&self, command: &ParsedCommand) -> DispatchOutcome {
        self.execute(command).await
    }

    async fn execute(&self, command: &ParsedCommand) -> DispatchOutcome {
        let text = command.parameter("text").unwrap_or_default();
        let outcome = match command.action_kind {
            ActionKind::FillEmail => self.fill_each(&self.layout.email_fields, text),
            ActionKind::FillPassword => self.fill_each(&self.layout.password_fields, text),
            ActionKind::FillConfirmPassword => {
                self.fill_each(&self.layout.confirm_password_fields, text)
            }
            ActionKind::ClearForm => {
                let fields = self.layout.all_fields().cloned().collect::<Vec<_>>();
                self.fill_each(&fields, "")
            }
            ActionKind::SubmitForm => self.click_first(&[
                self.layout.login_button.as_str(),
                self.layout.register_button.as_str(),
            ]),
            ActionKind::SubmitLogin => self.click_first(&[self.layout.login_button.as_str()]),
            ActionKind::CreateAccount => {
                self.click_first(&[self.layout.register_button.as_str()])
            }
            ActionKind::UploadImage => self.click_first(&[self.layout.upload_button.as_str()]),
            ActionKind::CapturePhoto => self.capture().await,
            ActionKind::NavigateLogin => self.navigate(&self.layout.login_route).await,
            ActionKind::NavigateRegister => self.navigate(&self.layout.register_route).await,
            ActionKind::NavigateCamera => self.navigate(&self.layout.camera_route).await,
            ActionKind::PlayAudio => self.media(MediaOp::Play),
            ActionKind::PauseAudio => self.media(MediaOp::Pause),
            ActionKind::ReplayAudio => self.media(MediaOp::Replay),
            ActionKind::EndSession => self.end_session().await,
            ActionKind::StopListening | ActionKind::ShowHelp | ActionKind::Unknown => {
                DispatchOutcome::Skipped {
                    reason: SkipReason::Unsupported,
                }
            }
        };
        debug!(action = ?command.action_kind, ?outcome, "dispatch finished");
        outcome
    }

    /// Fills every eligible field; ineligible ones are skipped silently.
    fn fill_each(&self, field_ids: &[String], text: &str) -> DispatchOutcome {
        let targets = field_ids
            .iter()
            .filter(|id| self.surface.is_eligible(&SurfaceTarget::Field((*id).clone())))
            .filter(|id| self.surface.fill_field(id, text))
            .cloned()
            .collect::<Vec<_>>();
        DispatchOutcome::from_targets(targets)
    }

    fn click_first(&self, control_ids: &[&str]) -> DispatchOutcome {
        let clicked = control_ids
            .iter()
            .find(|id| self.surface.is_eligible(&SurfaceTarget::Control((**id).to_string())))
            .filter(|id| self.surface.click_control(id))
            .map(|id| vec![(*id).to_string()])
            .unwrap_or_default();
        DispatchOutcome::from_targets(clicked)
    }

    fn media(&self, op: MediaOp) -> DispatchOutcome {
        if !self.surface.is_eligible(&SurfaceTarget::Media) || !self.surface.control_media(op) {
            return DispatchOutcome::from_targets(Vec::new());
        }
        DispatchOutcome::Executed {
            targets: vec![format!("media:{}", media_label(op))],
        }
    }

    async fn navigate(&self, route: &str) -> DispatchOutcome {
        if !self.surface.is_eligible(&SurfaceTarget::Route(route.to_string())) {
            return DispatchOutcome::from_targets(Vec::new());
        }
        let Some(_navigating) = self.begin_navigation().await else {
            return DispatchOutcome::Skipped {
                reason: SkipReason::Busy,
            };
        };
        let navigated = self.surface.navigate(route);
        self.end_navigation().await;
        if navigated {
            DispatchOutcome::Executed {
                targets: vec![format!("route:{route}")],
            }
        } else {
            DispatchOutcome::from_targets(Vec::new())
        }
    }

    async fn end_session(&self) -> DispatchOutcome {
        if !self.surface.is_eligible(&SurfaceTarget::Session) {
            return DispatchOutcome::from_targets(Vec::new());
        }
        let Some(_navigating) = self.begin_navigation().await else {
            return DispatchOutcome::Skipped {
                reason: SkipReason::Busy,
            };
        };
        let ended = self.surface.end_session();
        self.end_navigation().await;
        if ended {
            DispatchOutcome::Executed {
                targets: vec!["session".to_string()],
            }
        } else {
            DispatchOutcome::from_targets(Vec::new())
        }
    }

    /// Clicks capture when visible; otherwise opens the camera page first and
    /// waits for it to settle.
    async fn capture(&self) -> DispatchOutcome {
        let capture = SurfaceTarget::Control(self.layout.capture_button.clone());
        if self.surface.is_eligible(&capture) {
            return self.click_first(&[self.layout.capture_button.as_str()]);
        }

        let route = self.layout.camera_route.clone();
        if !self.surface.is_eligible(&SurfaceTarget::Route(route.clone())) {
            return DispatchOutcome::from_targets(Vec::new());
        }
        let Some(_navigating) = self.begin_navigation().await else {
            return DispatchOutcome::Skipped {
                reason: SkipReason::Busy,
            };
        };
        if !self.surface.navigate(&route) {
            self.end_navigation().await;
            return DispatchOutcome::from_targets(Vec::new());
        }
        tokio::time::sleep(self.capture_settle).await;
        self.end_navigation().await;

        let mut targets = vec![format!("route:{route}")];
        if self.surface.is_eligible(&capture)
            && self.surface.click_control(&self.layout.capture_button)
        {
            targets.push(self.layout.capture_button.clone());
        }
        DispatchOutcome::Executed { targets }
    }

    async fn begin_navigation(&self) -> Option<NavigationState> {
        let mut state = self.navigation.lock().await;
        if *state == NavigationState::Navigating {
            return None;
        }
        *state = NavigationState::Navigating;
        Some(NavigationState::Navigating)
    }

    async fn end_navigation(&self) {
        *self.navigation.lock().await = NavigationState::Idle;
    }
}

fn media_label(op: MediaOp) -> &'static str {
    match op {
        MediaOp::Play => "play",
        MediaOp::Pause => "pause",
        MediaOp::Replay => "replay",
    }
}

fn confirmation_prompt(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::EndSession => "¿Cerrar la sesión?",
        _ => "¿Confirmar la acción?",
    }
}
