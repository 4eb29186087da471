pub mod audio;
pub mod capture;
pub mod command;
pub mod console;
pub mod dispatch;
pub mod feedback;
pub mod hotkey;
pub mod permissions;
pub mod settings;
pub mod state;
pub mod transcript;
pub mod transcription;

pub use state::{
    Availability, ControllerError, VoiceEvent, VoiceEventKind, VoiceEventPayload,
    VoiceHudState, VoiceSessionController, VoiceSnapshot,
};
