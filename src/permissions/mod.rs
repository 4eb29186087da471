use crate::capture::{AudioCaptureCycle, CaptureError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MicrophonePermission {
    Granted,
    Denied,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSnapshot {
    pub microphone: MicrophonePermission,
    pub message: Option<String>,
}

impl Default for PermissionSnapshot {
    fn default() -> Self {
        Self {
            microphone: MicrophonePermission::Unknown,
            message: None,
        }
    }
}

impl PermissionSnapshot {
    pub fn is_denied(&self) -> bool {
        self.microphone == MicrophonePermission::Denied
    }
}

pub async fn probe_microphone(capture: &AudioCaptureCycle) -> PermissionSnapshot {
    let (microphone, message) = infer_microphone_permission(capture.probe().await);
    PermissionSnapshot {
        microphone,
        message: Some(message),
    }
}

fn infer_microphone_permission(
    probe: Result<(), CaptureError>,
) -> (MicrophonePermission, String) {
    match probe {
        Ok(()) => (
            MicrophonePermission::Granted,
            "Micrófono listo.".to_string(),
        ),
        Err(CaptureError::DeviceUnavailable(detail)) => (
            MicrophonePermission::Denied,
            format!(
                "No se pudo acceder al micrófono ({detail}). Revisá los permisos y volvé a intentar."
            ),
        ),
        Err(err) => (
            MicrophonePermission::Unknown,
            format!("La prueba del micrófono devolvió: {err}"),
        ),
    }
}
