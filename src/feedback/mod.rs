use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedbackCue {
    Listening,
    Executed,
    Unrecognized,
    Error,
}

pub trait CuePlayer: Send + Sync {
    fn play(&self, cue: FeedbackCue);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SilentCuePlayer;

impl CuePlayer for SilentCuePlayer {
    fn play(&self, _cue: FeedbackCue) {}
}

/// Short audible cues with a shared cooldown so rapid cycles do not overlap
/// playback. Only the cue is dropped; the command that caused it still runs.
pub struct FeedbackCues {
    player: Arc<dyn CuePlayer>,
    cooldown: Duration,
    last_played: Mutex<Option<Instant>>,
}

impl FeedbackCues {
    pub fn new(player: Arc<dyn CuePlayer>, cooldown: Duration) -> Self {
        Self {
            player,
            cooldown,
            last_played: Mutex::new(None),
        }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(SilentCuePlayer), Duration::ZERO)
    }

    /// Returns whether the cue was played.
    pub fn play(&self, cue: FeedbackCue) -> bool {
        let Ok(mut last_played) = self.last_played.lock() else {
            return false;
        };
        let now = Instant::now();
        if last_played.is_some_and(|at| now.duration_since(at) < self.cooldown) {
            trace!(?cue, "feedback cue suppressed by cooldown");
            return false;
        }
        *last_played = Some(now);
        drop(last_played);
        self.player.play(cue);
        true
    }
}
