use serde::{Deserialize, Serialize};

use crate::state::room::{ItemId, MediaKind};

/// "Play together" command as stored on the room document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    /// Item to open.
    pub media_id: ItemId,
    /// Media kind of the item.
    #[serde(default)]
    pub media_type: MediaKind,
    /// Playback position in seconds.
    #[serde(default)]
    pub position: f64,
    /// Whether playback should be running.
    #[serde(default)]
    pub is_playing: bool,
    /// Uid of the member who issued the command.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Server time of the command in epoch millis; unresolved until the store acknowledges it.
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Local request to broadcast a playback command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackCommand {
    /// Item to open.
    pub media_id: ItemId,
    /// Media kind of the item.
    #[serde(default)]
    pub media_type: MediaKind,
    /// Playback position in seconds.
    #[serde(default)]
    pub position: f64,
    /// Whether playback should be running.
    #[serde(default)]
    pub is_playing: bool,
}

/// Applies each remote playback command at most once per client.
#[derive(Debug, Default)]
pub struct PlaybackGate {
    last_applied: Option<i64>,
}

impl PlaybackGate {
    /// Decide whether `update` must be applied by the client `self_uid`.
    ///
    /// Self-issued commands are never applied. Others are applied once their
    /// server timestamp is known and newer than the last one applied.
    pub fn admit(&mut self, update: &PlaybackState, self_uid: Option<&str>) -> bool {
        if self_uid.is_some() && update.updated_by.as_deref() == self_uid {
            return false;
        }
        let Some(stamp) = update.updated_at else {
            return false;
        };
        if self.last_applied.is_some_and(|last| stamp <= last) {
            return false;
        }
        self.last_applied = Some(stamp);
        true
    }

    /// Timestamp of the last applied command.
    pub fn last_applied(&self) -> Option<i64> {
        self.last_applied
    }

    /// Forget the applied history (used when leaving a room).
    pub fn reset(&mut self) {
        self.last_applied = None;
    }
}
