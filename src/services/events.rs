use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::{
    chat::Message,
    playback::PlaybackState,
    presence::Member,
    room::{ItemId, MediaKind, RoomState},
};

/// Default capacity of the room event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    /// Neutral information.
    Info,
    /// Confirmation of a completed action.
    Success,
    /// Recoverable failure.
    Error,
}

/// Item opened as tonight's pick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenedPick {
    /// Picked item.
    pub item_id: ItemId,
    /// Media kind of the picked item.
    pub media_type: MediaKind,
    /// Title, when known.
    pub title: Option<String>,
    /// Pick token for room picks.
    pub pick_id: Option<String>,
    /// Uid of the picker for room picks.
    pub picked_by: Option<String>,
}

/// Everything the room engine tells its renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Non-blocking notification for the user.
    Notice {
        /// Severity.
        level: NoticeLevel,
        /// Text to show.
        message: String,
    },
    /// Another member's presence document appeared.
    MemberJoined {
        /// Member uid.
        member_id: String,
        /// Label to show.
        label: String,
    },
    /// A member's presence document was removed.
    MemberLeft {
        /// Member uid.
        member_id: String,
        /// Label to show.
        label: String,
    },
    /// Roster, most recently seen first.
    MembersChanged {
        /// Current members.
        members: Vec<Member>,
    },
    /// Local replicated state after a remote snapshot or a local mutation.
    StateChanged {
        /// Current state.
        state: RoomState,
    },
    /// A pick must be shown as tonight's pick.
    PickOpened {
        /// Picked item.
        pick: OpenedPick,
    },
    /// A remote "play together" command must be applied.
    PlaybackApplied {
        /// Command to apply.
        playback: PlaybackState,
    },
    /// Ordered chat log, oldest first.
    MessagesChanged {
        /// Current messages.
        messages: Vec<Message>,
    },
    /// Joined or left a room.
    SessionChanged {
        /// Current room, if any.
        room_id: Option<String>,
        /// Shareable link of the current page.
        link: String,
    },
    /// Storage backend health changed.
    StorageChanged {
        /// Whether writes are currently failing health checks.
        degraded: bool,
    },
}

impl RoomEvent {
    /// Event name used on the SSE stream.
    pub fn name(&self) -> &'static str {
        match self {
            RoomEvent::Notice { .. } => "notice",
            RoomEvent::MemberJoined { .. } => "member_joined",
            RoomEvent::MemberLeft { .. } => "member_left",
            RoomEvent::MembersChanged { .. } => "members_changed",
            RoomEvent::StateChanged { .. } => "state_changed",
            RoomEvent::PickOpened { .. } => "pick_opened",
            RoomEvent::PlaybackApplied { .. } => "playback_applied",
            RoomEvent::MessagesChanged { .. } => "messages_changed",
            RoomEvent::SessionChanged { .. } => "session_changed",
            RoomEvent::StorageChanged { .. } => "storage_changed",
        }
    }
}

/// Broadcast hub fanning room events out to every renderer.
#[derive(Debug, Clone)]
pub struct RoomEvents {
    sender: broadcast::Sender<RoomEvent>,
}

impl Default for RoomEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl RoomEvents {
    /// Hub backed by a broadcast channel of `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a subscriber receiving subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers, ignoring delivery errors.
    pub fn publish(&self, event: RoomEvent) {
        let _ = self.sender.send(event);
    }

    /// Publish a notice.
    pub fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.publish(RoomEvent::Notice {
            level,
            message: message.into(),
        });
    }

    /// Publish an informational notice.
    pub fn info(&self, message: impl Into<String>) {
        self.notice(NoticeLevel::Info, message);
    }

    /// Publish a success notice.
    pub fn success(&self, message: impl Into<String>) {
        self.notice(NoticeLevel::Success, message);
    }

    /// Publish an error notice.
    pub fn error(&self, message: impl Into<String>) {
        self.notice(NoticeLevel::Error, message);
    }
}
