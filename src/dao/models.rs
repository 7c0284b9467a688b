use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    dao::store::ServerTimestamp,
    state::{
        chat::{Mention, MessageBody, Reactions, ReplyPreview},
        pick::LastPick,
        playback::PlaybackState,
        room::{Filters, ItemId, MediaKind, PoolItem},
    },
};

/// Room document (`rooms/{id}`) or personal document (`users/{uid}`) as read back.
///
/// Every field is optional: a field missing from a snapshot leaves the
/// corresponding local value untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomDocument {
    /// Creator of the room; never set on personal documents.
    pub owner_id: Option<String>,
    /// Shared pool, most recently added first.
    pub pool: Option<Vec<PoolItem>>,
    /// Watched item ids.
    pub watched: Option<Vec<ItemId>>,
    /// Raw filter object, normalized on read.
    pub filters: Option<Value>,
    /// Last broadcast pick.
    pub last_pick: Option<LastPick>,
    /// Last "play together" command.
    pub playback: Option<PlaybackState>,
    /// External co-watch link.
    pub teleparty_url: Option<String>,
    /// Uid of the last replication writer.
    pub updated_by: Option<String>,
    /// Write stamp of the last replication write.
    pub client_write_id: Option<u64>,
    /// Server time of the last write.
    pub updated_at: Option<i64>,
    /// Server time of creation.
    pub created_at: Option<i64>,
}

impl RoomDocument {
    /// Decoded filters, if the document carries any.
    pub fn filters(&self) -> Option<Filters> {
        self.filters.clone().map(Filters::normalize)
    }
}

/// Replicated state payload merged onto the target document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedStateWrite<'a> {
    pub pool: &'a [PoolItem],
    pub watched: &'a BTreeSet<ItemId>,
    pub filters: &'a Filters,
    pub updated_by: &'a str,
    pub client_write_id: u64,
    pub updated_at: ServerTimestamp,
}

/// Initial room document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRoom<'a> {
    pub owner_id: &'a str,
    pub pool: &'a [PoolItem],
    pub watched: &'a BTreeSet<ItemId>,
    pub filters: &'a Filters,
    pub updated_by: &'a str,
    pub client_write_id: u64,
    pub created_at: ServerTimestamp,
    pub updated_at: ServerTimestamp,
}

/// Personal document created on first sign-in.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPersonalDocument<'a> {
    pub pool: &'a [PoolItem],
    pub watched: &'a BTreeSet<ItemId>,
    pub filters: &'a Filters,
    pub updated_by: &'a str,
    pub client_write_id: u64,
    pub created_at: ServerTimestamp,
    pub updated_at: ServerTimestamp,
}

/// Pick broadcast merged onto the room document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPickWrite {
    pub last_pick: PickRecord,
    pub updated_at: ServerTimestamp,
}

/// Stored form of [`LastPick`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PickRecord {
    pub pick_id: String,
    pub movie_id: ItemId,
    pub title: Option<String>,
    pub media_type: MediaKind,
    pub picked_by: String,
    pub picked_at: ServerTimestamp,
    pub client_picked_at: i64,
}

/// Playback command merged onto the room document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackWrite {
    pub playback: PlaybackRecord,
}

/// Stored form of [`PlaybackState`].
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackRecord {
    pub media_id: ItemId,
    pub media_type: MediaKind,
    pub position: f64,
    pub is_playing: bool,
    pub updated_by: String,
    pub updated_at: ServerTimestamp,
}

/// Presence heartbeat merged onto the member document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatWrite<'a> {
    pub uid: &'a str,
    pub name: Option<&'a str>,
    pub email: Option<&'a str>,
    pub last_seen_at: ServerTimestamp,
}

/// New chat message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage<'a> {
    #[serde(flatten)]
    pub body: &'a MessageBody,
    pub mentions: Vec<Mention>,
    pub user_id: &'a str,
    pub user_name: String,
    pub created_at: ServerTimestamp,
    pub reactions: Reactions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
}

/// Reaction map merged onto a message.
#[derive(Debug, Serialize)]
pub struct ReactionsWrite<'a> {
    pub reactions: &'a Reactions,
}

/// Co-watch link merged onto the room document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelepartyWrite<'a> {
    pub teleparty_url: &'a str,
    pub updated_at: ServerTimestamp,
}
