use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Presence document written by each member's heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    /// Member uid (same as the document id).
    #[serde(default)]
    pub uid: String,
    /// Display name at the time of the last heartbeat.
    #[serde(default)]
    pub name: Option<String>,
    /// Email at the time of the last heartbeat.
    #[serde(default)]
    pub email: Option<String>,
    /// Server time of the last heartbeat, in epoch millis.
    #[serde(default)]
    pub last_seen_at: Option<i64>,
}

/// Derived view of a room member, as exposed to renderers and mention resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    /// Member uid.
    pub id: String,
    /// Display name, if any.
    pub name: Option<String>,
    /// Email, if any.
    pub email: Option<String>,
    /// Last heartbeat in epoch millis, if one has been recorded.
    pub last_seen_ms: Option<i64>,
    /// Whether the member heartbeated within the online window.
    pub online: bool,
}

impl Member {
    /// Derive a member view from its record at instant `now_millis`.
    pub fn from_record(
        id: &str,
        record: &MemberRecord,
        now_millis: i64,
        window: Duration,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: record.name.clone(),
            email: record.email.clone(),
            last_seen_ms: record.last_seen_at,
            online: is_online(record.last_seen_at, now_millis, window),
        }
    }

    /// Label shown in notifications: name, then email, then id.
    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

/// Online iff the last heartbeat happened less than `window` before `now_millis`.
pub fn is_online(last_seen_ms: Option<i64>, now_millis: i64, window: Duration) -> bool {
    match last_seen_ms {
        Some(seen) if seen > 0 => {
            let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
            now_millis.saturating_sub(seen) < window_ms
        }
        _ => false,
    }
}

/// Build the roster sorted by most recently seen first.
pub fn build_roster<'a>(
    records: impl IntoIterator<Item = (&'a str, &'a MemberRecord)>,
    now_millis: i64,
    window: Duration,
) -> Vec<Member> {
    let mut members: Vec<Member> = records
        .into_iter()
        .map(|(id, record)| Member::from_record(id, record, now_millis, window))
        .collect();
    members.sort_by(|a, b| {
        b.last_seen_ms
            .unwrap_or(0)
            .cmp(&a.last_seen_ms.unwrap_or(0))
            .then_with(|| a.id.cmp(&b.id))
    });
    members
}

/// Presence transition observed between two member snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    /// A member document appeared.
    Joined {
        /// Member uid.
        id: String,
        /// Label to display.
        label: String,
    },
    /// A member document was deleted.
    Left {
        /// Member uid.
        id: String,
        /// Label to display.
        label: String,
    },
}
