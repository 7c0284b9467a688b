use serde::Serialize;

use crate::dto::format_millis;

/// Health payload returned by the `/healthcheck` route.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Health status ("ok" or "degraded").
    pub status: String,
    /// Room the bridge currently follows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// When the status was computed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<String>,
}

impl HealthResponse {
    /// Operational bridge.
    pub fn ok(room_id: Option<String>, now_millis: i64) -> Self {
        Self::with_status("ok", room_id, now_millis)
    }

    /// Bridge running while the store is unreachable.
    pub fn degraded(room_id: Option<String>, now_millis: i64) -> Self {
        Self::with_status("degraded", room_id, now_millis)
    }

    fn with_status(status: &str, room_id: Option<String>, now_millis: i64) -> Self {
        Self {
            status: status.to_string(),
            room_id,
            checked_at: format_millis(now_millis),
        }
    }
}
