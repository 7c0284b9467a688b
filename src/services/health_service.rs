use tracing::warn;

use crate::{dto::health::HealthResponse, state::SharedState};

/// Check the store and report the bridge health, logging connectivity issues.
pub async fn health_status(state: &SharedState) -> HealthResponse {
    let context = state.context();
    if let Err(err) = context.store.health_check().await {
        warn!(error = %err, "storage health check failed");
    }

    let room_id = state.session().current_room().await;
    let now = context.now_millis();
    if state.is_degraded() {
        HealthResponse::degraded(room_id, now)
    } else {
        HealthResponse::ok(room_id, now)
    }
}
