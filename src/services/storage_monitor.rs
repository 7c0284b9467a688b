use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{info, warn};

use crate::{
    dao::{storage::StorageError, store::DocumentStore},
    services::events::RoomEvent,
    state::SharedState,
};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Retry `connect` with exponential backoff until a store is available.
pub async fn connect_with_retry<F, Fut>(mut connect: F) -> Arc<dyn DocumentStore>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Arc<dyn DocumentStore>, StorageError>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt: u32 = 0;
    loop {
        match connect().await {
            Ok(store) => {
                info!(attempt, "storage connection established");
                return store;
            }
            Err(err) => {
                warn!(attempt, error = %err, "storage connection attempt failed");
                attempt += 1;
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

/// Poll the store health and flip the bridge into degraded mode while it fails.
///
/// Health checks back off exponentially while the store is down and return
/// to the regular poll interval once it recovers.
pub async fn run(state: SharedState) {
    let mut delay = INITIAL_DELAY;
    loop {
        match state.context().store.health_check().await {
            Ok(()) => {
                if mark(&state, false) {
                    info!("storage healthy again; leaving degraded mode");
                    state.context().events.success("Storage reachable again.");
                }
                delay = INITIAL_DELAY;
                sleep(HEALTH_POLL_INTERVAL).await;
            }
            Err(err) => {
                if mark(&state, true) {
                    warn!(error = %err, "storage health check failed; entering degraded mode");
                    state
                        .context()
                        .events
                        .error("Storage unreachable; changes may not be saved.");
                } else {
                    warn!(error = %err, retry_ms = delay.as_millis() as u64, "storage still unreachable");
                }
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
}

fn mark(state: &SharedState, degraded: bool) -> bool {
    let changed = state.update_degraded(degraded);
    if changed {
        state
            .context()
            .events
            .publish(RoomEvent::StorageChanged { degraded });
    }
    changed
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::{
        dao::store::memory::WriteFailure,
        services::session::RoomSession,
        state::{
            AppState,
            fixtures::{expect_event, harness},
        },
    };

    #[tokio::test(start_paused = true)]
    async fn degraded_flag_follows_store_health() {
        let h = harness(Some("ada"));
        let session = RoomSession::new(h.context.clone(), Url::parse("http://localhost/").unwrap());
        let state = AppState::new(session);
        let mut events = h.context.events.subscribe();
        let monitor = tokio::spawn(run(state.clone()));

        h.store.set_write_failure(Some(WriteFailure::Unavailable));
        let down = expect_event(&mut events, |e| matches!(e, RoomEvent::StorageChanged { .. })).await;
        assert_eq!(down, RoomEvent::StorageChanged { degraded: true });
        assert!(state.is_degraded());

        h.store.set_write_failure(None);
        let up = expect_event(&mut events, |e| matches!(e, RoomEvent::StorageChanged { .. })).await;
        assert_eq!(up, RoomEvent::StorageChanged { degraded: false });
        assert!(!state.is_degraded());
        monitor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn connect_retries_until_success() {
        let h = harness(None);
        let mut attempts = 0;
        let store = connect_with_retry(|| {
            attempts += 1;
            let outcome: Result<Arc<dyn DocumentStore>, StorageError> = if attempts < 3 {
                Err(StorageError::PermissionDenied("not yet".into()))
            } else {
                Ok(Arc::new(h.store.clone()))
            };
            async move { outcome }
        })
        .await;

        assert_eq!(attempts, 3);
        assert!(store.health_check().await.is_ok());
    }
}
