pub mod chat;
pub mod clock;
pub mod identity;
pub mod pick;
pub mod playback;
pub mod presence;
pub mod replication;
pub mod room;
pub mod room_link;

use std::sync::Arc;

use tokio::sync::watch;

use crate::{
    config::SyncConfig,
    dao::store::DocumentStore,
    services::{events::RoomEvents, session::RoomSession},
};

use self::{clock::Clock, identity::IdentityProvider};

/// Handle shared by every room component.
pub type SharedContext = Arc<SyncContext>;

/// Collaborators and settings the room components run against.
pub struct SyncContext {
    /// Realtime document store.
    pub store: Arc<dyn DocumentStore>,
    /// Signed-in user, with change notifications.
    pub identity: IdentityProvider,
    /// Local wall clock.
    pub clock: Arc<dyn Clock>,
    /// Render boundary.
    pub events: RoomEvents,
    /// Timings and bounds.
    pub config: SyncConfig,
}

impl SyncContext {
    /// Bundle the collaborators into a [`SharedContext`].
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: IdentityProvider,
        clock: Arc<dyn Clock>,
        events: RoomEvents,
        config: SyncConfig,
    ) -> SharedContext {
        Arc::new(Self {
            store,
            identity,
            clock,
            events,
            config: config.normalized(),
        })
    }

    /// Uid of the signed-in user, if any.
    pub fn uid(&self) -> Option<String> {
        self.identity.uid()
    }

    /// Local time in epoch millis.
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}

/// Shared handle to the bridge state.
pub type SharedState = Arc<AppState>;

/// State of the local HTTP bridge: the session it drives plus storage health.
pub struct AppState {
    session: RoomSession,
    degraded: watch::Sender<bool>,
}

impl AppState {
    /// Wrap `session` in a [`SharedState`]; storage starts out healthy.
    pub fn new(session: RoomSession) -> SharedState {
        let (degraded, _rx) = watch::channel(false);
        Arc::new(Self {
            session,
            degraded,
        })
    }

    /// Room session driven by the bridge.
    pub fn session(&self) -> &RoomSession {
        &self.session
    }

    /// Shared collaborators of the session.
    pub fn context(&self) -> &SharedContext {
        self.session.context()
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Update the degraded flag, returning whether it changed.
    pub fn update_degraded(&self, value: bool) -> bool {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::{sync::Arc, time::Duration};

    use tokio::{sync::broadcast, time::timeout};

    use super::{SharedContext, SyncContext};
    use crate::{
        config::SyncConfig,
        dao::store::MemoryStore,
        services::events::{RoomEvent, RoomEvents},
        state::{
            clock::ManualClock,
            identity::{Identity, IdentityProvider},
            room::{ItemId, PoolItem},
        },
    };

    pub const NOW: i64 = 1_700_000_000_000;

    pub struct Harness {
        pub store: MemoryStore,
        pub clock: Arc<ManualClock>,
        pub context: SharedContext,
    }

    /// Context over a fresh memory store, signed in as `uid` when given.
    pub fn harness(uid: Option<&str>) -> Harness {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = MemoryStore::new(clock.clone());
        harness_on(store, clock, uid)
    }

    /// Second client sharing `store` and `clock` with another harness.
    pub fn harness_on(store: MemoryStore, clock: Arc<ManualClock>, uid: Option<&str>) -> Harness {
        let identity = IdentityProvider::new(uid.map(identity));
        let config = SyncConfig {
            personal_save_delay: Duration::ZERO,
            ..SyncConfig::default()
        };
        let context = SyncContext::new(
            Arc::new(store.clone()),
            identity,
            clock.clone(),
            RoomEvents::default(),
            config,
        );
        Harness {
            store,
            clock,
            context,
        }
    }

    pub fn identity(uid: &str) -> Identity {
        let mut name = uid.to_string();
        if let Some(first) = name.get_mut(0..1) {
            first.make_ascii_uppercase();
        }
        Identity::new(uid, Some(name), Some(format!("{uid}@example.com")))
    }

    pub fn item(id: ItemId, rating: f64) -> PoolItem {
        PoolItem {
            id,
            title: Some(format!("Item {id}")),
            poster: None,
            rating: Some(rating),
            release_date: None,
            media_type: None,
        }
    }

    /// Wait for the first event matching `predicate`, skipping the others.
    pub async fn expect_event<F>(rx: &mut broadcast::Receiver<RoomEvent>, mut predicate: F) -> RoomEvent
    where
        F: FnMut(&RoomEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(event) if predicate(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event hub closed"),
                }
            }
        })
        .await
        .expect("expected event was not published")
    }

    /// Collect events published within `window`.
    pub async fn drain_events(rx: &mut broadcast::Receiver<RoomEvent>, window: Duration) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        let _ = timeout(window, async {
            while let Ok(event) = rx.recv().await {
                events.push(event);
            }
        })
        .await;
        events
    }

    /// Let spawned listener tasks run.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
