//! Presence heartbeat and member roster of the current room.

use std::sync::Arc;

use tokio::{
    sync::{Mutex, RwLock},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::HeartbeatWrite,
        paths::{CollectionPath, DocPath},
        store::{
            ChangeKind, CollectionQuery, CollectionSnapshot, ListenerHandle, ServerTimestamp,
            SetOptions, to_fields,
        },
        storage::StorageResult,
    },
    services::events::RoomEvent,
    state::{
        SharedContext,
        identity::Identity,
        presence::{Member, MemberRecord, PresenceChange, build_roster, is_online},
    },
};

struct Heartbeat {
    room_id: String,
    identity: Identity,
    handle: ListenerHandle,
}

/// Keeps the caller's presence document fresh and tracks the room roster.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    context: SharedContext,
    heartbeat: Mutex<Option<Heartbeat>>,
    members_listener: Mutex<Option<ListenerHandle>>,
    roster: RwLock<Vec<Member>>,
}

impl PresenceTracker {
    /// Tracker with no heartbeat and no listener running.
    pub fn new(context: SharedContext) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                context,
                heartbeat: Mutex::new(None),
                members_listener: Mutex::new(None),
                roster: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Beat once right away, then every heartbeat interval, for `identity` in `room_id`.
    ///
    /// Any previous heartbeat is replaced. Failures are ignored.
    pub async fn start_heartbeat(&self, room_id: &str, identity: Identity) {
        self.stop_heartbeat().await;

        beat(&self.inner.context, room_id, &identity).await;

        let period = self.inner.context.config.heartbeat_interval;
        let context = self.inner.context.clone();
        let task_room = room_id.to_string();
        let task_identity = identity.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                beat(&context, &task_room, &task_identity).await;
            }
        });

        info!(room_id, uid = %identity.uid, "presence heartbeat started");
        *self.inner.heartbeat.lock().await = Some(Heartbeat {
            room_id: room_id.to_string(),
            identity,
            handle: ListenerHandle::new(task),
        });
    }

    /// Beat once when the page becomes visible again, if a heartbeat is running.
    pub async fn page_visible(&self) {
        let target = {
            let guard = self.inner.heartbeat.lock().await;
            guard
                .as_ref()
                .map(|heartbeat| (heartbeat.room_id.clone(), heartbeat.identity.clone()))
        };
        if let Some((room_id, identity)) = target {
            beat(&self.inner.context, &room_id, &identity).await;
        }
    }

    /// Cancel the heartbeat; calling it again is a no-op.
    pub async fn stop_heartbeat(&self) {
        if let Some(mut heartbeat) = self.inner.heartbeat.lock().await.take() {
            heartbeat.handle.unsubscribe();
            debug!(room_id = %heartbeat.room_id, "presence heartbeat stopped");
        }
    }

    /// Whether a heartbeat is currently scheduled.
    pub async fn heartbeat_active(&self) -> bool {
        self.inner
            .heartbeat
            .lock()
            .await
            .as_ref()
            .is_some_and(|heartbeat| heartbeat.handle.is_active())
    }

    /// Follow the member collection of `room_id`, replacing any previous listener.
    pub async fn start_members_listener(&self, room_id: &str) {
        self.stop_members_listener().await;

        let query = CollectionQuery::new(CollectionPath::members(room_id));
        let mut subscription = self.inner.context.store.subscribe_collection(query);
        let tracker = self.clone();
        let room_id = room_id.to_string();
        let task = tokio::spawn(async move {
            let mut initial = true;
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(snapshot) => {
                        tracker.apply_members(snapshot, initial).await;
                        initial = false;
                    }
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "members listener failed");
                        tracker
                            .inner
                            .context
                            .events
                            .error("Failed to load room members.");
                        break;
                    }
                }
            }
        });

        *self.inner.members_listener.lock().await = Some(ListenerHandle::new(task));
    }

    /// Stop following the member collection and forget the roster.
    pub async fn stop_members_listener(&self) {
        if let Some(mut handle) = self.inner.members_listener.lock().await.take() {
            handle.unsubscribe();
        }
        self.inner.roster.write().await.clear();
    }

    /// Latest roster, most recently seen first, with online flags recomputed now.
    pub async fn members(&self) -> Vec<Member> {
        let now = self.inner.context.now_millis();
        let window = self.inner.context.config.online_window;
        let roster = self.inner.roster.read().await;
        roster
            .iter()
            .map(|member| Member {
                online: is_online(member.last_seen_ms, now, window),
                ..member.clone()
            })
            .collect()
    }

    async fn apply_members(&self, snapshot: CollectionSnapshot, initial: bool) {
        let context = &self.inner.context;
        let records: Vec<(String, MemberRecord)> = snapshot
            .docs
            .iter()
            .filter_map(|doc| match doc.decode::<MemberRecord>() {
                Ok(record) => Some((doc.id().to_string(), record)),
                Err(err) => {
                    warn!(error = %err, "skipping malformed member document");
                    None
                }
            })
            .collect();

        let roster = build_roster(
            records.iter().map(|(id, record)| (id.as_str(), record)),
            context.now_millis(),
            context.config.online_window,
        );
        *self.inner.roster.write().await = roster.clone();

        if !initial {
            let self_uid = context.uid();
            for change in presence_changes(&snapshot, self_uid.as_deref()) {
                match change {
                    PresenceChange::Joined { id, label } => {
                        context.events.info(format!("{label} joined"));
                        context.events.publish(RoomEvent::MemberJoined {
                            member_id: id,
                            label,
                        });
                    }
                    PresenceChange::Left { id, label } => {
                        context.events.info(format!("{label} left"));
                        context.events.publish(RoomEvent::MemberLeft {
                            member_id: id,
                            label,
                        });
                    }
                }
            }
        }

        context
            .events
            .publish(RoomEvent::MembersChanged { members: roster });
    }
}

/// Joins (other than self) and departures carried by a member snapshot.
fn presence_changes(snapshot: &CollectionSnapshot, self_uid: Option<&str>) -> Vec<PresenceChange> {
    snapshot
        .changes
        .iter()
        .filter_map(|change| {
            let id = change.value.id().to_string();
            let record = change.value.decode::<MemberRecord>().ok();
            let label = record
                .and_then(|record| record.name.or(record.email))
                .unwrap_or_else(|| id.clone());
            match change.kind {
                ChangeKind::Added if Some(id.as_str()) != self_uid => {
                    Some(PresenceChange::Joined { id, label })
                }
                ChangeKind::Removed => Some(PresenceChange::Left { id, label }),
                _ => None,
            }
        })
        .collect()
}

async fn beat(context: &SharedContext, room_id: &str, identity: &Identity) {
    if let Err(err) = write_heartbeat(context, room_id, identity).await {
        debug!(room_id, uid = %identity.uid, error = %err, "heartbeat failed");
    }
}

async fn write_heartbeat(
    context: &SharedContext,
    room_id: &str,
    identity: &Identity,
) -> StorageResult<()> {
    let payload = to_fields(&HeartbeatWrite {
        uid: &identity.uid,
        name: identity.display_name.as_deref(),
        email: identity.email.as_deref(),
        last_seen_at: ServerTimestamp,
    })?;
    context
        .store
        .set_document(
            &DocPath::member(room_id, &identity.uid),
            payload,
            SetOptions::merge(),
        )
        .await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::SyncConfig,
        dao::{store::DocumentStore, store::memory::WriteFailure},
        services::events::{NoticeLevel, RoomEvents},
        state::{
            SyncContext,
            fixtures::{self, NOW, drain_events, expect_event, harness, harness_on, settle},
            identity::IdentityProvider,
        },
    };

    #[tokio::test]
    async fn heartbeat_writes_presence_immediately() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());

        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;

        let record = h.store.peek(&DocPath::member("r1", "ada")).unwrap();
        assert_eq!(record["uid"], "ada");
        assert_eq!(record["name"], "Ada");
        assert_eq!(record["lastSeenAt"], NOW);
        tracker.stop_heartbeat().await;
        tracker.stop_heartbeat().await;
        assert!(!tracker.heartbeat_active().await);
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_uses_the_default_period() {
        let h = harness(Some("ada"));
        let context = SyncContext::new(
            h.context.store.clone(),
            IdentityProvider::new(Some(fixtures::identity("ada"))),
            h.clock.clone(),
            RoomEvents::default(),
            SyncConfig {
                heartbeat_interval: Duration::ZERO,
                ..SyncConfig::default()
            },
        );
        assert!(!context.config.heartbeat_interval.is_zero());
        let tracker = PresenceTracker::new(context);

        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        settle().await;
        assert!(tracker.heartbeat_active().await);
        tracker.stop_heartbeat().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_repeats_on_interval_until_stopped() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());
        let path = DocPath::member("r1", "ada");

        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        h.clock.advance(25_000);
        tokio::time::sleep(Duration::from_secs(26)).await;
        assert_eq!(h.store.peek(&path).unwrap()["lastSeenAt"], NOW + 25_000);

        tracker.stop_heartbeat().await;
        h.clock.advance(25_000);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.store.peek(&path).unwrap()["lastSeenAt"], NOW + 25_000);
    }

    #[tokio::test]
    async fn heartbeat_failures_are_swallowed() {
        let h = harness(Some("ada"));
        h.store.set_write_failure(Some(WriteFailure::Unavailable));
        let tracker = PresenceTracker::new(h.context.clone());
        let mut events = h.context.events.subscribe();

        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        tracker.page_visible().await;

        assert!(tracker.heartbeat_active().await);
        assert!(drain_events(&mut events, Duration::from_millis(50)).await.is_empty());
        tracker.stop_heartbeat().await;
    }

    #[tokio::test]
    async fn page_visible_refreshes_last_seen() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());
        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;

        h.clock.advance(71_500);
        tracker.page_visible().await;

        let record = h.store.peek(&DocPath::member("r1", "ada")).unwrap();
        assert_eq!(record["lastSeenAt"], NOW + 71_500);
        tracker.stop_heartbeat().await;
    }

    #[tokio::test]
    async fn first_snapshot_is_silent_then_joins_and_leaves_notify() {
        let ada = harness(Some("ada"));
        let bob = harness_on(ada.store.clone(), ada.clock.clone(), Some("bob"));
        let ada_tracker = PresenceTracker::new(ada.context.clone());
        let bob_tracker = PresenceTracker::new(bob.context.clone());
        let mut events = ada.context.events.subscribe();

        ada_tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        ada_tracker.start_members_listener("r1").await;
        let initial = expect_event(&mut events, |e| matches!(e, RoomEvent::MembersChanged { .. })).await;
        let RoomEvent::MembersChanged { members } = initial else {
            unreachable!()
        };
        assert_eq!(members.len(), 1);

        bob_tracker.start_heartbeat("r1", fixtures::identity("bob")).await;
        let joined = expect_event(&mut events, |e| matches!(e, RoomEvent::MemberJoined { .. })).await;
        assert_eq!(
            joined,
            RoomEvent::MemberJoined {
                member_id: "bob".into(),
                label: "Bob".into()
            }
        );

        ada.clock.advance(1_000);
        bob_tracker.page_visible().await;
        settle().await;

        bob_tracker.stop_heartbeat().await;
        bob.store
            .delete_document(&DocPath::member("r1", "bob"))
            .await
            .unwrap();
        let left = expect_event(&mut events, |e| matches!(e, RoomEvent::MemberLeft { .. })).await;
        assert_eq!(
            left,
            RoomEvent::MemberLeft {
                member_id: "bob".into(),
                label: "Bob".into()
            }
        );

        let roster = ada_tracker.members().await;
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].id, "ada");
        ada_tracker.stop_heartbeat().await;
        ada_tracker.stop_members_listener().await;
    }

    #[tokio::test]
    async fn heartbeat_refresh_is_silent() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());
        tracker.start_members_listener("r1").await;
        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        settle().await;

        let mut events = h.context.events.subscribe();
        h.clock.advance(1_000);
        tracker.page_visible().await;

        let seen = drain_events(&mut events, Duration::from_millis(100)).await;
        assert!(seen.iter().all(|e| matches!(e, RoomEvent::MembersChanged { .. })));
        assert!(!seen.is_empty());
        tracker.stop_heartbeat().await;
    }

    #[tokio::test]
    async fn roster_reports_offline_after_window() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());
        tracker.start_members_listener("r1").await;
        tracker.start_heartbeat("r1", fixtures::identity("ada")).await;
        tracker.stop_heartbeat().await;
        settle().await;

        assert!(tracker.members().await[0].online);
        h.clock.advance(71_000);
        assert!(!tracker.members().await[0].online);
    }

    #[tokio::test]
    async fn listener_errors_surface_once() {
        let h = harness(Some("ada"));
        let tracker = PresenceTracker::new(h.context.clone());
        let mut events = h.context.events.subscribe();
        tracker.start_members_listener("r1").await;
        settle().await;

        h.store.revoke_listeners("rules changed");
        let notice = expect_event(&mut events, |e| matches!(e, RoomEvent::Notice { .. })).await;
        assert_eq!(
            notice,
            RoomEvent::Notice {
                level: NoticeLevel::Error,
                message: "Failed to load room members.".into()
            }
        );
        assert!(drain_events(&mut events, Duration::from_millis(50)).await.is_empty());
    }
}
