use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::{
        models::{LastPickWrite, PickRecord, RoomDocument},
        paths::DocPath,
        store::{DocumentSnapshot, ListenerHandle, ServerTimestamp, SetOptions, to_fields},
    },
    error::ServiceError,
    services::{
        events::{OpenedPick, RoomEvent},
        replicator::StateReplicator,
    },
    state::{
        SharedContext,
        pick::{LastPick, NoMatchReason, PickGate, choose_pick, pick_candidates},
        room::ItemId,
    },
};

/// Message returned when a signed-out user picks inside a room.
pub const LOGIN_TO_PICK: &str = "Login to pick in this room.";

/// Result of a pick request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PickOutcome {
    /// Outside a room: the pick was opened locally.
    Opened {
        /// Opened item.
        pick: OpenedPick,
    },
    /// Inside a room: the pick was written to the room document and opens
    /// once it comes back through the room listener.
    Published {
        /// Minted pick token.
        pick_id: String,
        /// Picked item.
        item_id: ItemId,
    },
    /// Nothing could be picked.
    NoMatch {
        /// Why.
        reason: NoMatchReason,
    },
}

/// Chooses tonight's pick and opens room picks exactly once per client.
#[derive(Clone)]
pub struct PickCoordinator {
    inner: Arc<PickInner>,
}

struct PickInner {
    context: SharedContext,
    replicator: StateReplicator,
    room_id: Mutex<Option<String>>,
    gate: Mutex<PickGate>,
    last_pick: Mutex<Option<LastPick>>,
    last_opened: Mutex<Option<OpenedPick>>,
    last_chosen: Mutex<Option<ItemId>>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl PickCoordinator {
    /// Coordinator picking from the state owned by `replicator`.
    pub fn new(context: SharedContext, replicator: StateReplicator) -> Self {
        Self {
            inner: Arc::new(PickInner {
                context,
                replicator,
                room_id: Mutex::new(None),
                gate: Mutex::new(PickGate::default()),
                last_pick: Mutex::new(None),
                last_opened: Mutex::new(None),
                last_chosen: Mutex::new(None),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Pick a random candidate from the filtered pool.
    pub async fn pick_for_me(&self) -> Result<PickOutcome, ServiceError> {
        self.pick(None).await
    }

    /// Pick again, avoiding the previous pick when another candidate exists.
    ///
    /// A room pick counts as previous as soon as it is chosen, before its
    /// echo opens it.
    pub async fn reroll(&self) -> Result<PickOutcome, ServiceError> {
        let avoid = *self.inner.last_chosen.lock().await;
        self.pick(avoid).await
    }

    async fn pick(&self, avoid: Option<ItemId>) -> Result<PickOutcome, ServiceError> {
        let context = &self.inner.context;
        let state = self.inner.replicator.snapshot();
        let chosen = match pick_candidates(&state) {
            Ok(candidates) => choose_pick(&candidates, avoid, &mut rand::rng()).cloned(),
            Err(reason) => {
                match reason {
                    NoMatchReason::EmptyPool => context.events.error(reason.message()),
                    NoMatchReason::NoUnwatchedMatches => context.events.info(reason.message()),
                }
                return Ok(PickOutcome::NoMatch { reason });
            }
        };
        let Some(chosen) = chosen else {
            return Ok(PickOutcome::NoMatch {
                reason: NoMatchReason::EmptyPool,
            });
        };
        *self.inner.last_chosen.lock().await = Some(chosen.id);
        let media_type = chosen
            .media_type
            .or(state.filters.media_type)
            .unwrap_or_default();

        let room_id = self.inner.room_id.lock().await.clone();
        let Some(room_id) = room_id else {
            let pick = OpenedPick {
                item_id: chosen.id,
                media_type,
                title: chosen.title.clone(),
                pick_id: None,
                picked_by: None,
            };
            self.open(pick.clone()).await;
            return Ok(PickOutcome::Opened { pick });
        };

        let Some(uid) = context.uid() else {
            context.events.info(LOGIN_TO_PICK);
            return Err(ServiceError::Unauthorized(LOGIN_TO_PICK.into()));
        };

        let pick_id = Uuid::new_v4().to_string();
        let payload = to_fields(&LastPickWrite {
            last_pick: PickRecord {
                pick_id: pick_id.clone(),
                movie_id: chosen.id,
                title: chosen.title.clone(),
                media_type,
                picked_by: uid.clone(),
                picked_at: ServerTimestamp,
                client_picked_at: context.now_millis(),
            },
            updated_at: ServerTimestamp,
        })?;
        context
            .store
            .set_document(&DocPath::room(&room_id), payload, SetOptions::merge())
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, error = %err, "failed to publish pick");
                context.events.error("Failed to share the pick.");
            })?;

        info!(room_id = %room_id, pick_id = %pick_id, item_id = chosen.id, uid = %uid, "pick published");
        Ok(PickOutcome::Published {
            pick_id,
            item_id: chosen.id,
        })
    }

    /// Open the most recent pick again.
    pub async fn show_last_pick(&self) -> Result<OpenedPick, ServiceError> {
        let last = self.inner.last_opened.lock().await.clone();
        let Some(pick) = last else {
            self.inner.context.events.info("No pick yet.");
            return Err(ServiceError::NotFound("No pick yet.".into()));
        };
        self.inner
            .context
            .events
            .publish(RoomEvent::PickOpened { pick: pick.clone() });
        Ok(pick)
    }

    /// Last pick seen on the room document, for the room banner.
    pub async fn room_pick(&self) -> Option<LastPick> {
        self.inner.last_pick.lock().await.clone()
    }

    /// Follow `lastPick` on the room document, replacing any previous listener.
    pub async fn start_listener(&self, room_id: &str) {
        self.stop_listener().await;
        *self.inner.room_id.lock().await = Some(room_id.to_string());

        let mut subscription = self
            .inner
            .context
            .store
            .subscribe_document(&DocPath::room(room_id));
        let coordinator = self.clone();
        let room_id = room_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(snapshot) => coordinator.handle_snapshot(snapshot).await,
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "pick listener failed");
                        break;
                    }
                }
            }
        });
        *self.inner.listener.lock().await = Some(ListenerHandle::new(task));
    }

    /// Stop following the room document.
    pub async fn stop_listener(&self) {
        if let Some(mut handle) = self.inner.listener.lock().await.take() {
            handle.unsubscribe();
        }
    }

    /// Stop listening and forget every pick seen in the room.
    pub async fn reset(&self) {
        self.stop_listener().await;
        *self.inner.room_id.lock().await = None;
        self.inner.gate.lock().await.reset();
        *self.inner.last_pick.lock().await = None;
        *self.inner.last_opened.lock().await = None;
        *self.inner.last_chosen.lock().await = None;
    }

    /// Handle one delivery of the room document; a pick opens the first time
    /// its key is seen.
    pub async fn handle_snapshot(&self, snapshot: DocumentSnapshot) {
        let last_pick = match snapshot.decode::<RoomDocument>() {
            Ok(Some(document)) => document.last_pick,
            Ok(None) => None,
            Err(err) => {
                warn!(path = %snapshot.path, error = %err, "ignoring undecodable room snapshot");
                return;
            }
        };
        let Some(last_pick) = last_pick else {
            return;
        };

        *self.inner.last_pick.lock().await = Some(last_pick.clone());
        let key = last_pick.event_key();
        if !self.inner.gate.lock().await.admit(&key) {
            debug!(pick_key = %key, "pick already opened");
            return;
        }

        self.open(OpenedPick {
            item_id: last_pick.movie_id,
            media_type: last_pick.media_type,
            title: last_pick.title,
            pick_id: last_pick.pick_id,
            picked_by: last_pick.picked_by,
        })
        .await;
    }

    async fn open(&self, pick: OpenedPick) {
        *self.inner.last_chosen.lock().await = Some(pick.item_id);
        *self.inner.last_opened.lock().await = Some(pick.clone());
        self.inner
            .context
            .events
            .publish(RoomEvent::PickOpened { pick });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        dao::store::memory::WriteFailure,
        services::events::NoticeLevel,
        state::{
            fixtures::{Harness, drain_events, expect_event, harness, harness_on, item, settle},
            room::{Filters, MediaKind, RoomState},
        },
    };

    fn scenario_state(min_rating: f64) -> RoomState {
        let mut state = RoomState::default();
        state.add_item(item(2, 4.0));
        state.add_item(item(1, 8.0));
        state.filters = Filters {
            min_rating,
            ..Filters::default()
        };
        state
    }

    fn coordinator(h: &Harness, state: RoomState) -> PickCoordinator {
        let replicator = StateReplicator::new(h.context.clone(), state);
        PickCoordinator::new(h.context.clone(), replicator)
    }

    #[tokio::test]
    async fn local_pick_always_selects_the_only_match() {
        let h = harness(None);
        let picks = coordinator(&h, scenario_state(6.0));

        for _ in 0..20 {
            let PickOutcome::Opened { pick } = picks.pick_for_me().await.unwrap() else {
                panic!("expected a local pick");
            };
            assert_eq!(pick.item_id, 1);
            assert_eq!(pick.media_type, MediaKind::Movie);
        }
    }

    #[tokio::test]
    async fn no_match_reports_and_writes_nothing() {
        let h = harness(Some("ada"));
        let picks = coordinator(&h, scenario_state(9.0));
        picks.start_listener("r1").await;
        let mut events = h.context.events.subscribe();

        let outcome = picks.pick_for_me().await.unwrap();
        assert_eq!(
            outcome,
            PickOutcome::NoMatch {
                reason: NoMatchReason::NoUnwatchedMatches
            }
        );
        let notice = expect_event(&mut events, |e| matches!(e, RoomEvent::Notice { .. })).await;
        assert_eq!(
            notice,
            RoomEvent::Notice {
                level: NoticeLevel::Info,
                message: "No unwatched movies match your filters.".into()
            }
        );
        assert!(h.store.peek(&DocPath::room("r1")).is_none());
    }

    #[tokio::test]
    async fn room_pick_is_published_and_opened_once_everywhere() {
        let ada = harness(Some("ada"));
        let bob = harness_on(ada.store.clone(), ada.clock.clone(), Some("bob"));
        let ada_picks = coordinator(&ada, scenario_state(6.0));
        let bob_picks = coordinator(&bob, RoomState::default());
        ada_picks.start_listener("r1").await;
        bob_picks.start_listener("r1").await;
        let mut ada_events = ada.context.events.subscribe();
        let mut bob_events = bob.context.events.subscribe();

        let PickOutcome::Published { pick_id, item_id } = ada_picks.pick_for_me().await.unwrap()
        else {
            panic!("expected a published pick");
        };
        assert_eq!(item_id, 1);

        for events in [&mut ada_events, &mut bob_events] {
            let seen = drain_events(events, Duration::from_millis(150)).await;
            let opened: Vec<_> = seen
                .iter()
                .filter_map(|event| match event {
                    RoomEvent::PickOpened { pick } => Some(pick),
                    _ => None,
                })
                .collect();
            assert_eq!(opened.len(), 1);
            assert_eq!(opened[0].pick_id.as_deref(), Some(pick_id.as_str()));
            assert_eq!(opened[0].picked_by.as_deref(), Some("ada"));
        }

        let stored = ada.store.peek(&DocPath::room("r1")).unwrap();
        assert_eq!(stored["lastPick"]["pickId"], pick_id.as_str());
        assert!(stored["lastPick"]["pickedAt"].is_i64());
    }

    #[tokio::test]
    async fn reroll_right_after_a_room_pick_avoids_it() {
        for _ in 0..10 {
            let h = harness(Some("ada"));
            let mut state = RoomState::default();
            state.add_item(item(1, 8.0));
            state.add_item(item(3, 9.0));
            let picks = coordinator(&h, state);
            picks.start_listener("r1").await;
            settle().await;

            let PickOutcome::Published { item_id: first, .. } = picks.pick_for_me().await.unwrap()
            else {
                panic!("expected a published pick");
            };
            let PickOutcome::Published { item_id: second, .. } = picks.reroll().await.unwrap() else {
                panic!("expected a published reroll");
            };
            assert_ne!(first, second);
            picks.reset().await;
        }
    }

    #[tokio::test]
    async fn duplicate_and_reordered_deliveries_open_once() {
        let h = harness(Some("bob"));
        let picks = coordinator(&h, RoomState::default());
        let mut events = h.context.events.subscribe();
        let snapshot = |pick_id: &str, picked_at: i64| DocumentSnapshot {
            path: DocPath::room("r1"),
            data: Some(
                to_fields(&json!({
                    "lastPick": {"pickId": pick_id, "movieId": 5, "pickedBy": "ada", "pickedAt": picked_at}
                }))
                .unwrap(),
            ),
        };

        picks.handle_snapshot(snapshot("p1", 10)).await;
        picks.handle_snapshot(snapshot("p2", 5)).await;
        picks.handle_snapshot(snapshot("p1", 10)).await;
        picks.handle_snapshot(snapshot("p2", 5)).await;

        let opened: Vec<_> = drain_events(&mut events, Duration::from_millis(50))
            .await
            .into_iter()
            .filter_map(|event| match event {
                RoomEvent::PickOpened { pick } => pick.pick_id,
                _ => None,
            })
            .collect();
        assert_eq!(opened, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn signed_out_room_pick_is_rejected() {
        let h = harness(None);
        let picks = coordinator(&h, scenario_state(6.0));
        picks.start_listener("r1").await;

        let err = picks.pick_for_me().await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));
        settle().await;
        assert!(h.store.peek(&DocPath::room("r1")).is_none());
    }

    #[tokio::test]
    async fn reroll_avoids_previous_pick_when_possible() {
        let h = harness(None);
        let mut state = scenario_state(6.0);
        state.add_item(item(3, 9.0));
        let picks = coordinator(&h, state);

        let PickOutcome::Opened { pick: first } = picks.pick_for_me().await.unwrap() else {
            panic!("expected a local pick");
        };
        for _ in 0..10 {
            let previous = picks.show_last_pick().await.unwrap().item_id;
            let PickOutcome::Opened { pick } = picks.reroll().await.unwrap() else {
                panic!("expected a local pick");
            };
            assert_ne!(pick.item_id, previous);
        }
        assert!([1, 3].contains(&first.item_id));
    }

    #[tokio::test]
    async fn reset_forgets_opened_picks() {
        let h = harness(None);
        let picks = coordinator(&h, scenario_state(6.0));
        picks.pick_for_me().await.unwrap();
        picks.reset().await;

        assert!(matches!(
            picks.show_last_pick().await,
            Err(ServiceError::NotFound(_))
        ));
        assert!(picks.room_pick().await.is_none());
    }

    #[tokio::test]
    async fn failed_publish_surfaces_an_error() {
        let h = harness(Some("ada"));
        h.store.set_write_failure(Some(WriteFailure::Unavailable));
        let picks = coordinator(&h, scenario_state(6.0));
        picks.start_listener("r1").await;

        let err = picks.pick_for_me().await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
        assert!(picks.room_pick().await.is_none());
    }
}
