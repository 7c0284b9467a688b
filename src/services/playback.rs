use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{PlaybackRecord, PlaybackWrite, RoomDocument},
        paths::DocPath,
        store::{DocumentSnapshot, ListenerHandle, ServerTimestamp, SetOptions, to_fields},
    },
    error::ServiceError,
    services::events::RoomEvent,
    state::{
        SharedContext,
        playback::{PlaybackCommand, PlaybackGate},
    },
};

/// "Play together" broadcast for the current room.
#[derive(Clone)]
pub struct PlaybackSync {
    inner: Arc<PlaybackInner>,
}

struct PlaybackInner {
    context: SharedContext,
    room_id: Mutex<Option<String>>,
    gate: Mutex<PlaybackGate>,
    listener: Mutex<Option<ListenerHandle>>,
}

impl PlaybackSync {
    /// Sync with no room attached.
    pub fn new(context: SharedContext) -> Self {
        Self {
            inner: Arc::new(PlaybackInner {
                context,
                room_id: Mutex::new(None),
                gate: Mutex::new(PlaybackGate::default()),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Merge-write `command` as the room's playback state.
    pub async fn update_playback(&self, command: PlaybackCommand) -> Result<(), ServiceError> {
        let context = &self.inner.context;
        let Some(room_id) = self.inner.room_id.lock().await.clone() else {
            return Err(ServiceError::InvalidState("Join a room to play together.".into()));
        };
        let Some(uid) = context.uid() else {
            return Err(ServiceError::Unauthorized(
                "Login to play together in this room.".into(),
            ));
        };

        let payload = to_fields(&PlaybackWrite {
            playback: PlaybackRecord {
                media_id: command.media_id,
                media_type: command.media_type,
                position: command.position,
                is_playing: command.is_playing,
                updated_by: uid.clone(),
                updated_at: ServerTimestamp,
            },
        })?;
        context
            .store
            .set_document(&DocPath::room(&room_id), payload, SetOptions::merge())
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, error = %err, "failed to publish playback");
                context.events.error("Failed to start playback for the room.");
            })?;

        info!(room_id = %room_id, uid = %uid, media_id = command.media_id, "playback published");
        Ok(())
    }

    /// Follow `playback` on the room document.
    pub async fn start_listener(&self, room_id: &str) {
        self.stop_listener().await;
        *self.inner.room_id.lock().await = Some(room_id.to_string());

        let mut subscription = self
            .inner
            .context
            .store
            .subscribe_document(&DocPath::room(room_id));
        let sync = self.clone();
        let room_id = room_id.to_string();
        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(snapshot) => sync.handle_snapshot(snapshot).await,
                    Err(err) => {
                        warn!(room_id = %room_id, error = %err, "playback listener failed");
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

    /// Stop listening and forget the applied history.
    pub async fn reset(&self) {
        self.stop_listener().await;
        *self.inner.room_id.lock().await = None;
        self.inner.gate.lock().await.reset();
    }

    /// Apply the snapshot's playback command unless it is self-issued or already applied.
    pub async fn handle_snapshot(&self, snapshot: DocumentSnapshot) {
        let playback = match snapshot.decode::<RoomDocument>() {
            Ok(document) => document.and_then(|document| document.playback),
            Err(err) => {
                warn!(path = %snapshot.path, error = %err, "ignoring undecodable room snapshot");
                return;
            }
        };
        let Some(playback) = playback else {
            return;
        };

        let self_uid = self.inner.context.uid();
        if !self
            .inner
            .gate
            .lock()
            .await
            .admit(&playback, self_uid.as_deref())
        {
            debug!(updated_at = ?playback.updated_at, "playback update skipped");
            return;
        }

        self.inner
            .context
            .events
            .publish(RoomEvent::PlaybackApplied { playback });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::state::{
        fixtures::{drain_events, harness, harness_on, settle},
        room::MediaKind,
    };

    fn command(media_id: u64) -> PlaybackCommand {
        PlaybackCommand {
            media_id,
            media_type: MediaKind::Tv,
            position: 12.5,
            is_playing: true,
        }
    }

    fn applied(events: Vec<RoomEvent>) -> Vec<u64> {
        events
            .into_iter()
            .filter_map(|event| match event {
                RoomEvent::PlaybackApplied { playback } => Some(playback.media_id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn playback_reaches_others_but_not_the_issuer() {
        let ada = harness(Some("ada"));
        let bob = harness_on(ada.store.clone(), ada.clock.clone(), Some("bob"));
        let ada_sync = PlaybackSync::new(ada.context.clone());
        let bob_sync = PlaybackSync::new(bob.context.clone());
        ada_sync.start_listener("r1").await;
        bob_sync.start_listener("r1").await;
        settle().await;
        let mut ada_events = ada.context.events.subscribe();
        let mut bob_events = bob.context.events.subscribe();

        ada_sync.update_playback(command(42)).await.unwrap();

        let window = Duration::from_millis(100);
        assert!(applied(drain_events(&mut ada_events, window).await).is_empty());
        assert_eq!(applied(drain_events(&mut bob_events, window).await), vec![42]);

        let stored = ada.store.peek(&DocPath::room("r1")).unwrap();
        assert_eq!(stored["playback"]["updatedBy"], "ada");
        assert_eq!(stored["playback"]["mediaType"], "tv");
    }

    #[tokio::test]
    async fn redelivered_playback_applies_once() {
        let h = harness(Some("bob"));
        let sync = PlaybackSync::new(h.context.clone());
        let mut events = h.context.events.subscribe();
        let snapshot = |updated_at: Option<i64>| DocumentSnapshot {
            path: DocPath::room("r1"),
            data: Some(
                to_fields(&json!({
                    "playback": {"mediaId": 7, "updatedBy": "ada", "updatedAt": updated_at}
                }))
                .unwrap(),
            ),
        };

        sync.handle_snapshot(snapshot(None)).await;
        sync.handle_snapshot(snapshot(Some(10))).await;
        sync.handle_snapshot(snapshot(Some(10))).await;
        sync.handle_snapshot(snapshot(Some(9))).await;

        let seen = applied(drain_events(&mut events, Duration::from_millis(50)).await);
        assert_eq!(seen, vec![7]);
    }

    #[tokio::test]
    async fn playback_requires_a_room_and_sign_in() {
        let h = harness(None);
        let sync = PlaybackSync::new(h.context.clone());
        assert!(matches!(
            sync.update_playback(command(1)).await,
            Err(ServiceError::InvalidState(_))
        ));

        sync.start_listener("r1").await;
        assert!(matches!(
            sync.update_playback(command(1)).await,
            Err(ServiceError::Unauthorized(_))
        ));
        assert!(h.store.peek(&DocPath::room("r1")).is_none());
    }

    #[tokio::test]
    async fn reset_allows_replaying_older_commands_in_a_new_room() {
        let h = harness(Some("bob"));
        let sync = PlaybackSync::new(h.context.clone());
        let snapshot = DocumentSnapshot {
            path: DocPath::room("r1"),
            data: Some(
                to_fields(&json!({"playback": {"mediaId": 3, "updatedBy": "ada", "updatedAt": 5}}))
                    .unwrap(),
            ),
        };

        sync.handle_snapshot(snapshot.clone()).await;
        sync.reset().await;
        let mut events = h.context.events.subscribe();
        sync.handle_snapshot(snapshot).await;

        let seen = applied(drain_events(&mut events, Duration::from_millis(50)).await);
        assert_eq!(seen, vec![3]);
    }
}
