//! Room lifecycle: join, leave, create and delete rooms, and the wiring of
//! every room component against one room id.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dao::{
        models::{NewPersonalDocument, NewRoom, RoomDocument, TelepartyWrite},
        paths::{CollectionPath, DocPath},
        store::{ListenerHandle, ServerTimestamp, SetOptions, to_fields},
    },
    error::ServiceError,
    services::{
        events::RoomEvent,
        messages::MessageStream,
        pick::PickCoordinator,
        playback::PlaybackSync,
        presence::PresenceTracker,
        replicator::{StateReplicator, SyncTarget},
    },
    state::{
        SharedContext,
        identity::Identity,
        pick::LastPick,
        room::RoomState,
        room_link::{with_room, without_room},
    },
};

/// Message returned when a signed-out user creates a room.
pub const SIGN_IN_TO_CREATE: &str = "Sign in to create a room.";

/// Room document fields shown by the room header.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDetails {
    /// Room id.
    pub room_id: String,
    /// Creator of the room.
    pub owner_id: Option<String>,
    /// Whether the signed-in user owns the room.
    pub is_owner: bool,
    /// External co-watch link.
    pub teleparty_url: Option<String>,
    /// Last broadcast pick.
    pub last_pick: Option<LastPick>,
    /// Shareable room link.
    pub link: String,
}

struct Lifecycle {
    room_id: Option<String>,
    personal_stash: Option<RoomState>,
    page_url: Url,
}

/// Orchestrates the room components for one local user.
#[derive(Clone)]
pub struct RoomSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    context: SharedContext,
    presence: PresenceTracker,
    replicator: StateReplicator,
    picks: PickCoordinator,
    playback: PlaybackSync,
    messages: MessageStream,
    lifecycle: Mutex<Lifecycle>,
    auth_watcher: StdMutex<Option<ListenerHandle>>,
}

impl RoomSession {
    /// Session outside of any room, with links derived from `page_url`.
    pub fn new(context: SharedContext, page_url: Url) -> Self {
        let presence = PresenceTracker::new(context.clone());
        let replicator = StateReplicator::new(context.clone(), RoomState::default());
        let picks = PickCoordinator::new(context.clone(), replicator.clone());
        let playback = PlaybackSync::new(context.clone());
        let messages = MessageStream::new(context.clone(), presence.clone());
        Self {
            inner: Arc::new(SessionInner {
                context,
                presence,
                replicator,
                picks,
                playback,
                messages,
                lifecycle: Mutex::new(Lifecycle {
                    room_id: None,
                    personal_stash: None,
                    page_url: without_room(&page_url),
                }),
                auth_watcher: StdMutex::new(None),
            }),
        }
    }

    /// Shared collaborators.
    pub fn context(&self) -> &SharedContext {
        &self.inner.context
    }

    /// Presence heartbeat and roster.
    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.presence
    }

    /// Local replicated state.
    pub fn replicator(&self) -> &StateReplicator {
        &self.inner.replicator
    }

    /// Pick coordinator.
    pub fn picks(&self) -> &PickCoordinator {
        &self.inner.picks
    }

    /// Playback broadcast.
    pub fn playback(&self) -> &PlaybackSync {
        &self.inner.playback
    }

    /// Chat log.
    pub fn messages(&self) -> &MessageStream {
        &self.inner.messages
    }

    /// Attach personal sync for the current user and follow auth changes.
    pub async fn start(&self) {
        if self.inner.context.identity.current().is_some() {
            self.attach_personal().await;
        }

        let mut changes = self.inner.context.identity.subscribe();
        let session = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let identity = changes.borrow_and_update().clone();
                let Some(inner) = Weak::upgrade(&session) else {
                    break;
                };
                RoomSession { inner }.auth_changed(identity).await;
            }
        });

        let previous = self
            .inner
            .auth_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(ListenerHandle::new(task));
        if let Some(mut previous) = previous {
            previous.unsubscribe();
        }
    }

    async fn auth_changed(&self, identity: Option<Identity>) {
        let lifecycle = self.inner.lifecycle.lock().await;
        match (lifecycle.room_id.clone(), identity) {
            (Some(room_id), Some(identity)) => {
                info!(room_id = %room_id, uid = %identity.uid, "signed in while in a room");
                self.inner.presence.start_heartbeat(&room_id, identity).await;
            }
            (Some(room_id), None) => {
                info!(room_id = %room_id, "signed out while in a room");
                self.inner.presence.stop_heartbeat().await;
            }
            (None, Some(_)) => self.attach_personal().await,
            (None, None) => self.inner.replicator.retarget(None),
        }
    }

    async fn attach_personal(&self) {
        let Some(uid) = self.inner.context.uid() else {
            return;
        };
        if let Err(err) = self.ensure_personal_document().await {
            warn!(uid = %uid, error = %err, "could not prepare personal document");
        }
        self.inner
            .replicator
            .retarget(Some(SyncTarget::Personal { uid }));
    }

    /// Currently joined room.
    pub async fn current_room(&self) -> Option<String> {
        self.inner.lifecycle.lock().await.room_id.clone()
    }

    /// Shareable link of the current page.
    pub async fn room_link(&self) -> Url {
        self.inner.lifecycle.lock().await.page_url.clone()
    }

    /// Join `room_id`, leaving the current room first.
    pub async fn join(&self, room_id: &str) -> Result<(), ServiceError> {
        let room_id = room_id.trim();
        if room_id.is_empty() || room_id.contains('/') {
            return Err(ServiceError::InvalidInput(format!("invalid room id `{room_id}`")));
        }

        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.room_id.is_some() {
            self.leave_locked(&mut lifecycle, false).await;
        }
        if lifecycle.personal_stash.is_none() {
            lifecycle.personal_stash = Some(self.inner.replicator.snapshot());
        }

        let inner = &self.inner;
        inner.replicator.retarget(Some(SyncTarget::Room {
            room_id: room_id.to_string(),
        }));
        tokio::join!(
            inner.presence.start_members_listener(room_id),
            inner.picks.start_listener(room_id),
            inner.playback.start_listener(room_id),
            inner.messages.subscribe(room_id),
        );
        if let Some(identity) = inner.context.identity.current() {
            inner.presence.start_heartbeat(room_id, identity).await;
        }

        lifecycle.room_id = Some(room_id.to_string());
        lifecycle.page_url = with_room(&lifecycle.page_url, room_id);
        info!(room_id, uid = ?inner.context.uid(), "joined room");
        inner.context.events.publish(RoomEvent::SessionChanged {
            room_id: lifecycle.room_id.clone(),
            link: lifecycle.page_url.to_string(),
        });
        Ok(())
    }

    /// Leave the current room; a no-op outside of rooms.
    pub async fn leave(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.room_id.is_none() {
            return;
        }
        self.leave_locked(&mut lifecycle, true).await;
        self.attach_personal().await;
    }

    async fn leave_locked(&self, lifecycle: &mut Lifecycle, restore: bool) {
        let Some(room_id) = lifecycle.room_id.take() else {
            return;
        };
        let inner = &self.inner;
        inner.replicator.retarget(None);
        tokio::join!(
            inner.presence.stop_heartbeat(),
            inner.presence.stop_members_listener(),
            inner.picks.reset(),
            inner.playback.reset(),
            inner.messages.unsubscribe(),
        );

        if let Some(uid) = inner.context.uid() {
            let path = DocPath::member(&room_id, &uid);
            if let Err(err) = inner.context.store.delete_document(&path).await {
                debug!(room_id = %room_id, uid = %uid, error = %err, "could not remove member document");
            }
        }

        if restore {
            let stash = lifecycle.personal_stash.take().unwrap_or_default();
            inner.replicator.replace_local(stash);
        }
        lifecycle.page_url = without_room(&lifecycle.page_url);
        info!(room_id = %room_id, "left room");
        inner.context.events.publish(RoomEvent::SessionChanged {
            room_id: None,
            link: lifecycle.page_url.to_string(),
        });
    }

    /// Create a room seeded with the current local state, then join it.
    pub async fn create_room(&self) -> Result<String, ServiceError> {
        let context = &self.inner.context;
        let Some(uid) = context.uid() else {
            context.events.info(SIGN_IN_TO_CREATE);
            return Err(ServiceError::Unauthorized(SIGN_IN_TO_CREATE.into()));
        };

        let state = self.inner.replicator.snapshot();
        let payload = to_fields(&NewRoom {
            owner_id: &uid,
            pool: &state.pool,
            watched: &state.watched,
            filters: &state.filters,
            updated_by: &uid,
            client_write_id: self.inner.replicator.reserve_write_id(),
            created_at: ServerTimestamp,
            updated_at: ServerTimestamp,
        })?;
        let room_id = context
            .store
            .add_document(&CollectionPath::rooms(), payload)
            .await
            .inspect_err(|err| {
                warn!(uid = %uid, error = %err, "failed to create room");
                context.events.error("Failed to create room.");
            })?;

        info!(room_id = %room_id, uid = %uid, "room created");
        self.join(&room_id).await?;
        Ok(room_id)
    }

    /// Delete the current room (owner only), then leave it.
    pub async fn delete_room(&self) -> Result<(), ServiceError> {
        let context = &self.inner.context;
        let Some(room_id) = self.current_room().await else {
            return Err(ServiceError::InvalidState("Not in a room.".into()));
        };
        let Some(uid) = context.uid() else {
            return Err(ServiceError::Unauthorized("Sign in to delete this room.".into()));
        };

        let path = DocPath::room(&room_id);
        let owner = match context.store.get_document(&path).await? {
            Some(document) => document.decode::<RoomDocument>()?.owner_id,
            None => return Err(ServiceError::NotFound(format!("room `{room_id}` not found"))),
        };
        if owner.as_deref() != Some(uid.as_str()) {
            return Err(ServiceError::Unauthorized(
                "Only the room owner can delete it.".into(),
            ));
        }

        context
            .store
            .delete_document(&path)
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, error = %err, "failed to delete room");
                context.events.error("Failed to delete room.");
            })?;
        self.leave().await;
        info!(room_id = %room_id, uid = %uid, "room deleted");
        context.events.success("Room deleted.");
        Ok(())
    }

    /// Create `users/{uid}` from the local state when it does not exist yet.
    ///
    /// Returns whether the document was created.
    pub async fn ensure_personal_document(&self) -> Result<bool, ServiceError> {
        let context = &self.inner.context;
        let Some(uid) = context.uid() else {
            return Err(ServiceError::Unauthorized("Sign in to save your pool.".into()));
        };
        let path = DocPath::user(&uid);
        if context.store.get_document(&path).await?.is_some() {
            return Ok(false);
        }

        let state = self.inner.replicator.snapshot();
        let payload = to_fields(&NewPersonalDocument {
            pool: &state.pool,
            watched: &state.watched,
            filters: &state.filters,
            updated_by: &uid,
            client_write_id: self.inner.replicator.reserve_write_id(),
            created_at: ServerTimestamp,
            updated_at: ServerTimestamp,
        })?;
        context
            .store
            .set_document(&path, payload, SetOptions::overwrite())
            .await?;
        debug!(uid = %uid, "personal document created");
        Ok(true)
    }

    /// Store the co-watch link on the current room.
    pub async fn save_teleparty_url(&self, link: &str) -> Result<(), ServiceError> {
        let context = &self.inner.context;
        let link = link.trim();
        Url::parse(link)
            .map_err(|err| ServiceError::InvalidInput(format!("invalid link: {err}")))?;
        let Some(room_id) = self.current_room().await else {
            return Err(ServiceError::InvalidState("Not in a room.".into()));
        };
        if context.uid().is_none() {
            return Err(ServiceError::Unauthorized("Login to edit this room.".into()));
        }

        let payload = to_fields(&TelepartyWrite {
            teleparty_url: link,
            updated_at: ServerTimestamp,
        })?;
        context
            .store
            .set_document(&DocPath::room(&room_id), payload, SetOptions::merge())
            .await
            .inspect_err(|err| {
                warn!(room_id = %room_id, error = %err, "failed to save teleparty link");
                context.events.error("Failed to save Teleparty link.");
            })?;
        context.events.success("Teleparty link saved for this room.");
        Ok(())
    }

    /// Current room document fields.
    pub async fn room_details(&self) -> Result<RoomDetails, ServiceError> {
        let Some(room_id) = self.current_room().await else {
            return Err(ServiceError::InvalidState("Not in a room.".into()));
        };
        let context = &self.inner.context;
        let document = context
            .store
            .get_document(&DocPath::room(&room_id))
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("room `{room_id}` not found")))?
            .decode::<RoomDocument>()?;
        let is_owner = document.owner_id.is_some() && document.owner_id == context.uid();
        Ok(RoomDetails {
            room_id,
            owner_id: document.owner_id,
            is_owner,
            teleparty_url: document.teleparty_url,
            last_pick: document.last_pick,
            link: self.room_link().await.to_string(),
        })
    }

    /// Page became visible again: refresh presence right away.
    pub async fn page_visible(&self) {
        self.inner.presence.page_visible().await;
    }

    /// Leave any room and stop following auth and personal state.
    pub async fn shutdown(&self) {
        let watcher = self
            .inner
            .auth_watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut watcher) = watcher {
            watcher.unsubscribe();
        }
        let mut lifecycle = self.inner.lifecycle.lock().await;
        self.leave_locked(&mut lifecycle, true).await;
        self.inner.replicator.retarget(None);
        info!("room session stopped");
    }
}
