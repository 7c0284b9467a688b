//! Bidirectional replication of pool, watched set and filters with echo suppression.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard},
    thread::{self, ThreadId},
};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    dao::{
        models::{ReplicatedStateWrite, RoomDocument},
        paths::DocPath,
        store::{DocumentSnapshot, ListenerHandle, ServerTimestamp, SetOptions, to_fields},
        storage::StorageResult,
    },
    error::ServiceError,
    services::events::RoomEvent,
    state::{
        SharedContext,
        clock::WriteClock,
        replication::{ReplicationPhase, SaveTracker, is_stale_echo},
        room::{Filters, ItemId, PoolItem, RoomState},
    },
};

/// Message returned when a signed-out user edits a room.
pub const LOGIN_TO_EDIT: &str = "Login to edit this room.";

/// Remote document the local state is replicated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    /// `users/{uid}` outside of rooms.
    Personal {
        /// Owner of the personal document.
        uid: String,
    },
    /// `rooms/{room_id}` while in a room.
    Room {
        /// Joined room.
        room_id: String,
    },
}

impl SyncTarget {
    /// Path of the target document.
    pub fn path(&self) -> DocPath {
        match self {
            SyncTarget::Personal { uid } => DocPath::user(uid),
            SyncTarget::Room { room_id } => DocPath::room(room_id),
        }
    }

    /// Whether the target is a shared room.
    pub fn is_room(&self) -> bool {
        matches!(self, SyncTarget::Room { .. })
    }

    fn load_error(&self) -> &'static str {
        match self {
            SyncTarget::Personal { .. } => "Error loading saved data.",
            SyncTarget::Room { .. } => "Failed to load room.",
        }
    }
}

/// Synchronous callback run while a remote snapshot is being installed.
///
/// Saves scheduled from inside the callback are suppressed.
pub trait StateObserver: Send + Sync {
    /// Called with the freshly installed state.
    fn state_applied(&self, state: &RoomState);
}

/// Owner of the local replicated state and of its target document listener.
#[derive(Clone)]
pub struct StateReplicator {
    inner: Arc<ReplicatorInner>,
}

struct ReplicatorInner {
    context: SharedContext,
    local: RwLock<LocalState>,
    applying: Mutex<ApplyState>,
    target: Mutex<Option<SyncTarget>>,
    listener: Mutex<Option<ListenerHandle>>,
    pending_save: Mutex<Option<ListenerHandle>>,
    write_clock: WriteClock,
    observers: RwLock<Vec<Arc<dyn StateObserver>>>,
}

struct LocalState {
    state: RoomState,
    saves: SaveTracker,
}

/// Remote application in progress and the thread running it.
#[derive(Default)]
struct ApplyState {
    phase: ReplicationPhase<RoomDocument>,
    thread: Option<ThreadId>,
    resave: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StateReplicator {
    /// Replicator over `initial` local state with no target.
    pub fn new(context: SharedContext, initial: RoomState) -> Self {
        Self {
            inner: Arc::new(ReplicatorInner {
                context,
                local: RwLock::new(LocalState {
                    state: initial,
                    saves: SaveTracker::default(),
                }),
                applying: Mutex::new(ApplyState::default()),
                target: Mutex::new(None),
                listener: Mutex::new(None),
                pending_save: Mutex::new(None),
                write_clock: WriteClock::default(),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    fn local(&self) -> RwLockWriteGuard<'_, LocalState> {
        self.inner.local.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback run on every installed remote snapshot.
    pub fn add_observer(&self, observer: Arc<dyn StateObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Copy of the current local state.
    pub fn snapshot(&self) -> RoomState {
        self.inner
            .local
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    /// Current target document.
    pub fn target(&self) -> Option<SyncTarget> {
        lock(&self.inner.target).clone()
    }

    /// Stamp for a write that creates a target document from the local state.
    ///
    /// Echoes of that document are discarded once a later edit is issued.
    pub fn reserve_write_id(&self) -> u64 {
        self.inner
            .write_clock
            .next(self.inner.context.now_millis())
    }

    /// Replace the local state without writing it anywhere.
    pub fn replace_local(&self, state: RoomState) {
        self.local().state = state.clone();
        self.inner
            .context
            .events
            .publish(RoomEvent::StateChanged { state });
    }

    /// Switch to `target`: the old listener and any pending save are dropped
    /// before the new listener starts.
    pub fn retarget(&self, target: Option<SyncTarget>) {
        self.stop_listener();
        self.cancel_pending_save();
        self.local().saves.discard();
        *lock(&self.inner.target) = target.clone();
        if let Some(target) = target {
            info!(path = %target.path(), "replication target switched");
            self.start_listener(target);
        }
    }

    /// Stop following the target document.
    pub fn stop_listener(&self) {
        if let Some(mut handle) = lock(&self.inner.listener).take() {
            handle.unsubscribe();
        }
    }

    fn cancel_pending_save(&self) {
        if let Some(mut pending) = lock(&self.inner.pending_save).take() {
            pending.unsubscribe();
        }
    }

    fn start_listener(&self, target: SyncTarget) {
        let mut subscription = self.inner.context.store.subscribe_document(&target.path());
        let replicator = self.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = subscription.next().await {
                match delivery {
                    Ok(snapshot) => replicator.handle_snapshot(snapshot),
                    Err(err) => {
                        warn!(path = %target.path(), error = %err, "state listener failed");
                        replicator.inner.context.events.error(target.load_error());
                        break;
                    }
                }
            }
        });
        *lock(&self.inner.listener) = Some(ListenerHandle::new(task));
    }

    /// Handle one delivery of the target document.
    ///
    /// Stale echoes of this client's own writes are discarded; anything else
    /// replaces the local state unless local edits are still being saved.
    pub fn handle_snapshot(&self, snapshot: DocumentSnapshot) {
        let document = match snapshot.decode::<RoomDocument>() {
            Ok(Some(document)) => document,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "ignoring undecodable state snapshot");
                return;
            }
        };

        let self_uid = self.inner.context.uid();
        if is_stale_echo(
            document.updated_by.as_deref(),
            document.client_write_id,
            self_uid.as_deref(),
            self.inner.write_clock.last_issued(),
        ) {
            debug!(
                path = %snapshot.path,
                client_write_id = ?document.client_write_id,
                "discarding stale echo"
            );
            return;
        }

        self.apply_remote(document);
    }

    fn apply_remote(&self, document: RoomDocument) {
        let mut next = {
            let mut applying = lock(&self.inner.applying);
            let next = applying.phase.offer(document);
            if next.is_some() {
                applying.thread = Some(thread::current().id());
            }
            next
        };
        let mut resave = false;
        while let Some(document) = next {
            self.install(document);
            let mut applying = lock(&self.inner.applying);
            next = applying.phase.finish();
            if next.is_none() {
                applying.thread = None;
                resave = std::mem::take(&mut applying.resave);
            }
        }
        if resave {
            debug!("saving edits made while remote state was applied");
            self.schedule_save();
        }
    }

    fn install(&self, document: RoomDocument) {
        let filters = document.filters();
        let state = {
            let mut local = self.local();
            if local.saves.has_unsaved() {
                debug!(revision = local.saves.revision(), "remote state held back behind unsaved edits");
                local.saves.miss_remote();
                return;
            }
            if let Some(pool) = document.pool {
                local.state.pool = pool;
            }
            if let Some(watched) = document.watched {
                local.state.watched = watched.into_iter().collect();
            }
            if let Some(filters) = filters {
                local.state.filters = filters;
            }
            local.state.clone()
        };

        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.state_applied(&state);
        }

        self.inner
            .context
            .events
            .publish(RoomEvent::StateChanged { state });
    }

    /// Debounce a write of the local state to the target document.
    ///
    /// No-op while signed out, without a target, or from inside a remote
    /// snapshot application. Calls from other threads during an application
    /// are replayed once it completes.
    pub fn schedule_save(&self) {
        let Some(uid) = self.inner.context.uid() else {
            self.local().saves.discard();
            return;
        };
        {
            let mut applying = lock(&self.inner.applying);
            if applying.phase.is_applying() {
                if applying.thread == Some(thread::current().id()) {
                    drop(applying);
                    debug!("save suppressed while applying remote state");
                    self.local().saves.discard();
                } else {
                    debug!("save deferred until remote state is applied");
                    applying.resave = true;
                }
                return;
            }
        }
        let Some(target) = self.target() else {
            self.local().saves.discard();
            return;
        };

        let config = &self.inner.context.config;
        let delay = if target.is_room() {
            config.room_save_delay
        } else {
            config.personal_save_delay
        };
        let write_id = self.reserve_write_id();

        let replicator = self.clone();
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            replicator.flush(target, uid, write_id).await;
        });
        if let Some(mut previous) = lock(&self.inner.pending_save).replace(ListenerHandle::new(task)) {
            previous.unsubscribe();
        }
    }

    async fn flush(&self, target: SyncTarget, uid: String, write_id: u64) {
        let path = target.path();
        let (state, revision) = {
            let local = self.local();
            (local.state.clone(), local.saves.revision())
        };
        let result = self.write_state(&path, &state, &uid, write_id).await;
        let reread = self.local().saves.saved(revision, result.is_ok());
        match result {
            Ok(()) => debug!(path = %path, client_write_id = write_id, "state saved"),
            Err(err) => {
                warn!(path = %path, error = %err, "state save failed");
                self.inner.context.events.error("Failed to save changes.");
            }
        }
        if reread {
            self.reread(&target).await;
        }
    }

    async fn write_state(
        &self,
        path: &DocPath,
        state: &RoomState,
        uid: &str,
        write_id: u64,
    ) -> StorageResult<()> {
        let payload = to_fields(&ReplicatedStateWrite {
            pool: &state.pool,
            watched: &state.watched,
            filters: &state.filters,
            updated_by: uid,
            client_write_id: write_id,
            updated_at: ServerTimestamp,
        })?;
        self.inner
            .context
            .store
            .set_document(path, payload, SetOptions::merge())
            .await
    }

    /// Read the target again after remote snapshots were held back.
    async fn reread(&self, target: &SyncTarget) {
        let path = target.path();
        match self.inner.context.store.get_document(&path).await {
            Ok(document) => {
                if self.target().as_ref() != Some(target) {
                    return;
                }
                self.handle_snapshot(DocumentSnapshot {
                    path,
                    data: document.map(|document| document.data),
                });
            }
            Err(err) => warn!(path = %path, error = %err, "could not re-read state after save"),
        }
    }

    fn require_edit_rights(&self) -> Result<(), ServiceError> {
        let in_room = self.target().is_some_and(|target| target.is_room());
        if in_room && self.inner.context.uid().is_none() {
            return Err(ServiceError::Unauthorized(LOGIN_TO_EDIT.into()));
        }
        Ok(())
    }

    fn mutate<T>(&self, change: impl FnOnce(&mut RoomState) -> T) -> Result<T, ServiceError> {
        self.require_edit_rights()?;
        let (result, state) = {
            let mut local = self.local();
            let result = change(&mut local.state);
            local.saves.edit();
            (result, local.state.clone())
        };
        self.inner
            .context
            .events
            .publish(RoomEvent::StateChanged { state });
        self.schedule_save();
        Ok(result)
    }

    /// Add `item` at the front of the pool; `false` when it was already there.
    pub fn add_to_pool(&self, item: PoolItem) -> Result<bool, ServiceError> {
        self.mutate(|state| state.add_item(item))
    }

    /// Remove an item from the pool.
    pub fn remove_from_pool(&self, id: ItemId) -> Result<bool, ServiceError> {
        self.mutate(|state| state.remove_item(id))
    }

    /// Empty the pool.
    pub fn clear_pool(&self) -> Result<(), ServiceError> {
        self.mutate(|state| state.pool.clear())
    }

    /// Flip the watched flag of `id`, returning the new value.
    pub fn toggle_watched(&self, id: ItemId) -> Result<bool, ServiceError> {
        self.mutate(|state| state.toggle_watched(id))
    }

    /// Replace the filter configuration.
    pub fn set_filters(&self, filters: Filters) -> Result<(), ServiceError> {
        self.mutate(|state| state.filters = filters)
    }
}
