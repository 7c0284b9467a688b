//! In-process [`DocumentStore`] used as the standalone backend and as the fake in tests.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::{
    dao::{
        paths::{CollectionPath, DocPath},
        storage::{StorageError, StorageResult},
    },
    state::clock::{Clock, SystemClock},
};

use super::{
    CollectionQuery, CollectionSnapshot, Document, DocumentSnapshot, DocumentStore, Fields,
    ListenerHandle, SetOptions, Subscription, apply_write, auto_id, diff_collection,
    resolve_fields, subscription_channel,
};

const CHANGE_CAPACITY: usize = 256;

/// Failure mode injected into writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// Writes fail as if the backend were unreachable.
    Unavailable,
    /// Writes are refused as if the rules denied them.
    PermissionDenied,
}

/// Source error attached to injected unavailability.
#[derive(Debug, Error)]
#[error("injected write failure")]
pub struct InjectedFailure;

#[derive(Debug, Clone)]
enum StoreEvent {
    Changed(DocPath),
    ListenersRevoked(String),
}

/// Documents kept in a concurrent map, with change fan-out to listener tasks.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    docs: DashMap<DocPath, Fields>,
    events: broadcast::Sender<StoreEvent>,
    clock: Arc<dyn Clock>,
    write_failure: AtomicU8,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("documents", &self.inner.docs.len())
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    /// Create an empty store whose server timestamps come from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events, _rx) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                docs: DashMap::new(),
                events,
                clock,
                write_failure: AtomicU8::new(0),
            }),
        }
    }

    /// Make every following write fail with `failure` (or succeed again with `None`).
    pub fn set_write_failure(&self, failure: Option<WriteFailure>) {
        let code = match failure {
            None => 0,
            Some(WriteFailure::Unavailable) => 1,
            Some(WriteFailure::PermissionDenied) => 2,
        };
        self.inner.write_failure.store(code, Ordering::SeqCst);
    }

    /// Terminate every active listener with a permission error.
    pub fn revoke_listeners(&self, reason: impl Into<String>) {
        let _ = self
            .inner
            .events
            .send(StoreEvent::ListenersRevoked(reason.into()));
    }

    /// Synchronous peek at a stored document.
    pub fn peek(&self, path: &DocPath) -> Option<Fields> {
        self.inner.docs.get(path).map(|entry| entry.value().clone())
    }

    fn check_writable(&self, path: &DocPath) -> StorageResult<()> {
        match self.inner.write_failure.load(Ordering::SeqCst) {
            1 => Err(StorageError::unavailable(
                format!("failed to write `{path}`"),
                InjectedFailure,
            )),
            2 => Err(StorageError::PermissionDenied(format!(
                "write to `{path}` denied"
            ))),
            _ => Ok(()),
        }
    }

    fn write(&self, path: &DocPath, mut data: Fields, options: SetOptions) -> StorageResult<()> {
        self.check_writable(path)?;
        resolve_fields(&mut data, self.inner.clock.now_millis());
        match self.inner.docs.entry(path.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                *current = apply_write(Some(std::mem::take(current)), data, options);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(data);
            }
        }
        self.notify(path);
        Ok(())
    }

    fn remove(&self, path: &DocPath) -> StorageResult<()> {
        self.check_writable(path)?;
        if self.inner.docs.remove(path).is_some() {
            self.notify(path);
        }
        Ok(())
    }

    fn notify(&self, path: &DocPath) {
        let _ = self.inner.events.send(StoreEvent::Changed(path.clone()));
    }

    fn read_collection(&self, query: &CollectionQuery) -> Vec<Document> {
        let docs: Vec<Document> = self
            .inner
            .docs
            .iter()
            .filter(|entry| query.collection.contains(entry.key()))
            .map(|entry| Document {
                path: entry.key().clone(),
                data: entry.value().clone(),
            })
            .collect();
        query.apply(docs)
    }
}

impl DocumentStore for MemoryStore {
    fn get_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move {
            Ok(store.peek(&path).map(|data| Document { path, data }))
        })
    }

    fn set_document(
        &self,
        path: &DocPath,
        data: Fields,
        options: SetOptions,
    ) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.write(&path, data, options) })
    }

    fn delete_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.remove(&path) })
    }

    fn add_document(
        &self,
        collection: &CollectionPath,
        data: Fields,
    ) -> BoxFuture<'static, StorageResult<String>> {
        let store = self.clone();
        let collection = collection.clone();
        Box::pin(async move {
            let id = auto_id();
            store.write(&collection.doc(&id), data, SetOptions::overwrite())?;
            Ok(id)
        })
    }

    fn subscribe_document(&self, path: &DocPath) -> Subscription<DocumentSnapshot> {
        let store = self.clone();
        let path = path.clone();
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = subscription_channel();

        let task = tokio::spawn(async move {
            let mut last = store.peek(&path);
            let initial = DocumentSnapshot {
                path: path.clone(),
                data: last.clone(),
            };
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                match events.recv().await {
                    Ok(StoreEvent::Changed(changed)) if changed == path => {}
                    Ok(StoreEvent::Changed(_)) => continue,
                    Ok(StoreEvent::ListenersRevoked(reason)) => {
                        let _ = tx.send(Err(StorageError::PermissionDenied(reason))).await;
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(path = %path, skipped, "document listener lagged; resending state");
                    }
                    Err(RecvError::Closed) => return,
                }

                let current = store.peek(&path);
                if current == last {
                    continue;
                }
                last = current.clone();
                let snapshot = DocumentSnapshot {
                    path: path.clone(),
                    data: current,
                };
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx, ListenerHandle::new(task))
    }

    fn subscribe_collection(&self, query: CollectionQuery) -> Subscription<CollectionSnapshot> {
        let store = self.clone();
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = subscription_channel();

        let task = tokio::spawn(async move {
            let mut last = store.read_collection(&query);
            let initial = CollectionSnapshot {
                changes: diff_collection(&[], &last),
                docs: last.clone(),
            };
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                match events.recv().await {
                    Ok(StoreEvent::Changed(changed)) if query.collection.contains(&changed) => {}
                    Ok(StoreEvent::Changed(_)) => continue,
                    Ok(StoreEvent::ListenersRevoked(reason)) => {
                        let _ = tx.send(Err(StorageError::PermissionDenied(reason))).await;
                        return;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(
                            collection = %query.collection,
                            skipped,
                            "collection listener lagged; resending state"
                        );
                    }
                    Err(RecvError::Closed) => return,
                }

                let current = store.read_collection(&query);
                let changes = diff_collection(&last, &current);
                if changes.is_empty() {
                    continue;
                }
                last = current.clone();
                let snapshot = CollectionSnapshot {
                    docs: current,
                    changes,
                };
                if tx.send(Ok(snapshot)).await.is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx, ListenerHandle::new(task))
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            match store.inner.write_failure.load(Ordering::SeqCst) {
                1 => Err(StorageError::unavailable(
                    "memory store marked unavailable".to_string(),
                    InjectedFailure,
                )),
                _ => Ok(()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::time::timeout;

    use super::*;
    use crate::{
        dao::store::{ChangeKind, SUBSCRIPTION_BUFFER, ServerTimestamp, to_fields},
        state::clock::ManualClock,
    };

    fn fields(value: Value) -> Fields {
        to_fields(&value).unwrap()
    }

    async fn next<T>(subscription: &mut Subscription<T>) -> StorageResult<T> {
        timeout(Duration::from_secs(1), subscription.next())
            .await
            .expect("listener delivered in time")
            .expect("listener still open")
    }

    #[tokio::test]
    async fn slow_listener_backlog_is_bounded_and_catches_up() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(0)));
        let path = DocPath::room("r1");
        let mut subscription = store.subscribe_document(&path);
        assert!(next(&mut subscription).await.unwrap().data.is_none());

        let writes = SUBSCRIPTION_BUFFER as u64 * 4;
        for n in 0..writes {
            store
                .set_document(&path, fields(json!({"n": n})), SetOptions::overwrite())
                .await
                .unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscription.backlog(), SUBSCRIPTION_BUFFER);

        let mut latest = None;
        while latest != Some(writes - 1) {
            let snapshot = next(&mut subscription).await.unwrap();
            latest = snapshot.data.and_then(|data| data["n"].as_u64());
        }
    }

    #[tokio::test]
    async fn merge_writes_resolve_server_time() {
        let store = MemoryStore::new(Arc::new(ManualClock::new(5_000)));
        let path = DocPath::room("r1");

        store
            .set_document(&path, fields(json!({"pool": [], "ownerId": "u1"})), SetOptions::overwrite())
            .await
            .unwrap();
        store
            .set_document(
                &path,
                fields(json!({"updatedAt": ServerTimestamp})),
                SetOptions::merge(),
            )
            .await
            .unwrap();

        let doc = store.get_document(&path).await.unwrap().unwrap();
        assert_eq!(
            Value::Object(doc.data),
            json!({"pool": [], "ownerId": "u1", "updatedAt": 5_000})
        );
    }

    #[tokio::test]
    async fn document_listener_delivers_initial_state_then_changes() {
        let store = MemoryStore::default();
        let path = DocPath::room("r1");
        let mut subscription = store.subscribe_document(&path);

        assert!(!next(&mut subscription).await.unwrap().exists());

        store
            .set_document(&path, fields(json!({"a": 1})), SetOptions::merge())
            .await
            .unwrap();
        let snapshot = next(&mut subscription).await.unwrap();
        assert_eq!(snapshot.data.unwrap()["a"], 1);

        store.delete_document(&path).await.unwrap();
        assert!(!next(&mut subscription).await.unwrap().exists());
    }

    #[tokio::test]
    async fn collection_listener_reports_added_then_diffs() {
        let store = MemoryStore::default();
        let members = CollectionPath::members("r1");
        store
            .set_document(&members.doc("ada"), fields(json!({"uid": "ada"})), SetOptions::merge())
            .await
            .unwrap();

        let mut subscription = store.subscribe_collection(CollectionQuery::new(members.clone()));
        let first = next(&mut subscription).await.unwrap();
        assert_eq!(first.docs.len(), 1);
        assert_eq!(first.changes[0].kind, ChangeKind::Added);

        store
            .set_document(&members.doc("bob"), fields(json!({"uid": "bob"})), SetOptions::merge())
            .await
            .unwrap();
        let second = next(&mut subscription).await.unwrap();
        assert_eq!(second.docs.len(), 2);
        assert_eq!(second.changes.len(), 1);
        assert_eq!(second.changes[0].value.id(), "bob");

        store.delete_document(&members.doc("ada")).await.unwrap();
        let third = next(&mut subscription).await.unwrap();
        assert_eq!(third.changes[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn injected_failures_reject_writes() {
        let store = MemoryStore::default();
        let path = DocPath::user("u1");

        store.set_write_failure(Some(WriteFailure::Unavailable));
        let err = store
            .set_document(&path, Fields::new(), SetOptions::merge())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable { .. }));

        store.set_write_failure(Some(WriteFailure::PermissionDenied));
        let err = store.delete_document(&path).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        store.set_write_failure(None);
        store
            .set_document(&path, Fields::new(), SetOptions::merge())
            .await
            .unwrap();
        assert!(store.peek(&path).is_some());
    }

    #[tokio::test]
    async fn revoked_listeners_end_with_an_error() {
        let store = MemoryStore::default();
        let mut subscription = store.subscribe_document(&DocPath::room("r1"));
        next(&mut subscription).await.unwrap();

        store.revoke_listeners("rules changed");
        assert!(matches!(
            next(&mut subscription).await,
            Err(StorageError::PermissionDenied(_))
        ));
        assert!(subscription.next().await.is_none());
    }
}
