#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;

use std::{cmp::Ordering, collections::HashMap};

use futures::future::BoxFuture;
use serde::{
    Serialize, Serializer, de::DeserializeOwned, ser::Error as _, ser::SerializeMap,
};
use serde_json::{Map, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::dao::{
    paths::{CollectionPath, DocPath},
    storage::{StorageError, StorageResult},
};

pub use self::memory::MemoryStore;

/// Top-level fields of a stored document.
pub type Fields = Map<String, Value>;

const SENTINEL_KEY: &str = ".sv";
const SENTINEL_TIMESTAMP: &str = "timestamp";

/// Abstraction over a realtime document store with snapshot listeners.
///
/// Writes are plain awaited calls; subscriptions deliver the latest state of
/// what they watch, starting with the full current state.
pub trait DocumentStore: Send + Sync {
    /// Read a single document.
    fn get_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>>;
    /// Write a document, merging top-level fields when `options.merge` is set.
    fn set_document(
        &self,
        path: &DocPath,
        data: Fields,
        options: SetOptions,
    ) -> BoxFuture<'static, StorageResult<()>>;
    /// Delete a document; deleting a missing document succeeds.
    fn delete_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<()>>;
    /// Create a document with a generated id inside `collection`, returning the id.
    fn add_document(
        &self,
        collection: &CollectionPath,
        data: Fields,
    ) -> BoxFuture<'static, StorageResult<String>>;
    /// Watch one document.
    fn subscribe_document(&self, path: &DocPath) -> Subscription<DocumentSnapshot>;
    /// Watch the documents of a collection matching `query`.
    fn subscribe_collection(&self, query: CollectionQuery) -> Subscription<CollectionSnapshot>;
    /// Check that the backend is reachable.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
}

/// Write mode of [`DocumentStore::set_document`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Replace only the named top-level fields instead of the whole document.
    pub merge: bool,
}

impl SetOptions {
    /// Merge-write options.
    pub fn merge() -> Self {
        Self { merge: true }
    }

    /// Whole-document overwrite options.
    pub fn overwrite() -> Self {
        Self { merge: false }
    }
}

/// Placeholder resolved by the store to its own clock when the write lands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTimestamp;

impl Serialize for ServerTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(SENTINEL_KEY, SENTINEL_TIMESTAMP)?;
        map.end()
    }
}

/// JSON form of [`ServerTimestamp`].
pub fn server_timestamp() -> Value {
    let mut sentinel = Map::new();
    sentinel.insert(SENTINEL_KEY.into(), Value::from(SENTINEL_TIMESTAMP));
    Value::Object(sentinel)
}

fn is_server_timestamp(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 1 && map.get(SENTINEL_KEY).and_then(Value::as_str) == Some(SENTINEL_TIMESTAMP)
        }
        _ => false,
    }
}

/// Replace every server timestamp placeholder in `value` with `now_millis`.
pub fn resolve_server_timestamps(value: &mut Value, now_millis: i64) {
    if is_server_timestamp(value) {
        *value = Value::from(now_millis);
        return;
    }
    match value {
        Value::Object(map) => map
            .values_mut()
            .for_each(|child| resolve_server_timestamps(child, now_millis)),
        Value::Array(items) => items
            .iter_mut()
            .for_each(|child| resolve_server_timestamps(child, now_millis)),
        _ => {}
    }
}

/// [`resolve_server_timestamps`] over document fields.
pub fn resolve_fields(fields: &mut Fields, now_millis: i64) {
    fields
        .values_mut()
        .for_each(|value| resolve_server_timestamps(value, now_millis));
}

/// Apply a write to `existing`, honoring the merge flag.
pub fn apply_write(existing: Option<Fields>, data: Fields, options: SetOptions) -> Fields {
    match existing {
        Some(mut current) if options.merge => {
            current.extend(data);
            current
        }
        _ => data,
    }
}

/// Serialize a payload into document fields.
pub fn to_fields<T: Serialize>(payload: &T) -> StorageResult<Fields> {
    match serde_json::to_value(payload).map_err(StorageError::Encode)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(StorageError::Encode(serde_json::Error::custom(
            "document payload must be an object",
        ))),
    }
}

/// Fresh identifier for [`DocumentStore::add_document`].
pub fn auto_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A document read from the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Location of the document.
    pub path: DocPath,
    /// Stored fields.
    pub data: Fields,
}

impl Document {
    /// Document id (last path segment).
    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Decode the fields into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|source| StorageError::decode(self.path.as_str(), source))
    }
}

/// State of a watched document; `data` is `None` when it does not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// Location of the document.
    pub path: DocPath,
    /// Stored fields, if the document exists.
    pub data: Option<Fields>,
}

impl DocumentSnapshot {
    /// Whether the document exists.
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Decode the fields into a typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> StorageResult<Option<T>> {
        self.data
            .as_ref()
            .map(|data| {
                serde_json::from_value(Value::Object(data.clone()))
                    .map_err(|source| StorageError::decode(self.path.as_str(), source))
            })
            .transpose()
    }
}

/// How a document changed between two collection deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Entered the result set.
    Added,
    /// Still in the result set with different fields.
    Modified,
    /// Left the result set.
    Removed,
}

/// Store-agnostic change notification: the full value and how it changed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Value after the change (before it, for removals).
    pub value: T,
}

/// State of a watched collection plus the changes since the previous delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSnapshot {
    /// Documents in query order.
    pub docs: Vec<Document>,
    /// Changes since the previous delivery; everything is `Added` on the first one.
    pub changes: Vec<ChangeEvent<Document>>,
}

/// Collection query: optional ascending order on a numeric field, keeping the last `n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionQuery {
    /// Watched collection.
    pub collection: CollectionPath,
    /// Numeric field to sort by; documents missing it sort last.
    pub order_by: Option<String>,
    /// Keep only the last `n` documents in order.
    pub limit_to_last: Option<usize>,
}

impl CollectionQuery {
    /// Every document of `collection`, ordered by id.
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            order_by: None,
            limit_to_last: None,
        }
    }

    /// Order by `field` ascending.
    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by = Some(field.into());
        self
    }

    /// Keep the last `limit` documents.
    pub fn limit_to_last(mut self, limit: usize) -> Self {
        self.limit_to_last = Some(limit);
        self
    }

    /// Filter, sort and cut `docs` according to the query.
    pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
        let mut selected: Vec<Document> = docs
            .into_iter()
            .filter(|doc| self.collection.contains(&doc.path))
            .collect();
        selected.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit_to_last {
            let skip = selected.len().saturating_sub(limit);
            selected.drain(..skip);
        }
        selected
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        let by_field = match &self.order_by {
            Some(field) => {
                let key = |doc: &Document| doc.data.get(field).and_then(Value::as_f64);
                match (key(a), key(b)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
            None => Ordering::Equal,
        };
        by_field.then_with(|| a.path.cmp(&b.path))
    }
}

/// Classify the differences between two deliveries of the same query.
pub fn diff_collection(previous: &[Document], current: &[Document]) -> Vec<ChangeEvent<Document>> {
    let before: HashMap<&DocPath, &Document> =
        previous.iter().map(|doc| (&doc.path, doc)).collect();
    let after: HashMap<&DocPath, &Document> = current.iter().map(|doc| (&doc.path, doc)).collect();

    let mut changes: Vec<ChangeEvent<Document>> = current
        .iter()
        .filter_map(|doc| match before.get(&doc.path) {
            None => Some(ChangeEvent {
                kind: ChangeKind::Added,
                value: doc.clone(),
            }),
            Some(old) if old.data != doc.data => Some(ChangeEvent {
                kind: ChangeKind::Modified,
                value: doc.clone(),
            }),
            Some(_) => None,
        })
        .collect();

    changes.extend(
        previous
            .iter()
            .filter(|doc| !after.contains_key(&doc.path))
            .map(|doc| ChangeEvent {
                kind: ChangeKind::Removed,
                value: doc.clone(),
            }),
    );
    changes
}

/// Unsubscribe handle of a background listener task; aborts it when dropped.
#[derive(Debug, Default)]
pub struct ListenerHandle {
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Wrap a spawned listener task.
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    /// Whether the listener task is still running.
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the listener; calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Undelivered snapshots a listener may buffer before its feed waits.
pub const SUBSCRIPTION_BUFFER: usize = 16;

/// Bounded channel feeding a [`Subscription`].
pub fn subscription_channel<T>() -> (
    mpsc::Sender<StorageResult<T>>,
    mpsc::Receiver<StorageResult<T>>,
) {
    mpsc::channel(SUBSCRIPTION_BUFFER)
}

/// Stream of snapshots from a store listener plus its unsubscribe handle.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: mpsc::Receiver<StorageResult<T>>,
    handle: ListenerHandle,
}

impl<T> Subscription<T> {
    /// Assemble a subscription from the forwarding channel and its task.
    pub fn new(receiver: mpsc::Receiver<StorageResult<T>>, handle: ListenerHandle) -> Self {
        Self { receiver, handle }
    }

    /// Next delivery; `None` once the listener has stopped.
    pub async fn next(&mut self) -> Option<StorageResult<T>> {
        self.receiver.recv().await
    }

    #[cfg(test)]
    pub(crate) fn backlog(&self) -> usize {
        self.receiver.len()
    }

    /// Stop the listener and drop any undelivered snapshot.
    pub fn unsubscribe(mut self) {
        self.handle.unsubscribe();
        self.receiver.close();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(path: &DocPath, data: Value) -> Document {
        let Value::Object(data) = data else {
            panic!("fixture must be an object");
        };
        Document {
            path: path.clone(),
            data,
        }
    }

    #[test]
    fn server_timestamps_resolve_recursively() {
        let mut value = json!({
            "createdAt": server_timestamp(),
            "lastPick": {"pickedAt": ServerTimestamp, "movieId": 3},
            "list": [ServerTimestamp],
        });
        resolve_server_timestamps(&mut value, 42);
        assert_eq!(
            value,
            json!({"createdAt": 42, "lastPick": {"pickedAt": 42, "movieId": 3}, "list": [42]})
        );
    }

    #[test]
    fn merge_replaces_named_fields_only() {
        let existing = to_fields(&json!({"pool": [1], "reactions": {"a": ["x"]}})).unwrap();
        let update = to_fields(&json!({"reactions": {}})).unwrap();

        let merged = apply_write(Some(existing.clone()), update.clone(), SetOptions::merge());
        assert_eq!(Value::Object(merged), json!({"pool": [1], "reactions": {}}));

        let replaced = apply_write(Some(existing), update, SetOptions::overwrite());
        assert_eq!(Value::Object(replaced), json!({"reactions": {}}));
    }

    #[test]
    fn query_orders_and_keeps_last() {
        let messages = CollectionPath::messages("r1");
        let docs = vec![
            doc(&messages.doc("c"), json!({"createdAt": 3})),
            doc(&messages.doc("a"), json!({"createdAt": 1})),
            doc(&messages.doc("pending"), json!({})),
            doc(&messages.doc("b"), json!({"createdAt": 2})),
            doc(&DocPath::room("r1"), json!({"createdAt": 0})),
        ];
        let query = CollectionQuery::new(messages).order_by("createdAt").limit_to_last(3);

        let ids: Vec<_> = query.apply(docs).iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c", "pending"]);
    }

    #[test]
    fn diff_classifies_changes() {
        let members = CollectionPath::members("r1");
        let ada = members.doc("ada");
        let bob = members.doc("bob");
        let cy = members.doc("cy");
        let previous = vec![doc(&ada, json!({"t": 1})), doc(&bob, json!({"t": 1}))];
        let current = vec![doc(&ada, json!({"t": 2})), doc(&cy, json!({"t": 1}))];

        let kinds: Vec<_> = diff_collection(&previous, &current)
            .into_iter()
            .map(|change| (change.value.id().to_string(), change.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("ada".to_string(), ChangeKind::Modified),
                ("cy".to_string(), ChangeKind::Added),
                ("bob".to_string(), ChangeKind::Removed),
            ]
        );
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        assert!(matches!(to_fields(&3), Err(StorageError::Encode(_))));
    }
}
