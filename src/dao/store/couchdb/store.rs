use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::{
    dao::{
        paths::{CollectionPath, DocPath},
        storage::StorageResult,
        store::{
            CollectionQuery, CollectionSnapshot, Document, DocumentSnapshot, DocumentStore,
            Fields, ListenerHandle, SetOptions, Subscription, apply_write, auto_id,
            diff_collection, resolve_fields, subscription_channel,
        },
    },
    state::clock::{Clock, SystemClock},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        AllDocsResponse, ChangesResponse, CouchDocument, DatabaseInfo, END_SUFFIX,
        collection_prefix, doc_id, doc_path,
    },
};

const ALL_DOCS: &str = "_all_docs";
const CHANGES: &str = "_changes";
const MAX_WRITE_ATTEMPTS: u32 = 5;

type Sender<T> = mpsc::Sender<StorageResult<T>>;

/// Filter applied to the `_changes` feed.
enum ChangeFilter {
    DocIds(Vec<String>),
    IdPrefix(String),
}

impl ChangeFilter {
    fn name(&self) -> &'static str {
        match self {
            ChangeFilter::DocIds(_) => "_doc_ids",
            ChangeFilter::IdPrefix(_) => "_selector",
        }
    }

    fn body(&self) -> Value {
        match self {
            ChangeFilter::DocIds(ids) => json!({ "doc_ids": ids }),
            ChangeFilter::IdPrefix(prefix) => json!({
                "selector": {
                    "_id": { "$gt": prefix, "$lt": format!("{prefix}{END_SUFFIX}") }
                }
            }),
        }
    }
}

/// [`DocumentStore`] backed by a CouchDB database.
///
/// Paths map to document ids by replacing `/` with `::`. Listeners follow the
/// `_changes` long-poll feed and re-read what they watch. Server timestamps
/// are taken from the local clock since CouchDB cannot stamp fields itself.
#[derive(Clone)]
pub struct CouchStore {
    client: Client,
    base_url: Arc<Url>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
    poll_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CouchStore {
    /// Connect to CouchDB and create the database when missing.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/'))
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| CouchDaoError::InvalidBaseUrl {
                url: config.base_url.clone(),
            })?;
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;
        let auth = config
            .username
            .zip(config.password)
            .map(|(user, pass)| (Arc::<str>::from(user), Arc::<str>::from(pass)));

        let store = Self {
            client,
            base_url: Arc::new(base_url),
            database: Arc::from(config.database),
            auth,
            poll_timeout: config.poll_timeout,
            clock: Arc::new(SystemClock),
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = (*self.base_url).clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(&self.database).extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url(segments));
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user.as_ref(), Some(pass.as_ref())),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> CouchResult<reqwest::Response> {
        builder
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: path.to_string(),
                source,
            })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response, path: &str) -> CouchResult<T> {
        response
            .json::<T>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: path.to_string(),
                source,
            })
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let response = self.send(self.request(Method::GET, &[]), &database).await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::NOT_FOUND => {
                let create = self
                    .request(Method::PUT, &[])
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                if create.status().is_success() {
                    Ok(())
                } else {
                    Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    })
                }
            }
            other => Err(CouchDaoError::DatabaseStatus {
                database,
                status: other,
            }),
        }
    }

    async fn fetch(&self, id: &str) -> CouchResult<Option<CouchDocument>> {
        let response = self.send(self.request(Method::GET, &[id]), id).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Self::decode(response, id).await.map(Some),
            other => Err(CouchDaoError::RequestStatus {
                path: id.to_string(),
                status: other,
            }),
        }
    }

    /// PUT a document; `Ok(false)` signals a revision conflict.
    async fn put(&self, document: &CouchDocument) -> CouchResult<bool> {
        let builder = self.request(Method::PUT, &[&document.id]).json(document);
        let response = self.send(builder, &document.id).await?;
        match response.status() {
            StatusCode::CONFLICT => Ok(false),
            status if status.is_success() => Ok(true),
            other => Err(CouchDaoError::RequestStatus {
                path: document.id.clone(),
                status: other,
            }),
        }
    }

    async fn write(&self, path: &DocPath, mut data: Fields, options: SetOptions) -> CouchResult<()> {
        resolve_fields(&mut data, self.clock.now_millis());
        let id = doc_id(path);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let existing = self.fetch(&id).await?;
            let rev = existing.as_ref().and_then(|doc| doc.rev.clone());
            let fields = apply_write(existing.map(CouchDocument::into_fields), data.clone(), options);
            let document = CouchDocument {
                id: id.clone(),
                rev,
                fields,
            };
            if self.put(&document).await? {
                return Ok(());
            }
            debug!(doc_id = %id, attempt, "revision conflict; retrying write");
        }

        Err(CouchDaoError::Conflict {
            path: id,
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    async fn remove(&self, path: &DocPath) -> CouchResult<()> {
        let id = doc_id(path);
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(rev) = self.fetch(&id).await?.and_then(|doc| doc.rev) else {
                return Ok(());
            };
            let builder = self
                .request(Method::DELETE, &[&id])
                .query(&[("rev", rev.as_str())]);
            let response = self.send(builder, &id).await?;
            match response.status() {
                StatusCode::NOT_FOUND => return Ok(()),
                StatusCode::CONFLICT => continue,
                status if status.is_success() => return Ok(()),
                other => {
                    return Err(CouchDaoError::RequestStatus {
                        path: id,
                        status: other,
                    });
                }
            }
        }
        Err(CouchDaoError::Conflict {
            path: id,
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    async fn list(&self, query: &CollectionQuery) -> CouchResult<Vec<Document>> {
        let prefix = collection_prefix(&query.collection);
        let params = [
            ("include_docs", "true".to_string()),
            ("startkey", format!("\"{prefix}\"")),
            ("endkey", format!("\"{prefix}{END_SUFFIX}\"")),
        ];
        let builder = self.request(Method::GET, &[ALL_DOCS]).query(&params);
        let response = self.send(builder, ALL_DOCS).await?;
        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: ALL_DOCS.to_string(),
                status: response.status(),
            });
        }

        let payload: AllDocsResponse = Self::decode(response, ALL_DOCS).await?;
        let docs = payload.rows.into_iter().filter_map(|row| {
            let path = doc_path(&row.id)?;
            let doc = row.doc?;
            Some(Document {
                path,
                data: doc.into_fields(),
            })
        });
        Ok(query.apply(docs))
    }

    async fn update_seq(&self) -> CouchResult<Value> {
        let database = self.database.to_string();
        let response = self.send(self.request(Method::GET, &[]), &database).await?;
        if !response.status().is_success() {
            return Err(CouchDaoError::DatabaseStatus {
                database,
                status: response.status(),
            });
        }
        let info: DatabaseInfo = Self::decode(response, &database).await?;
        Ok(info.update_seq)
    }

    async fn poll_changes(&self, since: &Value, filter: &ChangeFilter) -> CouchResult<ChangesResponse> {
        let since = match since {
            Value::String(seq) => seq.clone(),
            other => other.to_string(),
        };
        let params = [
            ("feed", "longpoll".to_string()),
            ("since", since),
            ("timeout", self.poll_timeout.as_millis().to_string()),
            ("filter", filter.name().to_string()),
        ];
        let builder = self
            .request(Method::POST, &[CHANGES])
            .query(&params)
            .json(&filter.body());
        let response = self.send(builder, CHANGES).await?;
        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }
        Self::decode(response, CHANGES).await
    }

    async fn watch_document(&self, path: &DocPath, tx: &Sender<DocumentSnapshot>) -> CouchResult<()> {
        let id = doc_id(path);
        let filter = ChangeFilter::DocIds(vec![id.clone()]);
        let mut since = self.update_seq().await?;
        let mut last = self.fetch(&id).await?.map(CouchDocument::into_fields);
        let initial = DocumentSnapshot {
            path: path.clone(),
            data: last.clone(),
        };
        if tx.send(Ok(initial)).await.is_err() {
            return Ok(());
        }

        loop {
            let changes = self.poll_changes(&since, &filter).await?;
            since = changes.last_seq;
            if changes.results.is_empty() {
                continue;
            }
            let current = self.fetch(&id).await?.map(CouchDocument::into_fields);
            if current == last {
                continue;
            }
            last = current.clone();
            let snapshot = DocumentSnapshot {
                path: path.clone(),
                data: current,
            };
            if tx.send(Ok(snapshot)).await.is_err() {
                return Ok(());
            }
        }
    }

    async fn watch_collection(
        &self,
        query: &CollectionQuery,
        tx: &Sender<CollectionSnapshot>,
    ) -> CouchResult<()> {
        let filter = ChangeFilter::IdPrefix(collection_prefix(&query.collection));
        let mut since = self.update_seq().await?;
        let mut last = self.list(query).await?;
        let initial = CollectionSnapshot {
            changes: diff_collection(&[], &last),
            docs: last.clone(),
        };
        if tx.send(Ok(initial)).await.is_err() {
            return Ok(());
        }

        loop {
            let feed = self.poll_changes(&since, &filter).await?;
            since = feed.last_seq;
            if feed.results.is_empty() {
                continue;
            }
            let current = self.list(query).await?;
            let changes = diff_collection(&last, &current);
            if changes.is_empty() {
                continue;
            }
            last = current.clone();
            if tx.send(Ok(CollectionSnapshot { docs: current, changes })).await.is_err() {
                return Ok(());
            }
        }
    }
}

impl DocumentStore for CouchStore {
    fn get_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<Option<Document>>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move {
            let document = store.fetch(&doc_id(&path)).await?;
            Ok(document.map(|doc| Document {
                path,
                data: doc.into_fields(),
            }))
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
        Box::pin(async move { store.write(&path, data, options).await.map_err(Into::into) })
    }

    fn delete_document(&self, path: &DocPath) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        let path = path.clone();
        Box::pin(async move { store.remove(&path).await.map_err(Into::into) })
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
            store
                .write(&collection.doc(&id), data, SetOptions::overwrite())
                .await?;
            Ok(id)
        })
    }

    fn subscribe_document(&self, path: &DocPath) -> Subscription<DocumentSnapshot> {
        let store = self.clone();
        let path = path.clone();
        let (tx, rx) = subscription_channel();
        let task = tokio::spawn(async move {
            if let Err(err) = store.watch_document(&path, &tx).await {
                warn!(path = %path, error = %err, "document feed stopped");
                let _ = tx.send(Err(err.into())).await;
            }
        });
        Subscription::new(rx, ListenerHandle::new(task))
    }

    fn subscribe_collection(&self, query: CollectionQuery) -> Subscription<CollectionSnapshot> {
        let store = self.clone();
        let (tx, rx) = subscription_channel();
        let task = tokio::spawn(async move {
            if let Err(err) = store.watch_collection(&query, &tx).await {
                warn!(collection = %query.collection, error = %err, "collection feed stopped");
                let _ = tx.send(Err(err.into())).await;
            }
        });
        Subscription::new(rx, ListenerHandle::new(task))
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.update_seq().await.map(|_| ()).map_err(Into::into) })
    }
}
