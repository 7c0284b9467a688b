use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dao::{
    paths::{CollectionPath, DocPath},
    store::Fields,
};

/// Separator replacing `/` in document ids.
pub const ID_SEPARATOR: &str = "::";
/// Upper bound suffix for `_all_docs` and `_id` range queries.
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<CouchDocument>,
}

#[derive(Debug, Deserialize)]
pub struct DatabaseInfo {
    pub update_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub id: String,
}

/// Stored document: CouchDB metadata plus the application fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl CouchDocument {
    /// Application fields without CouchDB's reserved `_` keys.
    pub fn into_fields(self) -> Fields {
        self.fields
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .collect()
    }
}

pub fn doc_id(path: &DocPath) -> String {
    path.as_str().replace('/', ID_SEPARATOR)
}

pub fn doc_path(doc_id: &str) -> Option<DocPath> {
    DocPath::parse(&doc_id.replace(ID_SEPARATOR, "/"))
}

/// Id prefix shared by every document of `collection` (nested ones included).
pub fn collection_prefix(collection: &CollectionPath) -> String {
    format!(
        "{}{}",
        collection.as_str().replace('/', ID_SEPARATOR),
        ID_SEPARATOR
    )
}
