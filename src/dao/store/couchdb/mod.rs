mod config;
mod error;
mod models;
mod store;

pub use config::CouchConfig;
pub use error::{CouchDaoError, CouchResult};
pub use store::CouchStore;

use reqwest::StatusCode;

use crate::dao::storage::StorageError;

impl From<CouchDaoError> for StorageError {
    fn from(err: CouchDaoError) -> Self {
        match err {
            CouchDaoError::RequestStatus { status, ref path }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
            {
                StorageError::PermissionDenied(format!("access to `{path}` refused"))
            }
            other => StorageError::unavailable(other.to_string(), other),
        }
    }
}
