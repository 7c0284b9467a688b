//! Error types of the CouchDB document store.

use reqwest::StatusCode;
use thiserror::Error;

/// Result alias returning [`CouchDaoError`] failures.
pub type CouchResult<T> = Result<T, CouchDaoError>;

/// Failures that can occur while talking to CouchDB.
#[derive(Debug, Error)]
pub enum CouchDaoError {
    /// Required environment variable is missing.
    #[error("missing CouchDB environment variable `{var}`")]
    MissingEnvVar {
        /// Name of the variable.
        var: &'static str,
    },
    /// The configured base URL cannot address a database.
    #[error("invalid CouchDB base url `{url}`")]
    InvalidBaseUrl {
        /// Configured value.
        url: String,
    },
    /// Building the HTTP client failed.
    #[error("failed to build CouchDB client")]
    ClientBuilder {
        /// Client construction failure.
        #[source]
        source: reqwest::Error,
    },
    /// Creating the database failed.
    #[error("failed to create CouchDB database `{database}`")]
    DatabaseCreate {
        /// Database name.
        database: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected status for a database level request.
    #[error("unexpected CouchDB database response status {status} for `{database}`")]
    DatabaseStatus {
        /// Database name.
        database: String,
        /// Returned status.
        status: StatusCode,
    },
    /// A request could not be sent.
    #[error("failed to send CouchDB request to `{path}`")]
    RequestSend {
        /// Requested resource.
        path: String,
        /// Transport failure.
        #[source]
        source: reqwest::Error,
    },
    /// Unexpected status for a document or feed request.
    #[error("unexpected CouchDB response status {status} for `{path}`")]
    RequestStatus {
        /// Requested resource.
        path: String,
        /// Returned status.
        status: StatusCode,
    },
    /// Response body was not the expected JSON.
    #[error("failed to decode CouchDB response for `{path}`")]
    DecodeResponse {
        /// Requested resource.
        path: String,
        /// Decoding failure.
        #[source]
        source: reqwest::Error,
    },
    /// A merge kept losing the revision race.
    #[error("gave up writing `{path}` after {attempts} conflicting revisions")]
    Conflict {
        /// Document id.
        path: String,
        /// Attempts made.
        attempts: u32,
    },
}
