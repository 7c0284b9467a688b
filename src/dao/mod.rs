/// Document shapes stored in rooms, members, messages and personal documents.
pub mod models;
/// Typed document and collection paths.
pub mod paths;
/// Storage error types shared by every backend.
pub mod storage;
/// Document store abstraction and its backends.
pub mod store;
