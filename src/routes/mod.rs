use axum::Router;

use crate::state::SharedState;

pub mod chat;
pub mod health;
pub mod pool;
pub mod session;
pub mod sse;

/// Compose all route trees and wire in the shared state.
pub fn router(state: SharedState) -> Router<()> {
    health::router()
        .merge(sse::router())
        .merge(session::router())
        .merge(pool::router())
        .merge(chat::router())
        .with_state(state)
}
