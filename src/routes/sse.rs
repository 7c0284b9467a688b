use std::convert::Infallible;

use axum::{Router, extract::State, response::sse::Sse, routing::get};
use futures::Stream;
use tracing::info;

use crate::{services::sse_service, state::SharedState};

/// Stream room events (notices, roster, state, picks, playback, chat) to the page.
pub async fn room_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<axum::response::sse::Event, Infallible>>> {
    let receiver = state.context().events.subscribe();
    let room_id = state.session().current_room().await;
    info!(room_id = ?room_id, "new room event stream");
    sse_service::to_sse_stream(receiver)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sse/events", get(room_events))
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::{
        services::session::RoomSession,
        state::{AppState, fixtures::harness},
    };

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn event_stream_handler_runs_on_any_worker() {
        let h = harness(Some("ada"));
        let session = RoomSession::new(h.context.clone(), Url::parse("http://localhost/").unwrap());
        session.join("r1").await.unwrap();
        let state = AppState::new(session.clone());

        let handler = room_events(State(state));
        assert_send(&handler);
        let _stream = handler.await;
        session.shutdown().await;
    }
}
