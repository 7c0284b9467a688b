use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post, put},
};
use validator::Validate;

use crate::{
    dto::session::{CreatedRoom, JoinRoomRequest, SessionView, SignInRequest, TelepartyRequest},
    error::AppError,
    services::session::RoomDetails,
    state::{SharedState, identity::Identity},
};

/// Routes driving sign-in and the room lifecycle.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/session", get(session_view))
        .route("/session/sign-in", post(sign_in))
        .route("/session/sign-out", post(sign_out))
        .route("/session/visible", post(page_visible))
        .route("/rooms", post(create_room))
        .route("/rooms/join", post(join_room))
        .route("/rooms/leave", post(leave_room))
        .route("/rooms/current", get(room_details).delete(delete_room))
        .route("/rooms/current/teleparty", put(save_teleparty))
}

async fn view(state: &SharedState) -> SessionView {
    let session = state.session();
    SessionView {
        identity: state.context().identity.current(),
        room_id: session.current_room().await,
        link: session.room_link().await.to_string(),
        heartbeat_active: session.presence().heartbeat_active().await,
    }
}

/// Current identity and room attachment.
pub async fn session_view(State(state): State<SharedState>) -> Json<SessionView> {
    Json(view(&state).await)
}

/// Record the identity reported by the page's auth provider.
pub async fn sign_in(
    State(state): State<SharedState>,
    Json(payload): Json<SignInRequest>,
) -> Result<Json<SessionView>, AppError> {
    payload.validate()?;
    state.context().identity.sign_in(Identity::from(payload));
    Ok(Json(view(&state).await))
}

/// Forget the signed-in identity.
pub async fn sign_out(State(state): State<SharedState>) -> Json<SessionView> {
    state.context().identity.sign_out();
    Json(view(&state).await)
}

/// The page became visible again: refresh presence right away.
pub async fn page_visible(State(state): State<SharedState>) -> StatusCode {
    state.session().page_visible().await;
    StatusCode::NO_CONTENT
}

/// Create a room owned by the signed-in user and join it.
pub async fn create_room(State(state): State<SharedState>) -> Result<Json<CreatedRoom>, AppError> {
    let session = state.session();
    let room_id = session.create_room().await?;
    let link = session.room_link().await.to_string();
    Ok(Json(CreatedRoom { room_id, link }))
}

/// Join a room by id, leaving the current one first.
pub async fn join_room(
    State(state): State<SharedState>,
    Json(payload): Json<JoinRoomRequest>,
) -> Result<Json<SessionView>, AppError> {
    payload.validate()?;
    state.session().join(&payload.room_id).await?;
    Ok(Json(view(&state).await))
}

/// Leave the current room and return to personal sync.
pub async fn leave_room(State(state): State<SharedState>) -> Json<SessionView> {
    state.session().leave().await;
    Json(view(&state).await)
}

/// Room header details of the joined room.
pub async fn room_details(State(state): State<SharedState>) -> Result<Json<RoomDetails>, AppError> {
    let details = state.session().room_details().await?;
    Ok(Json(details))
}

/// Delete the joined room; only its owner may do so.
pub async fn delete_room(State(state): State<SharedState>) -> Result<StatusCode, AppError> {
    state.session().delete_room().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Store the external co-watch link on the joined room.
pub async fn save_teleparty(
    State(state): State<SharedState>,
    Json(payload): Json<TelepartyRequest>,
) -> Result<StatusCode, AppError> {
    payload.validate()?;
    state.session().save_teleparty_url(&payload.url).await?;
    Ok(StatusCode::NO_CONTENT)
}
