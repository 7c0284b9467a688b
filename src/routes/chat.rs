use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use validator::Validate;

use crate::{
    dto::chat::{
        MentionQuery, MessageView, PostMessageRequest, PostedMessage, ReactionRequest,
        ReactionToggled,
    },
    error::AppError,
    services::messages::MessageDraft,
    state::{SharedState, presence::Member},
};

/// Routes for the room roster and chat.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/members", get(members))
        .route("/members/mentions", get(mention_suggestions))
        .route("/messages", get(messages).post(post_message))
        .route("/messages/{id}/reactions", post(toggle_reaction))
}

/// Room roster with online flags.
pub async fn members(State(state): State<SharedState>) -> Json<Vec<Member>> {
    Json(state.session().presence().members().await)
}

/// Members matching what was typed after `@`.
pub async fn mention_suggestions(
    State(state): State<SharedState>,
    Query(query): Query<MentionQuery>,
) -> Json<Vec<Member>> {
    Json(state.session().messages().suggest_mentions(&query.prefix).await)
}

/// Most recent messages of the room, oldest first.
pub async fn messages(State(state): State<SharedState>) -> Json<Vec<MessageView>> {
    let messages = state.session().messages().messages().await;
    Json(messages.into_iter().map(MessageView::from).collect())
}

/// Post a text, GIF or sticker message.
pub async fn post_message(
    State(state): State<SharedState>,
    Json(payload): Json<PostMessageRequest>,
) -> Result<Json<PostedMessage>, AppError> {
    payload.validate()?;
    let id = state
        .session()
        .messages()
        .post_message(MessageDraft::from(payload))
        .await?;
    Ok(Json(PostedMessage { id }))
}

/// Toggle the caller's reaction on a message.
pub async fn toggle_reaction(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(payload): Json<ReactionRequest>,
) -> Result<Json<ReactionToggled>, AppError> {
    payload.validate()?;
    let reacted = state
        .session()
        .messages()
        .toggle_reaction(&id, &payload.emoji)
        .await?;
    Ok(Json(ReactionToggled { reacted }))
}
