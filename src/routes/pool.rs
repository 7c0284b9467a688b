use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use validator::Validate;

use crate::{
    dto::pool::{AddItemRequest, FiltersPatch, PlaybackRequest, StateView, Toggled},
    error::AppError,
    services::{events::OpenedPick, pick::PickOutcome},
    state::{
        SharedState,
        pick::LastPick,
        playback::PlaybackCommand,
        room::{ItemId, PoolItem},
    },
};

/// Routes editing the replicated pool and driving picks and playback.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/state", get(state_view))
        .route("/pool", post(add_item).delete(clear_pool))
        .route("/pool/{id}", delete(remove_item))
        .route("/watched/{id}", post(toggle_watched))
        .route("/filters", put(update_filters))
        .route("/pick", post(pick_for_me))
        .route("/pick/reroll", post(reroll))
        .route("/pick/last", get(room_pick).post(show_last_pick))
        .route("/playback", post(update_playback))
}

/// Current pool, watched set, filters and eligible items.
pub async fn state_view(State(state): State<SharedState>) -> Json<StateView> {
    Json(StateView::from(state.session().replicator().snapshot()))
}

/// Add a catalog item to the front of the pool.
pub async fn add_item(
    State(state): State<SharedState>,
    Json(payload): Json<AddItemRequest>,
) -> Result<Json<Toggled>, AppError> {
    payload.validate()?;
    let added = state
        .session()
        .replicator()
        .add_to_pool(PoolItem::from(payload))?;
    Ok(Json(Toggled { active: added }))
}

/// Remove an item from the pool.
pub async fn remove_item(
    State(state): State<SharedState>,
    Path(id): Path<ItemId>,
) -> Result<StatusCode, AppError> {
    if state.session().replicator().remove_from_pool(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("item {id} is not in the pool")))
    }
}

/// Empty the pool.
pub async fn clear_pool(State(state): State<SharedState>) -> Result<StatusCode, AppError> {
    state.session().replicator().clear_pool()?;
    Ok(StatusCode::NO_CONTENT)
}

/// Flip the watched flag of an item.
pub async fn toggle_watched(
    State(state): State<SharedState>,
    Path(id): Path<ItemId>,
) -> Result<Json<Toggled>, AppError> {
    let watched = state.session().replicator().toggle_watched(id)?;
    Ok(Json(Toggled { active: watched }))
}

/// Update some filter fields, keeping the others.
pub async fn update_filters(
    State(state): State<SharedState>,
    Json(payload): Json<FiltersPatch>,
) -> Result<Json<StateView>, AppError> {
    payload.validate()?;
    let replicator = state.session().replicator();
    let filters = payload.apply(replicator.snapshot().filters);
    replicator.set_filters(filters)?;
    Ok(Json(StateView::from(replicator.snapshot())))
}

/// Pick tonight's item at random from the eligible pool.
pub async fn pick_for_me(State(state): State<SharedState>) -> Result<Json<PickOutcome>, AppError> {
    let outcome = state.session().picks().pick_for_me().await?;
    Ok(Json(outcome))
}

/// Pick again, avoiding the previous pick.
pub async fn reroll(State(state): State<SharedState>) -> Result<Json<PickOutcome>, AppError> {
    let outcome = state.session().picks().reroll().await?;
    Ok(Json(outcome))
}

/// Last pick broadcast on the joined room.
pub async fn room_pick(State(state): State<SharedState>) -> Result<Json<LastPick>, AppError> {
    state
        .session()
        .picks()
        .room_pick()
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No pick yet.".into()))
}

/// Open the most recent pick again.
pub async fn show_last_pick(
    State(state): State<SharedState>,
) -> Result<Json<OpenedPick>, AppError> {
    let pick = state.session().picks().show_last_pick().await?;
    Ok(Json(pick))
}

/// Ask every member of the room to open an item together.
pub async fn update_playback(
    State(state): State<SharedState>,
    Json(payload): Json<PlaybackRequest>,
) -> Result<StatusCode, AppError> {
    payload.validate()?;
    state
        .session()
        .playback()
        .update_playback(PlaybackCommand::from(payload))
        .await?;
    Ok(StatusCode::ACCEPTED)
}
