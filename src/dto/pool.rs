use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    dto::validation::validate_region,
    state::{
        playback::PlaybackCommand,
        room::{Filters, ItemId, MediaKind, PoolItem, ProviderFlags, RoomState},
    },
};

/// Catalog entry to add to the pool.
#[derive(Debug, Deserialize, Validate)]
pub struct AddItemRequest {
    /// Catalog identifier.
    pub id: ItemId,
    #[validate(length(max = 300))]
    #[serde(default)]
    /// Display title.
    pub title: Option<String>,
    #[serde(default)]
    /// Poster path relative to the catalog image base.
    pub poster_path: Option<String>,
    #[validate(range(min = 0.0, max = 10.0))]
    #[serde(default)]
    /// Average audience rating.
    pub vote_average: Option<f64>,
    #[serde(default)]
    /// Release date as reported by the catalog.
    pub release_date: Option<String>,
    #[serde(default, rename = "mediaType")]
    /// Media kind.
    pub media_type: Option<MediaKind>,
}

impl From<AddItemRequest> for PoolItem {
    fn from(request: AddItemRequest) -> Self {
        PoolItem {
            id: request.id,
            title: request.title,
            poster: request.poster_path,
            rating: request.vote_average,
            release_date: request.release_date,
            media_type: request.media_type,
        }
    }
}

/// Partial filter update; absent fields keep their current value.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FiltersPatch {
    #[serde(default)]
    pub exclude_watched: Option<bool>,
    #[validate(range(min = 0.0, max = 10.0))]
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub media_type: Option<MediaKind>,
    #[validate(length(max = 4))]
    #[serde(default)]
    pub year: Option<String>,
    #[serde(default)]
    pub genre_ids: Option<BTreeSet<u64>>,
    #[validate(custom(function = "validate_region"))]
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub ott: Option<ProviderFlags>,
}

impl FiltersPatch {
    /// Apply the present fields over `current`.
    pub fn apply(self, mut current: Filters) -> Filters {
        if let Some(exclude_watched) = self.exclude_watched {
            current.exclude_watched = exclude_watched;
        }
        if let Some(min_rating) = self.min_rating {
            current.min_rating = min_rating;
        }
        if self.media_type.is_some() {
            current.media_type = self.media_type;
        }
        if let Some(year) = self.year {
            current.year = Some(year).filter(|year| !year.is_empty());
        }
        if let Some(genre_ids) = self.genre_ids {
            current.genre_ids = genre_ids;
        }
        if let Some(region) = self.region {
            current.region = Some(region.to_ascii_uppercase());
        }
        if let Some(ott) = self.ott {
            current.ott = ott;
        }
        current
    }
}

/// Replicated state plus the items currently eligible for a pick.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateView {
    /// Pool, watched set and filters.
    #[serde(flatten)]
    pub state: RoomState,
    /// Pool items passing the filters, in pool order.
    pub eligible: Vec<ItemId>,
}

impl From<RoomState> for StateView {
    fn from(state: RoomState) -> Self {
        let eligible = state.filtered_pool().iter().map(|item| item.id).collect();
        Self { state, eligible }
    }
}

/// Result of toggling membership in a set.
#[derive(Debug, Serialize)]
pub struct Toggled {
    /// State after the toggle.
    pub active: bool,
}

/// "Play together" request.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackRequest {
    /// Item to open.
    pub media_id: ItemId,
    #[serde(default)]
    /// Media kind.
    pub media_type: MediaKind,
    #[validate(range(min = 0.0))]
    #[serde(default)]
    /// Position in seconds.
    pub position: f64,
    #[serde(default = "default_playing")]
    /// Whether playback should run.
    pub is_playing: bool,
}

fn default_playing() -> bool {
    true
}

impl From<PlaybackRequest> for PlaybackCommand {
    fn from(request: PlaybackRequest) -> Self {
        PlaybackCommand {
            media_id: request.media_id,
            media_type: request.media_type,
            position: request.position,
            is_playing: request.is_playing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_patch_keeps_absent_fields() {
        let current = Filters {
            min_rating: 7.5,
            region: Some("IN".into()),
            ..Filters::default()
        };
        let patch: FiltersPatch =
            serde_json::from_str(r#"{"excludeWatched":false,"region":"us"}"#).unwrap();
        assert!(patch.validate().is_ok());

        let next = patch.apply(current);
        assert!(!next.exclude_watched);
        assert_eq!(next.min_rating, 7.5);
        assert_eq!(next.region.as_deref(), Some("US"));
    }

    #[test]
    fn filters_patch_rejects_out_of_range_rating() {
        let patch: FiltersPatch = serde_json::from_str(r#"{"minRating":11}"#).unwrap();
        assert!(patch.validate().is_err());
    }

    #[test]
    fn add_item_maps_catalog_fields() {
        let request: AddItemRequest = serde_json::from_str(
            r#"{"id":42,"title":"Heat","poster_path":"/h.jpg","vote_average":8.3,"mediaType":"movie"}"#,
        )
        .unwrap();
        assert!(request.validate().is_ok());
        let item = PoolItem::from(request);
        assert_eq!(item.poster.as_deref(), Some("/h.jpg"));
        assert_eq!(item.rating, Some(8.3));
        assert_eq!(item.media_type, Some(MediaKind::Movie));
    }

    #[test]
    fn catalog_payload_items_stay_eligible() {
        let request: AddItemRequest = serde_json::from_str(
            r#"{"id":7,"vote_average":7.5,"release_date":"1995-12-15","posterPath":"/ignored.jpg"}"#,
        )
        .unwrap();
        let item = PoolItem::from(request);
        assert_eq!(item.release_date.as_deref(), Some("1995-12-15"));
        assert_eq!(item.poster, None);

        let mut state = RoomState::default();
        state.add_item(item);
        assert_eq!(StateView::from(state).eligible, vec![7]);
    }

    #[test]
    fn state_view_lists_eligible_items() {
        let mut state = RoomState::default();
        state.add_item(PoolItem {
            id: 1,
            title: None,
            poster: None,
            rating: Some(8.0),
            release_date: None,
            media_type: None,
        });
        state.add_item(PoolItem {
            id: 2,
            title: None,
            poster: None,
            rating: Some(3.0),
            release_date: None,
            media_type: None,
        });
        let view = StateView::from(state);
        assert_eq!(view.eligible, vec![1]);
    }
}
