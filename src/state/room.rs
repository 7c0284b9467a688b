use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Catalog identifier of a movie or show.
pub type ItemId = u64;

const DEFAULT_MIN_RATING: f64 = 6.0;

/// Kind of catalog entry an item refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Feature film.
    #[default]
    Movie,
    /// Television show.
    Tv,
}

/// Summary of a movie/show kept in the shared pool.
///
/// Field names follow the catalog payload the pool is filled from, so the
/// replicated document stays readable by every client version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolItem {
    /// Catalog identifier.
    pub id: ItemId,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Poster image path relative to the catalog image base.
    #[serde(rename = "poster_path", default)]
    pub poster: Option<String>,
    /// Average audience rating (0-10).
    #[serde(rename = "vote_average", default)]
    pub rating: Option<f64>,
    /// Release date as reported by the catalog.
    #[serde(rename = "release_date", default)]
    pub release_date: Option<String>,
    /// Media kind; absent for entries added before kinds were tracked.
    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
}

impl PoolItem {
    /// Rating used by the pick filter; unrated items count as zero.
    pub fn rating_or_zero(&self) -> f64 {
        self.rating.unwrap_or(0.0)
    }
}

/// Per streaming provider toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct ProviderFlags {
    pub netflix: bool,
    pub prime: bool,
    pub hotstar: bool,
}

/// Structured filter configuration shared by the room.
///
/// Missing keys are filled from [`Filters::default`] when decoding, which is
/// how partially written filter objects are normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filters {
    /// Never pick items already in the watched set.
    pub exclude_watched: bool,
    /// Minimum rating an item needs to be picked.
    pub min_rating: f64,
    /// Restrict browsing to one media kind.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaKind>,
    /// Release year filter, kept as typed by the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    /// Catalog genre identifiers.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub genre_ids: BTreeSet<u64>,
    /// Two letter region used for watch-provider lookups.
    pub region: Option<String>,
    /// Streaming providers the room has access to.
    pub ott: ProviderFlags,
}

impl Default for Filters {
    fn default() -> Self {
        Self {
            exclude_watched: true,
            min_rating: DEFAULT_MIN_RATING,
            media_type: None,
            year: None,
            genre_ids: BTreeSet::new(),
            region: None,
            ott: ProviderFlags::default(),
        }
    }
}

impl Filters {
    /// Decode a stored filter object, filling missing keys with defaults.
    ///
    /// A malformed object yields the defaults.
    pub fn normalize(raw: serde_json::Value) -> Self {
        serde_json::from_value(raw).unwrap_or_default()
    }

    /// Whether `item` passes the rating/watched predicate.
    pub fn accepts(&self, item: &PoolItem, watched: &BTreeSet<ItemId>) -> bool {
        let rating_ok = item.rating_or_zero() >= self.min_rating;
        let watched_ok = !self.exclude_watched || !watched.contains(&item.id);
        rating_ok && watched_ok
    }
}

/// Replicated mutable room state: pool, watched set and filters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    /// Candidate items, most recently added first.
    pub pool: Vec<PoolItem>,
    /// Identifiers already watched.
    pub watched: BTreeSet<ItemId>,
    /// Active filter configuration.
    pub filters: Filters,
}

impl RoomState {
    /// Insert `item` at the front of the pool; returns `false` if already present.
    pub fn add_item(&mut self, item: PoolItem) -> bool {
        if self.contains(item.id) {
            return false;
        }
        self.pool.insert(0, item);
        true
    }

    /// Remove the item with `id`; returns whether something was removed.
    pub fn remove_item(&mut self, id: ItemId) -> bool {
        let before = self.pool.len();
        self.pool.retain(|item| item.id != id);
        self.pool.len() != before
    }

    /// Flip the watched flag of `id`, returning the new value.
    pub fn toggle_watched(&mut self, id: ItemId) -> bool {
        if self.watched.remove(&id) {
            false
        } else {
            self.watched.insert(id);
            true
        }
    }

    /// Whether the pool already holds `id`.
    pub fn contains(&self, id: ItemId) -> bool {
        self.pool.iter().any(|item| item.id == id)
    }

    /// Pool items accepted by the active filters, in pool order.
    pub fn filtered_pool(&self) -> Vec<&PoolItem> {
        self.pool
            .iter()
            .filter(|item| self.filters.accepts(item, &self.watched))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: ItemId, rating: f64) -> PoolItem {
        PoolItem {
            id,
            title: Some(format!("Item {id}")),
            poster: None,
            rating: Some(rating),
            release_date: None,
            media_type: None,
        }
    }

    #[test]
    fn add_item_prepends_and_deduplicates() {
        let mut state = RoomState::default();
        assert!(state.add_item(item(1, 7.0)));
        assert!(state.add_item(item(2, 7.0)));
        assert!(!state.add_item(item(1, 9.0)));

        let ids: Vec<_> = state.pool.iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[test]
    fn toggle_watched_round_trips() {
        let mut state = RoomState::default();
        assert!(state.toggle_watched(5));
        assert!(state.watched.contains(&5));
        assert!(!state.toggle_watched(5));
        assert!(state.watched.is_empty());
    }

    #[test]
    fn partial_filters_are_normalized() {
        let filters: Filters =
            serde_json::from_str(r#"{"minRating": 7.5, "ott": {"prime": true}}"#).unwrap();

        assert!(filters.exclude_watched);
        assert_eq!(filters.min_rating, 7.5);
        assert!(filters.ott.prime);
        assert!(!filters.ott.netflix);

        let fallback = Filters::normalize(serde_json::json!({"minRating": "high"}));
        assert_eq!(fallback, Filters::default());
    }

    #[test]
    fn pool_items_use_catalog_field_names() {
        let value = serde_json::to_value(item(3, 8.0)).unwrap();
        assert_eq!(value["vote_average"], 8.0);
        assert!(value.get("mediaType").is_none());

        let decoded: PoolItem =
            serde_json::from_str(r#"{"id": 3, "title": "X", "mediaType": "tv"}"#).unwrap();
        assert_eq!(decoded.media_type, Some(MediaKind::Tv));
        assert_eq!(decoded.rating_or_zero(), 0.0);
    }

    #[test]
    fn filtered_pool_applies_rating_and_watched() {
        let mut state = RoomState::default();
        state.add_item(item(1, 8.0));
        state.add_item(item(2, 4.0));
        state.add_item(item(3, 9.0));
        state.watched.insert(3);

        let ids: Vec<_> = state.filtered_pool().iter().map(|item| item.id).collect();
        assert_eq!(ids, vec![1]);
    }
}
