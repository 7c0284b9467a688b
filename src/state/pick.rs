use indexmap::IndexSet;
use rand::{Rng, seq::IndexedRandom};
use serde::{Deserialize, Serialize};

use crate::state::room::{ItemId, MediaKind, PoolItem, RoomState};

/// Number of recently opened pick keys remembered by a [`PickGate`].
const REMEMBERED_PICKS: usize = 64;

/// "Tonight's pick" as broadcast on the room document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastPick {
    /// Unique token minted by the picker; absent on documents written by older clients.
    #[serde(default)]
    pub pick_id: Option<String>,
    /// Picked item.
    pub movie_id: ItemId,
    /// Title of the picked item, for banners.
    #[serde(default)]
    pub title: Option<String>,
    /// Media kind of the picked item.
    #[serde(default)]
    pub media_type: MediaKind,
    /// Uid of the picker.
    #[serde(default)]
    pub picked_by: Option<String>,
    /// Server time of the pick in epoch millis.
    #[serde(default)]
    pub picked_at: Option<i64>,
    /// Picker's local clock at pick time, informational only.
    #[serde(default)]
    pub client_picked_at: Option<i64>,
}

impl LastPick {
    /// Key identifying this pick event for open-once handling.
    ///
    /// Documents without a `pickId` fall back to item id plus server time.
    pub fn event_key(&self) -> String {
        match &self.pick_id {
            Some(pick_id) if !pick_id.is_empty() => pick_id.clone(),
            _ => format!("{}_{}", self.movie_id, self.picked_at.unwrap_or(0)),
        }
    }
}

/// Why a pick request produced no pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatchReason {
    /// The pool holds nothing at all.
    EmptyPool,
    /// Every item is filtered out and watched items may not be reused.
    NoUnwatchedMatches,
}

impl NoMatchReason {
    /// User-facing message for the reason.
    pub fn message(&self) -> &'static str {
        match self {
            NoMatchReason::EmptyPool => "No movies in the pool to pick from.",
            NoMatchReason::NoUnwatchedMatches => "No unwatched movies match your filters.",
        }
    }
}

/// Candidate items for a pick under the active filters.
///
/// When nothing passes the filters, watched items are never reconsidered
/// while "exclude watched" is on; with it off the whole pool is used.
pub fn pick_candidates(state: &RoomState) -> Result<Vec<&PoolItem>, NoMatchReason> {
    let filtered = state.filtered_pool();
    if !filtered.is_empty() {
        return Ok(filtered);
    }
    if state.pool.is_empty() {
        return Err(NoMatchReason::EmptyPool);
    }
    if state.filters.exclude_watched {
        return Err(NoMatchReason::NoUnwatchedMatches);
    }
    Ok(state.pool.iter().collect())
}

/// Choose one candidate at random, avoiding `avoid` when another option exists.
pub fn choose_pick<'a, R: Rng + ?Sized>(
    candidates: &[&'a PoolItem],
    avoid: Option<ItemId>,
    rng: &mut R,
) -> Option<&'a PoolItem> {
    let preferred: Vec<&PoolItem> = match avoid {
        Some(avoid) if candidates.len() > 1 => candidates
            .iter()
            .copied()
            .filter(|item| item.id != avoid)
            .collect(),
        _ => Vec::new(),
    };
    let pool = if preferred.is_empty() {
        candidates
    } else {
        preferred.as_slice()
    };
    pool.choose(rng).copied()
}

/// Remembers which pick events this client already opened.
///
/// A pick opens iff its key was not acted on before, so duplicate and
/// re-ordered deliveries of the same pick never open it twice.
#[derive(Debug, Default)]
pub struct PickGate {
    seen: IndexSet<String>,
}

impl PickGate {
    /// Record `key`, returning `true` the first time it is seen.
    pub fn admit(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        if self.seen.len() >= REMEMBERED_PICKS {
            self.seen.shift_remove_index(0);
        }
        self.seen.insert(key.to_string());
        true
    }

    /// Key of the last pick acted on.
    pub fn last(&self) -> Option<&str> {
        self.seen.last().map(String::as_str)
    }

    /// Forget every pick (used when leaving a room).
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}
