/// Whether the replicator is installing a remote snapshot.
///
/// Snapshots offered while one is being applied are queued (latest wins) and
/// drained by the applier before the phase returns to `Idle`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationPhase<T> {
    /// Local mutations may schedule saves.
    Idle,
    /// A remote snapshot is being installed; saves are suppressed.
    ApplyingRemote {
        /// Most recent snapshot received during the application.
        queued: Option<T>,
    },
}

impl<T> Default for ReplicationPhase<T> {
    fn default() -> Self {
        ReplicationPhase::Idle
    }
}

impl<T> ReplicationPhase<T> {
    /// Whether a remote snapshot is currently being installed.
    pub fn is_applying(&self) -> bool {
        matches!(self, ReplicationPhase::ApplyingRemote { .. })
    }

    /// Offer a snapshot. Returns it when the caller must apply it now,
    /// `None` when it was queued behind the application in progress.
    pub fn offer(&mut self, snapshot: T) -> Option<T> {
        match self {
            ReplicationPhase::Idle => {
                *self = ReplicationPhase::ApplyingRemote { queued: None };
                Some(snapshot)
            }
            ReplicationPhase::ApplyingRemote { queued } => {
                *queued = Some(snapshot);
                None
            }
        }
    }

    /// Finish one application. Returns the next queued snapshot to apply, or
    /// goes back to `Idle` when none is pending.
    pub fn finish(&mut self) -> Option<T> {
        match self {
            ReplicationPhase::ApplyingRemote { queued } => {
                let next = queued.take();
                if next.is_none() {
                    *self = ReplicationPhase::Idle;
                }
                next
            }
            ReplicationPhase::Idle => None,
        }
    }
}

/// Local edit revisions against what has been handed to the store.
///
/// While an edit is unsaved, remote snapshots must not replace local state;
/// they are marked as missed and re-read once every edit is saved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveTracker {
    revision: u64,
    saved: u64,
    missed_remote: bool,
}

impl SaveTracker {
    /// Record a local edit, returning its revision.
    pub fn edit(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Latest local revision.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether some local edit has not been written yet.
    pub fn has_unsaved(&self) -> bool {
        self.revision > self.saved
    }

    /// A remote snapshot was held back behind unsaved edits.
    pub fn miss_remote(&mut self) {
        self.missed_remote = true;
    }

    /// A save of `revision` completed. Returns whether the target must be
    /// re-read because a remote snapshot was missed meanwhile.
    pub fn saved(&mut self, revision: u64, succeeded: bool) -> bool {
        self.saved = self.saved.max(revision);
        if succeeded && !self.has_unsaved() && self.missed_remote {
            self.missed_remote = false;
            return true;
        }
        false
    }

    /// Forget pending edits that will never be written.
    pub fn discard(&mut self) {
        self.saved = self.revision;
        self.missed_remote = false;
    }
}

/// A snapshot is a stale echo when it was written by this client with a
/// write id older than the last write this client issued.
pub fn is_stale_echo(
    updated_by: Option<&str>,
    client_write_id: Option<u64>,
    self_uid: Option<&str>,
    last_issued: u64,
) -> bool {
    match (updated_by, self_uid) {
        (Some(author), Some(me)) if author == me => {
            client_write_id.is_some_and(|write_id| write_id < last_issued)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_self_write_is_discarded_newer_is_applied() {
        assert!(is_stale_echo(Some("me"), Some(90), Some("me"), 100));
        assert!(!is_stale_echo(Some("me"), Some(110), Some("me"), 100));
        assert!(!is_stale_echo(Some("me"), Some(100), Some("me"), 100));
    }

    #[test]
    fn foreign_or_unstamped_snapshots_are_applied() {
        assert!(!is_stale_echo(Some("bob"), Some(1), Some("me"), 100));
        assert!(!is_stale_echo(Some("me"), None, Some("me"), 100));
        assert!(!is_stale_echo(Some("me"), Some(1), None, 100));
    }

    #[test]
    fn reentrant_offers_queue_latest_and_drain() {
        let mut phase = ReplicationPhase::default();
        assert_eq!(phase.offer(1), Some(1));
        assert!(phase.is_applying());

        assert_eq!(phase.offer(2), None);
        assert_eq!(phase.offer(3), None);

        assert_eq!(phase.finish(), Some(3));
        assert!(phase.is_applying());
        assert_eq!(phase.finish(), None);
        assert_eq!(phase, ReplicationPhase::Idle);
    }

    #[test]
    fn unsaved_edits_hold_back_remote_state_until_saved() {
        let mut saves = SaveTracker::default();
        assert!(!saves.has_unsaved());

        let first = saves.edit();
        let second = saves.edit();
        assert!(saves.has_unsaved());
        saves.miss_remote();

        assert!(!saves.saved(first, true));
        assert!(saves.has_unsaved());
        assert!(saves.saved(second, true));
        assert!(!saves.has_unsaved());
        assert!(!saves.saved(second, true));
    }

    #[test]
    fn failed_or_discarded_saves_release_the_guard() {
        let mut saves = SaveTracker::default();
        let revision = saves.edit();
        saves.miss_remote();
        assert!(!saves.saved(revision, false));
        assert!(!saves.has_unsaved());

        saves.edit();
        saves.miss_remote();
        saves.discard();
        assert!(!saves.has_unsaved());
        assert!(!saves.saved(saves.revision(), true));
    }
}
