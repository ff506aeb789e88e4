//! Replica selection policy: which remote version, if any, is worth
//! downloading. Split into the two halves the machine uses it in — judging
//! one announced version while in backup, and reducing the whole collected
//! table while finishing the joining sequence.

use super::ReplicatorStateMachine;
use crate::replica::Version;

// ReplicatorStateMachine replica selection
impl ReplicatorStateMachine {
    /// Backup half: accept any incomparable remote version (a new
    /// generation this daemon must catch up with) or any strictly newer
    /// comparable one. The remote state is aligned onto the local copy
    /// first since state is not a tie-breaker.
    pub(crate) fn should_download_version(
        &self,
        new_version: &Version,
    ) -> bool {
        let mut local = self.core.my_version.version().clone();
        local.set_state(new_version.state());
        !new_version.is_comparable(&local)
            || new_version.is_newer_than(&local)
    }

    /// Joining half: reduce the collected pool versions to the best one —
    /// replace the running best only by a comparable, strictly greater
    /// candidate, ties keeping the earlier entry — and return it if it
    /// beats the local version under the same acceptance rule. `None` when
    /// nothing was collected or the local version already wins.
    pub(crate) fn select_download_source(&self) -> Option<Version> {
        let entries = self.core.versions_list.snapshot();
        let (first, rest) = entries.split_first()?;

        let mut best = first.clone();
        for candidate in rest {
            if candidate.is_newer_than(&best) {
                best = candidate.clone();
            }
        }
        pf_debug!(
            "best pool version: gid={} clock={} from '{}'",
            best.gid(),
            best.logical_clock(),
            best.addr()
        );

        let mut local = self.core.my_version.version().clone();
        local.set_state(best.state());
        if local.is_comparable(&best) && !best.is_newer_than(&local) {
            return None;
        }
        Some(best)
    }
}
