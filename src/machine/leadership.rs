//! Handlers for the HAD election layer's notification commands, plus the
//! leader transition helpers.

use rand::prelude::*;
use tokio::time::Instant;

use super::ReplicatorStateMachine;
use crate::replica::{CommandKind, ReplicatorState};

// ReplicatorStateMachine HAD-notification handling
impl ReplicatorStateMachine {
    /// HAD is about to go passive: announce the version of the last run,
    /// ask the pool for versions, and open the collecting window. Run once
    /// unconditionally at startup; later notifications only matter while
    /// still collecting.
    pub(crate) async fn before_passive_state_handler(&mut self) {
        if self.state != ReplicatorState::VersionRequesting {
            return;
        }
        self.core
            .broadcast_version(CommandKind::NewlyJoinedVersion)
            .await;
        self.core.request_versions().await;

        pf_debug!("arming version requesting timer");
        self.version_requesting_timer.arm();
    }

    /// HAD finished an election it won. A joining daemon stays in its
    /// joining states; leadership follows later upon the in-leader
    /// notification.
    pub(crate) fn after_election_state_handler(&mut self) {
        if self.state == ReplicatorState::Backup {
            self.become_leader();
        }
    }

    /// HAD is giving up leadership. In the joining states and in backup
    /// (where the pool download outlasted HAD's leadership stint) this is
    /// ignored; the leader announces its final version and steps down.
    pub(crate) async fn after_leader_state_handler(&mut self) {
        if self.state != ReplicatorState::Leader {
            return;
        }
        self.core
            .broadcast_version(CommandKind::GivingUpVersion)
            .await;
        self.set_state(ReplicatorState::Backup);
    }

    /// HAD's periodic confirmation of this daemon's leadership. In backup
    /// it acts like a missed after-election notification; as leader it
    /// refreshes the liveness mark.
    pub(crate) fn in_leader_state_handler(&mut self) {
        match self.state {
            ReplicatorState::VersionRequesting
            | ReplicatorState::VersionDownloading => {}
            ReplicatorState::Backup => self.become_leader(),
            ReplicatorState::Leader => {
                self.last_had_alive = Instant::now();
                pf_debug!("HAD leadership confirmation recorded");
            }
        }
    }

    /// Passes to leader state: marks HAD as alive now and picks a fresh
    /// generation id if the pool carries incomparable versions.
    pub(crate) fn become_leader(&mut self) {
        self.last_had_alive = Instant::now();
        self.gid_selection_handler();
        self.set_state(ReplicatorState::Leader);
    }

    /// If any collected peer version is incomparable with the local one,
    /// assigns a fresh random generation id, announcing a logical epoch
    /// break so the pool will download from this leader.
    pub(crate) fn gid_selection_handler(&mut self) {
        let my_version = self.core.my_version.version().clone();
        let all_comparable = self
            .core
            .versions_list
            .snapshot()
            .iter()
            .all(|v| my_version.is_comparable(v));
        if all_comparable {
            pf_debug!("no need to select a new gid");
            return;
        }

        let mut rng = rand::thread_rng();
        let mut fresh = my_version.gid();
        while fresh == my_version.gid() {
            fresh = rng.gen();
        }
        match self.core.my_version.set_gid(fresh) {
            Ok(()) => pf_info!("new gid selected: {}", fresh),
            Err(e) => pf_error!("persisting new gid {}: {}", fresh, e),
        }
    }
}
