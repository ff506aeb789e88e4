//! Handlers for the three machine timers and for transferer child exits.

use std::process::ExitStatus;

use tokio::time::Instant;

use super::ReplicatorStateMachine;
use crate::replica::{
    CommandKind, ReapOutcome, ReplicatorState, TransfererRole,
};

// ReplicatorStateMachine timer and reaper handling
impl ReplicatorStateMachine {
    /// Periodic housekeeping tick: re-arms itself, kills overdue
    /// transferers, keeps the local version synchronized, and lets a
    /// leader without HAD confirmation step down.
    pub(crate) async fn replication_timer_fired(&mut self) {
        self.replication_timer.arm();
        if self.state == ReplicatorState::VersionRequesting {
            return;
        }

        let now = Instant::now();
        self.core
            .supervisor
            .kill_overdue_download(now, self.max_transferer_lifetime);
        if self.state == ReplicatorState::VersionDownloading {
            return;
        }
        self.core
            .supervisor
            .kill_overdue_uploads(now, self.max_transferer_lifetime);
        pf_debug!(
            "replication tick: {} downloading, {} uploading transferers",
            self.core.supervisor.download_count(),
            self.core.supervisor.upload_count()
        );

        if self.state == ReplicatorState::Backup {
            if let Err(e) = self.core.check_version_synchronization().await {
                pf_error!("synchronizing local version: {}", e);
            }
            return;
        }

        // leader path: announce local file changes to the pool
        match self.core.my_version.synchronize(true) {
            Ok(true) => {
                self.core
                    .broadcast_version(CommandKind::LeaderVersion)
                    .await;
            }
            Ok(false) => {}
            Err(e) => pf_error!("synchronizing local version: {}", e),
        }

        let silence = now.duration_since(self.last_had_alive);
        pf_debug!("{:?} without HAD leadership confirmation", silence);
        if silence > self.had_alive_tolerance {
            pf_warn!(
                "HAD silent for {:?} (tolerance {:?}), giving up leadership",
                silence,
                self.had_alive_tolerance
            );
            self.core
                .broadcast_version(CommandKind::GivingUpVersion)
                .await;
            self.set_state(ReplicatorState::Backup);
        }
    }

    /// End of the collect-pool-versions window: pick the best collected
    /// version and start downloading it, capping the download with the
    /// downloading timer; with nothing worth downloading, settle into
    /// backup right away.
    pub(crate) async fn version_requesting_timer_fired(&mut self) {
        self.version_requesting_timer.disarm();
        self.set_state(ReplicatorState::VersionDownloading);

        match self.select_download_source() {
            Some(best) => {
                self.core.download(best.addr());
                pf_debug!("arming version downloading timer");
                self.version_downloading_timer.arm();
            }
            None => {
                self.version_downloading_timer_fired().await;
            }
        }
    }

    /// End of the initial download, successful or given up: drop the
    /// collected versions, absorb whatever landed on disk, and settle into
    /// backup.
    pub(crate) async fn version_downloading_timer_fired(&mut self) {
        self.version_downloading_timer.disarm();
        self.core.versions_list.clear();

        if let Err(e) = self.core.check_version_synchronization().await {
            pf_error!("synchronizing local version: {}", e);
        }
        self.set_state(ReplicatorState::Backup);
    }

    /// A transferer child exited: settle its temp files, and when the
    /// initial download just succeeded, finish the joining sequence
    /// immediately instead of waiting out the downloading timer.
    pub(crate) async fn handle_transferer_exit(
        &mut self,
        role: TransfererRole,
        pid: u32,
        status: Option<ExitStatus>,
    ) {
        let outcome = self.core.supervisor.on_reaped(role, pid, status);
        if role == TransfererRole::Download
            && outcome == ReapOutcome::Success
            && self.state == ReplicatorState::VersionDownloading
        {
            self.version_downloading_timer_fired().await;
        }
    }
}
