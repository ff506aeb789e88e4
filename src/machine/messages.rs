//! Handlers for peer replication commands and the dispatch entry point.

use super::ReplicatorStateMachine;
use crate::replica::{CommandKind, PeerCommand, ReplicatorState};
use crate::utils::ReplistateError;

// ReplicatorStateMachine peer command handling
impl ReplicatorStateMachine {
    /// Dispatches one decoded inbound command to its handler.
    pub(crate) async fn handle_peer_command(
        &mut self,
        cmd: PeerCommand,
    ) -> Result<(), ReplistateError> {
        pf_debug!(
            "handling {} from '{}' in state {:?}",
            cmd.kind,
            cmd.sender,
            self.state
        );
        match cmd.kind {
            CommandKind::HadBeforePassive => {
                self.before_passive_state_handler().await;
                Ok(())
            }
            CommandKind::HadAfterElection => {
                self.after_election_state_handler();
                Ok(())
            }
            CommandKind::HadAfterLeader => {
                self.after_leader_state_handler().await;
                Ok(())
            }
            CommandKind::HadInLeader => {
                self.in_leader_state_handler();
                Ok(())
            }
            CommandKind::LeaderVersion => self.on_leader_version(cmd).await,
            CommandKind::TransferFile => {
                self.on_transfer_file(&cmd.sender);
                Ok(())
            }
            CommandKind::SolicitVersion => {
                self.on_solicit_version(&cmd.sender).await;
                Ok(())
            }
            CommandKind::SolicitVersionReply => {
                self.on_solicit_version_reply(cmd);
                Ok(())
            }
            CommandKind::NewlyJoinedVersion => {
                self.on_newly_joined_version(cmd);
                Ok(())
            }
            CommandKind::GivingUpVersion => {
                self.on_giving_up_version(cmd);
                Ok(())
            }
        }
    }

    /// The leader announced its version. In backup, refresh the local
    /// version first, then download from the leader when its version is
    /// incomparable or strictly newer and no download is running already.
    pub(crate) async fn on_leader_version(
        &mut self,
        cmd: PeerCommand,
    ) -> Result<(), ReplistateError> {
        if self.state != ReplicatorState::Backup {
            return Ok(());
        }
        if let Err(e) = self.core.check_version_synchronization().await {
            pf_error!("synchronizing before leader version check: {}", e);
        }

        let Some(version) = cmd.version else {
            return logged_err!(
                "REPLICATION_LEADER_VERSION from '{}' carried no version",
                cmd.sender
            );
        };
        if self.should_download_version(&version)
            && self.core.download_transferers_number() == 0
        {
            pf_debug!("downloading from '{}'", version.addr());
            self.core.download(version.addr());
        }
        Ok(())
    }

    /// A downloading transferer (whose callback address is the sender
    /// field) asked for the file pair; only the leader serves it.
    pub(crate) fn on_transfer_file(&mut self, sender: &str) {
        if self.state == ReplicatorState::Leader {
            self.core.upload(sender);
        }
    }

    /// A joining daemon solicited versions; settled daemons reply with
    /// their version and state.
    pub(crate) async fn on_solicit_version(&mut self, sender: &str) {
        if matches!(
            self.state,
            ReplicatorState::Backup | ReplicatorState::Leader
        ) {
            self.core
                .send_version_and_state(
                    CommandKind::SolicitVersionReply,
                    sender,
                )
                .await;
        }
    }

    /// A pool member replied to our solicitation; collect its version while
    /// the collecting window is open.
    pub(crate) fn on_solicit_version_reply(&mut self, cmd: PeerCommand) {
        if self.state != ReplicatorState::VersionRequesting {
            return;
        }
        match cmd.version {
            Some(version) => self.core.update_versions_list(version),
            None => pf_warn!(
                "REPLICATION_SOLICIT_VERSION_REPLY from '{}' carried \
                 no version",
                cmd.sender
            ),
        }
    }

    /// A daemon (re)joined the pool and announced the version of its last
    /// run. Hook for eventual state-file merging; nothing to do yet.
    pub(crate) fn on_newly_joined_version(&mut self, _cmd: PeerCommand) {
        if self.state == ReplicatorState::Leader {
            // merge hook
        }
    }

    /// A leader stepped down and announced its final version. The backup
    /// half is a merge hook like `on_newly_joined_version`; a reigning
    /// leader re-evaluates its generation id against the pool.
    pub(crate) fn on_giving_up_version(&mut self, _cmd: PeerCommand) {
        match self.state {
            ReplicatorState::Backup => {
                // merge hook
            }
            ReplicatorState::Leader => {
                self.gid_selection_handler();
            }
            _ => {}
        }
    }
}
