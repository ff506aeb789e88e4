//! Shared replication behaviour underneath the state machine: the local
//! version, the table of peer versions, the messenger, and the transferer
//! supervisor, with the operations both replication roles use.

use std::net::SocketAddr;
use std::time::Duration;

use crate::replica::codec::{CommandKind, PeerCommand};
use crate::replica::messenger::PeerMessenger;
use crate::replica::transferer::TransfererSupervisor;
use crate::replica::version::{LocalVersion, Version, VersionsTable};
use crate::utils::ReplistateError;

/// Composition of the replication building blocks, owned by the state
/// machine and shared across all of its handlers.
#[derive(Debug)]
pub(crate) struct ReplicaCore {
    /// This daemon's own version, tied to the on-disk file pair.
    pub(crate) my_version: LocalVersion,

    /// Latest versions received from peers, keyed by producer address.
    pub(crate) versions_list: VersionsTable,

    /// Peer messaging module.
    pub(crate) messenger: PeerMessenger,

    /// Transferer child supervisor.
    pub(crate) supervisor: TransfererSupervisor,
}

impl ReplicaCore {
    /// Sets up the building blocks: loads the local version from disk and
    /// binds the peer command listener.
    pub(crate) async fn new_and_setup(
        me: SocketAddr,
        peers: Vec<SocketAddr>,
        conn_timeout: Duration,
        state_file_path: &str,
        version_file_path: &str,
        transferer_path: &str,
    ) -> Result<Self, ReplistateError> {
        let my_version = LocalVersion::load(
            state_file_path,
            version_file_path,
            me.to_string(),
        )?;
        let messenger =
            PeerMessenger::new_and_setup(me, peers, conn_timeout).await?;
        let supervisor = TransfererSupervisor::new(
            transferer_path,
            state_file_path,
            version_file_path,
        );

        Ok(ReplicaCore {
            my_version,
            versions_list: VersionsTable::default(),
            messenger,
            supervisor,
        })
    }

    /// My own advertised address.
    pub(crate) fn me(&self) -> String {
        self.messenger.me()
    }

    /// Broadcasts the local version (with the current reported state) to the
    /// whole pool under the given command kind.
    pub(crate) async fn broadcast_version(&self, kind: CommandKind) {
        let cmd = PeerCommand::with_version(
            kind,
            self.me(),
            self.my_version.version().clone(),
        );
        self.messenger.broadcast(&cmd).await;
    }

    /// Asks every pool member for its current version.
    pub(crate) async fn request_versions(&self) {
        let cmd =
            PeerCommand::addr_only(CommandKind::SolicitVersion, self.me());
        self.messenger.broadcast(&cmd).await;
    }

    /// Sends the local version (with the current reported state) to one
    /// peer under the given command kind. Send failures are logged and
    /// swallowed, matching the best-effort broadcast policy.
    pub(crate) async fn send_version_and_state(
        &self,
        kind: CommandKind,
        peer: &str,
    ) {
        let cmd = PeerCommand::with_version(
            kind,
            self.me(),
            self.my_version.version().clone(),
        );
        if let Err(e) = self.messenger.unicast_addr(&cmd, peer).await {
            pf_debug!("sending {} to '{}': {}", kind, peer, e);
        }
    }

    /// Records a version received from a peer, replacing any previous entry
    /// from the same producer.
    pub(crate) fn update_versions_list(&mut self, version: Version) {
        pf_debug!(
            "recording version gid={} clock={} from '{}'",
            version.gid(),
            version.logical_clock(),
            version.addr()
        );
        self.versions_list.upsert(version);
    }

    /// Synchronizes the local version against the on-disk pair and, if it
    /// advanced, announces it to the pool. Returns whether it advanced.
    pub(crate) async fn check_version_synchronization(
        &mut self,
    ) -> Result<bool, ReplistateError> {
        let changed = self.my_version.synchronize(true)?;
        if changed {
            self.broadcast_version(CommandKind::LeaderVersion).await;
        }
        Ok(changed)
    }

    /// Starts a downloading transferer against the given peer. A download
    /// already in flight wins the race; the new request is dropped.
    pub(crate) fn download(&mut self, from_peer: &str) {
        match self.supervisor.start_download(from_peer) {
            Ok(()) => {}
            Err(ReplistateError::AlreadyRunning(m)) => {
                pf_warn!("download from '{}' dropped: {}", from_peer, m);
            }
            Err(e) => pf_error!("download from '{}': {}", from_peer, e),
        }
    }

    /// Starts an uploading transferer toward the given peer.
    pub(crate) fn upload(&mut self, to_peer: &str) {
        if let Err(e) = self.supervisor.start_upload(to_peer) {
            pf_error!("upload toward '{}': {}", to_peer, e);
        }
    }

    /// Number of downloading transferers currently alive (0 or 1).
    pub(crate) fn download_transferers_number(&self) -> usize {
        self.supervisor.download_count()
    }
}
