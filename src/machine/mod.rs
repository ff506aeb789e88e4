//! The replication state machine: owns the role state and the three
//! machine timers, processes HAD election notifications and peer commands,
//! and coordinates the version, messaging, and transferer components.

mod leadership;
mod messages;
mod selection;
mod timers;


use std::net::SocketAddr;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::replica::{ReplicaCore, ReplicatorState};
use crate::utils::{ReplistateError, Timer};

/// Configuration parameters struct, deserialized from an optional TOML
/// fragment laid over the defaults. All intervals are in seconds; a zero
/// for one of the two derivable intervals means "derive from
/// `had_connection_timeout` and the pool size".
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicatorConfig {
    /// Period of the housekeeping/broadcast timer.
    pub replication_interval: u64,

    /// Connect/send timeout toward any one peer.
    pub had_connection_timeout: u64,

    /// Hard lifetime cap for any one transferer child.
    pub max_transferer_lifetime: u64,

    /// Length of the collect-pool-versions window after joining;
    /// 0 derives `2 * (had_connection_timeout + 1)`.
    pub newly_joined_waiting_version_interval: u64,

    /// How long the leader tolerates HAD silence before stepping down;
    /// 0 derives `2 * (2 * had_connection_timeout * pool_size + 1)`.
    pub had_alive_tolerance: u64,

    /// Path of the replicated (opaque) state file.
    pub state_file_path: String,

    /// Path of the version file.
    pub version_file_path: String,

    /// Path of the transferer executable to fork.
    pub transferer_path: String,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        ReplicatorConfig {
            replication_interval: 300,
            had_connection_timeout: 20,
            max_transferer_lifetime: 300,
            newly_joined_waiting_version_interval: 0,
            had_alive_tolerance: 0,
            state_file_path: "/tmp/replistate.state".into(),
            version_file_path: "/tmp/replistate.version".into(),
            transferer_path: "replistate_transferer".into(),
        }
    }
}

impl ReplicatorConfig {
    /// Parses the configuration from an optional TOML fragment laid over
    /// the defaults. Unknown field names and type mismatches are fatal
    /// configuration errors.
    pub fn from_toml_str(
        config_str: Option<&str>,
    ) -> Result<Self, ReplistateError> {
        match config_str {
            None => Ok(Default::default()),
            Some(fragment) => Ok(toml::from_str(fragment)?),
        }
    }

    /// Validates the raw parameters and derives the dependent intervals
    /// for a pool of the given size. Every resolved interval must end up
    /// positive; anything else is a fatal configuration error.
    pub(crate) fn derive_intervals(
        &self,
        pool_size: usize,
    ) -> Result<MachineIntervals, ReplistateError> {
        if pool_size == 0 {
            return Err(ReplistateError::Config(
                "peer pool list must not be empty".into(),
            ));
        }
        for (name, value) in [
            ("replication_interval", self.replication_interval),
            ("had_connection_timeout", self.had_connection_timeout),
            ("max_transferer_lifetime", self.max_transferer_lifetime),
        ] {
            if value == 0 {
                return Err(ReplistateError::Config(format!(
                    "invalid config.{} '{}'",
                    name, value
                )));
            }
        }

        let hct = self.had_connection_timeout;
        let newly_joined_window =
            match self.newly_joined_waiting_version_interval {
                0 => 2 * (hct + 1),
                explicit => explicit,
            };
        let had_alive_tolerance = match self.had_alive_tolerance {
            0 => 2 * (2 * hct * pool_size as u64 + 1),
            explicit => explicit,
        };

        Ok(MachineIntervals {
            replication: Duration::from_secs(self.replication_interval),
            connection_timeout: Duration::from_secs(hct),
            max_transferer_lifetime: Duration::from_secs(
                self.max_transferer_lifetime,
            ),
            newly_joined_window: Duration::from_secs(newly_joined_window),
            had_alive_tolerance: Duration::from_secs(had_alive_tolerance),
        })
    }
}

/// The validated, derived intervals one machine instance runs on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MachineIntervals {
    /// Housekeeping timer period.
    replication: Duration,

    /// Connect/send timeout toward any one peer.
    connection_timeout: Duration,

    /// Hard lifetime cap per transferer child.
    max_transferer_lifetime: Duration,

    /// Collect-pool-versions window length.
    newly_joined_window: Duration,

    /// Tolerated HAD silence before the leader steps down.
    had_alive_tolerance: Duration,
}

/// The replication state machine of one daemon.
#[derive(Debug)]
pub struct ReplicatorStateMachine {
    /// Current role/progress state.
    state: ReplicatorState,

    /// The shared replication building blocks.
    core: ReplicaCore,

    /// Hard lifetime cap per transferer child.
    max_transferer_lifetime: Duration,

    /// Tolerated HAD silence before the leader steps down.
    had_alive_tolerance: Duration,

    /// Periodic housekeeping and local-version broadcast timer; re-armed
    /// by its own handler.
    replication_timer: Timer,

    /// End of the collect-pool-versions window; armed by the
    /// before-passive sequence, disarmed when it fires.
    version_requesting_timer: Timer,

    /// Cap on the initial download before settling for backup; armed when
    /// that download starts, disarmed when the joining sequence ends.
    version_downloading_timer: Timer,

    /// Last time HAD confirmed this daemon's leadership.
    last_had_alive: Instant,
}

impl ReplicatorStateMachine {
    /// Creates the machine and sets up its components: parses and validates
    /// configuration, loads the local version from disk, and binds the peer
    /// command listener. Configuration errors returned from here are fatal.
    pub async fn new_and_setup(
        me: SocketAddr,
        peers: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, ReplistateError> {
        let config = ReplicatorConfig::from_toml_str(config_str)?;
        let intervals = config.derive_intervals(peers.len())?;
        pf_info!(
            "replication_interval={}s max_transferer_lifetime={}s \
             newly_joined_window={}s had_alive_tolerance={}s pool_size={}",
            intervals.replication.as_secs(),
            intervals.max_transferer_lifetime.as_secs(),
            intervals.newly_joined_window.as_secs(),
            intervals.had_alive_tolerance.as_secs(),
            peers.len()
        );

        let core = ReplicaCore::new_and_setup(
            me,
            peers,
            intervals.connection_timeout,
            &config.state_file_path,
            &config.version_file_path,
            &config.transferer_path,
        )
        .await?;

        Ok(ReplicatorStateMachine {
            state: ReplicatorState::VersionRequesting,
            core,
            max_transferer_lifetime: intervals.max_transferer_lifetime,
            had_alive_tolerance: intervals.had_alive_tolerance,
            replication_timer: Timer::new(intervals.replication),
            version_requesting_timer: Timer::new(
                intervals.newly_joined_window,
            ),
            version_downloading_timer: Timer::new(
                intervals.max_transferer_lifetime,
            ),
            last_had_alive: Instant::now(),
        })
    }

    /// Current role/progress state.
    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    /// Main event loop logic of running this replication daemon.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), ReplistateError> {
        self.replication_timer.arm();
        // act as a newly joined daemon right away instead of waiting for
        // HAD's first before-passive notification
        self.before_passive_state_handler().await;

        loop {
            tokio::select! {
                // peer or HAD-notification command
                cmd = self.core.messenger.recv_cmd() => {
                    match cmd {
                        Ok(cmd) => {
                            if let Err(e) = self.handle_peer_command(cmd).await {
                                pf_error!("error handling peer command: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_error!("error receiving peer command: {}", e);
                        }
                    }
                },

                // periodic housekeeping tick
                _ = self.replication_timer.fired() => {
                    self.replication_timer_fired().await;
                },

                // end of the collect-pool-versions window
                _ = self.version_requesting_timer.fired() => {
                    self.version_requesting_timer_fired().await;
                },

                // initial download gave out
                _ = self.version_downloading_timer.fired() => {
                    self.version_downloading_timer_fired().await;
                },

                // a transferer child exited
                exited = self.core.supervisor.wait_any() => {
                    let (role, pid, status) = exited;
                    self.handle_transferer_exit(role, pid, status).await;
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("replication daemon caught termination signal");
                    self.shutdown();
                    return Ok(());
                },
            }
        }
    }

    /// Disarms all timers and kills and cleans every outstanding
    /// transferer. Nothing is promoted on this path.
    pub fn shutdown(&mut self) {
        self.replication_timer.disarm();
        self.version_requesting_timer.disarm();
        self.version_downloading_timer.disarm();
        self.core.supervisor.shutdown_all();
    }

    /// Transitions the role state, keeping the state reported inside
    /// outgoing versions in step.
    pub(crate) fn set_state(&mut self, state: ReplicatorState) {
        if self.state != state {
            pf_info!("state transition {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.core.my_version.set_reported_state(state);
    }
}
