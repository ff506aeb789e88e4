//! Replica version model: the identity and freshness of one copy of the
//! replicated state-file pair, plus the in-memory table of peer versions.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};
use tokio::io::AsyncRead;

use crate::replica::codec::{put_string, read_i32, read_i64, read_string};
use crate::utils::ReplistateError;

/// Generation identifier type. Two versions are comparable iff their gids
/// are equal; a fresh gid marks a logical epoch break in the pool.
pub type Gid = i32;

/// Role/progress state of a replication daemon. Carried inside every
/// version-bearing peer command as the producer's state at send time.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ReplicatorState {
    /// Initial state: collecting pool versions after (re)init.
    #[default]
    VersionRequesting,
    /// Downloading the best collected pool version.
    VersionDownloading,
    /// Normal steady state for non-leader daemons.
    Backup,
    /// Authoritative writer for the pool.
    Leader,
}

impl ReplicatorState {
    /// The stable wire code of this state.
    pub fn code(self) -> i32 {
        match self {
            ReplicatorState::VersionRequesting => 0,
            ReplicatorState::VersionDownloading => 1,
            ReplicatorState::Backup => 2,
            ReplicatorState::Leader => 3,
        }
    }

    /// Maps a wire code back to a state.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ReplicatorState::VersionRequesting),
            1 => Some(ReplicatorState::VersionDownloading),
            2 => Some(ReplicatorState::Backup),
            3 => Some(ReplicatorState::Leader),
            _ => None,
        }
    }
}

/// Identity and freshness of one replica of the state-file pair. Ordering is
/// defined only between comparable (equal-gid) versions, hence explicit
/// comparison methods instead of `PartialOrd`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Version {
    /// Generation identifier.
    gid: Gid,

    /// Per-generation monotonic counter of local file modifications.
    logical_clock: i64,

    /// Network address of the daemon that produced this version, treated as
    /// an opaque identifier string.
    addr: String,

    /// The producer's state at the time of sending.
    state: ReplicatorState,
}

impl Version {
    /// Creates a version value; the state field starts at its default and is
    /// stamped by the owner right before sending.
    pub fn new(gid: Gid, logical_clock: i64, addr: impl Into<String>) -> Self {
        debug_assert!(logical_clock >= 0);
        Version {
            gid,
            logical_clock,
            addr: addr.into(),
            state: ReplicatorState::default(),
        }
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn logical_clock(&self) -> i64 {
        self.logical_clock
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ReplicatorState {
        self.state
    }

    pub fn set_state(&mut self, state: ReplicatorState) {
        self.state = state;
    }

    /// Two versions are comparable iff they belong to the same generation.
    pub fn is_comparable(&self, other: &Version) -> bool {
        self.gid == other.gid
    }

    /// Strict order between comparable versions; false whenever the two are
    /// not comparable.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self.is_comparable(other) && self.logical_clock > other.logical_clock
    }

    /// Encodes this version onto an outbound frame: gid, logical clock, and
    /// producer address, followed by the producer state as its own coded
    /// item on the same stream.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.gid);
        buf.put_i64(self.logical_clock);
        put_string(buf, &self.addr);
        buf.put_i32(self.state.code());
    }

    /// Decodes a version (and the trailing producer state) from the given
    /// readable connection.
    pub async fn decode<Conn>(
        conn_read: &mut Conn,
    ) -> Result<Self, ReplistateError>
    where
        Conn: AsyncRead + Unpin,
    {
        let gid = read_i32(conn_read).await?;
        let logical_clock = read_i64(conn_read).await?;
        if logical_clock < 0 {
            return Err(ReplistateError::WireFormat(format!(
                "negative logical clock {}",
                logical_clock
            )));
        }
        let addr = read_string(conn_read).await?;
        let state_code = read_i32(conn_read).await?;
        let state = ReplicatorState::from_code(state_code).ok_or_else(|| {
            ReplistateError::WireFormat(format!(
                "invalid replicator state code {}",
                state_code
            ))
        })?;

        Ok(Version {
            gid,
            logical_clock,
            addr,
            state,
        })
    }
}

/// Size + mtime fingerprint of the state file, used to detect modifications
/// between synchronize calls.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
struct FileSnapshot {
    len: u64,
    mtime: SystemTime,
}

/// This daemon's own version, tied to the on-disk state/version file pair.
#[derive(Debug)]
pub(crate) struct LocalVersion {
    /// The current in-memory version value.
    version: Version,

    /// Path of the replicated (opaque) state file.
    state_file_path: PathBuf,

    /// Path of the version file recording `<gid> <clock> <addr>`.
    version_file_path: PathBuf,

    /// Fingerprint of the state file at the last synchronize; `None` while
    /// the file does not exist.
    state_snapshot: Option<FileSnapshot>,
}

impl LocalVersion {
    /// Loads the local version from disk. A missing version file means a
    /// cold start at `{gid: 0, clock: 0}`; an unreadable or unparseable one
    /// is an error the bootstrap layer treats as fatal.
    pub(crate) fn load(
        state_file_path: impl Into<PathBuf>,
        version_file_path: impl Into<PathBuf>,
        own_addr: impl Into<String>,
    ) -> Result<Self, ReplistateError> {
        let state_file_path = state_file_path.into();
        let version_file_path = version_file_path.into();

        let recorded = read_version_file(&version_file_path)?;
        let (gid, logical_clock) =
            recorded.map(|(g, c, _)| (g, c)).unwrap_or((0, 0));
        let state_snapshot = stat_snapshot(&state_file_path)?;

        Ok(LocalVersion {
            version: Version::new(gid, logical_clock, own_addr),
            state_file_path,
            version_file_path,
            state_snapshot,
        })
    }

    pub(crate) fn version(&self) -> &Version {
        &self.version
    }

    /// Stamps the state reported inside outgoing copies of this version.
    pub(crate) fn set_reported_state(&mut self, state: ReplicatorState) {
        self.version.state = state;
    }

    /// Assigns a fresh generation id and persists it to the version file, so
    /// that concurrently uploading children carry the new generation.
    pub(crate) fn set_gid(&mut self, gid: Gid) -> Result<(), ReplistateError> {
        write_version_file(
            &self.version_file_path,
            gid,
            self.version.logical_clock,
            &self.version.addr,
        )?;
        self.version.gid = gid;
        Ok(())
    }

    /// Synchronizes the in-memory version against the on-disk pair. Two
    /// change sources are distinguished:
    ///
    /// - The version file itself records a different `(gid, clock)` (a
    ///   downloaded pair was promoted into place): the on-disk value is
    ///   adopted as-is, the state-file fingerprint is refreshed without a
    ///   clock bump, and `true` is returned.
    /// - The state file's size/mtime differs from the cached fingerprint (a
    ///   local modification): with `bump_if_changed` the clock is bumped and
    ///   persisted and `true` is returned; without it `true` is returned and
    ///   nothing is mutated, so a later bumping call still sees the change.
    ///
    /// Returns `false` without mutation when nothing changed. A missing
    /// state file counts as "no change" until it first appears.
    pub(crate) fn synchronize(
        &mut self,
        bump_if_changed: bool,
    ) -> Result<bool, ReplistateError> {
        if let Some((gid, clock, _origin)) =
            read_version_file(&self.version_file_path)?
        {
            if (gid, clock)
                != (self.version.gid, self.version.logical_clock)
            {
                pf_debug!(
                    "adopting on-disk version gid={} clock={} \
                     (was gid={} clock={})",
                    gid,
                    clock,
                    self.version.gid,
                    self.version.logical_clock
                );
                self.version.gid = gid;
                self.version.logical_clock = clock;
                self.state_snapshot = stat_snapshot(&self.state_file_path)?;
                return Ok(true);
            }
        }

        let snapshot = stat_snapshot(&self.state_file_path)?;
        if snapshot != self.state_snapshot {
            if !bump_if_changed {
                return Ok(true);
            }
            let bumped = self.version.logical_clock + 1;
            write_version_file(
                &self.version_file_path,
                self.version.gid,
                bumped,
                &self.version.addr,
            )?;
            self.version.logical_clock = bumped;
            self.state_snapshot = snapshot;
            return Ok(true);
        }

        Ok(false)
    }
}

/// Reads and parses the version file. `Ok(None)` if the file does not exist.
fn read_version_file(
    path: &Path,
) -> Result<Option<(Gid, i64, String)>, ReplistateError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ReplistateError::FileIo(format!(
                "reading version file '{}': {}",
                path.display(),
                e
            )))
        }
    };

    let mut fields = content.split_whitespace();
    let parsed = (|| {
        let gid = fields.next()?.parse::<Gid>().ok()?;
        let clock = fields.next()?.parse::<i64>().ok()?;
        let addr = fields.next()?.to_string();
        if clock < 0 || fields.next().is_some() {
            return None;
        }
        Some((gid, clock, addr))
    })();

    match parsed {
        Some(triple) => Ok(Some(triple)),
        None => Err(ReplistateError::FileIo(format!(
            "malformed version file '{}': '{}'",
            path.display(),
            content.trim_end()
        ))),
    }
}

/// Writes the version file through a temp-and-rename so that concurrently
/// uploading children never observe a half-written line.
fn write_version_file(
    path: &Path,
    gid: Gid,
    clock: i64,
    addr: &str,
) -> Result<(), ReplistateError> {
    let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));
    let io_err = |e: std::io::Error| {
        ReplistateError::FileIo(format!(
            "writing version file '{}': {}",
            path.display(),
            e
        ))
    };
    fs::write(&tmp_path, format!("{} {} {}\n", gid, clock, addr))
        .map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)
}

/// Fingerprints the state file; `None` if it does not exist.
fn stat_snapshot(
    path: &Path,
) -> Result<Option<FileSnapshot>, ReplistateError> {
    match fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta.modified().map_err(|e| {
                ReplistateError::FileIo(format!(
                    "stating state file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
            Ok(Some(FileSnapshot {
                len: meta.len(),
                mtime,
            }))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ReplistateError::FileIo(format!(
            "stating state file '{}': {}",
            path.display(),
            e
        ))),
    }
}

/// In-memory mapping from peer address to the latest version received from
/// that peer. Keys are unique with last-write-wins; iteration order is fixed
/// by the address ordering so reductions over the table are deterministic.
#[derive(Debug, Default)]
pub(crate) struct VersionsTable {
    entries: BTreeMap<String, Version>,
}

impl VersionsTable {
    /// Inserts or replaces the entry for the version's producer.
    pub(crate) fn upsert(&mut self, version: Version) {
        self.entries.insert(version.addr.clone(), version);
    }

    /// Drops all entries.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// All current entries in address order.
    pub(crate) fn snapshot(&self) -> Vec<Version> {
        self.entries.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
