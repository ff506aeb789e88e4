//! Peer wire protocol: command codes and frame encoding/decoding.
//!
//! Every frame is one command: a signed 32-bit command code, the sender's
//! address as a length-prefixed string, then zero or more typed fields
//! depending on the command kind. All numbers are big-endian; strings are a
//! 32-bit length followed by UTF-8 bytes (no NUL). The end of a message is
//! the sender's write-side shutdown of the carrying connection. These
//! layouts interoperate with existing peers and must not change.

use std::fmt;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::replica::version::Version;
use crate::utils::ReplistateError;

// Command codes. The HAD-notification block and the replication block keep
// the numbering of the deployed daemons.
const CMD_HAD_BEFORE_PASSIVE_STATE: i32 = 702;
const CMD_HAD_AFTER_ELECTION_STATE: i32 = 703;
const CMD_HAD_AFTER_LEADER_STATE: i32 = 704;
const CMD_HAD_IN_LEADER_STATE: i32 = 705;
const CMD_REPLICATION_TRANSFER_FILE: i32 = 800;
const CMD_REPLICATION_LEADER_VERSION: i32 = 801;
const CMD_REPLICATION_NEWLY_JOINED_VERSION: i32 = 802;
const CMD_REPLICATION_GIVING_UP_VERSION: i32 = 803;
const CMD_REPLICATION_SOLICIT_VERSION: i32 = 804;
const CMD_REPLICATION_SOLICIT_VERSION_REPLY: i32 = 805;

/// Upper bound on any length-prefixed string in a frame. The replicated
/// payload is a pair of small files; addresses are far smaller still.
const MAX_STRING_LEN: u32 = 1 << 20;

/// The eight-plus-two command kinds a replication daemon exchanges with its
/// peers and with the local HAD election daemon.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CommandKind {
    /// HAD is about to enter its passive state.
    HadBeforePassive,
    /// HAD finished an election round.
    HadAfterElection,
    /// HAD is relinquishing leadership.
    HadAfterLeader,
    /// HAD's periodic "still the leader" notification.
    HadInLeader,
    /// A downloading transferer asks for the file pair to be pushed to it.
    TransferFile,
    /// The replication leader announces its current version.
    LeaderVersion,
    /// A newly joined daemon announces the version of its last run.
    NewlyJoinedVersion,
    /// A leader stepping down announces its final version.
    GivingUpVersion,
    /// A newly joined daemon asks the pool for versions.
    SolicitVersion,
    /// A pool member replies to a version solicitation.
    SolicitVersionReply,
}

impl CommandKind {
    /// The stable wire code of this command kind.
    pub fn code(self) -> i32 {
        match self {
            CommandKind::HadBeforePassive => CMD_HAD_BEFORE_PASSIVE_STATE,
            CommandKind::HadAfterElection => CMD_HAD_AFTER_ELECTION_STATE,
            CommandKind::HadAfterLeader => CMD_HAD_AFTER_LEADER_STATE,
            CommandKind::HadInLeader => CMD_HAD_IN_LEADER_STATE,
            CommandKind::TransferFile => CMD_REPLICATION_TRANSFER_FILE,
            CommandKind::LeaderVersion => CMD_REPLICATION_LEADER_VERSION,
            CommandKind::NewlyJoinedVersion => {
                CMD_REPLICATION_NEWLY_JOINED_VERSION
            }
            CommandKind::GivingUpVersion => {
                CMD_REPLICATION_GIVING_UP_VERSION
            }
            CommandKind::SolicitVersion => CMD_REPLICATION_SOLICIT_VERSION,
            CommandKind::SolicitVersionReply => {
                CMD_REPLICATION_SOLICIT_VERSION_REPLY
            }
        }
    }

    /// Maps a wire code back to a command kind.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            CMD_HAD_BEFORE_PASSIVE_STATE => Some(CommandKind::HadBeforePassive),
            CMD_HAD_AFTER_ELECTION_STATE => Some(CommandKind::HadAfterElection),
            CMD_HAD_AFTER_LEADER_STATE => Some(CommandKind::HadAfterLeader),
            CMD_HAD_IN_LEADER_STATE => Some(CommandKind::HadInLeader),
            CMD_REPLICATION_TRANSFER_FILE => Some(CommandKind::TransferFile),
            CMD_REPLICATION_LEADER_VERSION => Some(CommandKind::LeaderVersion),
            CMD_REPLICATION_NEWLY_JOINED_VERSION => {
                Some(CommandKind::NewlyJoinedVersion)
            }
            CMD_REPLICATION_GIVING_UP_VERSION => {
                Some(CommandKind::GivingUpVersion)
            }
            CMD_REPLICATION_SOLICIT_VERSION => {
                Some(CommandKind::SolicitVersion)
            }
            CMD_REPLICATION_SOLICIT_VERSION_REPLY => {
                Some(CommandKind::SolicitVersionReply)
            }
            _ => None,
        }
    }

    /// True for kinds whose payload carries a `Version` (followed by the
    /// producer's state) after the sender address.
    pub fn carries_version(self) -> bool {
        matches!(
            self,
            CommandKind::LeaderVersion
                | CommandKind::NewlyJoinedVersion
                | CommandKind::GivingUpVersion
                | CommandKind::SolicitVersionReply
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CommandKind::HadBeforePassive => "HAD_BEFORE_PASSIVE_STATE",
            CommandKind::HadAfterElection => "HAD_AFTER_ELECTION_STATE",
            CommandKind::HadAfterLeader => "HAD_AFTER_LEADER_STATE",
            CommandKind::HadInLeader => "HAD_IN_LEADER_STATE",
            CommandKind::TransferFile => "REPLICATION_TRANSFER_FILE",
            CommandKind::LeaderVersion => "REPLICATION_LEADER_VERSION",
            CommandKind::NewlyJoinedVersion => {
                "REPLICATION_NEWLY_JOINED_VERSION"
            }
            CommandKind::GivingUpVersion => "REPLICATION_GIVING_UP_VERSION",
            CommandKind::SolicitVersion => "REPLICATION_SOLICIT_VERSION",
            CommandKind::SolicitVersionReply => {
                "REPLICATION_SOLICIT_VERSION_REPLY"
            }
        };
        write!(f, "{}", name)
    }
}

/// One decoded peer command: the kind, the sender's own address, and the
/// sender's version (present only for version-bearing kinds).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PeerCommand {
    pub kind: CommandKind,
    pub sender: String,
    pub version: Option<Version>,
}

impl PeerCommand {
    /// Composes an address-only command.
    pub fn addr_only(kind: CommandKind, sender: impl Into<String>) -> Self {
        debug_assert!(!kind.carries_version());
        PeerCommand {
            kind,
            sender: sender.into(),
            version: None,
        }
    }

    /// Composes a version-bearing command.
    pub fn with_version(
        kind: CommandKind,
        sender: impl Into<String>,
        version: Version,
    ) -> Self {
        debug_assert!(kind.carries_version());
        PeerCommand {
            kind,
            sender: sender.into(),
            version: Some(version),
        }
    }

    /// Encodes this command into a fresh outbound frame buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32(self.kind.code());
        put_string(&mut buf, &self.sender);
        if let Some(version) = &self.version {
            version.encode(&mut buf);
        }
        buf
    }

    /// Decodes one command frame from the given readable connection. The
    /// sender is expected to shut down its write side after the final field;
    /// trailing bytes are a wire-format error.
    pub async fn read_from<Conn>(
        conn_read: &mut Conn,
    ) -> Result<Self, ReplistateError>
    where
        Conn: AsyncRead + Unpin,
    {
        let code = read_i32(conn_read).await?;
        let kind = CommandKind::from_code(code).ok_or_else(|| {
            ReplistateError::WireFormat(format!(
                "unknown command code {}",
                code
            ))
        })?;
        let sender = read_string(conn_read).await?;
        let version = if kind.carries_version() {
            Some(Version::decode(conn_read).await?)
        } else {
            None
        };

        // expect the end-of-message: the peer's write-side shutdown
        let mut probe = [0u8; 1];
        match conn_read.read(&mut probe).await {
            Ok(0) => Ok(PeerCommand {
                kind,
                sender,
                version,
            }),
            Ok(_) => Err(ReplistateError::WireFormat(format!(
                "trailing bytes after {} frame",
                kind
            ))),
            Err(e) => Err(ReplistateError::WireFormat(format!(
                "reading end of {} frame: {}",
                kind, e
            ))),
        }
    }
}

/// Appends a length-prefixed string field to an outbound frame.
pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_STRING_LEN as usize);
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Reads a signed 32-bit big-endian field.
pub(crate) async fn read_i32<Conn>(
    conn_read: &mut Conn,
) -> Result<i32, ReplistateError>
where
    Conn: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    conn_read
        .read_exact(&mut bytes)
        .await
        .map_err(|e| ReplistateError::WireFormat(format!("short read: {}", e)))?;
    Ok(i32::from_be_bytes(bytes))
}

/// Reads a signed 64-bit big-endian field.
pub(crate) async fn read_i64<Conn>(
    conn_read: &mut Conn,
) -> Result<i64, ReplistateError>
where
    Conn: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 8];
    conn_read
        .read_exact(&mut bytes)
        .await
        .map_err(|e| ReplistateError::WireFormat(format!("short read: {}", e)))?;
    Ok(i64::from_be_bytes(bytes))
}

/// Reads a length-prefixed UTF-8 string field.
pub(crate) async fn read_string<Conn>(
    conn_read: &mut Conn,
) -> Result<String, ReplistateError>
where
    Conn: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 4];
    conn_read
        .read_exact(&mut bytes)
        .await
        .map_err(|e| ReplistateError::WireFormat(format!("short read: {}", e)))?;
    let len = u32::from_be_bytes(bytes);
    if len > MAX_STRING_LEN {
        return Err(ReplistateError::WireFormat(format!(
            "string length {} exceeds cap",
            len
        )));
    }

    let mut content = vec![0u8; len as usize];
    conn_read
        .read_exact(&mut content)
        .await
        .map_err(|e| ReplistateError::WireFormat(format!("short read: {}", e)))?;
    Ok(String::from_utf8(content)?)
}

#[cfg(test)]
mod codec_tests {
    use super::*;
    use crate::replica::version::ReplicatorState;

    #[test]
    fn code_mapping_stable() {
        for kind in [
            CommandKind::HadBeforePassive,
            CommandKind::HadAfterElection,
            CommandKind::HadAfterLeader,
            CommandKind::HadInLeader,
            CommandKind::TransferFile,
            CommandKind::LeaderVersion,
            CommandKind::NewlyJoinedVersion,
            CommandKind::GivingUpVersion,
            CommandKind::SolicitVersion,
            CommandKind::SolicitVersionReply,
        ] {
            assert_eq!(CommandKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(CommandKind::from_code(0), None);
        assert_eq!(CommandKind::LeaderVersion.code(), 801);
        assert_eq!(CommandKind::HadBeforePassive.code(), 702);
    }

    #[tokio::test]
    async fn addr_only_roundtrip() -> Result<(), ReplistateError> {
        let cmd = PeerCommand::addr_only(
            CommandKind::SolicitVersion,
            "10.0.0.7:9618",
        );
        let buf = cmd.encode();
        let mut slice: &[u8] = &buf[..];
        let decoded = PeerCommand::read_from(&mut slice).await?;
        assert_eq!(decoded, cmd);
        Ok(())
    }

    #[tokio::test]
    async fn version_bearing_roundtrip() -> Result<(), ReplistateError> {
        let mut version = Version::new(7, 42, "10.0.0.7:9618");
        version.set_state(ReplicatorState::Backup);
        let cmd = PeerCommand::with_version(
            CommandKind::LeaderVersion,
            "10.0.0.7:9618",
            version,
        );
        let buf = cmd.encode();
        let mut slice: &[u8] = &buf[..];
        let decoded = PeerCommand::read_from(&mut slice).await?;
        assert_eq!(decoded, cmd);
        Ok(())
    }

    #[tokio::test]
    async fn short_frame_rejected() {
        let cmd = PeerCommand::addr_only(
            CommandKind::SolicitVersion,
            "10.0.0.7:9618",
        );
        let buf = cmd.encode();
        let mut slice: &[u8] = &buf[..buf.len() - 3];
        let res = PeerCommand::read_from(&mut slice).await;
        assert!(matches!(res, Err(ReplistateError::WireFormat(_))));
    }

    #[tokio::test]
    async fn trailing_bytes_rejected() {
        let cmd = PeerCommand::addr_only(
            CommandKind::SolicitVersion,
            "10.0.0.7:9618",
        );
        let mut buf = cmd.encode();
        buf.put_u8(0xff);
        let mut slice: &[u8] = &buf[..];
        let res = PeerCommand::read_from(&mut slice).await;
        assert!(matches!(res, Err(ReplistateError::WireFormat(_))));
    }

    #[tokio::test]
    async fn unknown_code_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(999);
        put_string(&mut buf, "10.0.0.7:9618");
        let mut slice: &[u8] = &buf[..];
        let res = PeerCommand::read_from(&mut slice).await;
        assert!(matches!(res, Err(ReplistateError::WireFormat(_))));
    }

    #[tokio::test]
    async fn oversized_string_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(CommandKind::SolicitVersion.code());
        buf.put_u32(u32::MAX); // absurd length prefix
        let mut slice: &[u8] = &buf[..];
        let res = PeerCommand::read_from(&mut slice).await;
        assert!(matches!(res, Err(ReplistateError::WireFormat(_))));
    }
}
