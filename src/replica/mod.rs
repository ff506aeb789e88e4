//! Building-block components of the replication daemon: the version model,
//! the peer messaging layer, and the transferer child-process supervisor.

mod codec;
mod core;
mod messenger;
mod transferer;
mod version;

pub use codec::{CommandKind, PeerCommand};
pub use version::{Gid, ReplicatorState, Version};

pub(crate) use self::core::ReplicaCore;
pub(crate) use transferer::{ReapOutcome, TransfererRole};

#[cfg(test)]
pub(crate) use transferer::{temp_file_path, testutil};
