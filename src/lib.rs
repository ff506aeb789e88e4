//! Public interface to the replistate core library, linked by the daemon
//! and transferer executables.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
pub mod utils;

pub mod machine;
pub mod replica;

pub use machine::{ReplicatorConfig, ReplicatorStateMachine};
pub use replica::{CommandKind, PeerCommand, ReplicatorState, Version};
pub use utils::ReplistateError;
