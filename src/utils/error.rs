//! Customized unified error type.

use std::io;
use std::net;

use thiserror::Error;

/// Customized error type for replistate. Variants classify how the daemon
/// reacts: `Config` is fatal at bootstrap, everything else is recovered by
/// logging and letting the next replication tick reconcile.
#[derive(Debug, PartialEq, Eq, Clone, Error)]
pub enum ReplistateError {
    /// Missing, non-positive, or unparseable configuration parameter.
    #[error("config: {0}")]
    Config(String),

    /// Malformed inbound frame; the offending connection gets dropped.
    #[error("wire format: {0}")]
    WireFormat(String),

    /// Connect/send failure toward one peer during broadcast or unicast.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// A second download requested while one is active.
    #[error("transferer already running: {0}")]
    AlreadyRunning(String),

    /// Transferer child exited non-zero, was killed, or could not spawn.
    #[error("transfer failed: {0}")]
    TransferFailed(String),

    /// Cannot read or write the state/version file pair.
    #[error("file i/o: {0}")]
    FileIo(String),

    /// Anything else (channel plumbing, parsing, ...).
    #[error("{0}")]
    Msg(String),
}

impl ReplistateError {
    /// Wraps any displayable value as a catch-all `Msg` error.
    pub fn msg(e: impl ToString) -> Self {
        ReplistateError::Msg(e.to_string())
    }

    /// True for errors the bootstrap layer must treat as fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplistateError::Config(_))
    }
}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `ReplistateError`.
macro_rules! impl_from_error {
    ($error:ty, $variant:ident) => {
        impl From<$error> for ReplistateError {
            fn from(e: $error) -> Self {
                ReplistateError::$variant(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error, Msg);
impl_from_error!(net::AddrParseError, Config);
impl_from_error!(toml::de::Error, Config);
impl_from_error!(std::num::ParseIntError, Msg);
impl_from_error!(std::string::FromUtf8Error, WireFormat);
impl_from_error!(tokio::time::error::Elapsed, PeerUnreachable);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = ReplistateError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = ReplistateError::from(io_error);
        assert!(format!("{}", e).contains("oh no!"));
    }

    #[test]
    fn fatal_classification() {
        assert!(ReplistateError::Config("bad interval".into()).is_fatal());
        assert!(!ReplistateError::WireFormat("short read".into()).is_fatal());
        assert!(!ReplistateError::msg("whatever").is_fatal());
    }
}
