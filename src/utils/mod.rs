//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

mod error;
mod safetcp;
mod timer;

pub use error::ReplistateError;
pub use timer::Timer;

pub(crate) use safetcp::{tcp_bind_with_retry, tcp_connect_with_timeout};
