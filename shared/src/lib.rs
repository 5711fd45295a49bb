//! Tunnelsnake Shared Library
//!
//! Transport modes, the Guardian command table and encoder, and the
//! error/status types returned by every tunnel operation.

pub mod protocol;
pub mod error;

pub use error::{Error, Result, Status};
pub use protocol::{encode, parse_line, Mode};
