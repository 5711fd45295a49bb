//! Error types for Tunnelsnake.
//!
//! Every tunnel and encoder operation returns [`Result`]. Callers that
//! report numeric status codes map any result through [`Status`].

use crate::protocol::Mode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("UDP configuration error: {0}")]
    Configuration(String),

    #[error("Incorrect mode selected: {0} is not supported")]
    UnsupportedMode(Mode),

    #[error("Tunnel is not open")]
    NotOpen,

    #[error("Tunnel is already open")]
    AlreadyOpen,

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// Result code reported for a tunnel operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    UdpConfigError = 1,
    IncorrectMode = 2,
    PacketError = 3,
    SocketError = 4,
}

impl Status {
    /// Numeric code of this status
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "OK",
            Status::UdpConfigError => "UDP_CONFIG_ERROR",
            Status::IncorrectMode => "INCORRECT_MODE",
            Status::PacketError => "PACKET_ERROR",
            Status::SocketError => "SOCKET_ERROR",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Status code this error is reported as
    pub fn status(&self) -> Status {
        match self {
            Error::Configuration(_) => Status::UdpConfigError,
            Error::UnsupportedMode(_) => Status::IncorrectMode,
            Error::InvalidPacket(_) | Error::UnknownCommand(_) | Error::Decode(_) => {
                Status::PacketError
            }
            Error::NotOpen | Error::AlreadyOpen | Error::Transport(_) => Status::SocketError,
        }
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::UdpConfigError.code(), 1);
        assert_eq!(Status::IncorrectMode.code(), 2);
        assert_eq!(Status::PacketError.code(), 3);
        assert_eq!(Status::SocketError.code(), 4);
        assert_eq!(Status::SocketError.to_string(), "SOCKET_ERROR");
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(Error::Configuration("port".into()).status(), Status::UdpConfigError);
        assert_eq!(Error::UnsupportedMode(Mode::Tcp).status(), Status::IncorrectMode);
        assert_eq!(Error::NotOpen.status(), Status::SocketError);
        assert_eq!(Error::AlreadyOpen.status(), Status::SocketError);
        assert_eq!(Error::InvalidPacket("empty".into()).status(), Status::PacketError);
        assert_eq!(Error::UnknownCommand("xx".into()).status(), Status::PacketError);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "listener");
        assert_eq!(Error::from(io).status(), Status::SocketError);
    }

    #[test]
    fn test_status_from_result() {
        let ok: Result<()> = Ok(());
        assert_eq!(Status::from(&ok), Status::Ok);
        assert!(Status::from(&ok).is_ok());

        let err: Result<()> = Err(Error::NotOpen);
        assert_eq!(Status::from(&err), Status::SocketError);
    }
}
