//! Built-in messages of category 0: handshake, errors, ping, and
//! end-of-connection.
//!
//! These are understood by every connection regardless of which message
//! packages the application registered.

use std::fmt;

use crate::message::{MessageId, Outbound};
use crate::wire::{WireReader, WireWriter};
use crate::ProtocolError;

/// Category reserved for [`SystemMessage`].
pub const SYSTEM_CATEGORY: u8 = 0;

const REGISTER: u8 = 1;
const WELCOME: u8 = 2;
const SERVER_ERROR: u8 = 3;
const VERSION_ERROR: u8 = 4;
const END_OF_CONNECTION: u8 = 5;
const PING: u8 = 6;

/// Why a connection attempt (or a session) failed.
///
/// Carried as a `u16` in [`SystemMessage::ServerError`] and
/// [`SystemMessage::VersionError`], and reported to the application by the
/// client bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    None = 0,
    ConnectFailed = 1,
    ConnectCanceled = 2,
    ConnectTimedOut = 3,
    VersionTooOld = 4,
    VersionTooNew = 5,
    BadKeyFormat = 6,
    BadKeyValue = 7,
    UnknownAccount = 8,
    MaxConnReached = 9,
    AccessLocked = 10,
    AlreadyConnected = 11,
    AccountDeleted = 12,
    BadRequest = 13,
}

impl ErrorCode {
    const ALL: [ErrorCode; 14] = [
        Self::None,
        Self::ConnectFailed,
        Self::ConnectCanceled,
        Self::ConnectTimedOut,
        Self::VersionTooOld,
        Self::VersionTooNew,
        Self::BadKeyFormat,
        Self::BadKeyValue,
        Self::UnknownAccount,
        Self::MaxConnReached,
        Self::AccessLocked,
        Self::AlreadyConnected,
        Self::AccountDeleted,
        Self::BadRequest,
    ];

    /// Wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parses a wire value. `None` for codes this build does not know.
    pub fn from_u16(v: u16) -> Option<Self> {
        Self::ALL.get(usize::from(v)).copied()
    }

    /// Short human-readable description.
    pub fn description(self) -> &'static str {
        match self {
            Self::None => "no error",
            Self::ConnectFailed => "failed to connect to server",
            Self::ConnectCanceled => "connection attempt canceled",
            Self::ConnectTimedOut => "server did not answer in time",
            Self::VersionTooOld => "client protocol version is too old",
            Self::VersionTooNew => "client protocol version is newer than the server's",
            Self::BadKeyFormat => "malformed access key",
            Self::BadKeyValue => "access key rejected",
            Self::UnknownAccount => "unknown account",
            Self::MaxConnReached => "server is full",
            Self::AccessLocked => "server is not accepting connections",
            Self::AlreadyConnected => "account is already connected",
            Self::AccountDeleted => "account was deleted",
            Self::BadRequest => "bad request",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Protocol-level messages every connection understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemMessage {
    /// First message a client sends: who it is and what it speaks.
    ClientRegister {
        /// Client protocol version.
        version: u32,
        /// Opaque access key, e.g. `"login:password"`.
        key: String,
    },
    /// The server accepted the registration.
    ServerWelcome,
    /// The server refused the connection.
    ServerError {
        code: ErrorCode,
        message: String,
    },
    /// The client's protocol version does not match.
    VersionError {
        /// [`ErrorCode::VersionTooOld`] or [`ErrorCode::VersionTooNew`].
        code: ErrorCode,
        /// The version the server speaks.
        server_version: u32,
        message: String,
    },
    /// The sender is closing the connection on purpose.
    EndOfConnection,
    /// Keep-alive probe; echoed back by the peer.
    Ping {
        seq: u8,
    },
}

impl SystemMessage {
    /// Reads the payload of the system message with type byte `kind`.
    ///
    /// Returns `Ok(None)` for a type this build does not know, so the
    /// caller can treat it like any other unknown message.
    pub fn decode(kind: u8, r: &mut WireReader<'_>) -> Result<Option<Self>, ProtocolError> {
        let msg = match kind {
            REGISTER => Self::ClientRegister {
                version: r.get_u32()?,
                key: r.get_string()?,
            },
            WELCOME => Self::ServerWelcome,
            SERVER_ERROR => Self::ServerError {
                code: read_code(r)?,
                message: r.get_string()?,
            },
            VERSION_ERROR => Self::VersionError {
                code: read_code(r)?,
                server_version: r.get_u32()?,
                message: r.get_string()?,
            },
            END_OF_CONNECTION => Self::EndOfConnection,
            PING => Self::Ping { seq: r.get_u8()? },
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }

    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ClientRegister { .. } => "ClientRegister",
            Self::ServerWelcome => "ServerWelcome",
            Self::ServerError { .. } => "ServerError",
            Self::VersionError { .. } => "VersionError",
            Self::EndOfConnection => "EndOfConnection",
            Self::Ping { .. } => "Ping",
        }
    }
}

fn read_code(r: &mut WireReader<'_>) -> Result<ErrorCode, ProtocolError> {
    let raw = r.get_u16()?;
    ErrorCode::from_u16(raw)
        .ok_or_else(|| ProtocolError::InvalidMessage(format!("unknown error code {raw}")))
}

impl Outbound for SystemMessage {
    fn message_id(&self) -> MessageId {
        let kind = match self {
            Self::ClientRegister { .. } => REGISTER,
            Self::ServerWelcome => WELCOME,
            Self::ServerError { .. } => SERVER_ERROR,
            Self::VersionError { .. } => VERSION_ERROR,
            Self::EndOfConnection => END_OF_CONNECTION,
            Self::Ping { .. } => PING,
        };
        MessageId::new(SYSTEM_CATEGORY, kind)
    }

    fn encode_payload(&self, w: &mut WireWriter<'_>) -> Result<(), ProtocolError> {
        match self {
            Self::ClientRegister { version, key } => {
                w.put_u32(*version);
                w.put_str(key)?;
            }
            Self::ServerWelcome | Self::EndOfConnection => {}
            Self::ServerError { code, message } => {
                w.put_u16(code.as_u16());
                w.put_str(message)?;
            }
            Self::VersionError {
                code,
                server_version,
                message,
            } => {
                w.put_u16(code.as_u16());
                w.put_u32(*server_version);
                w.put_str(message)?;
            }
            Self::Ping { seq } => w.put_u8(*seq),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Frame, HEADER_LEN};

    fn through_wire(msg: &SystemMessage) -> SystemMessage {
        let frame = Frame::encode(msg).unwrap();
        let bytes = frame.as_bytes();
        assert_eq!(bytes[0], SYSTEM_CATEGORY);
        let mut r = WireReader::new(&bytes[HEADER_LEN..]);
        let back = SystemMessage::decode(bytes[1], &mut r).unwrap().unwrap();
        assert_eq!(r.remaining(), 0, "decode must consume the whole payload");
        back
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        let msgs = [
            SystemMessage::ClientRegister {
                version: u32::MAX,
                key: "alice:secret".into(),
            },
            SystemMessage::ServerWelcome,
            SystemMessage::ServerError {
                code: ErrorCode::AccessLocked,
                message: String::new(),
            },
            SystemMessage::VersionError {
                code: ErrorCode::VersionTooOld,
                server_version: 7,
                message: "upgrade".into(),
            },
            SystemMessage::EndOfConnection,
            SystemMessage::Ping { seq: 119 },
        ];
        for msg in &msgs {
            assert_eq!(&through_wire(msg), msg, "{}", msg.name());
        }
    }

    #[test]
    fn test_error_code_wire_values_are_stable() {
        for (i, code) in ErrorCode::ALL.iter().enumerate() {
            assert_eq!(code.as_u16() as usize, i);
            assert_eq!(ErrorCode::from_u16(code.as_u16()), Some(*code));
        }
        assert_eq!(ErrorCode::from_u16(14), None);
    }

    #[test]
    fn test_unknown_error_code_is_invalid() {
        // ServerError with code 999.
        let mut r = WireReader::new(&[0x03, 0xE7, 0x00, 0x00]);
        let err = SystemMessage::decode(SERVER_ERROR, &mut r).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_unknown_system_kind_is_none() {
        let mut r = WireReader::new(&[]);
        assert_eq!(SystemMessage::decode(200, &mut r).unwrap(), None);
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(ErrorCode::MaxConnReached.to_string(), "server is full");
    }
}
