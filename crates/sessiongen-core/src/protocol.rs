//! Protocol client capability
//!
//! The chat protocol itself lives outside this workspace. A backend plugs in
//! by implementing [`Connector`], which opens [`Connection`]s bound to a
//! credential namespace. Connections report their progress as a sequential
//! stream of [`ConnectionEvent`]s.

use crate::error::{ErrorClass, ProtocolError};
use async_trait::async_trait;
use std::path::PathBuf;

/// Opaque authentication material produced by the protocol client
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialBundle(Vec<u8>);

impl CredentialBundle {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Contents are secret
impl std::fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialBundle({} bytes)", self.0.len())
    }
}

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Credentials were rejected or the device was unlinked (401)
    LoggedOut,
    /// Server asked for a fresh connection, typically right after pairing (515)
    RestartRequired,
    /// Connection closed by the server (428)
    ConnectionClosed,
    /// Keepalive or handshake timed out (408)
    ConnectionLost,
    /// Another client took over the session (440)
    ConnectionReplaced,
    /// Server failed to load the session (500)
    BadSession,
    /// Service temporarily unavailable (503)
    Unavailable,
    /// Anything else the protocol reported
    Other { code: Option<u16>, message: String },
}

impl DisconnectReason {
    /// Map a protocol status code
    pub fn from_status(code: u16) -> Self {
        match code {
            401 => DisconnectReason::LoggedOut,
            515 => DisconnectReason::RestartRequired,
            428 => DisconnectReason::ConnectionClosed,
            408 => DisconnectReason::ConnectionLost,
            440 => DisconnectReason::ConnectionReplaced,
            500 => DisconnectReason::BadSession,
            503 => DisconnectReason::Unavailable,
            _ => DisconnectReason::Other {
                code: Some(code),
                message: format!("statusCode: {}", code),
            },
        }
    }

    /// Map a failure raised while connecting or requesting a code
    pub fn from_error(err: &ProtocolError) -> Self {
        match err.status {
            Some(code) if !matches!(Self::from_status(code), DisconnectReason::Other { .. }) => {
                Self::from_status(code)
            }
            _ if err.class() == ErrorClass::LoggedOut => DisconnectReason::LoggedOut,
            _ => DisconnectReason::Other {
                code: err.status,
                message: err.message.clone(),
            },
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DisconnectReason::LoggedOut => Some(401),
            DisconnectReason::RestartRequired => Some(515),
            DisconnectReason::ConnectionClosed => Some(428),
            DisconnectReason::ConnectionLost => Some(408),
            DisconnectReason::ConnectionReplaced => Some(440),
            DisconnectReason::BadSession => Some(500),
            DisconnectReason::Unavailable => Some(503),
            DisconnectReason::Other { code, .. } => *code,
        }
    }

    /// Only an authentication failure ends a session without retrying
    pub fn is_logged_out(&self) -> bool {
        matches!(self, DisconnectReason::LoggedOut)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::LoggedOut => write!(f, "logged out"),
            DisconnectReason::RestartRequired => write!(f, "restart required"),
            DisconnectReason::ConnectionClosed => write!(f, "connection closed"),
            DisconnectReason::ConnectionLost => write!(f, "connection lost"),
            DisconnectReason::ConnectionReplaced => write!(f, "connection replaced"),
            DisconnectReason::BadSession => write!(f, "bad session"),
            DisconnectReason::Unavailable => write!(f, "service unavailable"),
            DisconnectReason::Other { message, .. } => write!(f, "{}", message),
        }
    }
}

/// Connection progress reported by a protocol client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    /// A QR challenge to be scanned by the phone; refreshed periodically
    Qr(String),
    /// Credentials changed and should be saved to the namespace
    CredentialsUpdated(CredentialBundle),
    /// Connection is authenticated
    Open,
    Closed(DisconnectReason),
    /// The phone just linked this device
    NewLogin,
    Online,
}

/// Credentials a connection is bound to
#[derive(Debug, Clone)]
pub struct AuthState {
    /// Directory holding this session's credentials
    pub namespace: PathBuf,
    /// Credentials saved by earlier connections of the same session
    pub credentials: Option<CredentialBundle>,
}

/// One live protocol connection
#[async_trait]
pub trait Connection: Send {
    /// Whether the bound credentials already belong to a linked device
    fn is_registered(&self) -> bool;

    /// Ask the server for a pairing code for `number` (E.164 digits, no `+`)
    ///
    /// Fails when called before the socket finished its initial handshake.
    async fn request_pairing_code(&mut self, number: &str) -> Result<String, ProtocolError>;

    /// Next connection event; `None` once the event stream ended
    async fn next_event(&mut self) -> Option<ConnectionEvent>;

    /// Address of the account this device was linked to, once open
    fn paired_account(&self) -> Option<String>;

    /// Send a text message to `to`
    async fn send_text(&mut self, to: &str, text: &str) -> Result<(), ProtocolError>;

    /// Close the connection without logging the device out
    async fn close(&mut self);
}

/// Opens protocol connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, auth: AuthState) -> Result<Box<dyn Connection>, ProtocolError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(DisconnectReason::from_status(401).is_logged_out());
        assert_eq!(
            DisconnectReason::from_status(515),
            DisconnectReason::RestartRequired
        );
        assert_eq!(DisconnectReason::from_status(999).status_code(), Some(999));
        assert!(!DisconnectReason::from_status(428).is_logged_out());
    }

    #[test]
    fn test_reason_from_error() {
        let err = ProtocolError::new("stream:error not-authorized");
        assert!(DisconnectReason::from_error(&err).is_logged_out());

        let err = ProtocolError::with_status(408, "Timed Out");
        assert_eq!(DisconnectReason::from_error(&err), DisconnectReason::ConnectionLost);

        let err = ProtocolError::new("Socket connection timeout");
        assert!(matches!(
            DisconnectReason::from_error(&err),
            DisconnectReason::Other { code: None, .. }
        ));
    }

    #[test]
    fn test_bundle_debug_hides_contents() {
        let bundle = CredentialBundle::from_bytes(b"secret".to_vec());
        assert_eq!(format!("{:?}", bundle), "CredentialBundle(6 bytes)");
    }
}
