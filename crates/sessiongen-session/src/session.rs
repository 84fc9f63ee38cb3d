//! Pairing session identity and lifecycle
//!
//! Session identifiers are capability tokens: holding one is enough to fetch
//! the stored credentials. They are only ever handed to the requesting user,
//! and logs refer to sessions by a short fingerprint instead.

use crate::pairing::{PairingError, PairingResult};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use sessiongen_core::PhoneNumber;
use sha2::{Digest, Sha256};

const SUFFIX_LEN: usize = 9;
const MIN_ID_LEN: usize = 10;
const MAX_ID_LEN: usize = 64;

/// Unique identifier for a pairing session
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new identifier: unix millis followed by a random suffix
    pub fn generate() -> Self {
        let suffix = Alphanumeric
            .sample_string(&mut rand::thread_rng(), SUFFIX_LEN)
            .to_lowercase();
        Self(format!("{}{}", Utc::now().timestamp_millis(), suffix))
    }

    /// Accept an identifier from untrusted input
    ///
    /// Only ASCII alphanumerics are allowed, so a valid id is always safe to
    /// use as a directory name.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = (MIN_ID_LEN..=MAX_ID_LEN).contains(&s.len())
            && s.bytes().all(|b| b.is_ascii_alphanumeric());
        valid.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, non-reversible tag for logs
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        URL_SAFE_NO_PAD.encode(&digest[..8])
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Debug output ends up in logs
impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", self.fingerprint())
    }
}

/// Lifecycle state of a pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    CodeIssued,
    QrIssued,
    Authenticated,
    Reconnecting,
    /// Credentials persisted and delivered
    Completed,
    /// The protocol rejected the credentials
    LoggedOut,
    /// Retry budget or session lifetime exhausted
    Expired,
    /// Torn down before completing, e.g. no challenge could be issued
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed
                | SessionState::LoggedOut
                | SessionState::Expired
                | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::CodeIssued => "code-issued",
            SessionState::QrIssued => "qr-issued",
            SessionState::Authenticated => "authenticated",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Completed => "completed",
            SessionState::LoggedOut => "logged-out",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// How the user proves possession of the phone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingMode {
    /// Numeric pairing code typed on the phone
    Code,
    /// QR code scanned by the phone
    Qr,
}

/// A request to pair a new device
#[derive(Debug, Clone)]
pub struct PairingRequest {
    number: Option<PhoneNumber>,
}

impl PairingRequest {
    /// Pairing-code request for a raw, user-typed number
    pub fn code(raw_number: &str) -> PairingResult<Self> {
        let number = PhoneNumber::parse(raw_number).map_err(PairingError::from)?;
        Ok(Self::with_number(number))
    }

    pub fn with_number(number: PhoneNumber) -> Self {
        Self {
            number: Some(number),
        }
    }

    pub fn qr() -> Self {
        Self { number: None }
    }

    pub fn number(&self) -> Option<&PhoneNumber> {
        self.number.as_ref()
    }

    pub fn mode(&self) -> PairingMode {
        if self.number.is_some() {
            PairingMode::Code
        } else {
            PairingMode::Qr
        }
    }
}

/// What the user needs to complete pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// Pairing code, grouped for readability (`ABCD-EFGH`)
    Code(String),
    /// Raw QR payload
    Qr(String),
}

/// Group a raw pairing code into blocks of four separated by `-`
pub fn format_pairing_code(raw: &str) -> String {
    let chars: Vec<char> = raw.chars().collect();
    chars
        .chunks(4)
        .map(|group| group.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join("-")
}
