//! sessiongen Session - Pairing sessions and credential storage
//!
//! Links a new device to a chat account and hands its credentials back.
//!
//! # Pairing Flow
//!
//! 1. Caller asks `PairingManager::start()` for a pairing code or QR session
//! 2. A fresh credential namespace is allocated and a protocol connection opened
//! 3. The pairing code (`ABCD-EFGH`) or QR payload is returned to the caller
//! 4. The user enters the code or scans the QR on their phone
//! 5. Once the connection opens, the credentials are stored under the session
//!    id and sent to the paired account
//!
//! # Example
//!
//! ```no_run
//! use sessiongen_core::{Config, LoopbackConnector};
//! use sessiongen_session::{Challenge, PairingManager, SessionStore};
//! use std::sync::Arc;
//!
//! async fn example() {
//!     let store = Arc::new(SessionStore::new().await.unwrap());
//!     let manager = PairingManager::new(
//!         Arc::new(LoopbackConnector::new()),
//!         store,
//!         Config::default(),
//!     );
//!
//!     let handle = manager.pair_number("+1 555 123 4567").await.unwrap();
//!     if let Challenge::Code(code) = &handle.challenge {
//!         println!("Enter this code on your phone: {}", code);
//!     }
//!
//!     // Later, using the id sent to the paired account
//!     let bundle = manager.fetch(&handle.session_id).await.unwrap();
//!     println!("{} bytes of credentials", bundle.len());
//! }
//! ```

pub mod delivery;
pub mod pairing;
pub mod session;
pub mod storage;

pub use pairing::{PairingError, PairingHandle, PairingManager, PairingResult};
pub use session::{
    format_pairing_code, Challenge, PairingMode, PairingRequest, SessionId, SessionState,
};
pub use storage::{CredentialNamespace, SessionStore, StorageError, StorageResult, StoredSession};
