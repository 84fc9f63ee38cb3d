//! sessiongen Core - Shared types and protocol client traits
//!
//! This crate provides the foundational types used across all sessiongen components.

pub mod config;
pub mod error;
pub mod loopback;
pub mod phone;
pub mod protocol;

pub use config::{Config, RetentionPolicy, RetryPolicy};
pub use error::{classify, Error, ErrorClass, ProtocolError, Result};
pub use loopback::{LoopbackConnector, LoopbackController};
pub use phone::PhoneNumber;
pub use protocol::{
    AuthState, Connection, ConnectionEvent, Connector, CredentialBundle, DisconnectReason,
};
