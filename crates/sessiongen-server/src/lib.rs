//! sessiongen Server - Axum-based HTTP server
//!
//! Exposes pairing, QR and credential retrieval endpoints over a
//! [`sessiongen_session::PairingManager`].

pub mod http;
pub mod qr;
pub mod state;

pub use http::create_router;
pub use state::AppState;
