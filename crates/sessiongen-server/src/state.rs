//! Shared application state

use sessiongen_core::Config;
use sessiongen_session::PairingManager;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Pairing manager driving every session
    pub pairing_manager: Arc<PairingManager>,
}

impl AppState {
    /// Create a new application state
    pub fn new(pairing_manager: Arc<PairingManager>) -> Self {
        Self {
            config: pairing_manager.config().clone(),
            pairing_manager,
        }
    }
}
