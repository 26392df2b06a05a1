use thiserror::Error;

use crate::domain::ConversationKey;

/// Error taxonomy for the coordination core.
///
/// `Validation` and `AlreadyActive` are surfaced synchronously for
/// user-facing messaging. `Store` write failures are surfaced so callers
/// can offer retry; read-subscription failures are logged at the
/// subscription layer instead. `Translation` failures never surface past
/// the translation lifecycle, which resets to its none state.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("an ephemeral session is already active for pair {0}")]
    AlreadyActive(ConversationKey),

    #[error("store operation failed: {0}")]
    Store(String),

    #[error("translation service failed: {0}")]
    Translation(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        CoreError::NotFound(message.into())
    }
}
