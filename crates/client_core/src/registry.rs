use std::collections::HashSet;

use shared::domain::ConversationKey;
use shared::error::CoreError;
use tokio::sync::Mutex;
use tracing::debug;

/// Tracks which pairwise sessions are live on this client. At most one
/// session per conversation key; sessions for different keys coexist.
#[derive(Default)]
pub struct ActiveSessionRegistry {
    active: Mutex<HashSet<ConversationKey>>,
}

impl ActiveSessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key for a new session. Fails while a previous session for
    /// the same key has not released it.
    pub async fn register(&self, key: &ConversationKey) -> Result<(), CoreError> {
        let mut active = self.active.lock().await;
        if !active.insert(key.clone()) {
            return Err(CoreError::AlreadyActive(key.clone()));
        }
        debug!(key = %key, "registry: session registered");
        Ok(())
    }

    /// Release the key. Clearing an unregistered key is a no-op.
    pub async fn clear(&self, key: &ConversationKey) {
        let mut active = self.active.lock().await;
        if active.remove(key) {
            debug!(key = %key, "registry: session slot cleared");
        }
    }

    pub async fn is_active(&self, key: &ConversationKey) -> bool {
        self.active.lock().await.contains(key)
    }
}
