//! Shared fixtures for the crate's test suites.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use shared::domain::{AccountTier, ParticipantProfile, TranslationState, UserId, VariantSlot};
use store::{MemoryStore, Store};
use translation::{TranslationRequest, TranslationService, TranslationTarget, VariantCount};

use crate::paths;

pub fn profile(id: &str, language: &str) -> ParticipantProfile {
    ParticipantProfile {
        user_id: UserId::from(id),
        display_name: id.to_string(),
        language: language.to_string(),
        engine: String::new(),
        tier: AccountTier::Free,
        image_url: None,
    }
}

pub fn premium_profile(id: &str, language: &str, engine: &str) -> ParticipantProfile {
    ParticipantProfile {
        engine: engine.to_string(),
        tier: AccountTier::Premium,
        ..profile(id, language)
    }
}

/// Completes every request synchronously, writing finished variants
/// straight back into the store the way the real service does.
pub struct EchoTranslationService {
    store: Arc<MemoryStore>,
}

impl EchoTranslationService {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TranslationService for EchoTranslationService {
    async fn translate(&self, request: TranslationRequest) -> anyhow::Result<()> {
        let phrase =
            |slot: usize| format!("[{} v{slot}] {}", request.target_language, request.text);
        match &request.target {
            TranslationTarget::Pairwise {
                scope,
                conversation_key,
                message_id,
            } => {
                let path = paths::pairwise_messages(*scope, conversation_key)
                    .child(message_id.as_str());
                let translations = match request.variants {
                    VariantCount::Single => json!({ VariantSlot::One.key(): phrase(1) }),
                    VariantCount::Multiple => json!({
                        VariantSlot::One.key(): phrase(1),
                        VariantSlot::Two.key(): phrase(2),
                        VariantSlot::Three.key(): phrase(3),
                    }),
                };
                let mut children = HashMap::new();
                children.insert("translations".to_string(), translations);
                children.insert(
                    "translation_state".to_string(),
                    json!(TranslationState::Ready),
                );
                self.store.update(&path, children).await?;
            }
            TranslationTarget::Group {
                group_id,
                message_id,
            } => {
                let path = paths::group_messages(group_id)
                    .child(message_id.as_str())
                    .child("translations")
                    .child(request.target_language.as_str());
                self.store.write(&path, json!(phrase(1))).await?;
            }
        }
        Ok(())
    }
}

/// Always fails, for exercising the reset path.
pub struct FailingTranslationService;

#[async_trait]
impl TranslationService for FailingTranslationService {
    async fn translate(&self, _request: TranslationRequest) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("engine offline"))
    }
}

/// Records requests without ever completing them, leaving messages in
/// translating state.
#[derive(Default)]
pub struct PendingTranslationService {
    pub requests: Mutex<Vec<TranslationRequest>>,
}

#[async_trait]
impl TranslationService for PendingTranslationService {
    async fn translate(&self, request: TranslationRequest) -> anyhow::Result<()> {
        self.requests.lock().expect("requests").push(request);
        Ok(())
    }
}
