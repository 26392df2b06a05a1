use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use shared::domain::{
    AccountTier, ConversationKey, DirectMessage, GroupId, GroupMessage, MessageId,
    ParticipantProfile, TranslationState, UserId, VariantSlot,
};
use shared::error::CoreError;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use store::{decode, Store, StorePath};
use translation::{
    ChatScope, TranslationRequest, TranslationService, TranslationTarget, VariantCount,
};

use crate::config::CoreSettings;
use crate::paths;

/// Engine used when the account tier does not unlock engine selection.
pub const DEFAULT_ENGINE: &str = "google";

/// Choosing an alternative engine is a premium entitlement.
pub fn effective_engine(profile: &ParticipantProfile) -> &str {
    match profile.tier {
        AccountTier::Premium if !profile.engine.is_empty() => &profile.engine,
        _ => DEFAULT_ENGINE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegenerateOutcome {
    /// All three variants were cached; they were rotated in place.
    Rotated,
    /// A new request went out; completion arrives through the store.
    Requested,
    /// The message already has a request in flight; nothing was done.
    InFlight,
    /// The external call failed; the message was reset so a retry starts
    /// clean.
    Reset,
}

/// Drives the per-message translation lifecycle: regeneration with variant
/// rotation, removal, and the serialization that keeps concurrent taps on
/// the same message from interleaving.
pub struct TranslationFlow {
    store: Arc<dyn Store>,
    service: Arc<dyn TranslationService>,
    settings: CoreSettings,
    inflight: Mutex<HashSet<MessageId>>,
}

impl TranslationFlow {
    pub fn new(
        store: Arc<dyn Store>,
        service: Arc<dyn TranslationService>,
        settings: CoreSettings,
    ) -> Self {
        Self {
            store,
            service,
            settings,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Regenerate the translation of one pairwise message. With all three
    /// variants cached this rotates them without an external call; the
    /// rotation is stretched to a minimum duration so repeated taps read
    /// as distinct changes. Otherwise a multi-variant request goes out and
    /// the message is marked translating until the service writes back.
    pub async fn regenerate_direct(
        &self,
        scope: ChatScope,
        key: &ConversationKey,
        message_id: &MessageId,
        requester: &ParticipantProfile,
        target_language: &str,
    ) -> Result<RegenerateOutcome, CoreError> {
        let Some(_guard) = self.claim(message_id) else {
            return Ok(RegenerateOutcome::InFlight);
        };
        let message_path = paths::pairwise_messages(scope, key).child(message_id.as_str());
        let message = self.load_direct(&message_path, message_id).await?;
        require_sender(&message.sender_id, requester)?;
        if message.translation_state == TranslationState::Translating {
            return Ok(RegenerateOutcome::InFlight);
        }

        if message.has_all_variants() {
            self.rotate_variants(&message_path, &message).await?;
            return Ok(RegenerateOutcome::Rotated);
        }

        self.store
            .write(
                &message_path.child("translation_state"),
                json!(TranslationState::Translating),
            )
            .await?;

        let source_language = if message.sender_language.is_empty() {
            requester.language.clone()
        } else {
            message.sender_language.clone()
        };
        let request = TranslationRequest {
            text: message.text.clone(),
            source_language,
            target_language: target_language.to_string(),
            mode: message.mode,
            engine: effective_engine(requester).to_string(),
            variants: VariantCount::Multiple,
            target: TranslationTarget::Pairwise {
                scope,
                conversation_key: key.clone(),
                message_id: message_id.clone(),
            },
            requested_by: requester.user_id.clone(),
            context: None,
        };
        match self.service.translate(request).await {
            Ok(()) => {
                debug!(message_id = %message_id, "translation: regeneration requested");
                Ok(RegenerateOutcome::Requested)
            }
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "translation: request failed, resetting");
                self.store
                    .write(
                        &message_path.child("translation_state"),
                        json!(TranslationState::None),
                    )
                    .await?;
                Ok(RegenerateOutcome::Reset)
            }
        }
    }

    /// Shift every variant one slot forward in a single atomic write, then
    /// hold until the minimum rotation duration has passed.
    async fn rotate_variants(
        &self,
        message_path: &StorePath,
        message: &DirectMessage,
    ) -> Result<(), CoreError> {
        let started = Instant::now();
        let take = |slot: VariantSlot| {
            message
                .variant(slot)
                .map(|text| Value::String(text.to_string()))
                .unwrap_or(Value::Null)
        };
        let mut rotated = HashMap::new();
        rotated.insert(VariantSlot::One.key().to_string(), take(VariantSlot::Two));
        rotated.insert(VariantSlot::Two.key().to_string(), take(VariantSlot::Three));
        rotated.insert(VariantSlot::Three.key().to_string(), take(VariantSlot::One));
        self.store
            .update(&message_path.child("translations"), rotated)
            .await?;

        let minimum = self.settings.min_rotation_duration();
        let elapsed = started.elapsed();
        if elapsed < minimum {
            sleep(minimum - elapsed).await;
        }
        Ok(())
    }

    /// Drop a pairwise message's translated content. State and variants go
    /// in one atomic update, so no reader sees removed state with variants
    /// still attached. Idempotent.
    pub async fn remove_direct(
        &self,
        scope: ChatScope,
        key: &ConversationKey,
        message_id: &MessageId,
        requester: &ParticipantProfile,
    ) -> Result<(), CoreError> {
        let Some(_guard) = self.claim(message_id) else {
            debug!(message_id = %message_id, "translation: removal skipped, change in progress");
            return Ok(());
        };
        let message_path = paths::pairwise_messages(scope, key).child(message_id.as_str());
        let message = self.load_direct(&message_path, message_id).await?;
        require_sender(&message.sender_id, requester)?;
        if message.translation_state == TranslationState::Removed {
            return Ok(());
        }

        let mut children = HashMap::new();
        children.insert(
            "translation_state".to_string(),
            json!(TranslationState::Removed),
        );
        children.insert("translations".to_string(), Value::Null);
        self.store.update(&message_path, children).await?;
        debug!(message_id = %message_id, "translation: removed");
        Ok(())
    }

    /// Request a fresh phrasing of a group message for one member's
    /// language. Any member may regenerate toward their own language.
    pub async fn regenerate_group(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        requester: &ParticipantProfile,
    ) -> Result<RegenerateOutcome, CoreError> {
        let Some(_guard) = self.claim(message_id) else {
            return Ok(RegenerateOutcome::InFlight);
        };
        let message_path = paths::group_messages(group_id).child(message_id.as_str());
        let snapshot = self.store.read_once(&message_path).await?;
        let Some(message) = decode::<GroupMessage>(&snapshot)? else {
            return Err(CoreError::not_found(format!("group message {message_id}")));
        };

        let request = TranslationRequest {
            text: message.text.clone(),
            source_language: message.sender_language.clone(),
            target_language: requester.language.clone(),
            mode: Default::default(),
            engine: effective_engine(requester).to_string(),
            variants: VariantCount::Single,
            target: TranslationTarget::Group {
                group_id: group_id.clone(),
                message_id: message_id.clone(),
            },
            requested_by: requester.user_id.clone(),
            context: None,
        };
        match self.service.translate(request).await {
            Ok(()) => Ok(RegenerateOutcome::Requested),
            Err(err) => {
                warn!(message_id = %message_id, error = %err, "translation: group request failed");
                Ok(RegenerateOutcome::Reset)
            }
        }
    }

    /// Clear a group message's cached variants. Only the original sender
    /// may remove; readers fall back to the untranslated text.
    pub async fn remove_group(
        &self,
        group_id: &GroupId,
        message_id: &MessageId,
        requester: &ParticipantProfile,
    ) -> Result<(), CoreError> {
        let Some(_guard) = self.claim(message_id) else {
            debug!(message_id = %message_id, "translation: group removal skipped, change in progress");
            return Ok(());
        };
        let message_path = paths::group_messages(group_id).child(message_id.as_str());
        let snapshot = self.store.read_once(&message_path).await?;
        let Some(message) = decode::<GroupMessage>(&snapshot)? else {
            return Err(CoreError::not_found(format!("group message {message_id}")));
        };
        require_sender(&message.sender_id, requester)?;

        let mut children = HashMap::new();
        children.insert("translations".to_string(), Value::Null);
        self.store.update(&message_path, children).await?;
        Ok(())
    }

    async fn load_direct(
        &self,
        message_path: &StorePath,
        message_id: &MessageId,
    ) -> Result<DirectMessage, CoreError> {
        let snapshot = self.store.read_once(message_path).await?;
        decode::<DirectMessage>(&snapshot)?
            .ok_or_else(|| CoreError::not_found(format!("message {message_id}")))
    }

    fn claim(&self, message_id: &MessageId) -> Option<InflightGuard<'_>> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !inflight.insert(message_id.clone()) {
            return None;
        }
        Some(InflightGuard {
            set: &self.inflight,
            message_id: message_id.clone(),
        })
    }
}

fn require_sender(sender_id: &UserId, requester: &ParticipantProfile) -> Result<(), CoreError> {
    if *sender_id != requester.user_id {
        return Err(CoreError::validation(
            "only the sender may change a message's translation",
        ));
    }
    Ok(())
}

/// Releases the in-flight claim when the operation finishes, including on
/// early error returns.
struct InflightGuard<'a> {
    set: &'a Mutex<HashSet<MessageId>>,
    message_id: MessageId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = match self.set.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inflight.remove(&self.message_id);
    }
}
