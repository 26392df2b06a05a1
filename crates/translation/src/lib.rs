use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use shared::domain::{ConversationKey, FormalityMode, GroupId, MessageId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantCount {
    Single,
    Multiple,
}

/// Which pairwise log a conversation key addresses: the long-lived direct
/// chat or the ephemeral connect session sharing the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatScope {
    Direct,
    Connect,
}

/// Where the service should write its results. Pairwise messages get slot
/// variants; group messages get one variant per member language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranslationTarget {
    Pairwise {
        scope: ChatScope,
        conversation_key: ConversationKey,
        message_id: MessageId,
    },
    Group {
        group_id: GroupId,
        message_id: MessageId,
    },
}

/// Bounded slice of recent conversation the service may use for
/// context-aware phrasing. `session_started_at` restricts context to the
/// current episode of a reused conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_started_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub text: String,
    pub source_language: String,
    pub target_language: String,
    pub mode: FormalityMode,
    pub engine: String,
    pub variants: VariantCount,
    pub target: TranslationTarget,
    pub requested_by: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ContextWindow>,
}

/// External translation service. Calls are fire-and-forget from the
/// core's perspective: `Ok` means the request was accepted, and the
/// service writes variants and state back into the store at the target
/// path. Completion is observed through the store subscription, never
/// through this return value.
#[async_trait]
pub trait TranslationService: Send + Sync {
    async fn translate(&self, request: TranslationRequest) -> Result<()>;
}

pub struct MissingTranslationService;

#[async_trait]
impl TranslationService for MissingTranslationService {
    async fn translate(&self, request: TranslationRequest) -> Result<()> {
        Err(anyhow!(
            "translation service unavailable (engine {})",
            request.engine
        ))
    }
}
