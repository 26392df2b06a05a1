use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);
id_newtype!(RequestId);
id_newtype!(GroupId);

/// Deterministic identifier for a pairwise conversation. The same unordered
/// pair of participants always resolves to the same key, so the key names a
/// conversation log that is reused across episodes, not a single episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(pub String);

impl ConversationKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountTier {
    #[default]
    Free,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormalityMode {
    Formal,
    #[default]
    Casual,
}

/// Lifecycle of one message's translated content. `None` is an explicit
/// variant: "no translation attempted / reset after failure", never a null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationState {
    #[default]
    None,
    Translating,
    Ready,
    Removed,
}

/// One of the fixed cached phrasings for a pairwise message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSlot {
    One,
    Two,
    Three,
}

impl VariantSlot {
    pub const ALL: [VariantSlot; 3] = [VariantSlot::One, VariantSlot::Two, VariantSlot::Three];

    pub fn key(self) -> &'static str {
        match self {
            VariantSlot::One => "translation1",
            VariantSlot::Two => "translation2",
            VariantSlot::Three => "translation3",
        }
    }
}

/// Lightweight reference attached to a message that replies to another.
/// The snippet is cached at send time so the reply stays renderable even
/// when the target message is outside the loaded window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub target_message_id: MessageId,
    pub target_sender_id: UserId,
    pub snippet: String,
}

/// A message in a pairwise conversation (direct chat or ephemeral connect
/// session). Variants live in slot keys `translation1..translation3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_language: String,
    #[serde(default)]
    pub text: String,
    pub created_at: i64,
    #[serde(default)]
    pub mode: FormalityMode,
    #[serde(default)]
    pub translation_state: TranslationState,
    #[serde(default)]
    pub translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
    #[serde(default)]
    pub is_session_end: bool,
}

impl DirectMessage {
    pub fn variant(&self, slot: VariantSlot) -> Option<&str> {
        self.translations
            .get(slot.key())
            .map(String::as_str)
            .filter(|text| !text.is_empty())
    }

    pub fn has_all_variants(&self) -> bool {
        VariantSlot::ALL.iter().all(|slot| self.variant(*slot).is_some())
    }
}

/// A message in a group conversation. Variants are keyed by target
/// language instead of slots, one phrasing per language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub sender_language: String,
    #[serde(default)]
    pub text: String,
    pub created_at: i64,
    #[serde(default)]
    pub translations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Accepted,
    Rejected,
    Timeout,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// Handshake record gating creation of an ephemeral session. Pending is the
/// sole initial state; every other status is terminal and one-way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub request_id: RequestId,
    pub from_user_id: UserId,
    pub to_user_id: UserId,
    pub conversation_key: ConversationKey,
    pub status: RequestStatus,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default)]
    pub from_display_name: String,
    #[serde(default)]
    pub from_language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_image_url: Option<String>,
}

impl ConnectionRequest {
    /// Status as the observer should report it: a pending request past its
    /// expiry stamp reads as expired. Expiry is driven elsewhere; here it
    /// is only observed.
    pub fn effective_status(&self, now_millis: i64) -> RequestStatus {
        if self.status == RequestStatus::Pending && now_millis > self.expires_at {
            RequestStatus::Expired
        } else {
            self.status
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipState {
    Absent,
    Member,
    Admin,
}

/// Group conversation record. `members` maps participant id to the admin
/// flag; the store does not enforce any admin invariant, the action layer
/// does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group_id: GroupId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_by: UserId,
    #[serde(default)]
    pub members: BTreeMap<String, bool>,
}

impl GroupRecord {
    pub fn membership_of(&self, user_id: &UserId) -> MembershipState {
        match self.members.get(user_id.as_str()) {
            Some(true) => MembershipState::Admin,
            Some(false) => MembershipState::Member,
            None => MembershipState::Absent,
        }
    }

    pub fn is_admin(&self, user_id: &UserId) -> bool {
        self.membership_of(user_id) == MembershipState::Admin
    }

    pub fn admin_count_excluding(&self, user_id: &UserId) -> usize {
        self.members
            .iter()
            .filter(|(member_id, is_admin)| **is_admin && member_id.as_str() != user_id.as_str())
            .count()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}

/// Read-only snapshot of a participant's account attributes. Provisioned
/// outside this core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantProfile {
    pub user_id: UserId,
    pub display_name: String,
    pub language: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub tier: AccountTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}
