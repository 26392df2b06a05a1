use shared::domain::{ConversationKey, UserId};

/// Deterministic key for the conversation between two participants. The
/// pair is unordered: both sides derive the identical key without any
/// coordination, and the key survives across session episodes.
pub fn pair_key(a: &UserId, b: &UserId) -> ConversationKey {
    let (first, second) = if a.as_str() <= b.as_str() {
        (a, b)
    } else {
        (b, a)
    };
    ConversationKey(format!("{}_{}", first.as_str(), second.as_str()))
}
