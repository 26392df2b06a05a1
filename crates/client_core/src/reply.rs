use std::sync::Mutex;

use shared::domain::{DirectMessage, GroupMessage, MessageId, ReplyRef, UserId};
use tracing::warn;

const SNIPPET_MAX_CHARS: usize = 50;
const SNIPPET_KEEP_CHARS: usize = 47;

/// Reply target for the next message; consumed by the send or cancelled.
#[derive(Default)]
pub struct ReplyComposer {
    pending: Mutex<Option<ReplyRef>>,
}

impl ReplyComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&self, target_message_id: MessageId, target_sender_id: UserId, text: &str) {
        let reply = ReplyRef {
            target_message_id,
            target_sender_id,
            snippet: snippet_of(text),
        };
        *self.lock() = Some(reply);
    }

    pub fn select_message(&self, message: &DirectMessage) {
        self.select(
            message.message_id.clone(),
            message.sender_id.clone(),
            &message.text,
        );
    }

    pub fn select_group_message(&self, message: &GroupMessage) {
        self.select(
            message.message_id.clone(),
            message.sender_id.clone(),
            &message.text,
        );
    }

    pub fn cancel(&self) {
        *self.lock() = None;
    }

    pub fn pending(&self) -> Option<ReplyRef> {
        self.lock().clone()
    }

    pub fn take(&self) -> Option<ReplyRef> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<ReplyRef>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("reply: composer lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Truncation happens on a character boundary so multi-byte scripts
/// never split.
pub fn snippet_of(text: &str) -> String {
    if text.chars().count() <= SNIPPET_MAX_CHARS {
        return text.to_string();
    }
    let kept: String = text.chars().take(SNIPPET_KEEP_CHARS).collect();
    format!("{kept}...")
}

/// How a reply reference renders against the currently loaded window.
#[derive(Debug, PartialEq)]
pub enum ReplyResolution<'a> {
    Loaded(&'a DirectMessage),
    /// Target is outside the window; fall back to the cached snippet.
    SnippetOnly(&'a str),
}

pub fn resolve<'a>(reply: &'a ReplyRef, window: &'a [DirectMessage]) -> ReplyResolution<'a> {
    window
        .iter()
        .find(|message| message.message_id == reply.target_message_id)
        .map(ReplyResolution::Loaded)
        .unwrap_or(ReplyResolution::SnippetOnly(&reply.snippet))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str, text: &str) -> DirectMessage {
        DirectMessage {
            message_id: MessageId::from(id),
            sender_id: UserId::from("u1"),
            sender_language: "English".into(),
            text: text.into(),
            created_at: 1,
            mode: Default::default(),
            translation_state: Default::default(),
            translations: Default::default(),
            reply: None,
            is_session_end: false,
        }
    }

    #[test]
    fn take_consumes_the_selection() {
        let composer = ReplyComposer::new();
        composer.select_message(&message("m1", "hello there"));
        assert!(composer.pending().is_some());
        assert!(composer.take().is_some());
        assert!(composer.take().is_none());
    }

    #[test]
    fn cancel_clears_the_selection() {
        let composer = ReplyComposer::new();
        composer.select_message(&message("m1", "hello"));
        composer.cancel();
        assert!(composer.pending().is_none());
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let long: String = "я".repeat(100);
        let snippet = snippet_of(&long);
        assert_eq!(snippet.chars().count(), SNIPPET_MAX_CHARS);
        assert!(snippet.ends_with("..."));
        assert!(snippet.starts_with('я'));

        assert_eq!(snippet_of("short"), "short");
        let exactly_fifty: String = "a".repeat(SNIPPET_MAX_CHARS);
        assert_eq!(snippet_of(&exactly_fifty), exactly_fifty);
    }

    #[test]
    fn resolve_prefers_loaded_target_and_falls_back_to_snippet() {
        let target = message("m1", "original text");
        let reply = ReplyRef {
            target_message_id: MessageId::from("m1"),
            target_sender_id: UserId::from("u1"),
            snippet: snippet_of("original text"),
        };

        let window = vec![target.clone(), message("m2", "later")];
        assert_eq!(resolve(&reply, &window), ReplyResolution::Loaded(&target));

        let without_target = vec![message("m2", "later")];
        assert_eq!(
            resolve(&reply, &without_target),
            ReplyResolution::SnippetOnly("original text")
        );
    }
}
