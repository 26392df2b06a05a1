use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use serde_json::json;
use shared::domain::{
    ConversationKey, DirectMessage, FormalityMode, MessageId, ParticipantProfile,
    TranslationState,
};
use shared::error::CoreError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use store::{decode, Store, StoreError, StoreSubscription};
use translation::{
    ChatScope, ContextWindow, TranslationRequest, TranslationService, TranslationTarget,
    VariantCount,
};

use crate::config::CoreSettings;
use crate::identity::pair_key;
use crate::paths;
use crate::registry::ActiveSessionRegistry;
use crate::reply::ReplyComposer;
use crate::translation_flow::effective_engine;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    MessagesUpdated(Vec<DirectMessage>),
    /// Emitted at most once per session.
    Ended { by_remote: bool },
}

struct SessionState {
    log: Vec<DirectMessage>,
    history_enabled: bool,
    ended: bool,
}

/// One live ephemeral session over a reused pairwise conversation log.
/// Claims its conversation key in the registry on open; only `close`
/// releases it.
pub struct SessionHandle {
    store: Arc<dyn Store>,
    translator: Arc<dyn TranslationService>,
    registry: Arc<ActiveSessionRegistry>,
    settings: CoreSettings,
    key: ConversationKey,
    local: ParticipantProfile,
    remote: ParticipantProfile,
    started_at: i64,
    formality: Mutex<FormalityMode>,
    reply: ReplyComposer,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionHandle {
    pub async fn open(
        store: Arc<dyn Store>,
        translator: Arc<dyn TranslationService>,
        registry: Arc<ActiveSessionRegistry>,
        settings: CoreSettings,
        local: ParticipantProfile,
        remote: ParticipantProfile,
        started_at: i64,
    ) -> Result<Arc<Self>, CoreError> {
        let key = pair_key(&local.user_id, &remote.user_id);
        registry.register(&key).await?;

        let (events, _) = broadcast::channel(64);
        let handle = Arc::new(Self {
            store,
            translator,
            registry,
            settings,
            key: key.clone(),
            local,
            remote,
            started_at,
            formality: Mutex::new(FormalityMode::default()),
            reply: ReplyComposer::new(),
            state: Mutex::new(SessionState {
                log: Vec::new(),
                history_enabled: false,
                ended: false,
            }),
            events,
            watch_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let subscription = handle.store.subscribe(&paths::connect_messages(&key)).await;
        let task = tokio::spawn(Self::watch(Arc::downgrade(&handle), subscription));
        *lock(&handle.watch_task) = Some(task);
        info!(key = %key, started_at, "session: opened");
        Ok(handle)
    }

    async fn watch(weak: Weak<SessionHandle>, mut subscription: StoreSubscription) {
        while let Some(snapshot) = subscription.recv().await {
            let Some(handle) = weak.upgrade() else { break };
            if handle.closed.load(Ordering::SeqCst) {
                break;
            }
            handle.apply_snapshot(&snapshot);
        }
    }

    fn apply_snapshot(&self, snapshot: &serde_json::Value) {
        let mut log = Vec::new();
        if let Some(children) = snapshot.as_object() {
            for (child_id, child) in children {
                match decode::<DirectMessage>(child) {
                    Ok(Some(message)) => log.push(message),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(key = %self.key, child_id, error = %err, "session: skipping malformed message");
                    }
                }
            }
        }
        log.sort_by(|a, b| {
            (a.created_at, &a.message_id).cmp(&(b.created_at, &b.message_id))
        });

        let (visible, remote_ended) = {
            let mut state = lock(&self.state);
            state.log = log;
            let remote_ended = !state.ended && self.find_remote_end(&state.log);
            if remote_ended {
                state.ended = true;
            }
            (self.filter_visible(&state), remote_ended)
        };
        let _ = self.events.send(SessionEvent::MessagesUpdated(visible));
        if remote_ended {
            info!(key = %self.key, "session: remote end marker detected");
            let _ = self.events.send(SessionEvent::Ended { by_remote: true });
        }
    }

    /// A marker counts only when it comes from the other side and was
    /// written for this episode. The tolerance absorbs clock skew between
    /// the marker's writer and our recorded start.
    fn find_remote_end(&self, log: &[DirectMessage]) -> bool {
        log.iter().any(|message| {
            message.is_session_end
                && message.sender_id != self.local.user_id
                && message.created_at > self.started_at - self.settings.session_end_tolerance_millis
        })
    }

    fn filter_visible(&self, state: &SessionState) -> Vec<DirectMessage> {
        state
            .log
            .iter()
            .filter(|message| state.history_enabled || message.created_at >= self.started_at)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn key(&self) -> &ConversationKey {
        &self.key
    }

    pub fn reply(&self) -> &ReplyComposer {
        &self.reply
    }

    pub fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    pub fn history_enabled(&self) -> bool {
        lock(&self.state).history_enabled
    }

    pub fn visible_messages(&self) -> Vec<DirectMessage> {
        let state = lock(&self.state);
        self.filter_visible(&state)
    }

    /// View-only toggle over the cached log; no refetch.
    pub fn set_history_enabled(&self, enabled: bool) {
        let visible = {
            let mut state = lock(&self.state);
            if state.history_enabled == enabled {
                return;
            }
            state.history_enabled = enabled;
            self.filter_visible(&state)
        };
        let _ = self.events.send(SessionEvent::MessagesUpdated(visible));
    }

    pub fn set_formality(&self, mode: FormalityMode) {
        *lock(&self.formality) = mode;
    }

    pub fn formality(&self) -> FormalityMode {
        *lock(&self.formality)
    }

    /// The message lands in translating state; a failed translation
    /// request resets it to untranslated rather than failing the send.
    pub async fn send_message(&self, text: &str) -> Result<MessageId, CoreError> {
        if self.is_ended() {
            return Err(CoreError::validation("session has ended"));
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::validation("message text is empty"));
        }

        let message_id = MessageId::new(self.store.push_id());
        let message = DirectMessage {
            message_id: message_id.clone(),
            sender_id: self.local.user_id.clone(),
            sender_language: self.local.language.clone(),
            text: text.to_string(),
            created_at: Utc::now().timestamp_millis(),
            mode: self.formality(),
            translation_state: TranslationState::Translating,
            translations: Default::default(),
            reply: self.reply.pending(),
            is_session_end: false,
        };
        let message_path = paths::connect_messages(&self.key).child(message_id.as_str());
        let value = serde_json::to_value(&message).map_err(StoreError::from)?;
        self.store.write(&message_path, value).await?;
        // Selection is consumed only once the message is durably written.
        self.reply.take();

        let request = TranslationRequest {
            text: text.to_string(),
            source_language: self.local.language.clone(),
            target_language: self.remote.language.clone(),
            mode: message.mode,
            engine: effective_engine(&self.local).to_string(),
            variants: VariantCount::Single,
            target: TranslationTarget::Pairwise {
                scope: ChatScope::Connect,
                conversation_key: self.key.clone(),
                message_id: message_id.clone(),
            },
            requested_by: self.local.user_id.clone(),
            context: Some(ContextWindow {
                depth: self.settings.context_depth,
                session_started_at: Some(self.started_at),
            }),
        };
        if let Err(err) = self.translator.translate(request).await {
            warn!(message_id = %message_id, error = %err, "session: translation request failed");
            if let Err(reset_err) = self
                .store
                .write(
                    &message_path.child("translation_state"),
                    json!(TranslationState::None),
                )
                .await
            {
                warn!(message_id = %message_id, error = %reset_err, "session: state reset failed");
            }
        }
        Ok(message_id)
    }

    /// Write the end marker, then tear down. When the remote already
    /// ended the session no second marker is written.
    pub async fn end_session(&self) -> Result<(), CoreError> {
        let already_ended = {
            let mut state = lock(&self.state);
            let previous = state.ended;
            state.ended = true;
            previous
        };
        if !already_ended {
            if let Err(err) = self.write_end_marker().await {
                // Marker never landed; undo the latch so the caller can retry.
                lock(&self.state).ended = false;
                return Err(err);
            }
            let _ = self.events.send(SessionEvent::Ended { by_remote: false });
        }
        self.close().await;
        Ok(())
    }

    async fn write_end_marker(&self) -> Result<(), CoreError> {
        let message_id = MessageId::new(self.store.push_id());
        let marker = DirectMessage {
            message_id: message_id.clone(),
            sender_id: self.local.user_id.clone(),
            sender_language: self.local.language.clone(),
            text: format!("{} left the session", self.local.display_name),
            created_at: Utc::now().timestamp_millis(),
            mode: FormalityMode::default(),
            translation_state: TranslationState::None,
            translations: Default::default(),
            reply: None,
            is_session_end: true,
        };
        let value = serde_json::to_value(&marker).map_err(StoreError::from)?;
        self.store
            .write(
                &paths::connect_messages(&self.key).child(message_id.as_str()),
                value,
            )
            .await?;
        Ok(())
    }

    /// Idempotent; after close no further events are emitted.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = lock(&self.watch_task).take() {
            task.abort();
        }
        self.registry.clear(&self.key).await;
        info!(key = %self.key, "session: closed");
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Registry release needs the async `close`; here only the watch
        // task is stopped so it does not outlive the handle.
        if let Some(task) = lock(&self.watch_task).take() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
