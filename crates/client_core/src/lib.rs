//! Coordination core for translation-augmented messaging.
//!
//! Everything here coordinates against the shared hierarchical store:
//! handshakes gate ephemeral sessions, sessions window a reused pairwise
//! log, and the translation lifecycle of each message is driven through
//! store state that both sides observe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use shared::domain::{
    ConnectionRequest, ParticipantProfile, RequestId, RequestStatus, UserId,
};
use shared::error::CoreError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use store::{decode, MemoryStore, Store, StoreSubscription};
use translation::{MissingTranslationService, TranslationService};

pub mod config;
pub mod connection;
pub mod identity;
pub mod membership;
pub mod paths;
pub mod registry;
pub mod reply;
pub mod session;
pub mod translation_flow;

pub use config::CoreSettings;
pub use connection::{ConnectionRequestCoordinator, RequestObservation};
pub use membership::{LeaveOutcome, MembershipGuard, MembershipWatch};
pub use registry::ActiveSessionRegistry;
pub use reply::{resolve, snippet_of, ReplyComposer, ReplyResolution};
pub use session::{SessionEvent, SessionHandle};
pub use translation_flow::{effective_engine, RegenerateOutcome, TranslationFlow, DEFAULT_ENGINE};

/// Client-wide notifications from the request watcher.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    IncomingRequest(ConnectionRequest),
    /// A watched request reached a terminal status. Dismissal timing comes
    /// from `CoreSettings::dismiss_delay`.
    RequestResolved {
        request_id: RequestId,
        status: RequestStatus,
    },
    /// An outgoing request was accepted while still fresh; the caller
    /// should open the session. Emitted at most once per request.
    SessionReady(ConnectionRequest),
}

/// Entry point tying the coordinators together for one signed-in user.
pub struct ChatClient {
    store: Arc<dyn Store>,
    translator: Arc<dyn TranslationService>,
    settings: CoreSettings,
    registry: Arc<ActiveSessionRegistry>,
    connections: ConnectionRequestCoordinator,
    translations: TranslationFlow,
    membership: MembershipGuard,
    local: ParticipantProfile,
    events: broadcast::Sender<CoreEvent>,
    request_watcher: Mutex<Option<JoinHandle<()>>>,
    // Handed to spawned watcher tasks so they never keep the client alive.
    weak_self: Weak<ChatClient>,
}

impl ChatClient {
    /// Client over an in-memory store with no translation service wired.
    /// Sends still work; translation requests fail and reset.
    pub fn new(local: ParticipantProfile) -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(MemoryStore::new()),
            Arc::new(MissingTranslationService),
            CoreSettings::load(),
            local,
        )
    }

    pub fn new_with_dependencies(
        store: Arc<dyn Store>,
        translator: Arc<dyn TranslationService>,
        settings: CoreSettings,
        local: ParticipantProfile,
    ) -> Arc<Self> {
        let registry = Arc::new(ActiveSessionRegistry::new());
        let connections = ConnectionRequestCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            settings.clone(),
        );
        let translations =
            TranslationFlow::new(Arc::clone(&store), Arc::clone(&translator), settings.clone());
        let membership = MembershipGuard::new(Arc::clone(&store));
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak_self| Self {
            store,
            translator,
            settings,
            registry,
            connections,
            translations,
            membership,
            local,
            events,
            request_watcher: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn connections(&self) -> &ConnectionRequestCoordinator {
        &self.connections
    }

    pub fn translations(&self) -> &TranslationFlow {
        &self.translations
    }

    pub fn membership(&self) -> &MembershipGuard {
        &self.membership
    }

    pub fn registry(&self) -> &Arc<ActiveSessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    pub fn local_profile(&self) -> &ParticipantProfile {
        &self.local
    }

    pub async fn load_profile(&self, user_id: &UserId) -> Result<ParticipantProfile, CoreError> {
        let snapshot = self.store.read_once(&paths::user_profile(user_id)).await?;
        decode::<ParticipantProfile>(&snapshot)?
            .ok_or_else(|| CoreError::not_found(format!("user {user_id}")))
    }

    /// Open an ephemeral session with `remote`, starting its window now.
    pub async fn open_session(
        &self,
        remote: ParticipantProfile,
    ) -> Result<Arc<SessionHandle>, CoreError> {
        SessionHandle::open(
            Arc::clone(&self.store),
            Arc::clone(&self.translator),
            Arc::clone(&self.registry),
            self.settings.clone(),
            self.local.clone(),
            remote,
            Utc::now().timestamp_millis(),
        )
        .await
    }

    /// Accept an incoming request and open the session it asked for. The
    /// requester's stored profile is preferred; the snapshot carried on
    /// the request covers a profile that cannot be read back.
    pub async fn accept_and_open(
        &self,
        request: &ConnectionRequest,
    ) -> Result<Arc<SessionHandle>, CoreError> {
        self.connections.accept_request(&request.request_id).await?;
        let remote = match self.load_profile(&request.from_user_id).await {
            Ok(profile) => profile,
            Err(CoreError::NotFound(_)) => ParticipantProfile {
                user_id: request.from_user_id.clone(),
                display_name: request.from_display_name.clone(),
                language: request.from_language.clone(),
                engine: String::new(),
                tier: Default::default(),
                image_url: request.from_image_url.clone(),
            },
            Err(err) => return Err(err),
        };
        self.open_session(remote).await
    }

    /// Start watching the request tree for this user. Incoming pending
    /// requests, terminal transitions, and fresh acceptances of our own
    /// requests surface as [`CoreEvent`]s. A second start replaces the
    /// first watcher.
    pub async fn start_request_watcher(&self) {
        let subscription = self.store.subscribe(&paths::connection_requests()).await;
        let task = tokio::spawn(Self::watch_requests(self.weak_self.clone(), subscription));
        let previous = lock(&self.request_watcher).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!(user = %self.local.user_id, "client: request watcher started");
    }

    pub fn stop_request_watcher(&self) {
        if let Some(task) = lock(&self.request_watcher).take() {
            task.abort();
        }
    }

    async fn watch_requests(weak: Weak<ChatClient>, mut subscription: StoreSubscription) {
        let mut seen: HashMap<RequestId, RequestStatus> = HashMap::new();
        while let Some(snapshot) = subscription.recv().await {
            let Some(client) = weak.upgrade() else { break };
            let Some(children) = snapshot.as_object() else { continue };
            let now = Utc::now().timestamp_millis();
            for child in children.values() {
                let request = match decode::<ConnectionRequest>(child) {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(error = %err, "client: skipping malformed request");
                        continue;
                    }
                };
                client.dispatch_request(&request, now, &mut seen);
            }
            // Records deleted from the store free their tracking state, so
            // neither map grows for the life of the client and a later
            // record reusing an id is treated as new.
            seen.retain(|id, _| children.contains_key(id.as_str()));
            client
                .connections
                .forget_missing(|id| children.contains_key(id.as_str()));
        }
    }

    fn dispatch_request(
        &self,
        request: &ConnectionRequest,
        now: i64,
        seen: &mut HashMap<RequestId, RequestStatus>,
    ) {
        let incoming = request.to_user_id == self.local.user_id;
        let outgoing = request.from_user_id == self.local.user_id;
        if !incoming && !outgoing {
            return;
        }
        let status = request.effective_status(now);
        let previous = seen.insert(request.request_id.clone(), status);
        if previous == Some(status) {
            return;
        }

        if incoming && status == RequestStatus::Pending {
            let _ = self.events.send(CoreEvent::IncomingRequest(request.clone()));
            return;
        }
        if status.is_terminal() {
            let _ = self.events.send(CoreEvent::RequestResolved {
                request_id: request.request_id.clone(),
                status,
            });
            if outgoing && self.connections.should_open_session(request) {
                let _ = self.events.send(CoreEvent::SessionReady(request.clone()));
            }
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.stop_request_watcher();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod lib_tests;

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod session_tests;

#[cfg(test)]
#[path = "tests/translation_tests.rs"]
mod translation_tests;

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod membership_tests;
