use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use shared::domain::{
    ConnectionRequest, ParticipantProfile, RequestId, RequestStatus, UserId,
};
use shared::error::CoreError;
use tracing::{info, warn};
use uuid::Uuid;

use store::{decode, Store, StoreError, StoreSubscription};

use crate::config::CoreSettings;
use crate::identity::pair_key;
use crate::paths;
use crate::registry::ActiveSessionRegistry;

/// Creates and resolves the handshake records that gate ephemeral
/// sessions. Status transitions are one-way: pending resolves once into a
/// terminal status and never leaves it.
pub struct ConnectionRequestCoordinator {
    store: Arc<dyn Store>,
    registry: Arc<ActiveSessionRegistry>,
    settings: CoreSettings,
    accepts: AcceptanceTracker,
}

impl ConnectionRequestCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ActiveSessionRegistry>,
        settings: CoreSettings,
    ) -> Self {
        let accepts = AcceptanceTracker::new(settings.accept_freshness_millis);
        Self {
            store,
            registry,
            settings,
            accepts,
        }
    }

    /// Send a connection request to another participant. Rejected while a
    /// session for the same pair is already live, so the receiver never
    /// sees a request it cannot act on.
    pub async fn create_request(
        &self,
        from: &ParticipantProfile,
        to_user_id: &UserId,
    ) -> Result<ConnectionRequest, CoreError> {
        if from.user_id == *to_user_id {
            return Err(CoreError::validation("cannot request a session with yourself"));
        }
        let key = pair_key(&from.user_id, to_user_id);
        if self.registry.is_active(&key).await {
            return Err(CoreError::AlreadyActive(key));
        }

        let now = Utc::now().timestamp_millis();
        let request = ConnectionRequest {
            request_id: RequestId::new(Uuid::new_v4().to_string()),
            from_user_id: from.user_id.clone(),
            to_user_id: to_user_id.clone(),
            conversation_key: key,
            status: RequestStatus::Pending,
            created_at: now,
            expires_at: now + self.settings.request_ttl_millis,
            from_display_name: from.display_name.clone(),
            from_language: from.language.clone(),
            from_image_url: from.image_url.clone(),
        };
        let value = serde_json::to_value(&request).map_err(StoreError::from)?;
        self.store
            .write(&paths::connection_request(&request.request_id), value)
            .await?;
        info!(request_id = %request.request_id, to = %to_user_id, "connection: request created");
        Ok(request)
    }

    /// Withdraw a pending request. Best effort: racing an acceptance or a
    /// repeat cancel is a no-op, and store failures are logged rather than
    /// surfaced since the request expires on its own anyway.
    pub async fn cancel_request(&self, request_id: &RequestId) {
        match self.transition(request_id, RequestStatus::Cancelled).await {
            Ok(true) => info!(request_id = %request_id, "connection: request cancelled"),
            Ok(false) => {}
            Err(err) => {
                warn!(request_id = %request_id, error = %err, "connection: cancel failed")
            }
        }
    }

    pub async fn accept_request(&self, request_id: &RequestId) -> Result<(), CoreError> {
        if !self.transition(request_id, RequestStatus::Accepted).await? {
            return Err(CoreError::validation("request is no longer pending"));
        }
        info!(request_id = %request_id, "connection: request accepted");
        Ok(())
    }

    pub async fn reject_request(&self, request_id: &RequestId) -> Result<(), CoreError> {
        if !self.transition(request_id, RequestStatus::Rejected).await? {
            return Err(CoreError::validation("request is no longer pending"));
        }
        info!(request_id = %request_id, "connection: request rejected");
        Ok(())
    }

    pub async fn time_out_request(&self, request_id: &RequestId) {
        if let Err(err) = self.transition(request_id, RequestStatus::Timeout).await {
            warn!(request_id = %request_id, error = %err, "connection: timeout write failed");
        }
    }

    /// Move a pending request into `next`. Returns false when the request
    /// is missing or already terminal.
    async fn transition(
        &self,
        request_id: &RequestId,
        next: RequestStatus,
    ) -> Result<bool, CoreError> {
        let path = paths::connection_request(request_id);
        let snapshot = self.store.read_once(&path).await?;
        let Some(request) = decode::<ConnectionRequest>(&snapshot)? else {
            return Ok(false);
        };
        if request.status.is_terminal() {
            return Ok(false);
        }
        let value = serde_json::to_value(next).map_err(StoreError::from)?;
        self.store.write(&path.child("status"), value).await?;
        Ok(true)
    }

    /// Watch one request resolve. The observation dedups repeated
    /// snapshots and closes itself after the first terminal status.
    pub async fn observe_request(&self, request_id: &RequestId) -> RequestObservation {
        let subscription = self
            .store
            .subscribe(&paths::connection_request(request_id))
            .await;
        RequestObservation {
            subscription,
            last: None,
            done: false,
        }
    }

    /// How long the UI should keep a resolved request's notice on screen.
    pub fn auto_dismiss_delay(&self, status: RequestStatus) -> Option<std::time::Duration> {
        self.settings.dismiss_delay(status)
    }

    /// Whether a just-observed acceptance should open a session. True at
    /// most once per request, and only while the acceptance is fresh.
    pub fn should_open_session(&self, request: &ConnectionRequest) -> bool {
        self.accepts
            .should_open(request, Utc::now().timestamp_millis())
    }

    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Drop acceptance tracking for requests whose records are gone from
    /// the store, so the set does not grow for the life of the client.
    pub(crate) fn forget_missing(&self, live: impl Fn(&RequestId) -> bool) {
        self.accepts.retain(live);
    }
}

/// Stream of effective status changes for one request.
pub struct RequestObservation {
    subscription: StoreSubscription,
    last: Option<RequestStatus>,
    done: bool,
}

impl RequestObservation {
    /// Next status change, or `None` once the request has resolved (or the
    /// record disappeared). Malformed snapshots are skipped with a log.
    pub async fn next(&mut self) -> Option<RequestStatus> {
        if self.done {
            return None;
        }
        while let Some(snapshot) = self.subscription.recv().await {
            let request = match decode::<ConnectionRequest>(&snapshot) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "connection: skipping malformed request snapshot");
                    continue;
                }
            };
            let status = request.effective_status(Utc::now().timestamp_millis());
            if self.last == Some(status) {
                continue;
            }
            self.last = Some(status);
            if status.is_terminal() {
                self.done = true;
            }
            return Some(status);
        }
        self.done = true;
        None
    }
}

/// Remembers which acceptances this client has already acted on, so a
/// replayed or re-delivered acceptance never opens a second session.
struct AcceptanceTracker {
    handled: Mutex<HashSet<RequestId>>,
    freshness_millis: i64,
}

impl AcceptanceTracker {
    fn new(freshness_millis: i64) -> Self {
        Self {
            handled: Mutex::new(HashSet::new()),
            freshness_millis,
        }
    }

    fn should_open(&self, request: &ConnectionRequest, now_millis: i64) -> bool {
        if request.status != RequestStatus::Accepted {
            return false;
        }
        if now_millis - request.created_at > self.freshness_millis {
            return false;
        }
        let mut handled = match self.handled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handled.insert(request.request_id.clone())
    }

    fn retain(&self, live: impl Fn(&RequestId) -> bool) {
        let mut handled = match self.handled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        handled.retain(|id| live(id));
    }
}
