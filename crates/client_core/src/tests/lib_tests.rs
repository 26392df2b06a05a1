use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::domain::{
    ConnectionRequest, ConversationKey, ParticipantProfile, RequestId, RequestStatus,
    UserId,
};
use shared::error::CoreError;
use store::{decode, MemoryStore, Store};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::support::{profile, PendingTranslationService};
use crate::{paths, ChatClient, CoreEvent, CoreSettings};

fn client_for(local: ParticipantProfile, store: &Arc<MemoryStore>) -> Arc<ChatClient> {
    ChatClient::new_with_dependencies(
        Arc::clone(store) as Arc<dyn Store>,
        Arc::new(PendingTranslationService::default()),
        CoreSettings::default(),
        local,
    )
}

async fn next_event(rx: &mut broadcast::Receiver<CoreEvent>) -> CoreEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("event within deadline")
        .expect("event channel open")
}

#[tokio::test]
async fn created_request_is_pending_with_ttl_and_pair_key() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create request");

    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.expires_at - request.created_at, 300_000);
    assert_eq!(request.conversation_key.as_str(), "alice_bob");

    let snapshot = store
        .read_once(&paths::connection_request(&request.request_id))
        .await
        .expect("read");
    let stored: ConnectionRequest = decode(&snapshot).expect("decode").expect("present");
    assert_eq!(stored, request);
}

#[tokio::test]
async fn self_request_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let result = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("alice"))
        .await;
    assert!(matches!(result, Err(CoreError::Validation(_))));
}

#[tokio::test]
async fn request_blocked_while_session_for_pair_is_live() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);

    let session = alice
        .open_session(profile("bob", "Spanish"))
        .await
        .expect("open session");

    let blocked = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await;
    assert!(matches!(blocked, Err(CoreError::AlreadyActive(_))));

    session.close().await;
    alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create after close");
}

#[tokio::test]
async fn terminal_status_never_transitions_again() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let bob = client_for(profile("bob", "Spanish"), &store);

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create");

    bob.connections()
        .accept_request(&request.request_id)
        .await
        .expect("accept");

    // Cancel after acceptance is a silent no-op.
    alice.connections().cancel_request(&request.request_id).await;

    let snapshot = store
        .read_once(&paths::connection_request(&request.request_id))
        .await
        .expect("read");
    let stored: ConnectionRequest = decode(&snapshot).expect("decode").expect("present");
    assert_eq!(stored.status, RequestStatus::Accepted);

    // A second explicit resolution reports the conflict.
    assert!(matches!(
        bob.connections().reject_request(&request.request_id).await,
        Err(CoreError::Validation(_))
    ));
}

#[tokio::test]
async fn observation_dedups_and_closes_after_terminal() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let bob = client_for(profile("bob", "Spanish"), &store);

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create");

    let mut observation = alice.connections().observe_request(&request.request_id).await;
    assert_eq!(observation.next().await, Some(RequestStatus::Pending));

    // Redundant write of the same status must not produce a change.
    store
        .write(
            &paths::connection_request(&request.request_id).child("status"),
            serde_json::json!(RequestStatus::Pending),
        )
        .await
        .expect("rewrite");
    bob.connections()
        .accept_request(&request.request_id)
        .await
        .expect("accept");

    assert_eq!(observation.next().await, Some(RequestStatus::Accepted));
    assert_eq!(observation.next().await, None);
}

#[tokio::test]
async fn watcher_routes_incoming_acceptance_and_opens_once() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let bob = client_for(profile("bob", "Spanish"), &store);

    alice.start_request_watcher().await;
    bob.start_request_watcher().await;
    let mut alice_events = alice.subscribe();
    let mut bob_events = bob.subscribe();

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create");

    match next_event(&mut bob_events).await {
        CoreEvent::IncomingRequest(incoming) => {
            assert_eq!(incoming.request_id, request.request_id)
        }
        other => panic!("expected incoming request, got {other:?}"),
    }

    bob.connections()
        .accept_request(&request.request_id)
        .await
        .expect("accept");

    match next_event(&mut alice_events).await {
        CoreEvent::RequestResolved { status, .. } => {
            assert_eq!(status, RequestStatus::Accepted)
        }
        other => panic!("expected resolution, got {other:?}"),
    }
    match next_event(&mut alice_events).await {
        CoreEvent::SessionReady(ready) => assert_eq!(ready.request_id, request.request_id),
        other => panic!("expected session ready, got {other:?}"),
    }

    // Re-delivery of the same acceptance never re-opens.
    store
        .write(
            &paths::connection_request(&request.request_id).child("status"),
            serde_json::json!(RequestStatus::Accepted),
        )
        .await
        .expect("rewrite");
    assert!(
        timeout(Duration::from_millis(200), alice_events.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn stale_acceptance_resolves_without_opening() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now().timestamp_millis();
    let request = ConnectionRequest {
        request_id: RequestId::from("r-stale"),
        from_user_id: UserId::from("alice"),
        to_user_id: UserId::from("bob"),
        conversation_key: ConversationKey("alice_bob".into()),
        status: RequestStatus::Accepted,
        created_at: now - 60_000,
        expires_at: now + 240_000,
        from_display_name: "alice".into(),
        from_language: "English".into(),
        from_image_url: None,
    };
    store
        .write(
            &paths::connection_request(&request.request_id),
            serde_json::to_value(&request).expect("serialize"),
        )
        .await
        .expect("seed");

    let alice = client_for(profile("alice", "English"), &store);
    alice.start_request_watcher().await;
    let mut events = alice.subscribe();

    match next_event(&mut events).await {
        CoreEvent::RequestResolved { status, .. } => {
            assert_eq!(status, RequestStatus::Accepted)
        }
        other => panic!("expected resolution, got {other:?}"),
    }
    assert!(timeout(Duration::from_millis(200), events.recv()).await.is_err());
}

#[tokio::test]
async fn removed_request_records_free_their_tracking_state() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let bob = client_for(profile("bob", "Spanish"), &store);
    bob.start_request_watcher().await;
    let mut bob_events = bob.subscribe();

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create");
    match next_event(&mut bob_events).await {
        CoreEvent::IncomingRequest(incoming) => {
            assert_eq!(incoming.request_id, request.request_id)
        }
        other => panic!("expected incoming request, got {other:?}"),
    }

    // The record is cleaned up, then a record reusing the id appears. With
    // the tracking state pruned on removal this reads as a new request.
    store
        .remove(&paths::connection_request(&request.request_id))
        .await
        .expect("remove");
    store
        .write(
            &paths::connection_request(&request.request_id),
            serde_json::to_value(&request).expect("serialize"),
        )
        .await
        .expect("rewrite");

    match next_event(&mut bob_events).await {
        CoreEvent::IncomingRequest(incoming) => {
            assert_eq!(incoming.request_id, request.request_id)
        }
        other => panic!("expected a fresh incoming request, got {other:?}"),
    }
}

#[tokio::test]
async fn accept_and_open_claims_the_conversation_key() {
    let store = Arc::new(MemoryStore::new());
    let alice = client_for(profile("alice", "English"), &store);
    let bob = client_for(profile("bob", "Spanish"), &store);

    let request = alice
        .connections()
        .create_request(alice.local_profile(), &UserId::from("bob"))
        .await
        .expect("create");

    let session = bob.accept_and_open(&request).await.expect("accept and open");
    assert_eq!(session.key().as_str(), "alice_bob");
    assert!(bob.registry().is_active(session.key()).await);

    session.close().await;
    assert!(!bob.registry().is_active(&ConversationKey("alice_bob".into())).await);
}
