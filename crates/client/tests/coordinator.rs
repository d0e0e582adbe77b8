mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatwire_client::ws::transport::{ConnectBehavior, MemoryPeer, MemoryTransport};
use chatwire_client::ws::ReconnectCounter;
use chatwire_client::{
    topics, ChannelError, ChannelKind, ChannelState, Coordinator, EventBus, RealtimeConfig,
    SessionTokens,
};
use chatwire_shared::{ApiError, ProblemDetails, Recipient};
use common::*;

struct Harness {
    client: Coordinator,
    bus: Arc<EventBus>,
    tokens: SessionTokens,
    transport: MemoryTransport,
    invalidations: Arc<AtomicUsize>,
}

fn harness(api: Arc<FakeApi>) -> Harness {
    let transport = MemoryTransport::new();
    harness_with(transport, api)
}

fn harness_with(transport: MemoryTransport, api: Arc<FakeApi>) -> Harness {
    build_harness(config(), SessionTokens::new(Some("tok".into())), transport, api)
}

fn build_harness(
    config: RealtimeConfig,
    tokens: SessionTokens,
    transport: MemoryTransport,
    api: Arc<FakeApi>,
) -> Harness {
    let bus = EventBus::new();
    let invalidations = Arc::new(AtomicUsize::new(0));
    let counted = invalidations.clone();
    let client = Coordinator::builder(config, Arc::new(tokens.clone()), bus.clone())
        .transport(Arc::new(transport.clone()))
        .fallback(api)
        .on_session_invalid(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    Harness {
        client,
        bus,
        tokens,
        transport,
        invalidations,
    }
}

impl Harness {
    async fn open_both(&self) -> (MemoryPeer, MemoryPeer) {
        let messages = self.transport.next_peer(MESSAGES).await;
        let presence = self.transport.next_peer(PRESENCE).await;
        for kind in [ChannelKind::Messages, ChannelKind::Presence] {
            wait_status(self.client.channel(kind).watch(), |s| s.state == ChannelState::Open).await;
        }
        (messages, presence)
    }
}

#[tokio::test(start_paused = true)]
async fn connected_is_derived_from_both_channels() {
    let transport = MemoryTransport::new();
    transport.script(PRESENCE, [ConnectBehavior::Hang]);
    let h = harness_with(transport, FakeApi::ok());
    let snapshots = record::<topics::ConnectionStateChanged>(&h.bus);

    let _messages = h.transport.next_peer(MESSAGES).await;
    wait_status(h.client.channel(ChannelKind::Messages).watch(), |s| {
        s.state == ChannelState::Open
    })
    .await;
    let state = h.client.state();
    assert!(!state.connected);
    assert!(state.connecting);
    assert!(h.client.is_connecting());

    wait_status(h.client.channel(ChannelKind::Presence).watch(), |s| s.error.is_some()).await;
    assert_eq!(h.client.error(), Some(ChannelError::HandshakeTimeout));
    assert!(!h.client.is_connected());

    let _presence = h.transport.next_peer(PRESENCE).await;
    wait_status(h.client.channel(ChannelKind::Presence).watch(), |s| {
        s.state == ChannelState::Open
    })
    .await;
    settle().await;
    assert!(h.client.is_connected());
    assert_eq!(h.client.error(), None);

    let last = snapshots.lock().last().cloned().unwrap();
    assert!(last.connected);
    assert_eq!(last.messages, ChannelState::Open);
    assert_eq!(last.presence, ChannelState::Open);
}

#[tokio::test(start_paused = true)]
async fn frames_are_dispatched_by_kind() {
    let h = harness(FakeApi::ok());
    let new_messages = record::<topics::NewMessage>(&h.bus);
    let received = record::<topics::MessageReceived>(&h.bus);
    let statuses = record::<topics::UserStatusChanged>(&h.bus);
    let reads = record::<topics::MessagesRead>(&h.bus);
    let unread = record::<topics::UnreadCountsUpdated>(&h.bus);
    let errors = record::<topics::ServerError>(&h.bus);
    let (messages, presence) = h.open_both().await;

    messages.send_text(message_frame("m1", "hello"));
    messages.send_text(message_frame("m1", "hello"));
    presence.send_text(r#"{"type":"status","data":{"userId":"u2","status":"away"}}"#);
    messages.send_text(
        r#"{"type":"read","data":{"messageIds":["m1"],"readerId":"u2","readAt":"2024-05-01T10:05:00Z"}}"#,
    );
    messages.send_text(r#"{"type":"unread_count","data":{"total":3,"byConversation":{"u2":3}}}"#);
    messages.send_text(r#"{"type":"error","data":{"code":"rate_limited","message":"slow down"}}"#);
    messages.send_text(r#"{"type":"reaction","data":{}}"#);
    settle().await;

    assert_eq!(new_messages.lock().len(), 1);
    assert_eq!(received.lock().len(), 1);
    assert_eq!(statuses.lock()[0].user_id, "u2");
    assert_eq!(reads.lock()[0].message_ids, ["m1"]);
    assert_eq!(unread.lock()[0].total, 3);
    assert_eq!(errors.lock()[0].message, "slow down");

    let history = h.client.messages();
    assert_eq!(history.len(), 1);
    assert!(history[0].read);
    assert!(h.client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_change_nothing() {
    let h = harness(FakeApi::ok());
    let new_messages = record::<topics::NewMessage>(&h.bus);
    let (messages, _presence) = h.open_both().await;
    let before = h.client.state();

    messages.send_text("not json at all");
    messages.send_text(r#"{"type":"message","data":{"id":1}}"#);
    messages.send_text(r#"{"data":{}}"#);
    settle().await;

    assert_eq!(h.client.state(), before);
    assert!(new_messages.lock().is_empty());
    assert!(h.client.messages().is_empty());

    messages.send_text(message_frame("m2", "still alive"));
    settle().await;
    assert_eq!(new_messages.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn auth_close_invalidates_session_once() {
    let h = harness(FakeApi::ok());
    let (messages, presence) = h.open_both().await;

    messages.close(1008, "Policy Violation");
    presence.close(4001, "invalid session");
    for kind in [ChannelKind::Messages, ChannelKind::Presence] {
        let status = wait_status(h.client.channel(kind).watch(), |s| s.error.is_some()).await;
        assert_eq!(status.error, Some(ChannelError::Authentication));
    }

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.attempt_count(MESSAGES), 1);
    assert_eq!(h.transport.attempt_count(PRESENCE), 1);
}

#[tokio::test(start_paused = true)]
async fn private_message_falls_back_with_the_same_events() {
    let api = FakeApi::ok();
    let h = harness(api.clone());
    let sent = record::<topics::MessageSent>(&h.bus);
    let received = record::<topics::MessageReceived>(&h.bus);
    let (mut messages, _presence) = h.open_both().await;

    assert!(h.client.send_private_message("u2", "over socket").await);
    settle().await;
    let frame = json(&messages.recv_text().await.unwrap());
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["data"]["recipientId"], "u2");
    assert!(api.calls.lock().is_empty());

    messages.close(1000, "bye");
    wait_status(h.client.channel(ChannelKind::Messages).watch(), |s| {
        s.state == ChannelState::Closed
    })
    .await;

    assert!(h.client.send_private_message("u2", "over http").await);
    assert_eq!(api.calls.lock().len(), 1);

    let sent = sent.lock();
    assert_eq!(sent.len(), 2);
    for event in sent.iter() {
        assert_eq!(event.recipient, Recipient::User("u2".into()));
    }
    assert_eq!(sent[0].content, "over socket");
    assert_eq!(sent[1].content, "over http");
    assert_eq!(received.lock().len(), 1);
    assert_eq!(h.client.messages()[0].content, "over http");
}

#[tokio::test(start_paused = true)]
async fn failed_fallback_emits_retry_without_retrying() {
    let api = FakeApi::failing(ApiError::Network("offline".into()));
    let transport = MemoryTransport::new();
    transport.script(MESSAGES, [ConnectBehavior::Hang]);
    let h = harness_with(transport, api.clone());
    let retries = record::<topics::RetryFailedMessage>(&h.bus);

    assert!(!h.client.send_private_message("u9", "lost").await);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(api.calls.lock().len(), 1);
    let retries = retries.lock();
    assert_eq!(retries.len(), 1);
    assert_eq!(retries[0].recipient_id, "u9");
    assert_eq!(retries[0].content, "lost");
    assert_eq!(h.invalidations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unauthorized_fallback_invalidates_session() {
    let api = FakeApi::failing(ApiError::Http {
        status: 401,
        body: serde_json::to_string(&ProblemDetails::unauthorized("session expired")).unwrap(),
    });
    let transport = MemoryTransport::new();
    transport.script(MESSAGES, [ConnectBehavior::Hang]);
    let h = harness_with(transport, api);

    let retries = record::<topics::RetryFailedMessage>(&h.bus);

    assert!(!h.client.send_private_message("u9", "lost").await);
    assert_eq!(h.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(retries.lock()[0].reason, "session expired");
}

#[tokio::test(start_paused = true)]
async fn group_messages_and_typing_queue_until_open() {
    let transport = MemoryTransport::new();
    transport.script(MESSAGES, [ConnectBehavior::Refuse("down".into())]);
    let h = harness_with(transport, FakeApi::ok());
    let sent = record::<topics::MessageSent>(&h.bus);

    assert!(h.client.send_group_message("g1", "queued"));
    assert!(h.client.send_typing("u2", true));
    assert!(h.client.send_typing("u2", false));
    assert!(h.client.mark_read(vec!["m1".into()]));

    let (mut messages, _presence) = h.open_both().await;
    let kinds: Vec<_> = messages
        .drain()
        .iter()
        .map(|t| json(t)["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, ["message", "typing", "stop_typing", "read"]);
    assert!(sent.lock().is_empty());

    assert!(h.client.send_group_message("g1", "live"));
    let frame = json(&messages.recv_text().await.unwrap());
    assert_eq!(frame["data"]["groupId"], "g1");
    assert_eq!(sent.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn presence_and_unread_subscriptions_route_to_their_channels() {
    let h = harness(FakeApi::ok());
    let (mut messages, mut presence) = h.open_both().await;

    h.client.watch_presence("u7").unwrap();
    h.client.watch_unread_counts().unwrap();
    settle().await;

    assert_eq!(
        json(&presence.recv_text().await.unwrap()),
        serde_json::json!({"action": "subscribe", "channel": "presence:u7"})
    );
    assert_eq!(
        json(&presence.recv_text().await.unwrap()),
        serde_json::json!({"action": "subscribe", "channel": "unread_counts"})
    );
    assert!(messages.drain().is_empty());

    h.client.unwatch_unread_counts().unwrap();
    assert_eq!(
        json(&presence.recv_text().await.unwrap()),
        serde_json::json!({"action": "unsubscribe", "channel": "unread_counts"})
    );
    settle().await;
    assert!(messages.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_tears_down_both_channels() {
    let h = harness(FakeApi::ok());
    let (messages, presence) = h.open_both().await;
    messages.send_text(message_frame("m1", "hello"));
    settle().await;
    assert_eq!(h.client.messages().len(), 1);

    h.client.disconnect();
    for kind in [ChannelKind::Messages, ChannelKind::Presence] {
        wait_status(h.client.channel(kind).watch(), |s| s.state == ChannelState::Closed).await;
    }
    assert_eq!(messages.client_close().map(|(code, _)| code), Some(1000));
    assert_eq!(presence.client_close().map(|(code, _)| code), Some(1000));
    assert!(h.client.messages().is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempt_count(MESSAGES), 1);
    assert_eq!(h.transport.attempt_count(PRESENCE), 1);
}

#[tokio::test(start_paused = true)]
async fn token_change_reconnects_with_the_new_token() {
    let h = harness(FakeApi::ok());
    let (messages, _presence) = h.open_both().await;
    assert_eq!(messages.token().as_deref(), Some("tok"));

    h.tokens.set("fresh");
    let renewed = h.transport.next_peer(MESSAGES).await;
    assert_eq!(renewed.token().as_deref(), Some("fresh"));
    assert_eq!(messages.client_close(), Some((1000, "Session changed".to_string())));

    h.tokens.clear();
    wait_status(h.client.channel(ChannelKind::Messages).watch(), |s| {
        s.state == ChannelState::Closed
    })
    .await;
    assert!(matches!(h.client.connect(), Err(chatwire_client::RealtimeError::Authentication)));
}

#[tokio::test(start_paused = true)]
async fn frames_arriving_during_disconnect_are_dropped() {
    let h = harness(FakeApi::ok());
    let new_messages = record::<topics::NewMessage>(&h.bus);
    let (messages, _presence) = h.open_both().await;

    messages.send_text(message_frame("late", "too late"));
    h.client.disconnect();
    for kind in [ChannelKind::Messages, ChannelKind::Presence] {
        wait_status(h.client.channel(kind).watch(), |s| s.state == ChannelState::Closed).await;
    }
    settle().await;
    assert!(h.client.messages().is_empty());
    assert!(new_messages.lock().is_empty());

    h.client.connect().unwrap();
    let (messages, _presence) = h.open_both().await;
    messages.send_text(message_frame("m2", "back again"));
    settle().await;
    assert_eq!(h.client.messages().len(), 1);
    assert_eq!(new_messages.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn logout_drops_frames_from_the_old_session() {
    let h = harness(FakeApi::ok());
    let (messages, _presence) = h.open_both().await;

    messages.send_text(message_frame("old", "previous session"));
    h.tokens.clear();
    for kind in [ChannelKind::Messages, ChannelKind::Presence] {
        wait_status(h.client.channel(kind).watch(), |s| s.state == ChannelState::Closed).await;
    }
    settle().await;
    assert!(h.client.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn auto_connect_off_waits_for_a_manual_connect() {
    let config = RealtimeConfig {
        auto_connect: false,
        ..config()
    };
    let h = build_harness(
        config,
        SessionTokens::new(Some("tok".into())),
        MemoryTransport::new(),
        FakeApi::ok(),
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.channel(ChannelKind::Messages).state(), ChannelState::Idle);
    assert_eq!(h.client.channel(ChannelKind::Presence).state(), ChannelState::Idle);
    assert_eq!(h.transport.attempt_count(MESSAGES), 0);
    assert_eq!(h.transport.attempt_count(PRESENCE), 0);

    // A new token does not start idle channels either.
    h.tokens.set("fresh");
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.transport.attempt_count(MESSAGES), 0);
    assert_eq!(h.transport.attempt_count(PRESENCE), 0);

    h.client.connect().unwrap();
    let (messages, presence) = h.open_both().await;
    assert_eq!(messages.token().as_deref(), Some("fresh"));
    assert_eq!(presence.token().as_deref(), Some("fresh"));
}

#[tokio::test(start_paused = true)]
async fn no_token_means_no_connection_until_login() {
    let h = build_harness(
        config(),
        SessionTokens::new(None),
        MemoryTransport::new(),
        FakeApi::ok(),
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.client.channel(ChannelKind::Messages).state(), ChannelState::Idle);
    assert_eq!(h.client.channel(ChannelKind::Presence).state(), ChannelState::Idle);
    assert_eq!(h.transport.attempt_count(MESSAGES), 0);
    assert_eq!(h.transport.attempt_count(PRESENCE), 0);

    h.tokens.set("tok");
    let (messages, _presence) = h.open_both().await;
    assert_eq!(messages.token().as_deref(), Some("tok"));
}

#[tokio::test(start_paused = true)]
async fn failures_on_both_channels_share_one_budget() {
    let transport = MemoryTransport::new();
    let refusals = |n| (0..n).map(|i| ConnectBehavior::Refuse(format!("down {i}")));
    transport.script(MESSAGES, refusals(10));
    transport.script(PRESENCE, refusals(10));
    let h = harness_with(transport, FakeApi::ok());

    tokio::time::sleep(Duration::from_secs(60)).await;
    let total = h.transport.attempt_count(MESSAGES) + h.transport.attempt_count(PRESENCE);
    assert_eq!(total, 6);
    for kind in [ChannelKind::Messages, ChannelKind::Presence] {
        assert_eq!(
            h.client.channel(kind).status().error,
            Some(ChannelError::MaxAttemptsExceeded { attempts: 5 })
        );
    }
}

#[tokio::test(start_paused = true)]
async fn presence_open_resets_the_messages_backoff() {
    let transport = MemoryTransport::new();
    transport.script(
        MESSAGES,
        (0..4).map(|i| ConnectBehavior::Refuse(format!("down {i}"))),
    );
    transport.script(PRESENCE, [ConnectBehavior::Hang]);
    let config = RealtimeConfig {
        handshake_timeout: Duration::from_millis(2500),
        ..config()
    };
    let counter = ReconnectCounter::new();
    let bus = EventBus::new();
    let client = Coordinator::builder(
        config,
        Arc::new(SessionTokens::new(Some("tok".into()))),
        bus,
    )
    .transport(Arc::new(transport.clone()))
    .fallback(FakeApi::ok())
    .reconnect_counter(counter.clone())
    .build()
    .unwrap();

    // messages fails at 0s, 1s, 3s; presence times out at 2.5s and opens at
    // 5.5s, so the messages failure at 7s counts as the first again.
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert_eq!(
        transport.attempt_gaps(MESSAGES),
        [1000, 2000, 4000, 1000].map(Duration::from_millis).to_vec()
    );
    assert_eq!(
        transport.attempt_gaps(PRESENCE),
        vec![Duration::from_millis(5500)]
    );
    assert!(client.is_connected());
    assert_eq!(counter.get(), 0);
}
