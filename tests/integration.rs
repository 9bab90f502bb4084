//! Integration tests for the stream client.

use replay_stream::{
    ChannelState, Client, ClientConfig, Credentials, JournalMapping, MappingStore, MarkerStore,
    MemoryMapping, MemoryTransport, Message, ReplayMarker, ReplayOption, ReplaySource,
    StaticCredentials, StoragePolicy, StreamError,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn credentials() -> StaticCredentials {
    StaticCredentials::new(Credentials::new(
        "00D-token",
        "https://acme.my.salesforce.com",
    ))
}

fn open_client(transport: &MemoryTransport, config: ClientConfig) -> Client {
    init_tracing();
    let client = Client::new(credentials(), transport.clone(), config);
    client.open().unwrap();
    client
}

fn memory_store(markers: Vec<ReplayMarker>) -> Arc<dyn MarkerStore> {
    Arc::new(MappingStore::new(MemoryMapping::with_markers(markers)))
}

fn marker(channel: &str, replay_id: i64) -> ReplayMarker {
    ReplayMarker::new(channel, replay_id, "2024-05-01T10:00:00.000Z")
}

fn replay_id(message: &Message) -> i64 {
    message.data["event"]["replayId"].as_i64().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for condition");
        thread::sleep(Duration::from_millis(5));
    }
}

// --- Replay Resolution ---

#[test]
fn test_first_subscribe_requests_store_default() {
    let transport = MemoryTransport::new();
    let client = open_client(&transport, ClientConfig::default());

    client.subscribe("/topic/orders").unwrap();

    assert_eq!(
        transport.subscribe_calls(),
        vec![("/topic/orders".to_string(), ReplayOption::NewEvents)]
    );
}

#[test]
fn test_all_events_default_until_marker_exists() {
    let transport = MemoryTransport::new();
    let store: Arc<dyn MarkerStore> = Arc::new(replay_stream::DefaultOnMiss::new(
        MappingStore::new(MemoryMapping::new()),
        ReplayOption::AllEvents,
    ));
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );

    client.subscribe("/topic/orders").unwrap();
    transport.deliver("/topic/orders", 3, json!({"Id": "a"}));
    client.receive().unwrap();

    client.unsubscribe("/topic/orders").unwrap();
    client.subscribe("/topic/orders").unwrap();

    let requested: Vec<_> = transport.subscribe_calls().into_iter().map(|c| c.1).collect();
    assert_eq!(
        requested,
        vec![ReplayOption::AllEvents, ReplayOption::After(3)]
    );
}

// --- Immediate Commit ---

#[test]
fn test_immediate_commit_advances_marker() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![marker("/topic/orders", 10)]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );

    client.subscribe("/topic/orders").unwrap();
    assert_eq!(transport.subscribe_calls()[0].1, ReplayOption::After(10));

    transport.deliver("/topic/orders", 11, json!({"Id": "a"}));
    transport.deliver("/topic/orders", 12, json!({"Id": "b"}));

    let first = client.receive().unwrap();
    assert_eq!(replay_id(&first), 11);
    assert_eq!(store.get_marker("/topic/orders").unwrap().unwrap().replay_id, 11);

    let second = client.receive().unwrap();
    assert_eq!(replay_id(&second), 12);
    assert_eq!(client.marker("/topic/orders").unwrap().unwrap().replay_id, 12);
}

#[test]
fn test_channels_are_tracked_independently() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );
    client.subscribe("/topic/a").unwrap();
    client.subscribe("/event/B__e").unwrap();

    transport.deliver("/topic/a", 100, json!({}));
    transport.deliver_message(&json!({
        "channel": "/event/B__e",
        "data": {
            "event": {"replayId": 7},
            "payload": {"CreatedDate": "2024-05-01T10:00:00.000Z"}
        }
    }));

    client.receive().unwrap();
    client.receive().unwrap();

    assert_eq!(store.get_marker("/topic/a").unwrap().unwrap().replay_id, 100);
    assert_eq!(store.get_marker("/event/B__e").unwrap().unwrap().replay_id, 7);
}

// --- Subscription State Machine ---

#[test]
fn test_subscribe_twice_issues_one_request() {
    let transport = MemoryTransport::new();
    let client = open_client(&transport, ClientConfig::default());

    client.subscribe("/topic/x").unwrap();
    client.subscribe("/topic/x").unwrap();

    assert_eq!(transport.subscribe_calls().len(), 1);
    assert_eq!(client.subscriptions(), vec!["/topic/x".to_string()]);
    assert_eq!(client.subscription_state("/topic/x"), ChannelState::Subscribed);
}

#[test]
fn test_unsubscribe_then_subscribe_resumes_from_marker() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::mapping(MemoryMapping::new()),
            ..Default::default()
        },
    );

    client.subscribe("/topic/x").unwrap();
    transport.deliver("/topic/x", 41, json!({}));
    client.receive().unwrap();

    client.unsubscribe("/topic/x").unwrap();
    assert_eq!(client.subscription_state("/topic/x"), ChannelState::Unsubscribed);
    assert!(client.subscriptions().is_empty());

    client.subscribe("/topic/x").unwrap();
    assert_eq!(
        transport.subscribe_calls().last().unwrap().1,
        ReplayOption::After(41)
    );
}

#[test]
fn test_fallback_when_marker_outside_retention() {
    let transport = MemoryTransport::new();
    transport.set_retention_floor("/topic/y", 1000);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(memory_store(vec![marker("/topic/y", 5)])),
            replay_fallback: Some(ReplayOption::AllEvents),
            ..Default::default()
        },
    );

    client.subscribe("/topic/y").unwrap();

    let requested: Vec<_> = transport.subscribe_calls().into_iter().map(|c| c.1).collect();
    assert_eq!(
        requested,
        vec![ReplayOption::After(5), ReplayOption::AllEvents]
    );
    assert_eq!(client.subscription_state("/topic/y"), ChannelState::Subscribed);
    assert_eq!(client.subscriptions(), vec!["/topic/y".to_string()]);
}

// --- Reconnection ---

#[test]
fn test_reconnect_resumes_after_marker() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(memory_store(vec![marker("/topic/z", 10)])),
            ..Default::default()
        },
    );
    client.subscribe("/topic/z").unwrap();

    transport.drop_connection();
    transport.restore_connection();

    wait_until(|| transport.subscribe_calls().len() == 2);
    assert_eq!(
        transport.subscribe_calls()[1],
        ("/topic/z".to_string(), ReplayOption::After(10))
    );
    wait_until(|| client.subscription_state("/topic/z") == ChannelState::Subscribed);
}

#[test]
fn test_reconnect_uses_marker_advanced_since_subscribe() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::mapping(MemoryMapping::new()),
            ..Default::default()
        },
    );
    for channel in ["/topic/b", "/topic/a"] {
        client.subscribe(channel).unwrap();
    }

    transport.deliver("/topic/a", 20, json!({}));
    client.receive().unwrap();

    transport.drop_connection();
    transport.restore_connection();

    wait_until(|| transport.subscribe_calls().len() == 4);
    assert_eq!(
        transport.subscribe_calls()[2..].to_vec(),
        vec![
            ("/topic/b".to_string(), ReplayOption::NewEvents),
            ("/topic/a".to_string(), ReplayOption::After(20)),
        ]
    );
}

#[test]
fn test_stale_message_is_dropped_when_server_replays() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![marker("/topic/x", 5)]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();

    // Buffered before the connection drops
    transport.deliver("/topic/x", 6, json!({"copy": "old"}));
    transport.drop_connection();
    transport.restore_connection();
    wait_until(|| {
        transport.subscribe_calls().len() == 2
            && client.subscription_state("/topic/x") == ChannelState::Subscribed
    });
    assert_eq!(transport.subscribe_calls()[1].1, ReplayOption::After(5));

    // The server replays it on the new subscription
    transport.deliver("/topic/x", 6, json!({"copy": "new"}));

    let message = client.receive().unwrap();
    assert_eq!(message.data["payload"]["copy"], "new");
    assert_eq!(store.get_marker("/topic/x").unwrap().unwrap().replay_id, 6);
    assert!(!client.has_pending());
}

#[test]
fn test_stale_message_without_replay_is_delivered_uncommitted() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();

    transport.deliver("/topic/x", 1, json!({}));
    transport.drop_connection();
    transport.restore_connection();
    wait_until(|| transport.subscribe_calls().len() == 2);
    wait_until(|| client.subscription_state("/topic/x") == ChannelState::Subscribed);

    let message = client.receive().unwrap();
    assert_eq!(replay_id(&message), 1);
    assert!(store.get_marker("/topic/x").unwrap().is_none());

    transport.deliver("/topic/x", 2, json!({}));
    client.receive().unwrap();
    assert_eq!(store.get_marker("/topic/x").unwrap().unwrap().replay_id, 2);
}

#[test]
fn test_reconnect_timeout_closes_client() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            connection_timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();
    transport.drop_connection();

    let err = client.receive().unwrap_err();
    assert!(matches!(err, StreamError::Timeout(_)));
    assert!(client.is_closed());
    assert!(transport.is_closed());
    assert!(matches!(client.receive(), Err(StreamError::ClientClosed)));
}

#[test]
fn test_no_timeout_waits_for_reconnect() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            connection_timeout: None,
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();
    transport.drop_connection();

    let result = client.receive_timeout(Duration::from_millis(100)).unwrap();
    assert!(result.is_none());
    assert!(!client.is_closed());

    transport.restore_connection();
    wait_until(|| transport.subscribe_calls().len() == 2);
    transport.deliver("/topic/x", 1, json!({}));
    assert_eq!(replay_id(&client.receive().unwrap()), 1);
}

#[test]
fn test_close_while_waiting_on_resubscription_commits_nothing() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![]);
    let client = Arc::new(open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            connection_timeout: None,
            resubscribe_retry: Duration::from_secs(60),
            ..Default::default()
        },
    ));
    client.subscribe("/topic/z").unwrap();
    transport.deliver("/topic/z", 10, json!({}));
    wait_until(|| client.pending_count() == 1);

    transport.interrupt_subscribe(0, "request hiccup");
    transport.drop_connection();
    transport.restore_connection();
    wait_until(|| transport.subscribe_calls().len() == 2);

    let consumer = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.receive())
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!consumer.is_finished());
    client.close().unwrap();

    let result = consumer.join().unwrap();
    assert!(matches!(result, Err(StreamError::ClientClosed)));
    assert!(store.get_marker("/topic/z").unwrap().is_none());
}

#[test]
fn test_stale_message_dropped_when_resubscribe_refused() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![marker("/topic/z", 5)]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            ..Default::default()
        },
    );
    client.subscribe("/topic/z").unwrap();
    transport.deliver("/topic/z", 10, json!({}));
    wait_until(|| client.pending_count() == 1);

    transport.set_retention_floor("/topic/z", 100);
    transport.drop_connection();
    transport.restore_connection();
    wait_until(|| transport.subscribe_calls().len() == 2 && client.subscriptions().is_empty());

    let err = client.receive().unwrap_err();
    assert!(matches!(err, StreamError::Replay { .. }));
    assert_eq!(store.get_marker("/topic/z").unwrap().unwrap().replay_id, 5);
    assert!(client.subscriptions().is_empty());
    assert!(!client.is_closed());
}

#[test]
fn test_resubscribe_interrupted_in_transit_is_retried() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![marker("/topic/z", 10)]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            resubscribe_retry: Duration::from_millis(20),
            ..Default::default()
        },
    );
    client.subscribe("/topic/z").unwrap();

    transport.interrupt_subscribe(0, "request hiccup");
    transport.drop_connection();
    transport.restore_connection();

    wait_until(|| {
        transport.subscribe_calls().len() == 3
            && client.subscription_state("/topic/z") == ChannelState::Subscribed
    });
    let calls = transport.subscribe_calls();
    assert_eq!(calls[1].1, ReplayOption::After(10));
    assert_eq!(calls[2].1, ReplayOption::After(10));

    transport.deliver("/topic/z", 11, json!({}));
    assert_eq!(replay_id(&client.receive().unwrap()), 11);
    assert_eq!(store.get_marker("/topic/z").unwrap().unwrap().replay_id, 11);
    assert!(!client.is_closed());
}

#[test]
fn test_receive_timeout_while_resubscribing() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            connection_timeout: None,
            resubscribe_retry: Duration::from_secs(1),
            ..Default::default()
        },
    );
    client.subscribe("/topic/z").unwrap();
    transport.deliver("/topic/z", 10, json!({}));
    wait_until(|| client.pending_count() == 1);

    transport.interrupt_subscribe(0, "request hiccup");
    transport.drop_connection();
    transport.restore_connection();
    wait_until(|| transport.subscribe_calls().len() == 2);

    let started = Instant::now();
    assert!(client
        .receive_timeout(Duration::from_millis(50))
        .unwrap()
        .is_none());
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(client.pending_count(), 1);

    // Delivered once the retry resubscribes the channel
    let message = client.receive().unwrap();
    assert_eq!(replay_id(&message), 10);
    assert_eq!(transport.subscribe_calls().len(), 3);
}

// --- Backpressure ---

#[test]
fn test_intake_waits_for_consumer() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            max_pending_count: 2,
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();

    for id in 1..=3 {
        transport.deliver("/topic/x", id, json!({}));
    }
    wait_until(|| client.pending_count() == 2);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.pending_count(), 2);

    assert_eq!(replay_id(&client.receive().unwrap()), 1);
    wait_until(|| client.pending_count() == 2);

    let rest: Vec<_> = (0..2).map(|_| replay_id(&client.receive().unwrap())).collect();
    assert_eq!(rest, vec![2, 3]);
    assert!(!client.has_pending());
}

#[test]
fn test_unbounded_buffer() {
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            max_pending_count: 0,
            ..Default::default()
        },
    );
    for id in 1..=500 {
        transport.deliver("/topic/x", id, json!({}));
    }
    wait_until(|| client.pending_count() == 500);
}

// --- Manual Commit ---

#[test]
fn test_manual_commit_replays_unprocessed_message_next_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("markers.journal");

    // First session: m1 fails processing
    {
        let mapping = JournalMapping::open(&path).unwrap();
        let transport = MemoryTransport::new();
        let client = open_client(
            &transport,
            ClientConfig {
                replay: ReplaySource::mapping(mapping),
                storage_policy: StoragePolicy::Manual,
                ..Default::default()
            },
        );
        let m0 = Message::new(
            "/topic/x",
            json!({"event": {"replayId": 0, "createdDate": "2024-05-01T09:00:00.000Z"}}),
        );
        client.commit(&m0).unwrap();
        client.subscribe("/topic/x").unwrap();

        transport.deliver("/topic/x", 1, json!({"Id": "m1"}));
        let m1 = client.receive().unwrap();
        let result: Result<(), StreamError> = client.process(&m1, |_| {
            Err(StreamError::InvalidOperation("handler crashed".into()))
        });
        assert!(result.is_err());
        assert_eq!(client.marker("/topic/x").unwrap().unwrap().replay_id, 0);
        client.close().unwrap();
    }

    // Second session resumes before m1
    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::mapping(JournalMapping::open(&path).unwrap()),
            storage_policy: StoragePolicy::Manual,
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();
    assert_eq!(transport.subscribe_calls()[0].1, ReplayOption::After(0));

    transport.deliver("/topic/x", 1, json!({"Id": "m1"}));
    let m1 = client.receive().unwrap();
    {
        let guard = client.begin(&m1);
        assert_eq!(guard.message().data["payload"]["Id"], "m1");
        guard.commit().unwrap();
    }
    assert_eq!(client.marker("/topic/x").unwrap().unwrap().replay_id, 1);
}

#[test]
fn test_manual_policy_does_not_commit_on_receive() {
    let transport = MemoryTransport::new();
    let store = memory_store(vec![]);
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::Store(Arc::clone(&store)),
            storage_policy: StoragePolicy::Manual,
            ..Default::default()
        },
    );
    client.subscribe("/topic/x").unwrap();
    transport.deliver("/topic/x", 9, json!({}));

    let message = client.receive().unwrap();
    assert!(store.get_marker("/topic/x").unwrap().is_none());

    client.commit(&message).unwrap();
    assert_eq!(store.get_marker("/topic/x").unwrap().unwrap().replay_id, 9);
}

// --- Persistence ---

#[test]
fn test_markers_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("markers.journal");

    {
        let transport = MemoryTransport::new();
        let client = open_client(
            &transport,
            ClientConfig {
                replay: ReplaySource::mapping(JournalMapping::open(&path).unwrap()),
                ..Default::default()
            },
        );
        client.subscribe("/topic/a").unwrap();
        client.subscribe("/topic/b").unwrap();
        for id in 1..=5 {
            transport.deliver("/topic/a", id, json!({}));
        }
        transport.deliver("/topic/b", 77, json!({}));
        for _ in 0..6 {
            client.receive().unwrap();
        }
    }

    let transport = MemoryTransport::new();
    let client = open_client(
        &transport,
        ClientConfig {
            replay: ReplaySource::mapping(JournalMapping::open(&path).unwrap()),
            ..Default::default()
        },
    );
    client.subscribe("/topic/a").unwrap();
    client.subscribe("/topic/b").unwrap();

    assert_eq!(
        transport.subscribe_calls(),
        vec![
            ("/topic/a".to_string(), ReplayOption::After(5)),
            ("/topic/b".to_string(), ReplayOption::After(77)),
        ]
    );
}

// --- Lifecycle ---

#[test]
fn test_server_close_ends_iteration() {
    let transport = MemoryTransport::new();
    let client = open_client(&transport, ClientConfig::default());
    client.subscribe("/topic/x").unwrap();

    transport.deliver("/topic/x", 1, json!({}));
    transport.deliver("/topic/x", 2, json!({}));
    transport.end_session();

    let results: Vec<_> = client.messages().collect();
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(matches!(results[2], Err(StreamError::ConnectionClosed)));
    assert!(client.is_closed());

    // A closed client can be opened again
    client.open().unwrap();
    assert!(!client.is_closed());
}

#[test]
fn test_close_releases_blocked_consumer() {
    let transport = MemoryTransport::new();
    let client = Arc::new(open_client(&transport, ClientConfig::default()));
    client.subscribe("/topic/x").unwrap();
    transport.deliver("/topic/x", 1, json!({}));
    wait_until(|| client.pending_count() == 1);

    let consumer = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.messages().count())
    };
    wait_until(|| !client.has_pending());
    thread::sleep(Duration::from_millis(20));
    client.close().unwrap();

    assert_eq!(consumer.join().unwrap(), 1);
    assert!(client.is_closed());
    assert!(client.subscriptions().is_empty());
}

#[test]
fn test_close_discards_pending_messages() {
    let transport = MemoryTransport::new();
    let client = open_client(&transport, ClientConfig::default());
    for id in 1..=3 {
        transport.deliver("/topic/x", id, json!({}));
    }
    wait_until(|| client.pending_count() == 3);

    client.close().unwrap();
    assert_eq!(client.pending_count(), 0);
    assert!(matches!(client.receive(), Err(StreamError::ClientClosed)));
}
