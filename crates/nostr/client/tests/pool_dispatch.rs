//! Integration tests for subscription bookkeeping and event dispatch.

use nostr::{Event, Filter};
use nostr_relay_pool::{
    ClientError, ConnectionState, EventHandler, FragmentData, MemoryTransport, PoolConfig,
    PoolNotification, RelayEvent, RelayPool, Result,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const RELAY_A: &str = "wss://relay-a.example";
const RELAY_B: &str = "wss://relay-b.example";

fn note(id: &str, kind: u16) -> Event {
    Event {
        id: id.to_string(),
        pubkey: "author-pubkey".to_string(),
        created_at: 1_703_000_000,
        kind,
        tags: vec![vec!["t".to_string(), "nostr".to_string()]],
        content: format!("note {id}"),
        sig: "sig".to_string(),
    }
}

fn event_message(subscription_id: &str, event: &Event) -> String {
    json!(["EVENT", subscription_id, event]).to_string()
}

async fn pool_with_relays(urls: &[&str]) -> (RelayPool, MemoryTransport) {
    let transport = MemoryTransport::new();
    let pool = RelayPool::new(PoolConfig::default(), transport.clone());
    for url in urls {
        assert_eq!(pool.add_relay(url).await, ConnectionState::Open);
    }
    (pool, transport)
}

async fn next_notification(pool: &RelayPool) -> Option<PoolNotification> {
    timeout(Duration::from_secs(2), pool.events().recv())
        .await
        .ok()
        .flatten()
}

fn recording_handler(seen: &Arc<Mutex<Vec<String>>>) -> EventHandler {
    let seen = Arc::clone(seen);
    Arc::new(move |relay_event: &RelayEvent| -> Result<()> {
        seen.lock().unwrap().push(relay_event.event.id.clone());
        Ok(())
    })
}

#[tokio::test]
async fn test_event_reaches_stream_then_handlers() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    pool.register_handler(
        1,
        Arc::new(|_event: &RelayEvent| -> Result<()> {
            Err(ClientError::Handler("rejects everything".to_string()))
        }),
    );
    pool.register_handler(1, recording_handler(&seen));
    let reactions = Arc::new(Mutex::new(Vec::new()));
    pool.register_handler(7, recording_handler(&reactions));

    let ids = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;
    assert_eq!(ids.len(), 1);
    assert_eq!(
        transport.sent_json(RELAY_A),
        vec![json!(["REQ", ids[0], { "kinds": [1] }])]
    );

    let event = note("note-1", 1);
    assert!(transport.push_text(RELAY_A, event_message(&ids[0], &event)));

    assert_eq!(
        next_notification(&pool).await,
        Some(PoolNotification::Event(RelayEvent {
            relay_url: RELAY_A.to_string(),
            subscription_id: ids[0].clone(),
            event,
        }))
    );
    assert_eq!(*seen.lock().unwrap(), vec!["note-1"]);
    assert!(reactions.lock().unwrap().is_empty());

    assert!(transport.push_text(RELAY_A, json!(["EOSE", ids[0]]).to_string()));
    assert_eq!(
        next_notification(&pool).await,
        Some(PoolNotification::EndOfStoredEvents {
            relay_url: RELAY_A.to_string(),
            subscription_id: ids[0].clone(),
        })
    );
}

#[tokio::test]
async fn test_event_without_handlers_still_reaches_stream() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let ids = pool.subscribe(Some(RELAY_A), Filter::new()).await;

    assert!(transport.push_text(RELAY_A, event_message(&ids[0], &note("lonely", 30023))));
    let notification = next_notification(&pool).await;
    assert!(matches!(
        notification,
        Some(PoolNotification::Event(RelayEvent { ref event, .. })) if event.id == "lonely"
    ));
}

#[tokio::test]
async fn test_fragmented_event_is_reassembled() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let ids = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;
    let event = note("split", 1);
    let message = event_message(&ids[0], &event);
    let (head, tail) = message.as_bytes().split_at(message.len() / 3);

    assert!(transport.push_fragment(RELAY_A, FragmentData::Binary(head.to_vec()), false));
    assert!(transport.push_fragment(RELAY_A, FragmentData::Binary(tail.to_vec()), true));

    let notification = next_notification(&pool).await;
    assert!(matches!(
        notification,
        Some(PoolNotification::Event(RelayEvent { event: ref received, .. })) if *received == event
    ));
}

#[tokio::test]
async fn test_garbage_and_notices_do_not_disturb_the_connection() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let ids = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;

    assert!(transport.push_text(RELAY_A, "[\"EVENT\", \"truncated"));
    assert!(transport.push_text(RELAY_A, r#"["NOTICE","slow down"]"#));
    assert!(transport.push_text(RELAY_A, r#"["OK","note-1",true,""]"#));
    assert!(transport.push_text(RELAY_A, event_message(&ids[0], &note("after", 1))));

    let notification = next_notification(&pool).await;
    assert!(matches!(
        notification,
        Some(PoolNotification::Event(RelayEvent { ref event, .. })) if event.id == "after"
    ));
    assert_eq!(pool.relay_state(RELAY_A).await, Some(ConnectionState::Open));
}

#[tokio::test]
async fn test_fan_out_subscribe_uses_distinct_ids() {
    let (pool, transport) = pool_with_relays(&[RELAY_A, RELAY_B]).await;
    transport.refuse("wss://down.example");
    assert_eq!(
        pool.add_relay("wss://down.example").await,
        ConnectionState::Failed
    );

    let filter = Filter::new().kind(1).limit(10);
    let ids = pool.subscribe(None, filter.clone()).await;
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);

    for url in [RELAY_A, RELAY_B] {
        let recorded = pool.subscriptions(url);
        assert_eq!(recorded.len(), 1);
        let (id, recorded_filter) = recorded.iter().next().unwrap();
        assert!(ids.contains(id));
        assert_eq!(recorded_filter, &filter);
        assert_eq!(
            transport.sent_json(url),
            vec![json!(["REQ", id, { "kinds": [1], "limit": 10 }])]
        );
    }
    assert!(pool.subscriptions("wss://down.example").is_empty());
}

#[tokio::test]
async fn test_unsubscribe_removes_only_matching_filter() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let notes = Filter::new().kinds([1, 6]);
    let reactions = Filter::new().kind(7);

    let note_ids = pool.subscribe(Some(RELAY_A), notes.clone()).await;
    let reaction_ids = pool.subscribe(Some(RELAY_A), reactions.clone()).await;

    pool.unsubscribe(Some(RELAY_A), &Filter::new().kinds([6, 1])).await;

    let remaining = pool.subscriptions(RELAY_A);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining.get(&reaction_ids[0]), Some(&reactions));
    assert_eq!(
        transport.sent_json(RELAY_A).last(),
        Some(&json!(["CLOSE", note_ids[0]]))
    );

    let sent_before = transport.sent(RELAY_A).len();
    pool.unsubscribe(Some(RELAY_A), &notes).await;
    pool.unsubscribe(Some("wss://unknown.example"), &reactions).await;
    assert_eq!(transport.sent(RELAY_A).len(), sent_before);
    assert_eq!(pool.subscriptions(RELAY_A).len(), 1);
}

#[tokio::test]
async fn test_unsubscribe_everywhere_closes_each_relay_id() {
    let (pool, transport) = pool_with_relays(&[RELAY_A, RELAY_B]).await;
    let filter = Filter::new().authors(["alice"]);
    let ids = pool.subscribe(None, filter.clone()).await;

    pool.unsubscribe(None, &filter).await;

    for url in [RELAY_A, RELAY_B] {
        assert!(pool.subscriptions(url).is_empty());
        let closed = transport.sent_json(url).pop().unwrap();
        assert_eq!(closed[0], "CLOSE");
        assert!(ids.iter().any(|id| closed[1] == id.as_str()));
    }
}

#[tokio::test]
async fn test_remove_relay_closes_subscriptions_and_transport() {
    let (pool, transport) = pool_with_relays(&[RELAY_A, RELAY_B]).await;
    let first = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;
    let second = pool.subscribe(Some(RELAY_A), Filter::new().kind(7)).await;

    pool.remove_relay(RELAY_A).await;

    let sent = transport.sent_json(RELAY_A);
    assert!(sent.contains(&json!(["CLOSE", first[0]])));
    assert!(sent.contains(&json!(["CLOSE", second[0]])));
    assert!(!transport.is_connected(RELAY_A));
    assert_eq!(pool.relay_state(RELAY_A).await, None);
    assert!(pool.subscriptions(RELAY_A).is_empty());
    assert_eq!(pool.relay_urls().await, vec![RELAY_B]);

    pool.remove_relay(RELAY_A).await;
}

#[tokio::test]
async fn test_close_all_then_stale_fragment_is_ignored() {
    let (pool, transport) = pool_with_relays(&[RELAY_A, RELAY_B]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    pool.register_handler(1, recording_handler(&seen));
    let ids = pool.subscribe(None, Filter::new().kind(1)).await;
    let events = pool.events();

    pool.close_all().await;

    assert!(pool.relay_urls().await.is_empty());
    for url in [RELAY_A, RELAY_B] {
        assert!(!transport.is_connected(url));
        assert_eq!(transport.sent_json(url).last().map(|m| m[0].clone()), Some(json!("CLOSE")));
        assert!(pool.subscriptions(url).is_empty());
    }

    assert!(!transport.push_text(RELAY_A, event_message(&ids[0], &note("late", 1))));
    assert_eq!(timeout(Duration::from_secs(1), events.recv()).await.ok(), Some(None));
    assert!(seen.lock().unwrap().is_empty());

    pool.close_all().await;
    assert!(pool.is_closed());
    assert!(pool.subscribe(None, Filter::new()).await.is_empty());
    assert_eq!(pool.add_relay(RELAY_A).await, ConnectionState::Failed);
}

#[tokio::test]
async fn test_fragment_in_flight_at_close_all_is_harmless() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let ids = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;
    let events = pool.events();

    assert!(transport.push_fragment(RELAY_A, FragmentData::Text("[\"EVENT\",".to_string()), false));
    assert!(transport.push_text(RELAY_A, event_message(&ids[0], &note("racing", 1))));
    pool.close_all().await;

    let drained = timeout(Duration::from_secs(1), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok());
}

#[tokio::test]
async fn test_publish_goes_to_open_relays_only() {
    let (pool, transport) = pool_with_relays(&[RELAY_A, RELAY_B]).await;
    transport.close(RELAY_B, 1000, "maintenance");
    for _ in 0..100 {
        if pool.relay_state(RELAY_B).await == Some(ConnectionState::Closed) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(pool.relay_state(RELAY_B).await, Some(ConnectionState::Closed));

    let event = note("published", 1);
    let confirmations = pool.publish(&event).await.unwrap();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].relay_url, RELAY_A);
    assert!(confirmations[0].accepted);
    assert_eq!(transport.sent_json(RELAY_A), vec![json!(["EVENT", event])]);
}

#[tokio::test]
async fn test_connect_all_reports_unreachable_relays() {
    let transport = MemoryTransport::new();
    transport.refuse(RELAY_B);
    let pool = RelayPool::new(
        PoolConfig::with_relays([RELAY_A, RELAY_B]),
        transport.clone(),
    );

    let error = pool.connect_all().await.unwrap_err();
    assert!(error.to_string().contains(RELAY_B));
    assert!(!error.to_string().contains(RELAY_A));
    assert_eq!(pool.relay_state(RELAY_A).await, Some(ConnectionState::Open));
    assert_eq!(pool.relay_state(RELAY_B).await, Some(ConnectionState::Failed));

    transport.accept(RELAY_B);
    pool.connect_all().await.unwrap();
    assert_eq!(transport.open_count(RELAY_A), 1);
    assert_eq!(pool.relay_state(RELAY_B).await, Some(ConnectionState::Open));
}

#[tokio::test]
async fn test_messages_from_one_relay_arrive_in_order() {
    let (pool, transport) = pool_with_relays(&[RELAY_A]).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    pool.register_handler(1, recording_handler(&seen));
    let ids = pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await;
    let sub = &ids[0];

    let split = |text: String, pieces: usize| -> Vec<String> {
        let bytes = text.into_bytes();
        let size = bytes.len().div_ceil(pieces);
        bytes
            .chunks(size)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    };

    assert!(transport.push_text(RELAY_A, event_message(sub, &note("first", 1))));
    let second = split(event_message(sub, &note("second", 1)), 3);
    let last = second.len() - 1;
    for (index, piece) in second.into_iter().enumerate() {
        assert!(transport.push_fragment(RELAY_A, FragmentData::Text(piece), index == last));
    }
    assert!(transport.push_text(RELAY_A, json!(["EOSE", sub]).to_string()));
    assert!(transport.push_text(RELAY_A, event_message(sub, &note("third", 1))));
    let fourth = split(event_message(sub, &note("fourth", 1)), 2);
    let last = fourth.len() - 1;
    for (index, piece) in fourth.into_iter().enumerate() {
        assert!(transport.push_fragment(RELAY_A, FragmentData::Text(piece), index == last));
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        match next_notification(&pool).await {
            Some(PoolNotification::Event(relay_event)) => received.push(relay_event.event.id),
            Some(PoolNotification::EndOfStoredEvents { .. }) => received.push("EOSE".to_string()),
            None => break,
        }
    }
    assert_eq!(received, vec!["first", "second", "EOSE", "third", "fourth"]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["first", "second", "third", "fourth"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_subscribe_while_relay_opens_sends_one_req_per_subscription() {
    for _ in 0..200 {
        let transport = MemoryTransport::new();
        let pool = RelayPool::new(PoolConfig::default(), transport.clone());

        let adding = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.add_relay(RELAY_A).await })
        };
        let subscribing = {
            let pool = pool.clone();
            tokio::spawn(async move {
                while pool.relay(RELAY_A).await.is_none() {
                    tokio::task::yield_now().await;
                }
                pool.subscribe(Some(RELAY_A), Filter::new().kind(1)).await
            })
        };
        assert_eq!(adding.await.unwrap(), ConnectionState::Open);
        assert_eq!(subscribing.await.unwrap().len(), 1);

        let requested: Vec<String> = transport
            .sent_json(RELAY_A)
            .iter()
            .filter(|message| message[0] == "REQ")
            .filter_map(|message| message[1].as_str().map(ToString::to_string))
            .collect();
        let recorded: Vec<String> = pool.subscriptions(RELAY_A).into_keys().collect();
        assert_eq!(requested, recorded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_racing_close_all_leaves_nothing_behind() {
    for _ in 0..200 {
        let transport = MemoryTransport::new();
        let pool = RelayPool::new(PoolConfig::default(), transport.clone());

        let adding = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.add_relay(RELAY_A).await })
        };
        let closing = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close_all().await })
        };
        adding.await.unwrap();
        closing.await.unwrap();

        assert!(pool.relay_urls().await.is_empty());
        assert_eq!(pool.relay_state(RELAY_A).await, None);
        assert!(!transport.is_connected(RELAY_A));
    }
}
