//! Bounded transport behavior under overflow, idleness and disconnects.

use casework::error::StreamError;
use casework::stream::{encode, Event, EventTransport, EventType, TransportConfig};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use std::time::Duration;

fn numbered(n: u64) -> Event {
    let mut data = Map::new();
    data.insert("n".to_string(), Value::from(n));
    Event::new(EventType::Chunk, data)
}

fn config(capacity: usize) -> TransportConfig {
    TransportConfig {
        capacity,
        heartbeat_interval: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn test_overflow_evicts_the_oldest_events() {
    let (tx, rx) = EventTransport::channel(config(3));
    for n in 0..5 {
        tx.send(numbered(n)).unwrap();
    }
    assert_eq!(rx.len(), 3);
    let stats = tx.stats();
    assert_eq!(stats.sent, 5);
    assert_eq!(stats.evicted, 2);

    drop(tx);
    let received: Vec<Value> = rx.into_stream().map(|e| e.data["n"].clone()).collect().await;
    assert_eq!(received, vec![json!(2), json!(3), json!(4)]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_stream_emits_heartbeats() {
    let (tx, mut rx) = EventTransport::channel(config(10));

    let heartbeat = rx.recv().await.unwrap();
    assert_eq!(heartbeat.event_type, "heartbeat");
    assert!(heartbeat.data["timestamp"].is_i64());
    assert_eq!(rx.stats().heartbeats, 1);

    tx.send(numbered(1)).unwrap();
    assert_eq!(rx.recv().await.unwrap().event_type, "chunk");

    drop(tx);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_sending_after_the_receiver_leaves_fails() {
    let (tx, rx) = EventTransport::channel(config(10));
    drop(rx);
    assert!(tx.is_closed());
    assert!(matches!(tx.send(numbered(1)), Err(StreamError::Closed)));
}

#[tokio::test]
async fn test_wire_stream_matches_the_encoder() {
    let (tx, rx) = EventTransport::channel(config(10));
    let event = numbered(7).with_id("chunk-1").with_retry(2500);
    let expected = encode(&event).unwrap();
    tx.send(event).unwrap();
    drop(tx);

    let frames: Vec<String> = rx.into_wire().collect().await;
    assert_eq!(frames, vec![expected.clone()]);
    assert_eq!(
        expected,
        "event: chunk\nid: chunk-1\nretry: 2500\ndata: {\"n\":7}\n\n"
    );
}

#[tokio::test]
async fn test_invalid_events_are_skipped_on_the_wire() {
    let (tx, rx) = EventTransport::channel(config(10));
    let mut bogus = numbered(1);
    bogus.event_type = "bogus".to_string();
    tx.send(bogus).unwrap();
    tx.send(numbered(2)).unwrap();
    drop(tx);

    let frames: Vec<String> = rx.into_wire().collect().await;
    assert_eq!(frames.len(), 1);
    assert!(frames[0].contains("\"n\":2"));
}
