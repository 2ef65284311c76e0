//! Bounded, lossy event transport with heartbeats.
//!
//! One transport backs one stream. Producers never wait: when the queue is full
//! the oldest queued event is evicted for the newest. The receiver emits a
//! heartbeat whenever nothing was delivered for the heartbeat interval.

use super::encoder;
use super::event::Event;
use crate::error::StreamError;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Transport sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    pub capacity: usize,
    pub heartbeat_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Counters for one transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub sent: u64,
    pub evicted: u64,
    pub heartbeats: u64,
}

struct Shared {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    senders: Mutex<usize>,
    receiver_alive: Mutex<bool>,
    stats: Mutex<TransportStats>,
}

impl Shared {
    fn closed(&self) -> bool {
        *self.senders.lock() == 0
    }
}

/// Factory for sender/receiver pairs
pub struct EventTransport;

impl EventTransport {
    pub fn channel(config: TransportConfig) -> (EventSender, EventReceiver) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            capacity: config.capacity.max(1),
            notify: Notify::new(),
            senders: Mutex::new(1),
            receiver_alive: Mutex::new(true),
            stats: Mutex::new(TransportStats::default()),
        });
        (
            EventSender {
                shared: Arc::clone(&shared),
            },
            EventReceiver {
                shared,
                heartbeat_interval: config.heartbeat_interval,
            },
        )
    }
}

/// Producer half. Cloneable; the stream ends once every sender is dropped.
pub struct EventSender {
    shared: Arc<Shared>,
}

impl EventSender {
    /// Queue an event without waiting, evicting the oldest one when full.
    pub fn send(&self, event: Event) -> Result<(), StreamError> {
        if !*self.shared.receiver_alive.lock() {
            return Err(StreamError::Closed);
        }
        let evicted = {
            let mut queue = self.shared.queue.lock();
            let evicted = if queue.len() >= self.shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            evicted
        };
        {
            let mut stats = self.shared.stats.lock();
            stats.sent += 1;
            if evicted.is_some() {
                stats.evicted += 1;
            }
        }
        if let Some(dropped) = evicted {
            warn!(
                event_type = %dropped.event_type,
                event_id = dropped.id.as_deref().unwrap_or(""),
                capacity = self.shared.capacity,
                "Event queue full; evicted oldest event"
            );
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> TransportStats {
        *self.shared.stats.lock()
    }

    pub fn is_closed(&self) -> bool {
        !*self.shared.receiver_alive.lock()
    }
}

impl Clone for EventSender {
    fn clone(&self) -> Self {
        *self.shared.senders.lock() += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EventSender {
    fn drop(&mut self) {
        let mut senders = self.shared.senders.lock();
        *senders = senders.saturating_sub(1);
        drop(senders);
        self.shared.notify.notify_one();
    }
}

/// Consumer half
pub struct EventReceiver {
    shared: Arc<Shared>,
    heartbeat_interval: Duration,
}

impl EventReceiver {
    /// Next event, a heartbeat after an idle interval, or `None` once every
    /// sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let next = self.shared.queue.lock().pop_front();
            if next.is_some() {
                return next;
            }
            if self.shared.closed() {
                // A sender may have pushed between the pop and the close check.
                return self.shared.queue.lock().pop_front();
            }

            tokio::select! {
                _ = self.shared.notify.notified() => continue,
                _ = tokio::time::sleep(self.heartbeat_interval) => {
                    self.shared.stats.lock().heartbeats += 1;
                    debug!("Transport idle; emitting heartbeat");
                    return Some(Event::heartbeat());
                }
            }
        }
    }

    /// Events currently queued
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TransportStats {
        *self.shared.stats.lock()
    }

    pub fn into_stream(mut self) -> impl Stream<Item = Event> + Send {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }

    /// Encoded wire text, one item per event. Events that fail validation are
    /// logged and skipped.
    pub fn into_wire(mut self) -> impl Stream<Item = String> + Send {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                match encoder::encode(&event) {
                    Ok(text) => {
                        yield text;
                    }
                    Err(e) => warn!(
                        event_type = %event.event_type,
                        error = %e,
                        "Skipping invalid event"
                    ),
                }
            }
        }
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        *self.shared.receiver_alive.lock() = false;
    }
}
