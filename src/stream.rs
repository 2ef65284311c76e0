//! Event stream: typed events, wire encoding and the bounded transport that
//! delivers them to one consumer.

pub mod encoder;
pub mod event;
pub mod transport;

pub use encoder::{encode, validate};
pub use event::{generate_event_id, Event, EventType, OVERSIZE_WARN_BYTES};
pub use transport::{EventReceiver, EventSender, EventTransport, TransportConfig, TransportStats};
