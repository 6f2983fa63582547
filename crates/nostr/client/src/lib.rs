//! Multi-relay Nostr client.
//!
//! [`RelayPool`] keeps connections to a set of relays, records which filters
//! are subscribed where, reopens relays that drop abnormally and fans every
//! received event out to an [`EventStream`] and to per-kind handlers.

pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod message;
pub mod pool;
pub mod relay;
pub mod subscription;
pub mod transport;

pub use bus::{EventBus, EventStream, PoolNotification, RelayEvent};
pub use config::{ConfigError, PoolConfig, RelayConfig};
pub use error::{ClientError, Result};
pub use handler::{EventHandler, HandlerRegistry};
pub use message::{ClientMessage, RelayMessage, parse_relay_message};
pub use pool::RelayPool;
pub use relay::{ConnectionState, FragmentBuffer, PublishConfirmation, RelayConnection};
pub use subscription::{SubscriptionTable, generate_subscription_id};
pub use transport::{
    ABNORMAL_CLOSURE, FragmentData, MemoryTransport, NORMAL_CLOSURE, Transport,
    TransportConnection, TransportFrame, TransportSink, WebSocketTransport,
};
