//! Single relay connection management.

use crate::config::RelayConfig;
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use crate::transport::{FragmentData, TransportSink};
use nostr::Event;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open in progress
    Connecting,
    /// Connected and ready
    Open,
    /// Closed deliberately (by either side); terminal
    Closed,
    /// Waiting to reopen after an abnormal closure
    Reconnecting,
    /// Open failed or reconnection attempts ran out; terminal
    Failed,
}

impl ConnectionState {
    /// Whether the relay is live or on its way back.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Reconnecting)
    }
}

/// Outcome of handing an event to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishConfirmation {
    pub relay_url: String,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

/// Accumulates inbound fragments until the final one arrives.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    bytes: Vec<u8>,
}

impl FragmentBuffer {
    /// Append a fragment. On the final fragment the whole message is returned
    /// and the buffer starts over empty.
    pub fn push(&mut self, data: &FragmentData, is_final: bool) -> Option<Vec<u8>> {
        self.bytes.extend_from_slice(data.as_bytes());
        is_final.then(|| std::mem::take(&mut self.bytes))
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Relay connection.
///
/// The pool drives the lifecycle; this type owns the per-relay state it needs:
/// the transport sink, the fragment buffer, the state and the retry counter.
pub struct RelayConnection {
    url: String,
    config: RelayConfig,
    state: RwLock<ConnectionState>,
    sink: Mutex<Option<Box<dyn TransportSink>>>,
    fragments: Mutex<FragmentBuffer>,
    reconnect_attempts: AtomicU32,
    retired: AtomicBool,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Held while recording a new subscription and while bringing the relay
    /// online, so a REQ is sent by exactly one of the two.
    subscribing: Mutex<()>,
}

impl RelayConnection {
    pub fn new(url: &str, config: RelayConfig) -> Self {
        Self {
            url: url.to_string(),
            config,
            state: RwLock::new(ConnectionState::Connecting),
            sink: Mutex::new(None),
            fragments: Mutex::new(FragmentBuffer::default()),
            reconnect_attempts: AtomicU32::new(0),
            retired: AtomicBool::new(false),
            driver: std::sync::Mutex::new(None),
            subscribing: Mutex::new(()),
        }
    }

    /// Relay URL as string.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write().await;
        if *current != state {
            debug!("relay {}: {:?} -> {:?}", self.url, *current, state);
            *current = state;
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Claim the next reconnection attempt, or `None` once the budget is spent.
    pub(crate) fn next_reconnect_attempt(&self) -> Option<u32> {
        let max = self.config.max_reconnect_attempts;
        self.reconnect_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |attempts| {
                (attempts < max).then_some(attempts + 1)
            })
            .ok()
            .map(|previous| previous + 1)
    }

    pub(crate) async fn subscription_guard(&self) -> MutexGuard<'_, ()> {
        self.subscribing.lock().await
    }

    /// Install a freshly opened transport and mark the relay open.
    pub(crate) async fn attach(&self, sink: Box<dyn TransportSink>) {
        *self.sink.lock().await = Some(sink);
        *self.fragments.lock().await = FragmentBuffer::default();
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open).await;
    }

    /// Forget the transport after the remote side closed it.
    pub(crate) async fn detach(&self) {
        self.sink.lock().await.take();
    }

    /// Close the transport from our side and mark the relay closed.
    pub(crate) async fn disconnect(&self) {
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink
            && let Err(error) = sink.close().await
        {
            debug!("error closing transport to {}: {}", self.url, error);
        }
        self.set_state(ConnectionState::Closed).await;
    }

    pub(crate) async fn send(&self, message: &ClientMessage<'_>) -> Result<()> {
        if self.state().await != ConnectionState::Open {
            return Err(ClientError::NotConnected);
        }
        let text = message.to_json()?;
        let mut sink_guard = self.sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(text).await
    }

    /// Send an EVENT. Acceptance means the relay was handed the event, not
    /// that it stored it.
    pub(crate) async fn publish(&self, event: &Event) -> PublishConfirmation {
        let (accepted, message) = match self.send(&ClientMessage::Event(event)).await {
            Ok(()) => (true, "queued".to_string()),
            Err(error) => (false, error.to_string()),
        };
        PublishConfirmation {
            relay_url: self.url.clone(),
            event_id: event.id.clone(),
            accepted,
            message,
        }
    }

    /// Feed one inbound fragment through the buffer.
    ///
    /// Returns a message only when `is_final` completes one that the pool
    /// dispatches. Undecodable messages are logged and dropped; the buffer is
    /// reset either way.
    pub(crate) async fn receive_fragment(
        &self,
        data: &FragmentData,
        is_final: bool,
    ) -> Option<RelayMessage> {
        let complete = self.fragments.lock().await.push(data, is_final)?;

        let text = match String::from_utf8(complete) {
            Ok(text) => text,
            Err(error) => {
                warn!(
                    "invalid UTF-8 message from {}: {} ({:?})",
                    self.url,
                    error,
                    String::from_utf8_lossy(error.as_bytes())
                );
                return None;
            }
        };

        match parse_relay_message(&text) {
            Ok(Some(message)) if message.is_dispatched() => Some(message),
            Ok(Some(message)) => {
                debug!("ignoring {:?} from {}", message, self.url);
                None
            }
            Ok(None) => {
                debug!("ignoring unrecognized message from {}: {}", self.url, text);
                None
            }
            Err(error) => {
                warn!("protocol parse error on {}: {} ({})", self.url, error, text);
                None
            }
        }
    }

    pub(crate) fn set_driver(&self, handle: JoinHandle<()>) {
        let mut driver = self.driver.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.is_retired() {
            handle.abort();
            return;
        }
        if let Some(previous) = driver.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the driver task and block any further dispatch or reconnection.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            driver.abort();
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}
