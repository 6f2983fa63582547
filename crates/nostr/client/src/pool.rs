//! Relay pool for multi-relay fanout.
//!
//! The pool owns every relay connection, the subscription table, the handler
//! registry and the event bus. Each open relay gets one driver task that reads
//! its frames, dispatches completed messages and reopens the transport after
//! an abnormal closure.

use crate::bus::{EventBus, EventStream, PoolNotification, RelayEvent};
use crate::config::PoolConfig;
use crate::error::{ClientError, Result};
use crate::handler::{EventHandler, HandlerRegistry};
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::{ConnectionState, PublishConfirmation, RelayConnection};
use crate::subscription::{SubscriptionTable, generate_subscription_id};
use crate::transport::{
    ABNORMAL_CLOSURE, Transport, TransportConnection, TransportFrame, TransportSink,
    WebSocketTransport,
};
use futures_util::future::join_all;
use nostr::{Event, Filter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

struct PoolInner {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    relays: RwLock<HashMap<String, Arc<RelayConnection>>>,
    subscriptions: SubscriptionTable,
    handlers: HandlerRegistry,
    bus: EventBus,
    closing: AtomicBool,
}

/// Multi-relay connection and subscription manager.
///
/// Cheap to clone; clones share the same relays, subscriptions and handlers.
#[derive(Clone)]
pub struct RelayPool {
    inner: Arc<PoolInner>,
}

impl RelayPool {
    /// Create new relay pool over the given transport. No relay is contacted
    /// until [`RelayPool::add_relay`] or [`RelayPool::connect_all`].
    pub fn new(config: PoolConfig, transport: impl Transport) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                transport: Arc::new(transport),
                relays: RwLock::new(HashMap::new()),
                subscriptions: SubscriptionTable::new(),
                handlers: HandlerRegistry::new(),
                bus: EventBus::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Relay pool speaking WebSocket.
    pub fn websocket(config: PoolConfig) -> Self {
        Self::new(config, WebSocketTransport)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Add every relay from the configuration.
    ///
    /// Fails with [`ClientError::RelaysUnreachable`] naming each relay that
    /// could not be opened; the others stay connected.
    pub async fn connect_all(&self) -> Result<()> {
        let urls = self.inner.config.relays.clone();
        let results = join_all(urls.iter().map(|url| self.try_add_relay(url))).await;

        let unreachable: Vec<String> = urls
            .iter()
            .zip(results)
            .filter_map(|(url, result)| result.err().map(|error| format!("{url}: {error}")))
            .collect();
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(ClientError::RelaysUnreachable(unreachable))
        }
    }

    /// Add a relay and open it.
    ///
    /// A relay that is already connecting, open or reconnecting is left alone.
    /// One that is closed or failed is replaced by a fresh connection, which
    /// resends the filters still recorded for its URL. Failures are logged and
    /// reported as [`ConnectionState::Failed`].
    pub async fn add_relay(&self, url: &str) -> ConnectionState {
        match self.try_add_relay(url).await {
            Ok(state) => state,
            Err(error) => {
                warn!("failed to add relay {}: {}", url, error);
                ConnectionState::Failed
            }
        }
    }

    async fn try_add_relay(&self, url: &str) -> Result<ConnectionState> {
        if self.inner.is_closing() {
            return Err(ClientError::Connection("relay pool is closed".to_string()));
        }

        let relay = {
            let mut relays = self.inner.relays.write().await;
            // close_all may have drained the registry while we waited.
            if self.inner.is_closing() {
                return Err(ClientError::Connection("relay pool is closed".to_string()));
            }
            match relays.get(url) {
                Some(existing) => {
                    let state = existing.state().await;
                    if state.is_active() {
                        debug!("relay {} already in pool ({:?})", url, state);
                        return Ok(state);
                    }
                    existing.retire();
                }
                None if relays.len() >= self.inner.config.max_relays => {
                    return Err(ClientError::Connection(format!(
                        "maximum relay limit ({}) reached",
                        self.inner.config.max_relays
                    )));
                }
                None => {}
            }
            let relay = Arc::new(RelayConnection::new(
                url,
                self.inner.config.relay_config.clone(),
            ));
            relays.insert(url.to_string(), Arc::clone(&relay));
            relay
        };

        PoolInner::open(&self.inner, &relay).await?;
        Ok(relay.state().await)
    }

    /// Close a relay and forget it along with its subscriptions.
    pub async fn remove_relay(&self, url: &str) {
        let removed = self.inner.relays.write().await.remove(url);
        let Some(relay) = removed else {
            warn!("relay not found: {}", url);
            return;
        };
        self.inner.retire(&relay).await;
        info!("removed relay {}", url);
    }

    /// Subscribe `filter` on one relay, or on every open relay when `relay_url`
    /// is `None`. Returns one fresh subscription id per relay subscribed.
    ///
    /// A named relay that is not open yet records the filter; the REQ goes out
    /// when the relay (re)opens.
    pub async fn subscribe(&self, relay_url: Option<&str>, filter: Filter) -> Vec<String> {
        if self.inner.is_closing() {
            warn!("relay pool is closed; ignoring subscribe");
            return Vec::new();
        }
        let targets = match relay_url {
            Some(url) => match self.relay(url).await {
                Some(relay) => vec![relay],
                None => {
                    warn!("relay not found: {}", url);
                    return Vec::new();
                }
            },
            None => self.open_relays().await,
        };

        let mut ids = Vec::with_capacity(targets.len());
        for relay in targets {
            ids.push(self.inner.subscribe_on(&relay, &filter).await);
        }
        ids
    }

    /// Close every subscription whose filter equals `filter`, on one relay or
    /// on all of them.
    pub async fn unsubscribe(&self, relay_url: Option<&str>, filter: &Filter) {
        let targets = match relay_url {
            Some(url) => match self.relay(url).await {
                Some(relay) => vec![relay],
                None => {
                    warn!("relay not found: {}", url);
                    return;
                }
            },
            None => self.inner.relays.read().await.values().cloned().collect(),
        };

        for relay in targets {
            for id in self.inner.subscriptions.find_by_filter(relay.url(), filter) {
                if self.inner.subscriptions.remove(relay.url(), &id).is_some() {
                    self.inner.close_subscription(&relay, &id).await;
                }
            }
        }
    }

    /// Publish event to all open relays.
    pub async fn publish(&self, event: &Event) -> Result<Vec<PublishConfirmation>> {
        let relays = self.open_relays().await;
        if relays.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let mut confirmations = Vec::with_capacity(relays.len());
        for relay in relays {
            confirmations.push(relay.publish(event).await);
        }
        Ok(confirmations)
    }

    /// Append a handler for `kind`. Handlers for a kind run in registration
    /// order for every event of that kind, from any relay.
    pub fn register_handler(&self, kind: u16, handler: EventHandler) {
        self.inner.handlers.register(kind, handler);
    }

    /// Drop every handler for `kind`. Returns how many were removed.
    pub fn remove_handler(&self, kind: u16) -> usize {
        self.inner.handlers.remove_kind(kind)
    }

    /// Drop one registration of `handler` for `kind`.
    pub fn remove_handler_instance(&self, kind: u16, handler: &EventHandler) -> bool {
        self.inner.handlers.remove_instance(kind, handler)
    }

    /// Kinds with at least one handler, ascending.
    pub fn list_handlers(&self) -> Vec<u16> {
        self.inner.handlers.kinds()
    }

    /// Close every relay, clear all subscriptions and end the event stream.
    ///
    /// Safe to call more than once.
    pub async fn close_all(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let relays: Vec<Arc<RelayConnection>> = self
            .inner
            .relays
            .write()
            .await
            .drain()
            .map(|(_, relay)| relay)
            .collect();

        for relay in &relays {
            self.inner.retire(relay).await;
        }
        self.inner.bus.close();
        if !relays.is_empty() {
            info!("closed {} relay connection(s)", relays.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closing()
    }

    /// Stream of events and end-of-stored-events notices from every relay.
    pub fn events(&self) -> EventStream {
        self.inner.bus.stream()
    }

    /// Get relay by URL.
    pub async fn relay(&self, url: &str) -> Option<Arc<RelayConnection>> {
        self.inner.relays.read().await.get(url).cloned()
    }

    pub async fn relay_state(&self, url: &str) -> Option<ConnectionState> {
        let relay = self.relay(url).await?;
        Some(relay.state().await)
    }

    /// URLs of every relay in the pool, sorted.
    pub async fn relay_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.inner.relays.read().await.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Subscription ids and filters currently recorded for `url`.
    pub fn subscriptions(&self, url: &str) -> HashMap<String, Filter> {
        self.inner.subscriptions.filters_of(url)
    }

    async fn open_relays(&self) -> Vec<Arc<RelayConnection>> {
        let relays: Vec<Arc<RelayConnection>> =
            self.inner.relays.read().await.values().cloned().collect();
        let mut open = Vec::with_capacity(relays.len());
        for relay in relays {
            if relay.state().await == ConnectionState::Open {
                open.push(relay);
            }
        }
        open
    }
}

impl PoolInner {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn open_transport(&self, relay: &RelayConnection) -> Result<TransportConnection> {
        let connect_timeout = relay.config().connect_timeout;
        timeout(connect_timeout, self.transport.open(relay.url()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("connection timeout after {:?}", connect_timeout))
            })?
    }

    /// First open of a relay: connect, start its driver, send recorded filters.
    async fn open(self: &Arc<Self>, relay: &Arc<RelayConnection>) -> Result<()> {
        relay.set_state(ConnectionState::Connecting).await;
        let connection = match self.open_transport(relay).await {
            Ok(connection) => connection,
            Err(error) => {
                relay.set_state(ConnectionState::Failed).await;
                return Err(error);
            }
        };

        if relay.is_retired() || self.is_closing() {
            let mut sink = connection.sink;
            if let Err(error) = sink.close().await {
                debug!("error closing transport to {}: {}", relay.url(), error);
            }
            return Err(ClientError::Connection(format!(
                "relay {} removed while connecting",
                relay.url()
            )));
        }

        if !self.bring_online(relay, connection.sink).await {
            return Err(ClientError::Connection(format!(
                "relay {} removed while connecting",
                relay.url()
            )));
        }
        info!("connected to relay {}", relay.url());
        let driver = tokio::spawn(drive_relay(
            Arc::downgrade(self),
            Arc::clone(relay),
            connection.frames,
        ));
        relay.set_driver(driver);
        Ok(())
    }

    /// Mark the relay open and resend its recorded filters, with new
    /// subscriptions held off until both are done. Returns false, with the
    /// transport closed again, if the relay was retired meanwhile.
    async fn bring_online(&self, relay: &RelayConnection, sink: Box<dyn TransportSink>) -> bool {
        let _guard = relay.subscription_guard().await;
        relay.attach(sink).await;
        // retire() may have run its disconnect before the sink was attached.
        if relay.is_retired() {
            relay.disconnect().await;
            return false;
        }
        self.resubscribe(relay).await;
        true
    }

    async fn subscribe_on(&self, relay: &RelayConnection, filter: &Filter) -> String {
        let _guard = relay.subscription_guard().await;
        let id = generate_subscription_id();
        self.subscriptions.add(relay.url(), id.clone(), filter.clone());

        match relay.state().await {
            ConnectionState::Open => {
                if let Err(error) = relay.send(&ClientMessage::Req(&id, filter)).await {
                    warn!("failed to send subscription {} to {}: {}", id, relay.url(), error);
                }
            }
            state => debug!(
                "relay {} is {:?}; subscription {} waits for reopen",
                relay.url(),
                state,
                id
            ),
        }
        id
    }

    /// Resend every recorded filter for `relay` under a fresh id.
    async fn resubscribe(&self, relay: &RelayConnection) {
        let recorded = self.subscriptions.filters_of(relay.url());
        if recorded.is_empty() {
            return;
        }
        info!("resubscribing {} filter(s) on {}", recorded.len(), relay.url());

        for (old_id, filter) in recorded {
            let new_id = generate_subscription_id();
            // Unsubscribed while we were reconnecting.
            if !self.subscriptions.replace(relay.url(), &old_id, new_id.clone()) {
                continue;
            }
            if let Err(error) = relay.send(&ClientMessage::Req(&new_id, &filter)).await {
                warn!("failed to resubscribe {} on {}: {}", new_id, relay.url(), error);
            }
        }
    }

    async fn close_subscription(&self, relay: &RelayConnection, id: &str) {
        if relay.state().await != ConnectionState::Open {
            return;
        }
        if let Err(error) = relay.send(&ClientMessage::Close(id)).await {
            debug!("failed to close subscription {} on {}: {}", id, relay.url(), error);
        }
    }

    /// Stop a relay for good: no more dispatch, reconnects or subscriptions.
    async fn retire(&self, relay: &RelayConnection) {
        relay.retire();
        for id in self.subscriptions.remove_relay(relay.url()).keys() {
            self.close_subscription(relay, id).await;
        }
        relay.disconnect().await;
    }

    fn dispatch(&self, relay_url: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event(subscription_id, event) => {
                let relay_event = RelayEvent {
                    relay_url: relay_url.to_string(),
                    subscription_id,
                    event,
                };
                if !self.bus.push(PoolNotification::Event(relay_event.clone())) {
                    debug!("event bus closed; not queueing event from {}", relay_url);
                }
                self.handlers.dispatch(&relay_event);
            }
            RelayMessage::Eose(subscription_id) => {
                self.bus.push(PoolNotification::EndOfStoredEvents {
                    relay_url: relay_url.to_string(),
                    subscription_id,
                });
            }
            other => debug!("not dispatching {:?} from {}", other, relay_url),
        }
    }
}

/// Per-relay driver: dispatch inbound messages, then reconnect after an
/// abnormal closure until the budget runs out.
async fn drive_relay(
    pool: Weak<PoolInner>,
    relay: Arc<RelayConnection>,
    mut frames: mpsc::UnboundedReceiver<TransportFrame>,
) {
    loop {
        let (code, reason) = loop {
            match frames.recv().await {
                Some(TransportFrame::Fragment { data, is_final }) => {
                    let Some(message) = relay.receive_fragment(&data, is_final).await else {
                        continue;
                    };
                    let Some(inner) = pool.upgrade() else {
                        return;
                    };
                    if relay.is_retired() || inner.is_closing() {
                        return;
                    }
                    inner.dispatch(relay.url(), message);
                }
                Some(TransportFrame::Closed { code, reason }) => break (code, reason),
                None => {
                    break (
                        ABNORMAL_CLOSURE,
                        "transport ended without close frame".to_string(),
                    );
                }
            }
        };

        relay.detach().await;
        if relay.is_retired() {
            return;
        }
        if code != ABNORMAL_CLOSURE {
            info!("relay {} closed ({}): {}", relay.url(), code, reason);
            relay.set_state(ConnectionState::Closed).await;
            return;
        }

        warn!("relay {} closed abnormally: {}", relay.url(), reason);
        match reconnect(&pool, &relay).await {
            Some(next) => frames = next,
            None => return,
        }
    }
}

/// Reopen `relay` after the configured delay. A failed reopen spends another
/// attempt. Returns the new frame stream, or `None` when the relay gave up or
/// was removed.
async fn reconnect(
    pool: &Weak<PoolInner>,
    relay: &RelayConnection,
) -> Option<mpsc::UnboundedReceiver<TransportFrame>> {
    let config = relay.config().clone();
    loop {
        relay.set_state(ConnectionState::Reconnecting).await;
        let Some(attempt) = relay.next_reconnect_attempt() else {
            warn!(
                "giving up on relay {} after {} reconnect attempts",
                relay.url(),
                config.max_reconnect_attempts
            );
            relay.set_state(ConnectionState::Failed).await;
            return None;
        };

        info!(
            "reconnecting to {} in {:?} (attempt {}/{})",
            relay.url(),
            config.reconnect_delay,
            attempt,
            config.max_reconnect_attempts
        );
        sleep(config.reconnect_delay).await;

        let inner = pool.upgrade()?;
        if relay.is_retired() || inner.is_closing() {
            return None;
        }

        relay.set_state(ConnectionState::Connecting).await;
        match inner.open_transport(relay).await {
            Ok(connection) => {
                if !inner.bring_online(relay, connection.sink).await {
                    return None;
                }
                info!("reconnected to relay {}", relay.url());
                return Some(connection.frames);
            }
            Err(error) => warn!(
                "reconnect attempt {} to {} failed: {}",
                attempt,
                relay.url(),
                error
            ),
        }
    }
}
