//! In-process transport for tests and embedding.
//!
//! Every URL behaves like a relay that accepts connections unless refused.
//! The caller plays the relay side: it reads what the pool sent and injects
//! fragments and close frames.

use super::{FragmentData, Transport, TransportConnection, TransportFrame, TransportSink};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct MemoryRelay {
    frames: Option<mpsc::UnboundedSender<TransportFrame>>,
    generation: u64,
    attempts: usize,
    opens: usize,
    sent: Vec<String>,
}

#[derive(Default)]
struct MemoryState {
    relays: HashMap<String, MemoryRelay>,
    refused: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every following `open` for `url` fail.
    pub fn refuse(&self, url: &str) {
        self.lock().refused.insert(url.to_string());
    }

    /// Undo [`MemoryTransport::refuse`].
    pub fn accept(&self, url: &str) {
        self.lock().refused.remove(url);
    }

    /// Number of `open` calls for `url`, refused ones included.
    pub fn open_attempts(&self, url: &str) -> usize {
        self.lock().relays.get(url).map_or(0, |relay| relay.attempts)
    }

    /// Number of successful opens for `url`.
    pub fn open_count(&self, url: &str) -> usize {
        self.lock().relays.get(url).map_or(0, |relay| relay.opens)
    }

    /// Whether the latest connection for `url` is still live on both ends.
    pub fn is_connected(&self, url: &str) -> bool {
        self.lock()
            .relays
            .get(url)
            .and_then(|relay| relay.frames.as_ref())
            .is_some_and(|frames| !frames.is_closed())
    }

    /// Every text sent to `url`, across all of its connections, in order.
    pub fn sent(&self, url: &str) -> Vec<String> {
        self.lock()
            .relays
            .get(url)
            .map(|relay| relay.sent.clone())
            .unwrap_or_default()
    }

    /// [`MemoryTransport::sent`] parsed as JSON; unparsable entries are skipped.
    pub fn sent_json(&self, url: &str) -> Vec<Value> {
        self.sent(url)
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// Deliver one fragment on the live connection for `url`.
    ///
    /// Returns `false` when no live connection exists; the fragment is dropped.
    pub fn push_fragment(&self, url: &str, data: FragmentData, is_final: bool) -> bool {
        self.deliver(url, TransportFrame::Fragment { data, is_final })
    }

    /// Deliver a complete text message on the live connection for `url`.
    pub fn push_text(&self, url: &str, text: impl Into<String>) -> bool {
        self.push_fragment(url, FragmentData::Text(text.into()), true)
    }

    /// Close the live connection for `url` from the relay side.
    pub fn close(&self, url: &str, code: u16, reason: &str) -> bool {
        let delivered = self.deliver(
            url,
            TransportFrame::Closed {
                code,
                reason: reason.to_string(),
            },
        );
        if let Some(relay) = self.lock().relays.get_mut(url) {
            relay.frames = None;
        }
        delivered
    }

    /// Drop the live connection for `url` without a close frame, as a
    /// network failure would.
    pub fn sever(&self, url: &str) -> bool {
        self.lock()
            .relays
            .get_mut(url)
            .and_then(|relay| relay.frames.take())
            .is_some()
    }

    fn deliver(&self, url: &str, frame: TransportFrame) -> bool {
        self.lock()
            .relays
            .get(url)
            .and_then(|relay| relay.frames.as_ref())
            .is_some_and(|frames| frames.send(frame).is_ok())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<TransportConnection> {
        let mut state = self.lock();
        let refused = state.refused.contains(url);
        let relay = state.relays.entry(url.to_string()).or_default();
        relay.attempts += 1;
        if refused {
            return Err(ClientError::Connection(format!("connection refused: {}", url)));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        relay.frames = Some(frames_tx);
        relay.generation += 1;
        relay.opens += 1;

        Ok(TransportConnection {
            sink: Box::new(MemorySink {
                url: url.to_string(),
                generation: relay.generation,
                state: Arc::clone(&self.state),
            }),
            frames: frames_rx,
        })
    }
}

struct MemorySink {
    url: String,
    generation: u64,
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySink {
    fn with_live_relay<T>(&self, apply: impl FnOnce(&mut MemoryRelay) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.relays.get_mut(&self.url) {
            Some(relay) if relay.generation == self.generation && relay.frames.is_some() => {
                Ok(apply(relay))
            }
            _ => Err(ClientError::NotConnected),
        }
    }
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, text: String) -> Result<()> {
        self.with_live_relay(|relay| relay.sent.push(text))
    }

    async fn close(&mut self) -> Result<()> {
        // Closing twice, or after the relay side hung up, is not an error.
        let _ = self.with_live_relay(|relay| relay.frames = None);
        Ok(())
    }
}
