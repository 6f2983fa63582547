//! Transport seam between the pool and the byte stream that carries relay traffic.
//!
//! A transport opens a connection and hands back a [`TransportSink`] for
//! outbound text plus a channel of [`TransportFrame`]s. Fragments may arrive
//! split across several frames; only the frame with `is_final` set completes
//! a message. Every connection ends with exactly one `Closed` frame, or with
//! the channel simply ending, which the pool treats as an abnormal closure.

mod memory;
mod websocket;

pub use memory::MemoryTransport;
pub use websocket::{WebSocketTransport, validate_relay_url};

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Close status reserved for connections dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close status sent when the local side ends the connection.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Payload of one inbound fragment as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentData {
    Text(String),
    Binary(Vec<u8>),
}

impl FragmentData {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Inbound event from an open transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Fragment { data: FragmentData, is_final: bool },
    Closed { code: u16, reason: String },
}

/// Outbound half of an open transport.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// An open transport: the sink and the inbound frame channel.
pub struct TransportConnection {
    pub sink: Box<dyn TransportSink>,
    pub frames: mpsc::UnboundedReceiver<TransportFrame>,
}

/// Opens relay connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<TransportConnection>;
}
