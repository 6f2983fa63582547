//! WebSocket transport over tokio-tungstenite.

use super::{
    ABNORMAL_CLOSURE, FragmentData, Transport, TransportConnection, TransportFrame, TransportSink,
};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// No status code in the close frame.
const NO_STATUS_RECEIVED: u16 = 1005;

/// Opens `ws://` and `wss://` relay connections.
///
/// Connect timeouts are applied by the pool, per relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportConnection> {
        let parsed_url = validate_relay_url(url)?;

        let (stream, _response) = connect_async(parsed_url.as_str())
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (writer, mut reader) = stream.split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let relay_url = parsed_url.to_string();

        let reader_task = tokio::spawn(async move {
            let closed = loop {
                let Some(frame) = reader.next().await else {
                    break TransportFrame::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended without close frame".to_string(),
                    };
                };
                let forwarded = match frame {
                    Ok(Message::Text(text)) => TransportFrame::Fragment {
                        data: FragmentData::Text(text.to_string()),
                        is_final: true,
                    },
                    Ok(Message::Binary(bytes)) => TransportFrame::Fragment {
                        data: FragmentData::Binary(bytes.to_vec()),
                        is_final: true,
                    },
                    Ok(Message::Ping(payload)) => {
                        debug!("received ping from {} ({} bytes)", relay_url, payload.len());
                        continue;
                    }
                    Ok(Message::Pong(_) | Message::Frame(_)) => continue,
                    Ok(Message::Close(close_frame)) => {
                        break match close_frame {
                            Some(close_frame) => TransportFrame::Closed {
                                code: u16::from(close_frame.code),
                                reason: close_frame.reason.to_string(),
                            },
                            None => TransportFrame::Closed {
                                code: NO_STATUS_RECEIVED,
                                reason: String::new(),
                            },
                        };
                    }
                    Err(error) => {
                        break TransportFrame::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: error.to_string(),
                        };
                    }
                };
                if frames_tx.send(forwarded).is_err() {
                    return;
                }
            };
            let _ = frames_tx.send(closed);
        });

        Ok(TransportConnection {
            sink: Box::new(WebSocketSink {
                writer: Some(writer),
                reader_task,
            }),
            frames: frames_rx,
        })
    }
}

struct WebSocketSink {
    writer: Option<WsWriter>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, text: String) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(ClientError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let result = match self.writer.take() {
            Some(mut writer) => writer
                .send(Message::Close(None))
                .await
                .map_err(|error| ClientError::WebSocket(error.to_string())),
            None => Ok(()),
        };
        self.reader_task.abort();
        result
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Parse a relay URL, accepting only WebSocket schemes.
pub fn validate_relay_url(url: &str) -> Result<Url> {
    let parsed_url = Url::parse(url)?;
    if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
        return Err(ClientError::InvalidUrl(format!(
            "URL must use ws:// or wss:// scheme, got: {}",
            parsed_url.scheme()
        )));
    }
    Ok(parsed_url)
}
