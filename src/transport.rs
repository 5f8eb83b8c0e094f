//! Remote channel to the Live API
//!
//! The socket is split into a read half owned by a reader task and a write
//! half owned by a writer task. Callers never touch the socket: they push
//! [`ClientMessage`]s into an unbounded queue through [`Outbound`], which
//! returns immediately and preserves enqueue order on the wire.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::events::RemoteEvent;
use crate::protocol::{parse_server_message, ClientMessage, Inbound, SetupMessage};

/// Error type for remote channel operations
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Receives lifecycle signals and inbound messages from the channel.
pub type RemoteEventSink = Arc<dyn Fn(RemoteEvent) + Send + Sync>;

/// Non-blocking, order-preserving handle for outbound messages.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Outbound {
    pub fn new(tx: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self { tx }
    }

    /// Queue a message for the writer task.
    pub fn send(&self, msg: ClientMessage) -> Result<(), TransportError> {
        self.tx.send(msg).map_err(|_| TransportError::ConnectionClosed)
    }
}

/// An open duplex session with the remote agent.
pub trait RemoteChannel: Send {
    fn outbound(&self) -> Outbound;

    /// Close the channel. Repeated calls are no-ops.
    fn close(&mut self);
}

/// Opens remote channels.
pub trait Connector: Send + Sync {
    /// Connect and send `setup`. The sink later receives [`RemoteEvent::Open`]
    /// once the server has accepted the setup.
    fn connect(
        &self,
        setup: SetupMessage,
        events: RemoteEventSink,
    ) -> BoxFuture<'static, Result<Box<dyn RemoteChannel>, TransportError>>;
}

/// WebSocket connector for the Gemini Live API.
#[derive(Debug, Clone)]
pub struct GeminiConnector {
    url: String,
}

impl GeminiConnector {
    pub fn new(url: &str) -> Self {
        Self { url: url.to_string() }
    }
}

impl Connector for GeminiConnector {
    fn connect(
        &self,
        setup: SetupMessage,
        events: RemoteEventSink,
    ) -> BoxFuture<'static, Result<Box<dyn RemoteChannel>, TransportError>> {
        let url = self.url.clone();
        Box::pin(async move {
            info!("Connecting to Live API with model {}", setup.model);
            let (ws_stream, resp) = connect_async(&url).await?;
            debug!("WebSocket connection response: {:?}", resp.status());

            let (mut sink, mut stream) = ws_stream.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

            // Setup must be the first frame on the wire.
            tx.send(ClientMessage::Setup(setup))
                .map_err(|_| TransportError::ConnectionClosed)?;

            let writer_events = events.clone();
            let writer = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    let json = match msg.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize outbound message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(json)).await {
                        error!("Failed to send message: {:?}", e);
                        writer_events(RemoteEvent::Error(e.to_string()));
                        return;
                    }
                }
                debug!("Outbound queue closed, closing socket");
                let _ = sink.close().await;
            });

            let reader = tokio::spawn(async move {
                info!("Inbound message task started");
                while let Some(message_result) = stream.next().await {
                    match message_result {
                        Ok(Message::Text(text)) => dispatch(&text, &events),
                        Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                            Ok(text) => dispatch(text, &events),
                            Err(_) => debug!("Ignoring binary message ({} bytes)", bytes.len()),
                        },
                        Ok(Message::Close(frame)) => {
                            info!("WebSocket closed: {:?}", frame);
                            events(RemoteEvent::Closed(frame.map(|f| f.reason.as_str().to_string())));
                            return;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!("WebSocket error: {:?}", e);
                            events(RemoteEvent::Error(e.to_string()));
                            return;
                        }
                    }
                }
                events(RemoteEvent::Closed(None));
            });

            info!("Connected to Live API");
            Ok(Box::new(GeminiChannel {
                tx: Some(tx),
                reader,
                _writer: writer,
            }) as Box<dyn RemoteChannel>)
        })
    }
}

fn dispatch(text: &str, events: &RemoteEventSink) {
    for inbound in parse_server_message(text) {
        match inbound {
            Inbound::SetupComplete => {
                info!("Live session setup complete");
                events(RemoteEvent::Open);
            }
            Inbound::GoAway => {
                warn!("Server announced disconnect");
                events(RemoteEvent::Message(Inbound::GoAway));
            }
            other => events(RemoteEvent::Message(other)),
        }
    }
}

struct GeminiChannel {
    tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl RemoteChannel for GeminiChannel {
    fn outbound(&self) -> Outbound {
        match &self.tx {
            Some(tx) => Outbound::new(tx.clone()),
            // A sender whose receiver is already gone: every send fails.
            None => Outbound::new(mpsc::unbounded_channel().0),
        }
    }

    fn close(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        // The writer flushes what is queued, then closes the socket once
        // every outstanding `Outbound` clone is gone.
        self.reader.abort();
        info!("Remote channel closed");
    }
}

impl Drop for GeminiChannel {
    fn drop(&mut self) {
        self.close();
    }
}
