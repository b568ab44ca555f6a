//! Transport abstraction for the patch channel.
//!
//! The reconciler only needs whole text frames in and out plus a close
//! signal; anything that provides that can carry a model:
//! - [`WebSocketTransport`] — tokio-tungstenite client connection
//! - [`MemoryTransport`] — in-process channel pair, driven by a [`MemoryPeer`]

use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{PatchMessage, ProtocolError};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProtocolError>> + Send + 'a>>;

/// A duplex channel of already-framed text messages.
pub trait Transport: Send {
    /// Send one frame.
    fn send(&mut self, text: String) -> TransportFuture<'_, ()>;

    /// Wait for the next frame.
    ///
    /// Returns `Ok(None)` once the remote has closed the connection.
    /// `ProtocolError::Deserialization` rejects a single undecodable frame;
    /// the connection stays usable. Any other error is fatal.
    fn recv(&mut self) -> TransportFuture<'_, Option<String>>;

    /// Close the connection. Pending frames may be lost.
    fn close(&mut self) -> TransportFuture<'_, ()>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client transport (text frames).
pub struct WebSocketTransport {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    closed: bool,
}

impl WebSocketTransport {
    /// Open a WebSocket connection to `url`.
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| ProtocolError::Transport(e.to_string()))?;
        let (sink, stream) = ws_stream.split();
        log::info!("Connected to {url}");
        Ok(Self {
            sink,
            stream,
            closed: false,
        })
    }
}

impl Transport for WebSocketTransport {
    fn send(&mut self, text: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.sink
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<String>> {
        Box::pin(async move {
            if self.closed {
                return Ok(None);
            }
            loop {
                match self.stream.next().await {
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                    Some(Ok(Message::Binary(data))) => {
                        // Some servers frame JSON as binary
                        let text = String::from_utf8(data.to_vec())
                            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
                        return Ok(Some(text));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.closed = true;
                        return Ok(None);
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        self.closed = true;
                        return Err(ProtocolError::Transport(e.to_string()));
                    }
                }
            }
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            self.sink
                .close()
                .await
                .map_err(|e| ProtocolError::Transport(e.to_string()))
        })
    }
}

/// In-process transport. Frames sent by the peer arrive here and vice versa.
pub struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, ProtocolError>>,
    outbound: Option<mpsc::UnboundedSender<String>>,
}

/// The remote end of a [`MemoryTransport`].
pub struct MemoryPeer {
    inbound: Option<mpsc::UnboundedSender<Result<String, ProtocolError>>>,
    outbound: mpsc::UnboundedReceiver<String>,
}

impl MemoryTransport {
    pub fn pair() -> (MemoryTransport, MemoryPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            MemoryTransport {
                inbound: in_rx,
                outbound: Some(out_tx),
            },
            MemoryPeer {
                inbound: Some(in_tx),
                outbound: out_rx,
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, text: String) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            let tx = self.outbound.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
            tx.send(text).map_err(|_| ProtocolError::ConnectionClosed)
        })
    }

    fn recv(&mut self) -> TransportFuture<'_, Option<String>> {
        Box::pin(async move {
            match self.inbound.recv().await {
                Some(Ok(text)) => Ok(Some(text)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.outbound = None;
            self.inbound.close();
            Ok(())
        })
    }
}

impl MemoryPeer {
    /// Deliver a raw frame to the transport.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.inbound.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Ok(text.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Encode and deliver a message.
    pub fn send(&self, msg: &PatchMessage) -> Result<(), ProtocolError> {
        self.send_text(msg.encode()?)
    }

    /// Make the transport's next `recv` fail with `error`.
    pub fn fail(&self, error: ProtocolError) -> Result<(), ProtocolError> {
        let tx = self.inbound.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(Err(error)).map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection from the remote side.
    pub fn close(&mut self) {
        self.inbound = None;
    }

    /// Next frame sent by the transport, `None` once it has closed.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next frame sent by the transport, decoded.
    pub async fn recv(&mut self) -> Option<Result<PatchMessage, ProtocolError>> {
        self.recv_text().await.map(|text| PatchMessage::decode(&text))
    }
}
