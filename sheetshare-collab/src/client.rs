//! WebSocket client for an edit server.
//!
//! Connects, waits for the `init` handshake and then exchanges JSON
//! frames. Used by the integration tests and handy for scripting a
//! session from Rust.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::{ClientMessage, Handshake, ProtocolError, ServerMessage};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected editor.
pub struct EditorClient {
    writer: SplitSink<Socket, Message>,
    reader: SplitStream<Socket>,
    handshake: Handshake,
}

impl EditorClient {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8000`) and wait for the handshake.
    ///
    /// A server that answers with an `error` frame instead (session full or
    /// already over) yields [`ProtocolError::Rejected`].
    pub async fn connect(url: &str) -> Result<Self, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        let (writer, mut reader) = ws_stream.split();

        let handshake = match Self::next_message(&mut reader).await? {
            ServerMessage::Init(handshake) => handshake,
            ServerMessage::Error { code, message } => {
                return Err(ProtocolError::Rejected { code, message });
            }
            other => return Err(ProtocolError::UnexpectedMessage(other.kind().to_string())),
        };
        log::debug!("Connected to {url} as {}", handshake.user_id);

        Ok(Self {
            writer,
            reader,
            handshake,
        })
    }

    pub fn user_id(&self) -> Uuid {
        self.handshake.user_id
    }

    /// The `init` payload received on connect.
    pub fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let text = msg.encode()?;
        self.writer.send(Message::text(text)).await?;
        Ok(())
    }

    /// Send a raw text frame, bypassing encoding.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ProtocolError> {
        self.writer.send(Message::text(text.to_string())).await?;
        Ok(())
    }

    /// Next server message. Fails with `ConnectionClosed` once the server
    /// has closed the socket.
    pub async fn recv(&mut self) -> Result<ServerMessage, ProtocolError> {
        Self::next_message(&mut self.reader).await
    }

    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<ServerMessage, ProtocolError> {
        tokio::time::timeout(limit, self.recv())
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Skip messages until one of type `kind` arrives.
    pub async fn recv_kind(&mut self, kind: &str, limit: Duration) -> Result<ServerMessage, ProtocolError> {
        let wait = async {
            loop {
                let msg = match self.recv().await {
                    Ok(msg) => msg,
                    Err(e) => return Err(e),
                };
                if msg.kind() == kind {
                    return Ok(msg);
                }
                log::trace!("Skipping {} while waiting for {kind}", msg.kind());
            }
        };
        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ProtocolError::Timeout)?
    }

    /// Close the socket politely.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.writer.send(Message::Close(None)).await?;
        Ok(())
    }

    async fn next_message(reader: &mut SplitStream<Socket>) -> Result<ServerMessage, ProtocolError> {
        while let Some(frame) = reader.next().await {
            match frame? {
                Message::Text(text) => return ServerMessage::decode(text.as_str()),
                Message::Close(_) => return Err(ProtocolError::ConnectionClosed),
                _ => {}
            }
        }
        Err(ProtocolError::ConnectionClosed)
    }
}
