//! WebSocket transport for an [`EditSession`].
//!
//! ```text
//! Editor A ──┐
//!             ├── connection task ── EditSession ── BroadcastBus
//! Editor B ──┘   (one per socket)        │
//!                                        ├──► outbound queue A ──► socket A
//!                                        └──► outbound queue B ──► socket B
//! ```
//!
//! Each accepted socket gets its own task that `select!`s between inbound
//! frames (handed to the session) and its outbound queue (written to the
//! socket). The accept loop stops once the session ends; open connections
//! drain their final `session_ended` frame and close, and [`EditServer::serve`]
//! returns only after they have (or after [`SHUTDOWN_GRACE`]).

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::ProtocolError;
use crate::session::{EditSession, EditorConnection, SessionConfig, SessionMode};
use sheetshare_core::Table;

/// How long [`EditServer::serve`] waits for open connections to flush
/// their last frames once the session has ended.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum simultaneous editors (collaborative mode)
    pub max_editors: usize,
    /// Outbound queue depth per editor
    pub outbound_capacity: usize,
    /// Coerce cell edits to column types
    pub strict_types: bool,
    pub mode: SessionMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            max_editors: 100,
            outbound_capacity: 256,
            strict_types: true,
            mode: SessionMode::Collaborative,
        }
    }
}

impl ServerConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            mode: self.mode,
            strict_types: self.strict_types,
            max_editors: self.max_editors,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Sockets turned away (session full or ended)
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionPhase {
    Connecting,
    Active,
    Disconnected,
}

/// Serves one editing session over WebSocket.
pub struct EditServer {
    config: ServerConfig,
    session: Arc<EditSession>,
    stats: Arc<RwLock<ServerStats>>,
}

impl EditServer {
    /// Start a session over `table`.
    pub fn new(config: ServerConfig, table: Table) -> Self {
        let session = Arc::new(EditSession::new(table, config.session_config()));
        Self::with_session(config, session)
    }

    /// Serve an existing session.
    pub fn with_session(config: ServerConfig, session: Arc<EditSession>) -> Self {
        Self {
            config,
            session,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn session(&self) -> &Arc<EditSession> {
        &self.session
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the session ends.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Edit server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the session ends, then wait
    /// for the open connections to close.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut ended = self.session.completion().subscribe();
        if self.session.is_ended() {
            return Ok(());
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let session = self.session.clone();
                    let stats = self.stats.clone();
                    connections.spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, addr, session, stats).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        log::error!("Connection task failed: {e}");
                    }
                }
                changed = ended.changed() => {
                    if changed.is_err() || ended.borrow().is_some() {
                        break;
                    }
                }
            }
        }

        log::info!("Session over, waiting for {} connection(s) to close", connections.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = connections.join_next().await {
                if let Err(e) = joined {
                    log::error!("Connection task failed: {e}");
                }
            }
        })
        .await;
        if drained.is_err() {
            log::warn!("Dropping {} connection(s) still open after {SHUTDOWN_GRACE:?}", connections.len());
            connections.abort_all();
        }
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        session: Arc<EditSession>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ProtocolError> {
        let mut phase = ConnectionPhase::Connecting;
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.write().await.total_connections += 1;
        log::debug!("WebSocket handshake with {addr} done ({phase:?})");

        let EditorConnection { editor_id, mut outbound } = match session.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("Refused editor from {addr}: {e}");
                stats.write().await.rejected_connections += 1;
                let frame = e.to_message().encode()?;
                ws_sender.send(Message::text(frame)).await?;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };
        phase = ConnectionPhase::Active;
        stats.write().await.active_connections += 1;
        log::info!("Editor {editor_id} connected from {addr} ({phase:?})");

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.as_str().len() as u64;
                            }
                            if let Err(e) = session.handle_text(editor_id, text.as_str()).await {
                                log::debug!("Request from {editor_id} rejected: {e}");
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            log::warn!("Ignoring {} byte binary frame from {addr}", data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if ws_sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                                log::warn!("Failed to write to {addr}: {e}");
                                break;
                            }
                        }
                        None => {
                            // Session ended or the editor was removed.
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }

        phase = ConnectionPhase::Disconnected;
        session.disconnect(editor_id).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::debug!("Editor {editor_id} from {addr} is {phase:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8000");
        assert_eq!(config.max_editors, 100);
        assert_eq!(config.outbound_capacity, 256);
        assert!(config.strict_types);
        assert_eq!(config.mode, SessionMode::Collaborative);
    }

    #[test]
    fn test_session_config_follows_server_config() {
        let config = ServerConfig {
            mode: SessionMode::Solo,
            strict_types: false,
            ..ServerConfig::default()
        };
        let session = config.session_config();
        assert_eq!(session.mode, SessionMode::Solo);
        assert!(!session.strict_types);
        assert_eq!(session.editor_limit(), 1);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = EditServer::new(ServerConfig::default(), Table::default());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_connections, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_serve_returns_once_session_ends() {
        let server = EditServer::new(ServerConfig::default(), Table::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let session = server.session().clone();
        let handle = tokio::spawn(async move { server.serve(listener).await });

        session.shutdown().await.unwrap();
        let served = tokio::time::timeout(std::time::Duration::from_secs(2), handle).await;
        assert!(served.unwrap().unwrap().is_ok());
    }
}
