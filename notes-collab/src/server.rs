//! Session bootstrap: TCP accept, WebSocket upgrade, admission.
//!
//! Architecture:
//! ```text
//! TCP accept ──► handshake ──────────────► access check ──► run_connection
//!                  │ path  /ws/{note_id}      │ NoteCatalog        │
//!                  │ 404 otherwise            │ policy close       ├── Hub
//!                  │ Authenticator → 401      │ if unreadable      └── OperationApplier
//! ```
//!
//! Everything after admission lives in [`crate::connection`].

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::WebSocketStream;

use crate::auth::{Authenticator, QueryAuthenticator};
use crate::config::ServerConfig;
use crate::connection::{run_connection, ConnectionContext, Identity};
use crate::hub::Hub;
use crate::operation::OperationApplier;
use crate::protocol::{NoteId, ParticipantId};
use crate::storage::{Access, DocumentStore, NoteCatalog, StoreError};

/// Path prefix of the realtime endpoint.
pub const SESSION_PATH_PREFIX: &str = "/ws/";

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Accepts participants and wires them into the hub.
///
/// Cheap to clone; every clone shares the same hub and store.
#[derive(Clone)]
pub struct SessionServer {
    config: ServerConfig,
    hub: Hub,
    catalog: Arc<dyn NoteCatalog>,
    authenticator: Arc<dyn Authenticator>,
    ctx: ConnectionContext,
}

impl SessionServer {
    /// Build a server over a store serving both the realtime and catalog
    /// contracts. Spawns the hub worker, so it must be called inside a
    /// tokio runtime.
    pub fn new<S>(config: ServerConfig, store: Arc<S>) -> Self
    where
        S: DocumentStore + NoteCatalog + 'static,
    {
        let documents: Arc<dyn DocumentStore> = store.clone();
        let catalog: Arc<dyn NoteCatalog> = store;

        let hub = Hub::spawn(Arc::clone(&documents), config.hub_capacity);
        let applier = OperationApplier::new(documents, hub.clone());
        let ctx = ConnectionContext::new(hub.clone(), applier, &config);

        Self {
            config,
            hub,
            catalog,
            authenticator: Arc::new(QueryAuthenticator),
            ctx,
        }
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator + 'static) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener, SessionError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), SessionError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SessionError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(self, stream: TcpStream, addr: SocketAddr) -> Result<(), SessionError> {
        let mut admitted: Option<(NoteId, ParticipantId)> = None;
        let authenticator = Arc::clone(&self.authenticator);

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let Some(note_id) = note_id_from_path(request.uri().path()) else {
                log::debug!("Rejecting {addr}: unknown path {}", request.uri().path());
                return Err(reject(StatusCode::NOT_FOUND, "Unknown endpoint"));
            };
            let participant = authenticator.authenticate(request).map_err(|e| {
                log::debug!("Rejecting {addr}: {e}");
                reject(StatusCode::UNAUTHORIZED, &e.to_string())
            })?;
            admitted = Some((note_id, participant));
            Ok(response)
        };

        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some((note_id, participant)) = admitted else {
            return Ok(());
        };

        let access = if self.config.enforce_access {
            match self.catalog.access(&note_id, participant).await {
                Ok(access) if access.can_read() => access,
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    log::info!("Participant {participant} denied access to note {note_id}");
                    close(&mut ws, CloseCode::Policy, "Access denied").await;
                    return Ok(());
                }
                Err(e) => {
                    close(&mut ws, CloseCode::Error, "Internal error").await;
                    return Err(e.into());
                }
            }
        } else {
            Access::Write
        };

        log::info!("WebSocket session for participant {participant} on note {note_id} from {addr}");
        let identity = Identity {
            note_id,
            participant,
            access,
        };
        run_connection(ws, identity, self.ctx.clone()).await;
        Ok(())
    }
}

/// `/ws/{note_id}` → percent-decoded `note_id`. Nested paths are not sessions.
fn note_id_from_path(path: &str) -> Option<NoteId> {
    let raw = path.strip_prefix(SESSION_PATH_PREFIX)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    let id = urlencoding::decode(raw).ok()?;
    Some(NoteId::from(id.into_owned()))
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

async fn close(ws: &mut WebSocketStream<TcpStream>, code: CloseCode, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        log::debug!("Failed to send close frame: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_note_id_from_path() {
        assert_eq!(note_id_from_path("/ws/abc"), Some(NoteId::from("abc")));
        assert_eq!(note_id_from_path("/ws/42"), Some(NoteId::from(42u64)));
        assert_eq!(note_id_from_path("/ws/"), None);
        assert_eq!(note_id_from_path("/ws/a/b"), None);
        assert_eq!(note_id_from_path("/notes/abc"), None);
    }

    #[test]
    fn test_note_id_from_path_percent_decoded() {
        assert_eq!(note_id_from_path("/ws/my%20note"), Some(NoteId::from("my note")));
        assert_eq!(note_id_from_path("/ws/caf%C3%A9"), Some(NoteId::from("café")));
        // An encoded slash stays inside the id
        assert_eq!(note_id_from_path("/ws/a%2Fb"), Some(NoteId::from("a/b")));
        // '+' is literal in a path
        assert_eq!(note_id_from_path("/ws/a+b"), Some(NoteId::from("a+b")));
        // Not UTF-8 once decoded
        assert_eq!(note_id_from_path("/ws/%FF"), None);
    }

    #[test]
    fn test_reject_response() {
        let response = reject(StatusCode::UNAUTHORIZED, "nope");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SessionServer::new(ServerConfig::default(), Arc::new(MemoryStore::new()));
        assert_eq!(server.config().bind_addr, "127.0.0.1:8080");
        assert_eq!(server.hub().stats().await.rooms, 0);
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            ..ServerConfig::default()
        };
        let server = SessionServer::new(config, Arc::new(MemoryStore::new()));
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
