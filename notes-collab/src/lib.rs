//! # notes-collab: Real-time collaborative notes hub
//!
//! Participants open a WebSocket per document. Edits are applied to the
//! stored document one at a time per document and fanned out to everyone
//! viewing it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  /ws/{note_id}  ┌───────────────┐  register   ┌─────────────┐
//! │ Participant │ ◄─────────────► │ SessionServer │ ──────────► │ Hub worker  │
//! │ (browser)   │   JSON frames   │  Connection   │             │ (rooms)     │
//! └─────────────┘                 └───────┬───────┘             └──────▲──────┘
//!                                         │ operation                  │ broadcast
//!                                         ▼                            │
//!                                 ┌───────────────┐  load/save  ┌──────┴──────┐
//!                                 │ Operation     │ ──────────► │ Document    │
//!                                 │ Applier       │             │ Store       │
//!                                 │ (note locks)  │             └─────────────┘
//!                                 └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes (`sync`, `operation`, `cursor`) and edits
//! - [`operation`]: content transition, per-document locks, the applier
//! - [`hub`]: room registry actor with bounded fan-out
//! - [`connection`]: reader/writer loops of one socket
//! - [`server`]: handshake, authentication, access control
//! - [`storage`]: document store and catalog contracts, in-memory and RocksDB backends
//! - [`config`]: server configuration

pub mod auth;
pub mod config;
pub mod connection;
pub mod hub;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Authenticator, QueryAuthenticator};
pub use config::{ConfigError, ServerConfig};
pub use connection::{run_connection, ConnectionContext, Identity};
pub use hub::{ConnectionId, Frame, Hub, HubStats, Peer};
pub use operation::{apply, ApplyError, NoteLocks, OperationApplier};
pub use protocol::{Edit, EditKind, Envelope, NoteId, ParticipantId, ProtocolError, Route};
pub use server::{SessionError, SessionServer};
pub use storage::{
    Access, Collaborator, DocumentState, DocumentStore, MemoryStore, Note, NoteCatalog,
    NoteChanges, OperationRecord, Permission, RocksStore, StoreConfig, StoreError,
};
