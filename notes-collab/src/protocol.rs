//! JSON envelope protocol for the realtime channel.
//!
//! Wire format (one JSON object per WebSocket text frame):
//! ```text
//! ┌───────────┬─────────┬─────────┬───────────────────────────────────────┐
//! │ type      │ note_id │ user_id │ payload                               │
//! ├───────────┼─────────┼─────────┼───────────────────────────────────────┤
//! │ sync      │ string  │ integer │ content (string), version (integer)   │
//! │ operation │ string  │ integer │ operation (object), version (integer) │
//! │ cursor    │ string  │ integer │ data (opaque JSON)                    │
//! └───────────┴─────────┴─────────┴───────────────────────────────────────┘
//! ```
//!
//! `note_id` is accepted as either a JSON string or integer and always
//! written back as a string. `note_id` and `user_id` supplied by a client are
//! overwritten by the server before anything is relayed (see [`Envelope::stamp`]).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Authenticated participant identity.
pub type ParticipantId = u64;

/// Document identity. Also the identity of the room viewing it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NoteId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for NoteId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for NoteId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        // Binary storage formats are not self-describing; they always hold a string.
        if !deserializer.is_human_readable() {
            return String::deserialize(deserializer).map(NoteId);
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => NoteId(s),
            Raw::Number(n) => NoteId(n.to_string()),
        })
    }
}

/// A single content mutation. Positions and lengths count characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Edit {
    Insert {
        position: usize,
        #[serde(default)]
        content: String,
    },
    Delete {
        position: usize,
        #[serde(default)]
        length: usize,
    },
    /// No content change; carried for cursor bookkeeping.
    Retain { position: usize },
}

impl Edit {
    pub fn kind(&self) -> EditKind {
        match self {
            Edit::Insert { .. } => EditKind::Insert,
            Edit::Delete { .. } => EditKind::Delete,
            Edit::Retain { .. } => EditKind::Retain,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Edit::Insert { position, .. }
            | Edit::Delete { position, .. }
            | Edit::Retain { position } => *position,
        }
    }
}

/// Edit discriminant, as recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Insert,
    Delete,
    Retain,
}

impl EditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EditKind::Insert => "insert",
            EditKind::Delete => "delete",
            EditKind::Retain => "retain",
        }
    }
}

/// Top-level realtime message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Full snapshot, server to client only, sent once on join.
    Sync {
        #[serde(default)]
        note_id: NoteId,
        #[serde(default)]
        user_id: ParticipantId,
        content: String,
        version: u64,
    },
    /// An edit. `version` is the document version after it was applied.
    Operation {
        #[serde(default)]
        note_id: NoteId,
        #[serde(default)]
        user_id: ParticipantId,
        operation: Edit,
        #[serde(default)]
        version: u64,
    },
    /// Ephemeral presence, relayed verbatim and never persisted.
    Cursor {
        #[serde(default)]
        note_id: NoteId,
        #[serde(default)]
        user_id: ParticipantId,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Routing header of an encoded envelope; the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub note_id: NoteId,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub version: Option<u64>,
}

impl Route {
    /// Version of an `operation` envelope; `None` for every other type.
    pub fn operation_version(&self) -> Option<u64> {
        if self.kind == "operation" {
            self.version
        } else {
            None
        }
    }
}

impl Envelope {
    pub fn sync(
        note_id: NoteId,
        user_id: ParticipantId,
        content: impl Into<String>,
        version: u64,
    ) -> Self {
        Envelope::Sync {
            note_id,
            user_id,
            content: content.into(),
            version,
        }
    }

    pub fn operation(note_id: NoteId, user_id: ParticipantId, operation: Edit, version: u64) -> Self {
        Envelope::Operation {
            note_id,
            user_id,
            operation,
            version,
        }
    }

    pub fn cursor(note_id: NoteId, user_id: ParticipantId, data: serde_json::Value) -> Self {
        Envelope::Cursor {
            note_id,
            user_id,
            data,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Sync { .. } => "sync",
            Envelope::Operation { .. } => "operation",
            Envelope::Cursor { .. } => "cursor",
        }
    }

    pub fn note_id(&self) -> &NoteId {
        match self {
            Envelope::Sync { note_id, .. }
            | Envelope::Operation { note_id, .. }
            | Envelope::Cursor { note_id, .. } => note_id,
        }
    }

    pub fn user_id(&self) -> ParticipantId {
        match self {
            Envelope::Sync { user_id, .. }
            | Envelope::Operation { user_id, .. }
            | Envelope::Cursor { user_id, .. } => *user_id,
        }
    }

    /// Overwrite routing and attribution with the connection's own identity.
    pub fn stamp(&mut self, note: &NoteId, participant: ParticipantId) {
        match self {
            Envelope::Sync { note_id, user_id, .. }
            | Envelope::Operation { note_id, user_id, .. }
            | Envelope::Cursor { note_id, user_id, .. } => {
                *note_id = note.clone();
                *user_id = participant;
            }
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Deserialization)
    }
}

/// Read the routing header of an encoded envelope without decoding the payload.
pub fn route(frame: &str) -> Result<Route, ProtocolError> {
    serde_json::from_str(frame).map_err(ProtocolError::Deserialization)
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_operation_frame() {
        let frame = r#"{"type":"operation","note_id":"7","operation":{"type":"insert","position":3,"content":"hi"}}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.kind(), "operation");
        assert_eq!(env.note_id().as_str(), "7");
        assert_eq!(env.user_id(), 0);
        match env {
            Envelope::Operation { operation, version, .. } => {
                assert_eq!(
                    operation,
                    Edit::Insert {
                        position: 3,
                        content: "hi".into()
                    }
                );
                assert_eq!(version, 0);
            }
            other => panic!("Expected operation, got {other:?}"),
        }
    }

    #[test]
    fn test_integer_note_id_accepted() {
        let frame = r#"{"type":"cursor","note_id":42,"user_id":5,"data":{"line":1}}"#;
        let env = Envelope::decode(frame).unwrap();
        assert_eq!(env.note_id(), &NoteId::from(42u64));

        // Always written back as a string
        let encoded = env.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["note_id"], json!("42"));
    }

    #[test]
    fn test_stamp_overwrites_client_identity() {
        let mut env = Envelope::cursor(NoteId::from("other"), 999, json!({"x": 1}));
        env.stamp(&NoteId::from("mine"), 3);
        assert_eq!(env.note_id().as_str(), "mine");
        assert_eq!(env.user_id(), 3);
    }

    #[test]
    fn test_sync_wire_shape() {
        let env = Envelope::sync(NoteId::from("n1"), 8, "hello", 4);
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], json!("sync"));
        assert_eq!(value["note_id"], json!("n1"));
        assert_eq!(value["content"], json!("hello"));
        assert_eq!(value["version"], json!(4));
    }

    #[test]
    fn test_operation_wire_shape() {
        let env = Envelope::operation(
            NoteId::from("n1"),
            2,
            Edit::Delete {
                position: 1,
                length: 3,
            },
            9,
        );
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["operation"]["type"], json!("delete"));
        assert_eq!(value["operation"]["length"], json!(3));
        assert_eq!(value["version"], json!(9));
        assert_eq!(value["user_id"], json!(2));
    }

    #[test]
    fn test_delete_length_defaults_to_zero() {
        let edit: Edit = serde_json::from_str(r#"{"type":"delete","position":2}"#).unwrap();
        assert_eq!(
            edit,
            Edit::Delete {
                position: 2,
                length: 0
            }
        );
    }

    #[test]
    fn test_retain_ignores_extra_fields() {
        let edit: Edit =
            serde_json::from_str(r#"{"type":"retain","position":5,"length":2}"#).unwrap();
        assert_eq!(edit, Edit::Retain { position: 5 });
        assert_eq!(edit.kind(), EditKind::Retain);
        assert_eq!(edit.position(), 5);
    }

    #[test]
    fn test_route_reads_only_header() {
        let frame = r#"{"type":"whatever","note_id":"abc","extra":[1,2,3]}"#;
        let route = route(frame).unwrap();
        assert_eq!(route.note_id.as_str(), "abc");
        assert_eq!(route.kind, "whatever");
        assert_eq!(route.operation_version(), None);
    }

    #[test]
    fn test_route_missing_note_id_is_empty() {
        assert!(route(r#"{"type":"cursor"}"#).unwrap().note_id.is_empty());
    }

    #[test]
    fn test_route_operation_version() {
        let op = Envelope::operation(NoteId::from("n"), 1, Edit::Retain { position: 0 }, 6);
        assert_eq!(route(&op.encode().unwrap()).unwrap().operation_version(), Some(6));

        // A sync carries a version too, but it is not an operation
        let sync = Envelope::sync(NoteId::from("n"), 1, "", 6);
        let route = route(&sync.encode().unwrap()).unwrap();
        assert_eq!(route.version, Some(6));
        assert_eq!(route.operation_version(), None);
    }

    #[test]
    fn test_decode_invalid_frames() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"type":"teleport","note_id":"1"}"#).is_err());
        // operation envelope without an operation body
        assert!(Envelope::decode(r#"{"type":"operation","note_id":"1"}"#).is_err());
        assert!(Envelope::decode(
            r#"{"type":"operation","operation":{"type":"insert","position":-1}}"#
        )
        .is_err());
        assert!(route("[1,2").is_err());
    }

    #[test]
    fn test_edit_kind_names() {
        assert_eq!(EditKind::Insert.as_str(), "insert");
        assert_eq!(EditKind::Delete.as_str(), "delete");
        assert_eq!(EditKind::Retain.as_str(), "retain");
    }
}
