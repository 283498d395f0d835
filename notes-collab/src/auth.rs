//! Participant identification during the WebSocket handshake.

use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::protocol::ParticipantId;

/// Header consulted when no `user_id` query parameter is present.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the participant behind an upgrade request.
///
/// Runs inside the handshake callback, so implementations must not block.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, request: &Request) -> Result<ParticipantId, AuthError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing participant id")]
    Missing,
    #[error("Invalid participant id: {0:?}")]
    Invalid(String),
}

/// Trusts a `user_id` query parameter, falling back to the `X-User-Id` header.
///
/// Meant to sit behind a gateway that has already verified the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAuthenticator;

impl Authenticator for QueryAuthenticator {
    fn authenticate(&self, request: &Request) -> Result<ParticipantId, AuthError> {
        let from_query = request.uri().query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "user_id")
                .map(|(_, value)| value.into_owned())
        });
        let raw = match from_query {
            Some(value) => value,
            None => request
                .headers()
                .get(USER_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or(AuthError::Missing)?,
        };
        raw.trim().parse().map_err(|_| AuthError::Invalid(raw))
    }
}
