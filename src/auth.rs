//! Auth collaborator — bearer credentials for the push transport.
//!
//! Token issuance lives elsewhere; this crate only consumes credentials.
//! The sync channel asks for a token at connect time and asks for a refresh
//! when the server flags the credential expired mid-stream. A refresh
//! failure ends the session — the caller must re-authenticate and start a
//! fresh one.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The server rejected the credential outright.
    #[error("credential rejected: {0}")]
    Rejected(String),
    /// This provider cannot mint a fresh credential.
    #[error("credential refresh unavailable")]
    RefreshUnavailable,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Current bearer token.
    async fn bearer_token(&self) -> Result<String, AuthError>;

    /// Force a refresh after the server flagged the token expired.
    /// Returns the new token.
    async fn refresh(&self) -> Result<String, AuthError>;
}

/// Fixed token supplied via CLI flag or environment. Cannot refresh, so
/// expiry mid-stream ends the session.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn bearer_token(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }

    async fn refresh(&self) -> Result<String, AuthError> {
        Err(AuthError::RefreshUnavailable)
    }
}
