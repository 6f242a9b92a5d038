//! Request-level error taxonomy.
//!
//! Every error a handler can surface maps to one HTTP status plus a stable
//! machine-readable reason string. Dispute broadcast failures never appear
//! here: they are persisted on the dispute attempt row instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchtowerError {
    /// Malformed inputs: bad hex lengths, non-uint fields, invalid principals.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The signature verifier rejected the submitted state.
    #[error("signature rejected: {0}")]
    SignatureInvalid(String),

    /// Watchlist enforcement: the principal is not watched by this node.
    #[error("principal not watched: {0}")]
    PrincipalNotWatched(String),

    /// Policy gate in the upsert or co-sign path.
    #[error("policy violation: {reason}")]
    Policy { status: u16, reason: String },

    /// Co-signing is not configured or the signer backend is unavailable.
    #[error("co-signer unavailable: {0}")]
    CoSigner(String),

    /// The underlying store refused a read or write.
    #[error("state store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The ingest payload could not be decoded.
    #[error("ingest error: {0}")]
    Ingest(String),
}

impl WatchtowerError {
    /// Conflict-style policy rejection (409).
    pub fn conflict(reason: impl Into<String>) -> Self {
        WatchtowerError::Policy {
            status: 409,
            reason: reason.into(),
        }
    }

    /// Forbidden-style policy rejection (403).
    pub fn forbidden(reason: impl Into<String>) -> Self {
        WatchtowerError::Policy {
            status: 403,
            reason: reason.into(),
        }
    }

    /// HTTP status code for this error kind.
    pub fn status(&self) -> u16 {
        match self {
            WatchtowerError::Validation(_) => 400,
            WatchtowerError::SignatureInvalid(_) => 401,
            WatchtowerError::PrincipalNotWatched(_) => 403,
            WatchtowerError::Policy { status, .. } => *status,
            WatchtowerError::CoSigner(_) => 503,
            WatchtowerError::Store(_) => 500,
            WatchtowerError::Ingest(_) => 400,
        }
    }

    /// Stable reason string for the JSON error body.
    pub fn reason(&self) -> String {
        match self {
            WatchtowerError::Validation(msg) => msg.clone(),
            WatchtowerError::SignatureInvalid(msg) => msg.clone(),
            WatchtowerError::PrincipalNotWatched(principal) => {
                format!("principal-not-watched: {principal}")
            }
            WatchtowerError::Policy { reason, .. } => reason.clone(),
            WatchtowerError::CoSigner(msg) => msg.clone(),
            WatchtowerError::Store(err) => format!("state-store: {err}"),
            WatchtowerError::Ingest(msg) => msg.clone(),
        }
    }
}

pub type Result<T, E = WatchtowerError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(WatchtowerError::Validation("x".into()).status(), 400);
        assert_eq!(WatchtowerError::SignatureInvalid("x".into()).status(), 401);
        assert_eq!(
            WatchtowerError::PrincipalNotWatched("SP1".into()).status(),
            403
        );
        assert_eq!(WatchtowerError::conflict("nonce-too-low").status(), 409);
        assert_eq!(
            WatchtowerError::forbidden("counterparty-balance-decrease").status(),
            403
        );
        assert_eq!(WatchtowerError::CoSigner("off".into()).status(), 503);
        assert_eq!(WatchtowerError::Ingest("bad".into()).status(), 400);
    }

    #[test]
    fn policy_reason_is_verbatim() {
        let err = WatchtowerError::conflict("unknown-pipe-state");
        assert_eq!(err.reason(), "unknown-pipe-state");
    }
}
