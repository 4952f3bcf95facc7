//! Error taxonomy for the authentication engine.
//!
//! Errors fall into three groups:
//! - per-scheme failures (`MissingCredential`, `UserNotFound`,
//!   `PasswordMismatch`, `InvalidToken`): the request simply is not
//!   authenticated by that scheme
//! - `Configuration`: raised while building the manager or resolving a scheme
//! - `Database` / `Internal`: infrastructure failures, propagated untouched

use std::fmt;

/// Errors that can occur while authenticating a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The request carries no credential for this scheme.
    MissingCredential,

    /// No user matches the supplied identifier or credentials.
    UserNotFound,

    /// A user was found but the password does not verify.
    PasswordMismatch,

    /// The token is malformed, tampered, expired or revoked.
    InvalidToken(String),

    /// Missing or structurally invalid configuration.
    Configuration(String),

    /// The backing store failed.
    Database(String),

    /// Any other internal failure (hashing, signing, serialization).
    Internal(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingCredential => write!(f, "No credentials provided"),
            Self::UserNotFound => write!(f, "User not found"),
            Self::PasswordMismatch => write!(f, "Password mismatch"),
            Self::InvalidToken(msg) => write!(f, "Invalid token: {}", msg),
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Result type for authentication operations.
pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    /// Whether this error only means "this scheme did not authenticate".
    ///
    /// Recoverable errors are turned into `false` by `check()` and are
    /// absorbed by the fallback loop; everything else is propagated.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential
                | Self::UserNotFound
                | Self::PasswordMismatch
                | Self::InvalidToken(_)
        )
    }

    /// HTTP status code a host should answer with.
    pub fn status_code(&self) -> u16 {
        if self.is_recoverable() { 401 } else { 500 }
    }

    /// Create an invalid token error.
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<surrealdb::Error> for AuthError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            // Client side: malformed, tampered or expired tokens
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::ExpiredSignature
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => Self::InvalidToken(err.to_string()),

            // Server side: key material or crypto backend problems
            _ => Self::Internal(format!("JWT: {}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(AuthError::MissingCredential.is_recoverable());
        assert!(AuthError::UserNotFound.is_recoverable());
        assert!(AuthError::PasswordMismatch.is_recoverable());
        assert!(AuthError::invalid_token("expired").is_recoverable());
        assert!(!AuthError::config("no secret").is_recoverable());
        assert!(!AuthError::Database("down".to_string()).is_recoverable());
        assert!(!AuthError::Internal("boom".to_string()).is_recoverable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AuthError::PasswordMismatch.status_code(), 401);
        assert_eq!(AuthError::config("x").status_code(), 500);
    }

    #[test]
    fn test_display() {
        assert_eq!(AuthError::MissingCredential.to_string(), "No credentials provided");
        assert_eq!(
            AuthError::invalid_token("bad signature").to_string(),
            "Invalid token: bad signature"
        );
        assert_eq!(
            AuthError::config("missing secret").to_string(),
            "Configuration error: missing secret"
        );
    }

    #[test]
    fn test_jwt_error_mapping() {
        let err = jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::ExpiredSignature);
        assert!(matches!(AuthError::from(err), AuthError::InvalidToken(_)));

        let err = jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidKeyFormat);
        assert!(matches!(AuthError::from(err), AuthError::Internal(_)));
    }
}
