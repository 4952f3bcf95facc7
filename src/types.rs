//! NewType wrappers for the identifiers that flow through the auth engine.
//!
//! These keep scheme names, user identifiers and token material from being
//! mixed up (e.g. passing a plaintext token where a hash is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Name of a configured scheme (e.g. "session", "api").
    ///
    /// This is the key used in the auth configuration document, not the
    /// scheme kind: two schemes of the same kind can be configured under
    /// different names.
    SchemeName
);

newtype_string!(
    /// Normalized user identifier.
    ///
    /// Whatever the backing store uses as a primary key (string or number)
    /// is normalized to its string form when embedded in tokens or sessions.
    UserIdentifier
);

newtype_string!(
    /// Server-side lookup id of a persisted token.
    ///
    /// Distinct from the secret half of an opaque token: knowing the lookup
    /// id alone does not authenticate anything.
    TokenLookupId
);

newtype_string!(
    /// SHA-256 hex digest of a token secret (never the plaintext).
    TokenHash
);

impl UserIdentifier {
    /// Normalize a JSON value into an identifier.
    ///
    /// Only strings and numbers are accepted; anything else is not a usable key.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}
