//! Request identities.
//!
//! A request id is both the externally visible response `id` and the key the
//! text engine uses to multiplex concurrent generations.

use std::fmt;

use uuid::Uuid;

/// Number of hex characters taken from a v4 UUID.
const SUFFIX_LEN: usize = 12;

/// Opaque per-request correlation token (`chatcmpl-…` or `cmpl-…`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// New identity for a chat completion.
    pub fn chat() -> Self {
        Self::with_prefix("chatcmpl")
    }

    /// New identity for a text completion.
    pub fn completion() -> Self {
        Self::with_prefix("cmpl")
    }

    fn with_prefix(prefix: &str) -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(format!("{prefix}-{}", &hex[..SUFFIX_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
