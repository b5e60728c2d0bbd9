//! Core domain types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Project name, compared case-insensitively.
///
/// The original casing is preserved for display; equality, hashing, and
/// map keys all go through the lowercased form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectName(String);

impl ProjectName {
    /// Create a new project name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The name as entered
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercased key used for uniqueness and routing
    pub fn key(&self) -> String {
        self.0.to_lowercase()
    }
}

impl PartialEq for ProjectName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for ProjectName {}

impl std::hash::Hash for ProjectName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProjectName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProjectName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of an agent session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new session id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation id linking an outbound command to its eventual result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Credential minted by pairing, used for tunnel authentication
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey(pub String);

impl DeviceKey {
    /// Get the raw key string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Key material stays out of Debug output
impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceKey(..{})", &self.0[self.0.len().saturating_sub(4)..])
    }
}
