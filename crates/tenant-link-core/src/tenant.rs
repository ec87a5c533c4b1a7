//! Tenant and credential record identifiers.

use std::{borrow::Borrow, fmt};

use serde::{Deserialize, Serialize};

/// Opaque tenant identifier.
///
/// Every registry entry, credential record and event channel is keyed by one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Key of one credential record within a tenant.
///
/// Composed as `category` alone or `category-id` when an id is given, e.g.
/// `creds`, `pre-key-17`, `session-6281234567890.0`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    /// Category holding the primary credential set.
    pub const CREDS: &'static str = "creds";

    /// Compose a key from a category and optional id.
    #[must_use]
    pub fn new(category: &str, id: Option<&str>) -> Self {
        match id {
            Some(id) => Self(format!("{category}-{id}")),
            None => Self(category.to_owned()),
        }
    }

    /// The primary `creds` key.
    #[must_use]
    pub fn creds() -> Self {
        Self(Self::CREDS.to_owned())
    }

    /// Borrow the composed key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
