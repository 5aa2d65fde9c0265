//! Type-safe identifiers for Warden resources.
//!
//! These types keep the different kinds of names apart: an [`ObjectKey`]
//! addresses one stored object, an [`IssuerRef`] is what a request says
//! about the issuer it wants, and a [`PassId`] tags the log lines of a
//! single reconciliation pass.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// API group of the issuers shipped with Warden.
pub const DEFAULT_ISSUER_GROUP: &str = "warden.io";

/// Kind used when an issuer reference leaves it out.
pub const DEFAULT_ISSUER_KIND: &str = "Issuer";

/// Identity of a stored object: kind, namespace and name.
///
/// Work queues deduplicate on this key and events are recorded against it.
/// Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of an object of another kind in the same namespace.
    pub fn sibling(&self, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(kind, self.namespace.clone(), name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Reference from a request to the issuer that should sign it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerRef {
    pub name: String,
    #[serde(default = "default_issuer_kind")]
    pub kind: String,
    #[serde(default = "default_issuer_group")]
    pub group: String,
}

fn default_issuer_kind() -> String {
    DEFAULT_ISSUER_KIND.to_string()
}

fn default_issuer_group() -> String {
    DEFAULT_ISSUER_GROUP.to_string()
}

impl IssuerRef {
    /// Reference to a Warden `Issuer` by name.
    pub fn issuer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: default_issuer_kind(),
            group: default_issuer_group(),
        }
    }

    /// Key of the referenced issuer when resolved from `namespace`.
    pub fn key_in(&self, namespace: &str) -> ObjectKey {
        ObjectKey::new(self.kind.clone(), namespace, self.name.clone())
    }
}

impl fmt::Display for IssuerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.kind, self.group, self.name)
    }
}

/// Unique ID of one reconciliation pass, used for log correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PassId(String);

impl PassId {
    /// Create a new random pass ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_display() {
        let namespaced = ObjectKey::new("Certificate", "web", "frontend");
        assert_eq!(namespaced.to_string(), "Certificate/web/frontend");

        let cluster = ObjectKey::new("Issuer", "", "letsencrypt");
        assert_eq!(cluster.to_string(), "Issuer/letsencrypt");
    }

    #[test]
    fn test_issuer_ref_defaults() {
        let parsed: IssuerRef = serde_json::from_str(r#"{"name":"le-staging"}"#).unwrap();
        assert_eq!(parsed, IssuerRef::issuer("le-staging"));
        assert_eq!(parsed.key_in("web"), ObjectKey::new("Issuer", "web", "le-staging"));
    }

    #[test]
    fn test_pass_ids_are_unique() {
        let a = PassId::new();
        let b = PassId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 12);
    }
}
