//! Core value types shared across the ingestion manager

use serde::{Deserialize, Serialize};

/// Opaque fingerprint a connector produces for a stage specification at a
/// point in time. Two equal version contexts mean "the stage would process
/// documents identically"; any difference forces a reindex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionContext(String);

impl VersionContext {
    pub fn new(version: impl Into<String>) -> Self {
        VersionContext(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionContext {
    fn from(s: &str) -> Self {
        VersionContext(s.to_string())
    }
}

/// Opaque configuration document handed to a connector when asking it to
/// describe a stage. Connectors interpret it; the ingestion manager does not.
pub type Specification = serde_json::Value;

/// Key identifying one (document, output connection) pair across the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputKey {
    /// Name of the identifier space the hash lives in.
    pub identifier_class: String,
    /// Hashed repository document identifier.
    pub identifier_hash: String,
    /// Downstream index the document was (or would be) delivered to.
    pub output_connection: String,
}

impl OutputKey {
    pub fn new(
        identifier_class: impl Into<String>,
        identifier_hash: impl Into<String>,
        output_connection: impl Into<String>,
    ) -> Self {
        OutputKey {
            identifier_class: identifier_class.into(),
            identifier_hash: identifier_hash.into(),
            output_connection: output_connection.into(),
        }
    }
}

/// Version fingerprints recorded for a document at one output, as of the
/// last successful record or ingest. Columns that were NULL in storage come
/// back as empty strings here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentIngestStatus {
    pub document_version: String,
    pub transformation_version: String,
    pub output_version: String,
    pub parameter_version: String,
    pub authority_name: String,
}

/// Build the storage key for a document: the identifier-space name joined
/// with the identifier hash. The pair is what makes hashes from different
/// repositories non-colliding.
pub fn make_doc_key(identifier_class: &str, identifier_hash: &str) -> String {
    format!("{identifier_class}:{identifier_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_doc_key() {
        assert_eq!(make_doc_key("web", "abc123"), "web:abc123");
    }

    #[test]
    fn test_output_key_equality() {
        let a = OutputKey::new("web", "h1", "solr");
        let b = OutputKey::new("web", "h1", "solr");
        let c = OutputKey::new("web", "h1", "elastic");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_version_context_display() {
        let v = VersionContext::new("v42");
        assert_eq!(v.to_string(), "v42");
        assert_eq!(v.as_str(), "v42");
    }
}
