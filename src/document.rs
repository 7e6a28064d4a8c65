//! Knowledge-base document shapes shared across the ingestion and query paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar metadata attached to documents and returned with search hits.
pub type Metadata = serde_json::Map<String, Value>;

/// A knowledge-base document awaiting ingestion or returned from the index.
///
/// Immutable once stored except for full replacement under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique document identifier.
    pub id: String,
    /// Full document text; embedded on ingestion and stored as metadata.
    pub text: String,
    /// Caller-supplied scalar metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// One similarity hit produced by a query. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Matched document id.
    pub id: String,
    /// Cosine similarity in `[-1, 1]`, as reported by the index.
    pub score: f32,
    /// Stored document text.
    pub text: String,
    /// Stored metadata (includes the text copy the index keeps).
    pub metadata: Metadata,
}
