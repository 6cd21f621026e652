//! Core data model: memories, embedding rows, system-state entries, label
//! tokens, and the OAuth record shapes persisted under `system_state`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `state.embedding_tables`: table name -> model names that populated it.
pub type EmbeddingTables = HashMap<String, Vec<String>>;

/// The canonical memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Monotonically increasing, process-wide unique primary key.
    pub id: i64,
    /// Client-facing ID, unique within `namespace`, sequential starting at 1.
    pub content_id: i64,
    /// Opaque byte string: UTF-8 plaintext, or a ciphertext envelope when
    /// `enc` is true. Kept as raw bytes so a ciphertext blob round-trips
    /// exactly; callers decode/decrypt at the presentation layer.
    pub content: Vec<u8>,
    /// True if `content` is a ciphertext envelope (see `crate::encryption`).
    pub enc: bool,
    pub namespace: String,
    /// Ordered, duplicate-free.
    pub labels: Vec<String>,
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub state: MemoryState,
}

/// Structured metadata attached to a memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub embedding_tables: EmbeddingTables,
}

/// A row in a per-dimension `memory_<D>` table.
#[derive(Debug, Clone)]
pub struct EmbeddingRow {
    pub memory_id: i64,
    pub embedding: Vec<f32>,
    pub namespace: String,
    pub embedding_model: String,
}

/// A scored match produced by semantic `retrieve_memories`.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryMatch {
    #[serde(flatten)]
    pub memory: MemoryView,
    /// Integer percentage (0-100), present only for semantic search results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<i32>,
}

/// The client-facing projection of a memory (client ID resolved per §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct MemoryView {
    pub id: i64,
    pub content: String,
    pub labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// `(namespace, token)` row backing the trending-labels algorithm.
#[derive(Debug, Clone)]
pub struct LabelToken {
    pub namespace: String,
    pub token: String,
    pub count: i64,
    pub last_seen: DateTime<Utc>,
    pub last_decay: DateTime<Utc>,
}

/// A ranked trending label with its triggering token.
#[derive(Debug, Clone, Serialize)]
pub struct TrendingLabel {
    pub label: String,
    pub count: i64,
    pub token: String,
    pub score: f64,
}

/// Duplicate-detection warning tier, see §4.5.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DuplicateTier {
    Exact,
    WorthReviewing,
    SimilarTerritory,
    SemanticallyRelated,
}

impl DuplicateTier {
    /// Classify a cosine similarity score; `None` below the lowest threshold.
    pub fn classify(similarity: f32) -> Option<Self> {
        if similarity >= 1.00 {
            Some(Self::Exact)
        } else if similarity >= 0.91 {
            Some(Self::WorthReviewing)
        } else if similarity >= 0.81 {
            Some(Self::SimilarTerritory)
        } else if similarity >= 0.70 {
            Some(Self::SemanticallyRelated)
        } else {
            None
        }
    }

    pub fn message(&self, existing_id: i64, similarity: f32) -> String {
        let pct = (similarity * 100.0).round() as i32;
        match self {
            Self::Exact => format!("Exact match with memory #{existing_id} ({pct}% similar)"),
            Self::WorthReviewing => {
                format!("Worth reviewing: memory #{existing_id} is {pct}% similar")
            }
            Self::SimilarTerritory => format!(
                "Explores similar territory to memory #{existing_id} ({pct}% similar)"
            ),
            Self::SemanticallyRelated => {
                format!("Semantically related to memory #{existing_id} ({pct}% similar)")
            }
        }
    }
}

/// Parsed filter-grammar term: `labels`/`source` fuzzy include/exclude list.
#[derive(Debug, Clone, Default)]
pub struct LabelFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl LabelFilter {
    /// Parse the comma-separated `labels`/`source` grammar from §4.5.
    pub fn parse(raw: &str) -> Self {
        let mut include = Vec::new();
        let mut exclude = Vec::new();
        for term in raw.split(',') {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            if let Some(rest) = term.strip_prefix('!') {
                if !rest.is_empty() {
                    exclude.push(rest.to_string());
                }
            } else {
                include.push(term.to_string());
            }
        }
        Self { include, exclude }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

// --- OAuth record shapes persisted under system_state (see §3, §6) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    pub client_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAccessToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthRefreshToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToAccess {
    pub access_token: String,
}

/// In-memory-only (never persisted): a pending authorization code.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub resource: Option<String>,
}

/// The authenticated principal resolved from a bearer credential.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub client_id: String,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn api_key_client() -> Self {
        Self {
            client_id: "api_key_client".to_string(),
            scopes: vec!["*".to_string()],
        }
    }

    pub fn anonymous() -> Self {
        Self {
            client_id: "anonymous".to_string(),
            scopes: vec!["*".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_filter_parses_include_and_exclude() {
        let f = LabelFilter::parse("beer,!stout,wine");
        assert_eq!(f.include, vec!["beer", "wine"]);
        assert_eq!(f.exclude, vec!["stout"]);
    }

    #[test]
    fn label_filter_empty_is_empty() {
        assert!(LabelFilter::parse("").is_empty());
        assert!(LabelFilter::parse("  ").is_empty());
    }

    #[test]
    fn duplicate_tier_thresholds() {
        assert_eq!(DuplicateTier::classify(1.0), Some(DuplicateTier::Exact));
        assert_eq!(
            DuplicateTier::classify(0.95),
            Some(DuplicateTier::WorthReviewing)
        );
        assert_eq!(
            DuplicateTier::classify(0.85),
            Some(DuplicateTier::SimilarTerritory)
        );
        assert_eq!(
            DuplicateTier::classify(0.72),
            Some(DuplicateTier::SemanticallyRelated)
        );
        assert_eq!(DuplicateTier::classify(0.5), None);
    }
}
