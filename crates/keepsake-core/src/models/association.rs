//! Association model (content ↔ journal membership)

use serde::{Deserialize, Serialize};

/// A unique (content, journal) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub content_id: String,
    pub journal_id: String,
}

impl Association {
    pub fn new(journal_id: impl Into<String>, content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            journal_id: journal_id.into(),
        }
    }

    /// Deterministic entity id, so every device names the same pair identically.
    pub fn entity_id(&self) -> String {
        format!("{}:{}", self.journal_id, self.content_id)
    }

    /// Parse an association out of a synced payload.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "contentId": self.content_id,
            "journalId": self.journal_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_is_stable() {
        let a = Association::new("j1", "c1");
        let b = Association::new("j1", "c1");
        assert_eq!(a.entity_id(), b.entity_id());
        assert_eq!(a.entity_id(), "j1:c1");
    }

    #[test]
    fn payload_round_trip() {
        let association = Association::new("j1", "c9");
        let parsed = Association::from_payload(&association.to_payload()).unwrap();
        assert_eq!(parsed, association);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(Association::from_payload(&serde_json::json!({"journalId": "j"})).is_none());
    }
}
