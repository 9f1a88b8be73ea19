//! Pending operation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A local mutation waiting to be uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOperation {
    Create,
    Update,
    Delete,
}

impl PendingOperation {
    /// Merge a newly enqueued operation into the one already pending for the same key.
    ///
    /// A later operation replaces the earlier one, except that an update never
    /// downgrades a pending create (the server has not seen the entity yet) and a
    /// create never replaces a pending update (the server already has it).
    #[must_use]
    pub const fn collapse(existing: Option<Self>, incoming: Self) -> Self {
        match (existing, incoming) {
            (Some(Self::Create), Self::Update) => Self::Create,
            (Some(Self::Update), Self::Create) => Self::Update,
            (_, incoming) => incoming,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PendingOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown pending operation `{other}`")),
        }
    }
}

/// One entry of a Change Queue snapshot.
///
/// `revision` identifies the enqueue that produced this entry; acknowledging
/// with a stale revision leaves a newer pending write in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    pub entity_id: String,
    pub operation: PendingOperation,
    pub revision: i64,
}

#[cfg(test)]
mod tests {
    use super::PendingOperation::{self, Create, Delete, Update};

    #[test]
    fn first_enqueue_is_kept() {
        for op in [Create, Update, Delete] {
            assert_eq!(PendingOperation::collapse(None, op), op);
        }
    }

    #[test]
    fn create_then_update_stays_create() {
        assert_eq!(PendingOperation::collapse(Some(Create), Update), Create);
    }

    #[test]
    fn anything_then_delete_is_delete() {
        for op in [Create, Update, Delete] {
            assert_eq!(PendingOperation::collapse(Some(op), Delete), Delete);
        }
    }

    #[test]
    fn update_then_create_stays_update() {
        assert_eq!(PendingOperation::collapse(Some(Update), Create), Update);
    }

    #[test]
    fn delete_is_replaced_by_later_write() {
        assert_eq!(PendingOperation::collapse(Some(Delete), Create), Create);
        assert_eq!(PendingOperation::collapse(Some(Delete), Update), Update);
    }

    #[test]
    fn labels_parse_back() {
        for op in [Create, Update, Delete] {
            assert_eq!(op.as_str().parse::<PendingOperation>(), Ok(op));
        }
    }
}
