//! Optimistic-concurrency version constraint

use serde::{Deserialize, Serialize};

/// The assertion a client makes about the server state it last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum VersionConstraint {
    /// Force-write for an entity with no known server state. Only valid for ids
    /// the server has never seen.
    None,
    /// Accept only if the server's current version equals this one.
    Known {
        #[serde(rename = "serverVersion")]
        server_version: u64,
    },
}

impl VersionConstraint {
    /// Constraint for a locally known server version.
    pub const fn from_observed(server_version: Option<u64>) -> Self {
        match server_version {
            Some(server_version) => Self::Known { server_version },
            None => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let known = serde_json::to_value(VersionConstraint::Known { server_version: 3 }).unwrap();
        assert_eq!(known, serde_json::json!({"kind": "known", "serverVersion": 3}));

        let none = serde_json::to_value(VersionConstraint::None).unwrap();
        assert_eq!(none, serde_json::json!({"kind": "none"}));
    }

    #[test]
    fn observed_version_maps_to_known() {
        assert_eq!(
            VersionConstraint::from_observed(Some(7)),
            VersionConstraint::Known { server_version: 7 }
        );
        assert_eq!(VersionConstraint::from_observed(None), VersionConstraint::None);
    }
}
