//! Change feed over a [`VersionStore`].

use std::sync::atomic::Ordering;

use keepsake_core::models::{EntityType, Timestamp};
use keepsake_core::protocol::ChangesResponse;

use crate::version_store::{Slot, VersionStore};

/// Everything that changed in `entity_type` after `since`.
///
/// The upper bound is the clock snapshot taken before the scan: mutations
/// still in flight carry larger stamps and show up in the next query. When
/// `since` predates purged tombstones the response lists every live entity
/// and sets `resync_required`.
pub fn changes_since(
    store: &VersionStore,
    entity_type: EntityType,
    since: Timestamp,
) -> ChangesResponse {
    let upper = store.clock().snapshot();
    let partition = store.partition(entity_type);
    let resync_required = since < partition.purged_before.load(Ordering::SeqCst);

    let mut changes = Vec::new();
    let mut deletions = Vec::new();
    for slot in partition.slots.iter() {
        match slot.value() {
            Slot::Live(entity) => {
                let in_window = entity.last_updated > since && entity.last_updated <= upper;
                if resync_required || in_window {
                    changes.push(entity.clone());
                }
            }
            Slot::Deleted(tombstone) => {
                let in_window = tombstone.deleted_at > since && tombstone.deleted_at <= upper;
                if !resync_required && in_window {
                    deletions.push(tombstone.clone());
                }
            }
        }
    }
    changes.sort_by(|a, b| a.last_updated.cmp(&b.last_updated).then_with(|| a.id.cmp(&b.id)));
    deletions.sort_by(|a, b| a.deleted_at.cmp(&b.deleted_at).then_with(|| a.id.cmp(&b.id)));

    ChangesResponse {
        changes,
        deletions,
        server_timestamp: upper,
        resync_required,
    }
}
