//! Services shared by every Keepsake client surface.

mod local_store;

pub use local_store::{
    ChangeOrigin, EntityChange, LocalStore, MembershipDiff, RemoteApply, RemoteDeletion,
};
