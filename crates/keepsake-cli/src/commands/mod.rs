pub mod add;
pub mod common;
pub mod completions;
pub mod conflicts;
pub mod delete;
pub mod edit;
pub mod link;
pub mod list;
pub mod resolve;
pub mod status;
pub mod sync;
