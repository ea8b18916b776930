//! Denormalized tree maintenance.
//!
//! - [`TreeMaintainer`] pushes a tag's id into every ancestor on create and
//!   prunes removed ids on delete
//! - [`SubtreeDeleter`] removes a whole subtree and hands the deleted ids to
//!   the maintainer's prune walk

mod deleter;
mod maintainer;

pub use deleter::{RemovedSubtree, SubtreeDeleter};
pub use maintainer::{TreeMaintainer, DEFAULT_MAX_DEPTH};
