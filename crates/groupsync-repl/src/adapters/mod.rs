//! Concrete sources and targets.

pub mod directory_target;
pub mod file_source;

pub use directory_target::{DirectoryTarget, GROUPS_NEEDING_SETTINGS};
pub use file_source::FileGroupSource;
