#![warn(missing_docs)]

//! GroupSync core: membership snapshots, the edit script between two
//! snapshots, and the differ that computes it.

pub mod difference;
pub mod differ;
pub mod error;
pub mod model;

pub use difference::{Difference, DifferenceKind, GroupRef};
pub use differ::diff;
pub use error::CoreError;
pub use model::{current_time_ms, Group, GroupSet, Membership, Role};
