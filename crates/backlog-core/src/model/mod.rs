//! Domain types: work items, process profiles and index rows.

pub mod item;
pub mod profile;
pub mod row;

pub use item::{Kind, WorkItem, WorklogEntry};
pub use profile::ProcessProfile;
pub use row::{DerivedIndexRow, ItemFilter};
