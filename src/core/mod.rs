//! Core functionality module
//!
//! Contains the path table, recursive installer, rename correlation and the
//! event router, tied together by the registry.

pub mod path_table;
pub mod rename;
pub(crate) mod installer;
pub(crate) mod registry;
pub(crate) mod router;

// Re-export main types
pub use path_table::{OwnerId, RegistryEntry};
pub use rename::{PendingRename, RenameCorrelator};
pub use registry::Registry;
