pub mod backend;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod filter;
pub mod mask;
pub mod watcher;

pub use backend::{RawEvent, WatchId};
pub use config::TreewatchConfig;
pub use crate::core::Registry;
pub use error::{BackendError, WatchError};
pub use events::{SemanticEvent, WatchEvent};
pub use filter::DirectoryFilter;
pub use mask::EventMask;
pub use watcher::{Ack, Listener, WatchHandle, WatchState};
