use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use serde::{Deserialize, Serialize};
use crate::EventMask;

/// What happened, as seen by a listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SemanticEvent {
    Created,
    Deleted,
    Modified,
    Renamed { from: PathBuf },
    SelfDeleted,
    SelfMoved,
    Overflow,
}

impl SemanticEvent {
    pub fn label(&self) -> &'static str {
        match self {
            SemanticEvent::Created => "CREATED",
            SemanticEvent::Deleted => "DELETED",
            SemanticEvent::Modified => "MODIFIED",
            SemanticEvent::Renamed { .. } => "RENAMED",
            SemanticEvent::SelfDeleted => "SELF_DELETED",
            SemanticEvent::SelfMoved => "SELF_MOVED",
            SemanticEvent::Overflow => "OVERFLOW",
        }
    }
}

impl fmt::Display for SemanticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One resolved notification delivered to a watch's listener.
///
/// `path` is relative to the watch root; it is empty for events about the
/// root itself and for overflow notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: SemanticEvent,
    pub path: PathBuf,
    pub is_dir: bool,
    pub mask: EventMask,
    pub timestamp: SystemTime,
}

impl WatchEvent {
    pub fn new(kind: SemanticEvent, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            is_dir: false,
            mask: EventMask::empty(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn overflow() -> Self {
        Self::new(SemanticEvent::Overflow, PathBuf::new()).with_mask(EventMask::Q_OVERFLOW)
    }

    pub fn with_mask(mut self, mask: EventMask) -> Self {
        self.is_dir = mask.is_dir();
        self.mask = mask;
        self
    }

    pub fn renamed_from(&self) -> Option<&PathBuf> {
        match &self.kind {
            SemanticEvent::Renamed { from } => Some(from),
            _ => None,
        }
    }
}
