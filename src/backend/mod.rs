//! Low-level single-directory watch facility
//!
//! A backend watches exactly one directory per handle, non-recursively, and
//! reports raw events tagged with that handle. The registry builds recursive
//! coverage on top of this seam.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;
use crate::{BackendError, EventMask};

#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

/// Opaque identifier of one installed low-level watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl WatchId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd#{}", self.0)
    }
}

/// One event exactly as the facility produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// `None` only for events not tied to a watch, such as queue overflow.
    pub handle: Option<WatchId>,
    pub mask: EventMask,
    pub cookie: u32,
    pub name: Option<OsString>,
}

impl RawEvent {
    pub fn new(handle: WatchId, mask: EventMask) -> Self {
        Self {
            handle: Some(handle),
            mask,
            cookie: 0,
            name: None,
        }
    }

    pub fn overflow() -> Self {
        Self {
            handle: None,
            mask: EventMask::Q_OVERFLOW,
            cookie: 0,
            name: None,
        }
    }

    pub fn with_name<S: Into<OsString>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_cookie(mut self, cookie: u32) -> Self {
        self.cookie = cookie;
        self
    }
}

/// Control half of a watch context: registers and unregisters directories.
pub trait WatchBackend: Send + Sync + 'static {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchId, BackendError>;

    fn remove_watch(&self, handle: WatchId) -> Result<(), BackendError>;

    /// Close the context. A reader blocked in [`EventSource::read_events`]
    /// returns an error once the close takes effect.
    fn close(&self);
}

/// Reader half of a watch context.
pub trait EventSource: Send + 'static {
    /// Block until at least one event is available and return the batch.
    fn read_events(&mut self) -> io::Result<Vec<RawEvent>>;
}

/// Both halves of a freshly opened context.
pub struct OpenedBackend {
    pub control: Arc<dyn WatchBackend>,
    pub events: Box<dyn EventSource>,
}

impl fmt::Debug for OpenedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedBackend").finish_non_exhaustive()
    }
}

/// Open the platform's native facility.
#[cfg(target_os = "linux")]
pub fn open_native(read_buffer_bytes: usize) -> io::Result<OpenedBackend> {
    linux::open(read_buffer_bytes)
}

#[cfg(not(target_os = "linux"))]
pub fn open_native(_read_buffer_bytes: usize) -> io::Result<OpenedBackend> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no native single-directory watch facility on this platform",
    ))
}
