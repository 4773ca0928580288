//! In-process watch context driven by injected events.
//!
//! Watches are validated against the real filesystem (the directory must
//! exist) but no kernel facility is involved: events only arrive through
//! [`MemoryBackend::emit`]. Useful for deterministic tests of the registry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use parking_lot::Mutex;
use super::{EventSource, OpenedBackend, RawEvent, WatchBackend, WatchId};
use crate::{BackendError, EventMask};

#[derive(Default)]
struct State {
    by_path: HashMap<PathBuf, WatchId>,
    by_id: HashMap<WatchId, (PathBuf, EventMask)>,
    next_id: u64,
    closed: bool,
}

/// Control half of the scripted backend. Clone it to keep a handle for
/// injecting events after the registry has taken the backend.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    sender: Arc<Mutex<Option<Sender<Vec<RawEvent>>>>>,
    limit: Option<usize>,
}

pub struct MemoryEvents {
    receiver: Receiver<Vec<RawEvent>>,
}

impl MemoryBackend {
    /// Open a scripted context. `limit` caps the number of live watches.
    pub fn open(limit: Option<usize>) -> (MemoryBackend, OpenedBackend) {
        let (tx, rx) = mpsc::channel();
        let backend = MemoryBackend {
            state: Arc::new(Mutex::new(State::default())),
            sender: Arc::new(Mutex::new(Some(tx))),
            limit,
        };
        let opened = OpenedBackend {
            control: Arc::new(backend.clone()),
            events: Box::new(MemoryEvents { receiver: rx }),
        };
        (backend, opened)
    }

    /// Queue a single event for the reader.
    pub fn emit(&self, event: RawEvent) -> bool {
        self.emit_batch(vec![event])
    }

    /// Queue a batch, delivered to the reader as one read.
    pub fn emit_batch(&self, batch: Vec<RawEvent>) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.send(batch).is_ok(),
            None => false,
        }
    }

    /// Id of the live watch on `path`, if any.
    pub fn id_of<P: AsRef<Path>>(&self, path: P) -> Option<WatchId> {
        self.state.lock().by_path.get(path.as_ref()).copied()
    }

    pub fn path_of(&self, id: WatchId) -> Option<PathBuf> {
        self.state.lock().by_id.get(&id).map(|(path, _)| path.clone())
    }

    pub fn mask_of(&self, id: WatchId) -> Option<EventMask> {
        self.state.lock().by_id.get(&id).map(|(_, mask)| *mask)
    }

    /// All watched directories, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.state.lock().by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn watch_count(&self) -> usize {
        self.state.lock().by_id.len()
    }
}

impl WatchBackend for MemoryBackend {
    fn add_watch(&self, path: &Path, mask: EventMask) -> Result<WatchId, BackendError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(BackendError::Closed);
        }

        if let Some(id) = state.by_path.get(path).copied() {
            if let Some((_, existing)) = state.by_id.get_mut(&id) {
                *existing |= mask;
            }
            return Ok(id);
        }

        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(BackendError::Rejected(io::Error::new(
                io::ErrorKind::Other,
                format!("not a directory: {}", path.display()),
            )));
        }

        if let Some(limit) = self.limit {
            if state.by_id.len() >= limit {
                return Err(BackendError::LimitReached);
            }
        }

        state.next_id += 1;
        let id = WatchId::new(state.next_id);
        state.by_path.insert(path.to_path_buf(), id);
        state.by_id.insert(id, (path.to_path_buf(), mask));
        Ok(id)
    }

    fn remove_watch(&self, handle: WatchId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        match state.by_id.remove(&handle) {
            Some((path, _)) => {
                state.by_path.remove(&path);
                Ok(())
            }
            None => Err(BackendError::Rejected(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unknown watch {}", handle),
            ))),
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.by_id.clear();
        state.by_path.clear();
        self.sender.lock().take();
    }
}

impl EventSource for MemoryEvents {
    fn read_events(&mut self) -> io::Result<Vec<RawEvent>> {
        self.receiver
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory watch context closed"))
    }
}
