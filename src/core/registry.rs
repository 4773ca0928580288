//! The shared watch registry and its threads.
//!
//! One registry owns one low-level context. Every install and uninstall,
//! whichever watch issued it, goes through the registry's table lock; the
//! lock is never held while a listener runs.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use parking_lot::Mutex;
use super::path_table::{InsertOutcome, OwnerId, PathTable, RegistryEntry, Target};
use super::router::EventRouter;
use crate::backend::{self, OpenedBackend, WatchBackend};
use crate::config::TreewatchConfig;
use crate::watcher::{WatchHandle, WatchShared};
use crate::{BackendError, EventMask, WatchError, WatchId};

/// Outcome of installing one directory.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    Installed(WatchId),
    AlreadyWatched(WatchId),
    OwnerGone,
}

pub(crate) struct RegistryShared {
    backend: Arc<dyn WatchBackend>,
    table: Mutex<PathTable<WatchShared>>,
    config: TreewatchConfig,
}

impl RegistryShared {
    pub(crate) fn config(&self) -> &TreewatchConfig {
        &self.config
    }

    pub(crate) fn is_live(&self, owner: OwnerId) -> bool {
        self.table.lock().is_live(owner)
    }

    pub(crate) fn register_owner(&self, owner: OwnerId, watch: Weak<WatchShared>) {
        self.table.lock().register_owner(owner, watch);
    }

    /// Install a watch on `path` for `owner` and record it under `suffix`.
    pub(crate) fn add_entry(
        &self,
        owner: OwnerId,
        path: &Path,
        suffix: PathBuf,
        mask: EventMask,
    ) -> Result<AddOutcome, BackendError> {
        let mut table = self.table.lock();
        if !table.is_live(owner) {
            return Ok(AddOutcome::OwnerGone);
        }

        let handle = self.backend.add_watch(path, mask)?;
        match table.insert(handle, owner, suffix) {
            InsertOutcome::Inserted => Ok(AddOutcome::Installed(handle)),
            InsertOutcome::AlreadyPresent => Ok(AddOutcome::AlreadyWatched(handle)),
            InsertOutcome::OwnerGone => Ok(AddOutcome::OwnerGone),
        }
    }

    pub(crate) fn resolve(&self, handle: WatchId) -> Vec<Target<WatchShared>> {
        let mut table = self.table.lock();
        let resolution = table.resolve(handle);
        if !resolution.released.is_empty() {
            tracing::debug!(
                "Purged {} watches of a dropped owner",
                resolution.released.len()
            );
        }
        self.unregister(resolution.released);
        resolution.targets
    }

    /// Remove every entry of `owner` and unregister handles nobody else uses.
    pub(crate) fn release(&self, owner: OwnerId) -> usize {
        let mut table = self.table.lock();
        let released = table.release_owner(owner);
        let count = released.len();
        self.unregister(released);
        count
    }

    pub(crate) fn remove_entry(&self, handle: WatchId, owner: OwnerId) {
        let mut table = self.table.lock();
        if table.remove_entry(handle, owner) {
            self.unregister(vec![handle]);
        }
    }

    /// Drop all entries of a handle the facility reported as gone.
    pub(crate) fn forget(&self, handle: WatchId) -> Vec<RegistryEntry> {
        let mut table = self.table.lock();
        let entries = table.forget_handle(handle);
        if !entries.is_empty() {
            self.unregister(vec![handle]);
        }
        entries
    }

    pub(crate) fn rebase(&self, owner: OwnerId, from: &Path, to: &Path) -> usize {
        self.table.lock().rebase(owner, from, to)
    }

    pub(crate) fn release_prefix(&self, owner: OwnerId, prefix: &Path) -> usize {
        let mut table = self.table.lock();
        let released = table.release_prefix(owner, prefix);
        let count = released.len();
        self.unregister(released);
        count
    }

    pub(crate) fn handles_of(&self, owner: OwnerId) -> Vec<WatchId> {
        self.table.lock().handles_of(owner)
    }

    pub(crate) fn live_watches(&self) -> Vec<Arc<WatchShared>> {
        let mut table = self.table.lock();
        let (live, released) = table.live_owners();
        self.unregister(released);
        live
    }

    pub(crate) fn handle_count(&self) -> usize {
        self.table.lock().handle_count()
    }

    // Called with the table lock held.
    fn unregister(&self, handles: Vec<WatchId>) {
        for handle in handles {
            if let Err(err) = self.backend.remove_watch(handle) {
                tracing::debug!("Removing {} failed: {}", handle, err);
            }
        }
    }

    fn close(&self) {
        self.backend.close();
    }
}

/// A low-level watch context plus the threads that drain it.
///
/// Most programs use [`Registry::global`]; tests and embedders that bring
/// their own backend use [`Registry::with_backend`].
pub struct Registry {
    shared: Arc<RegistryShared>,
}

static GLOBAL: OnceLock<Result<Registry, String>> = OnceLock::new();

impl Registry {
    /// Open the native facility with `config`.
    pub fn open(config: TreewatchConfig) -> Result<Self, WatchError> {
        let opened = backend::open_native(config.router.read_buffer_bytes).map_err(|err| {
            WatchError::ContextUnavailable {
                reason: err.to_string(),
            }
        })?;
        Self::with_backend(opened, config)
    }

    /// Start the pump and router threads over an already opened backend.
    pub fn with_backend(opened: OpenedBackend, config: TreewatchConfig) -> Result<Self, WatchError> {
        let OpenedBackend { control, mut events } = opened;
        let shared = Arc::new(RegistryShared {
            backend: control,
            table: Mutex::new(PathTable::new()),
            config,
        });

        let (tx, rx) = mpsc::channel();
        let spawn_failed = |err: std::io::Error| WatchError::ContextUnavailable {
            reason: format!("failed to spawn registry thread: {}", err),
        };

        let router = EventRouter::new(shared.clone());
        thread::Builder::new()
            .name("treewatch-router".to_string())
            .spawn(move || router.run(rx))
            .map_err(spawn_failed)?;

        let pump_result = thread::Builder::new()
            .name("treewatch-reader".to_string())
            .spawn(move || loop {
                match events.read_events() {
                    Ok(batch) => {
                        if tx.send(batch).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::debug!("Watch event source closed: {}", err);
                        break;
                    }
                }
            });
        if let Err(err) = pump_result {
            shared.close();
            return Err(spawn_failed(err));
        }

        tracing::debug!("Watch registry started");
        Ok(Self { shared })
    }

    /// The process-wide registry over the native facility, opened on first use.
    ///
    /// A failure to open is remembered and returned on every call.
    pub fn global() -> Result<&'static Registry, WatchError> {
        let result = GLOBAL.get_or_init(|| {
            Registry::open(TreewatchConfig::from_env()).map_err(|err| err.to_string())
        });
        result.as_ref().map_err(|reason| WatchError::ContextUnavailable {
            reason: reason.clone(),
        })
    }

    /// Create a watch on `root`. Nothing is installed until [`WatchHandle::start`].
    pub fn watch<P: AsRef<Path>>(&self, root: P, recursive: bool, mask: EventMask) -> WatchHandle {
        WatchHandle::with_registry(Ok(self.shared.clone()), root.as_ref(), recursive, mask)
    }

    pub(crate) fn shared(&self) -> Arc<RegistryShared> {
        self.shared.clone()
    }

    /// Number of distinct low-level handles currently installed.
    pub fn handle_count(&self) -> usize {
        self.shared.handle_count()
    }

    pub fn config(&self) -> &TreewatchConfig {
        &self.shared.config
    }

    /// Close the low-level context; the reader and router threads wind down.
    pub fn shutdown(&self) {
        self.shared.close();
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handles", &self.handle_count())
            .finish()
    }
}
