use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use parking_lot::{Mutex, RwLock};
use crate::core::installer::{InstallMode, RecursiveInstaller};
use crate::core::registry::RegistryShared;
use crate::core::{OwnerId, Registry};
use crate::{DirectoryFilter, EventMask, WatchError, WatchEvent, WatchId};

/// Callback invoked on the router thread for every notification.
pub type Listener = Arc<dyn Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync>;

/// Lifecycle of a [`WatchHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Starting,
    Active,
    Stopping,
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

enum Control {
    Start(Option<Sender<Result<(), WatchError>>>),
    Stop(Option<Sender<Result<(), WatchError>>>),
}

/// State shared between a handle, its control worker and the router.
pub(crate) struct WatchShared {
    pub(crate) id: OwnerId,
    pub(crate) root: PathBuf,
    pub(crate) recursive: bool,
    pub(crate) mask: EventMask,
    pub(crate) filter: DirectoryFilter,
    state: Mutex<WatchState>,
    listener: RwLock<Option<Listener>>,
    worker: Mutex<Option<Sender<Control>>>,
    registry: Result<Arc<RegistryShared>, String>,
}

impl WatchShared {
    /// Whether the caller asked for any of `bits`.
    pub(crate) fn wants(&self, bits: EventMask) -> bool {
        self.mask.intersects(bits.kind_bits())
    }

    pub(crate) fn listener(&self) -> Option<Listener> {
        self.listener.read().clone()
    }

    pub(crate) fn mark_idle(&self) {
        *self.state.lock() = WatchState::Idle;
    }

    fn registry(&self) -> Result<&Arc<RegistryShared>, WatchError> {
        self.registry.as_ref().map_err(|reason| WatchError::ContextUnavailable {
            reason: reason.clone(),
        })
    }

    fn do_start(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut state = self.state.lock();
            if *state != WatchState::Idle {
                return Ok(());
            }
            *state = WatchState::Starting;
        }

        let result = self.install_root();
        self.finish_start(result)
    }

    /// Settle a start attempt. The router may retire the watch while the
    /// install runs (root deleted); the watch then holds no handles and
    /// must stay idle.
    fn finish_start(&self, installed: Result<usize, WatchError>) -> Result<(), WatchError> {
        let mut state = self.state.lock();
        let count = match installed {
            Ok(count) => count,
            Err(err) => {
                *state = WatchState::Idle;
                return Err(err);
            }
        };

        let registry = match self.registry() {
            Ok(registry) => registry,
            Err(err) => {
                *state = WatchState::Idle;
                return Err(err);
            }
        };
        if registry.handles_of(self.id).is_empty() {
            registry.release(self.id);
            *state = WatchState::Idle;
            return Err(WatchError::Cancelled {
                root: self.root.clone(),
            });
        }

        tracing::info!("Watching {} ({} directories)", self.root.display(), count);
        *state = WatchState::Active;
        Ok(())
    }

    fn install_root(self: &Arc<Self>) -> Result<usize, WatchError> {
        let registry = self.registry()?;
        registry.register_owner(self.id, Arc::downgrade(self));

        match RecursiveInstaller::new(registry).install(self, &self.root, InstallMode::Root) {
            Ok(_) if registry.handles_of(self.id).is_empty() => {
                registry.release(self.id);
                Err(WatchError::Cancelled {
                    root: self.root.clone(),
                })
            }
            Ok(installed) => Ok(installed.len()),
            Err(err) => {
                // No half-initialized watch is left behind.
                let released = registry.release(self.id);
                tracing::warn!(
                    "Starting watch on {} failed, released {} handles: {}",
                    self.root.display(),
                    released,
                    err
                );
                Err(err)
            }
        }
    }

    fn do_stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == WatchState::Idle {
                return;
            }
            *state = WatchState::Stopping;
        }

        if let Ok(registry) = self.registry() {
            let released = registry.release(self.id);
            tracing::info!("Stopped watching {} ({} handles released)", self.root.display(), released);
        }
        self.mark_idle();
    }

    /// Queue a request on the control worker, spawning it if needed.
    fn submit(self: &Arc<Self>, control: Control) {
        let mut slot = self.worker.lock();

        let control = match slot.as_ref() {
            Some(tx) => match tx.send(control) {
                Ok(()) => return,
                Err(mpsc::SendError(control)) => control,
            },
            None => control,
        };

        let (tx, rx) = mpsc::channel();
        // The receiver is alive until the worker exits, which needs this lock.
        let _ = tx.send(control);
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("treewatch-control-{}", self.id.0))
            .spawn(move || run_worker(shared, rx));

        match spawned {
            Ok(_) => *slot = Some(tx),
            Err(err) => {
                tracing::error!("Failed to spawn control worker for {}: {}", self.root.display(), err);
                *slot = None;
            }
        }
    }
}

/// Serializes start/stop requests for one watch. Exits once the watch is
/// idle and nothing else is queued.
fn run_worker(shared: Arc<WatchShared>, rx: Receiver<Control>) {
    let mut next = None;
    loop {
        let control = match next.take() {
            Some(control) => control,
            None => match rx.recv() {
                Ok(control) => control,
                Err(_) => return,
            },
        };

        match control {
            Control::Start(ack) => {
                let result = shared.do_start();
                if let Err(err) = &result {
                    tracing::error!("Failed to start watch on {}: {}", shared.root.display(), err);
                }
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            Control::Stop(ack) => {
                shared.do_stop();
                if let Some(ack) = ack {
                    let _ = ack.send(Ok(()));
                }
            }
        }

        if *shared.state.lock() == WatchState::Idle {
            let mut slot = shared.worker.lock();
            match rx.try_recv() {
                Ok(control) => next = Some(control),
                Err(_) => {
                    *slot = None;
                    return;
                }
            }
        }
    }
}

/// Completion of a queued start or stop. Dropping it is fine; waiting on it
/// reports the outcome.
#[must_use = "an Ack can be dropped, but waiting on it is the only way to see errors"]
pub struct Ack {
    rx: Receiver<Result<(), WatchError>>,
    root: PathBuf,
}

impl Ack {
    pub fn wait(self) -> Result<(), WatchError> {
        self.rx.recv().unwrap_or(Err(WatchError::ControlWorkerGone { root: self.root }))
    }

    /// Wait up to `timeout`; `None` if the request is still in progress.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), WatchError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(WatchError::ControlWorkerGone {
                root: self.root.clone(),
            })),
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack").field("root", &self.root).finish()
    }
}

/// A recursive (or single-directory) watch on one root path.
///
/// Created idle; [`start`](Self::start) installs the watches and
/// [`stop`](Self::stop) removes them. Both return immediately, the work
/// happens on a per-handle control worker. Dropping an active handle stops it.
pub struct WatchHandle {
    shared: Arc<WatchShared>,
}

impl WatchHandle {
    /// Watch `root` through the process-wide registry.
    pub fn new<P: AsRef<Path>>(root: P, recursive: bool, mask: EventMask) -> Self {
        let registry = Registry::global()
            .map(|registry| registry.shared())
            .map_err(|err| err.to_string());
        Self::with_registry(registry, root.as_ref(), recursive, mask)
    }

    pub(crate) fn with_registry(
        registry: Result<Arc<RegistryShared>, String>,
        root: &Path,
        recursive: bool,
        mask: EventMask,
    ) -> Self {
        let honor_ignore_files = registry
            .as_ref()
            .map(|r| r.config().install.honor_ignore_files)
            .unwrap_or(false);

        Self {
            shared: Arc::new(WatchShared {
                id: OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed)),
                root: normalize_root(root),
                recursive,
                mask: mask.kind_bits(),
                filter: DirectoryFilter::new(honor_ignore_files),
                state: Mutex::new(WatchState::Idle),
                listener: RwLock::new(None),
                worker: Mutex::new(None),
                registry,
            }),
        }
    }

    /// Install or replace the callback. Events arriving with no listener are dropped.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&WatchEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        *self.shared.listener.write() = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.shared.listener.write() = None;
    }

    /// Begin watching. A no-op if already active.
    pub fn start(&self) -> Ack {
        let (tx, rx) = mpsc::channel();
        self.shared.submit(Control::Start(Some(tx)));
        Ack {
            rx,
            root: self.shared.root.clone(),
        }
    }

    /// Stop watching and release every low-level handle. A no-op if idle.
    pub fn stop(&self) -> Ack {
        let (tx, rx) = mpsc::channel();
        self.shared.submit(Control::Stop(Some(tx)));
        Ack {
            rx,
            root: self.shared.root.clone(),
        }
    }

    pub fn state(&self) -> WatchState {
        *self.shared.state.lock()
    }

    /// Low-level handles currently installed for this watch, ordered.
    pub fn owned_handles(&self) -> Vec<WatchId> {
        match &self.shared.registry {
            Ok(registry) => registry.handles_of(self.shared.id),
            Err(_) => Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn mask(&self) -> EventMask {
        self.shared.mask
    }

    pub fn is_recursive(&self) -> bool {
        self.shared.recursive
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        let idle = *self.shared.state.lock() == WatchState::Idle;
        if idle && self.shared.worker.lock().is_none() {
            return;
        }
        self.shared.submit(Control::Stop(None));
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("root", &self.shared.root)
            .field("recursive", &self.shared.recursive)
            .field("mask", &self.shared.mask)
            .field("state", &self.state())
            .finish()
    }
}

/// Absolute, lexically normalized form of `path`. Symbolic links are not resolved.
fn normalize_root(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::TreewatchConfig;

    #[test]
    fn test_start_settles_idle_when_retired_during_install() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let (_backend, opened) = MemoryBackend::open(None);
        let registry = Registry::with_backend(opened, TreewatchConfig::default()).unwrap();
        let handle = registry.watch(temp_dir.path(), true, EventMask::ALL_EVENTS);
        let shared = handle.shared.clone();

        // Registered, then released by the router before the install reports back.
        registry.shared().register_owner(shared.id, Arc::downgrade(&shared));
        *shared.state.lock() = WatchState::Starting;
        registry.shared().release(shared.id);

        let err = shared.finish_start(Ok(1)).unwrap_err();
        assert!(matches!(err, WatchError::Cancelled { .. }));
        assert_eq!(handle.state(), WatchState::Idle);
        assert!(handle.owned_handles().is_empty());
    }

    #[test]
    fn test_start_settles_active_with_handles() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let (backend, opened) = MemoryBackend::open(None);
        let registry = Registry::with_backend(opened, TreewatchConfig::default()).unwrap();
        let handle = registry.watch(temp_dir.path(), false, EventMask::CREATE);

        handle.start().wait().unwrap();

        assert_eq!(handle.state(), WatchState::Active);
        assert_eq!(handle.owned_handles(), vec![backend.id_of(temp_dir.path()).unwrap()]);
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(Path::new("/w/./a/../b/")), PathBuf::from("/w/b"));
        assert_eq!(normalize_root(Path::new("/w")), PathBuf::from("/w"));
        assert!(normalize_root(Path::new("rel")).is_absolute());
    }

    #[test]
    fn test_unavailable_context_surfaces_on_start() {
        let handle = WatchHandle::with_registry(
            Err("inotify_init failed".to_string()),
            Path::new("/w"),
            true,
            EventMask::ALL_EVENTS,
        );

        let err = handle.start().wait().unwrap_err();
        assert!(matches!(err, WatchError::ContextUnavailable { .. }));
        assert_eq!(handle.state(), WatchState::Idle);
        assert!(handle.owned_handles().is_empty());
    }

    #[test]
    fn test_stop_while_idle_is_noop() {
        let handle = WatchHandle::with_registry(
            Err("closed".to_string()),
            Path::new("/w"),
            false,
            EventMask::CREATE,
        );

        assert!(handle.stop().wait().is_ok());
        assert_eq!(handle.state(), WatchState::Idle);
    }

    #[test]
    fn test_mask_drops_control_bits() {
        let handle = WatchHandle::with_registry(
            Err("closed".to_string()),
            Path::new("/w"),
            false,
            EventMask::CREATE | EventMask::ISDIR | EventMask::ONESHOT,
        );

        assert_eq!(handle.mask(), EventMask::CREATE);
        assert!(!handle.is_recursive());
        assert_eq!(handle.root(), Path::new("/w"));
    }
}
