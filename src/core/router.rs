//! The event router: turns raw per-directory events into root-relative
//! notifications and keeps recursive coverage current.
//!
//! The router runs on a single thread and is the only mutator of the rename
//! table. Registry lookups take the table lock briefly; listeners run with
//! no lock held.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::time::Instant;
use super::installer::{InstallMode, RecursiveInstaller};
use super::path_table::{OwnerId, Target};
use super::registry::RegistryShared;
use super::rename::{PendingRename, RenameCorrelator};
use crate::backend::RawEvent;
use crate::watcher::WatchShared;
use crate::{EventMask, SemanticEvent, WatchError, WatchEvent, WatchId};

/// Owner of a pending rename, held without keeping the watch alive.
#[derive(Clone)]
pub(crate) struct PendingOwner {
    id: OwnerId,
    watch: Weak<WatchShared>,
}

/// A notification bound for one watch.
pub(crate) struct Delivery {
    pub(crate) watch: Arc<WatchShared>,
    pub(crate) event: WatchEvent,
}

pub(crate) struct EventRouter {
    registry: Arc<RegistryShared>,
    renames: RenameCorrelator<OwnerId, PendingOwner>,
}

impl EventRouter {
    pub(crate) fn new(registry: Arc<RegistryShared>) -> Self {
        let router_config = &registry.config().router;
        let renames = RenameCorrelator::new(
            router_config.rename_retention(),
            router_config.max_pending_renames,
        );
        Self { registry, renames }
    }

    /// Drain `inbox` until every sender is gone.
    pub(crate) fn run(mut self, inbox: Receiver<Vec<RawEvent>>) {
        loop {
            let received = match self.renames.next_deadline() {
                Some(deadline) => {
                    inbox.recv_timeout(deadline.saturating_duration_since(Instant::now()))
                }
                None => inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match received {
                Ok(batch) => {
                    for raw in batch {
                        let deliveries = self.route(raw);
                        deliver(deliveries);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            let expired = self.expire(Instant::now());
            deliver(expired);
        }
        tracing::debug!("Event router stopped");
    }

    /// Resolve one raw event into the notifications it produces.
    pub(crate) fn route(&mut self, raw: RawEvent) -> Vec<Delivery> {
        tracing::trace!("Raw event {:?}", raw);

        if raw.mask.contains(EventMask::Q_OVERFLOW) {
            tracing::warn!("Low-level event queue overflowed; events were lost");
            return self
                .registry
                .live_watches()
                .into_iter()
                .map(|watch| Delivery {
                    watch,
                    event: WatchEvent::overflow(),
                })
                .collect();
        }

        let Some(handle) = raw.handle else {
            return Vec::new();
        };

        if raw.mask.contains(EventMask::IGNORED) {
            self.handle_ignored(handle);
            return Vec::new();
        }

        let mut out = Vec::new();
        for target in self.registry.resolve(handle) {
            self.route_to(handle, target, &raw, &mut out);
        }
        out
    }

    /// Report move-outs whose move-in never came as deletions.
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for pending in self.renames.evict_expired(now) {
            self.unmatched_move_out(pending, &mut out);
        }
        out
    }

    fn route_to(&mut self, handle: WatchId, target: Target<WatchShared>, raw: &RawEvent, out: &mut Vec<Delivery>) {
        let Target { owner, watch, suffix } = target;
        let mask = raw.mask;
        let is_dir = mask.is_dir();
        let path = match &raw.name {
            Some(name) => suffix.join(name),
            None => suffix.clone(),
        };
        let is_root = suffix.as_os_str().is_empty();

        if mask.intersects(EventMask::DELETE_SELF | EventMask::UNMOUNT) {
            if is_root {
                if watch.wants(EventMask::DELETE_SELF) {
                    out.push(Delivery {
                        watch: watch.clone(),
                        event: WatchEvent::new(SemanticEvent::SelfDeleted, PathBuf::new())
                            .with_mask(mask | EventMask::ISDIR),
                    });
                }
                self.retire(owner, &watch);
            } else {
                self.registry.remove_entry(handle, owner);
            }
            return;
        }

        if mask.contains(EventMask::MOVE_SELF) {
            if is_root && watch.wants(EventMask::MOVE_SELF) {
                out.push(Delivery {
                    event: WatchEvent::new(SemanticEvent::SelfMoved, PathBuf::new())
                        .with_mask(mask | EventMask::ISDIR),
                    watch,
                });
            }
            return;
        }

        if mask.contains(EventMask::CREATE) {
            if is_dir && watch.recursive {
                self.extend(&watch, &path);
            }
            if watch.wants(EventMask::CREATE) {
                out.push(Delivery {
                    event: WatchEvent::new(SemanticEvent::Created, path).with_mask(mask),
                    watch,
                });
            }
            return;
        }

        if mask.contains(EventMask::MOVED_FROM) {
            let pending = PendingRename {
                cookie: raw.cookie,
                owner: PendingOwner {
                    id: owner,
                    watch: Arc::downgrade(&watch),
                },
                old_path: path,
                is_dir,
                inserted: Instant::now(),
            };
            if let Some(displaced) = self.renames.record(owner, pending) {
                self.unmatched_move_out(displaced, out);
            }
            return;
        }

        if mask.contains(EventMask::MOVED_TO) {
            match self.renames.resolve(&owner, raw.cookie) {
                Some(pending) => {
                    if pending.is_dir {
                        let moved = self.registry.rebase(owner, &pending.old_path, &path);
                        tracing::debug!(
                            "Rebased {} watches from {} to {}",
                            moved,
                            pending.old_path.display(),
                            path.display()
                        );
                    }
                    if watch.wants(EventMask::MOVE) {
                        out.push(Delivery {
                            event: WatchEvent::new(
                                SemanticEvent::Renamed {
                                    from: pending.old_path,
                                },
                                path,
                            )
                            .with_mask(mask),
                            watch,
                        });
                    }
                }
                None => {
                    // Moved in from outside this watch.
                    if is_dir && watch.recursive {
                        self.extend(&watch, &path);
                    }
                    if watch.wants(EventMask::MOVED_TO) {
                        out.push(Delivery {
                            event: WatchEvent::new(SemanticEvent::Created, path).with_mask(mask),
                            watch,
                        });
                    }
                }
            }
            return;
        }

        if mask.contains(EventMask::DELETE) {
            if watch.wants(EventMask::DELETE) {
                out.push(Delivery {
                    event: WatchEvent::new(SemanticEvent::Deleted, path).with_mask(mask),
                    watch,
                });
            }
            return;
        }

        let modified = EventMask::MODIFY | EventMask::ATTRIB | EventMask::CLOSE_WRITE;
        if mask.intersects(modified) {
            if watch.wants(mask & modified) {
                out.push(Delivery {
                    event: WatchEvent::new(SemanticEvent::Modified, path).with_mask(mask),
                    watch,
                });
            }
            return;
        }

        tracing::trace!("Not dispatching {:?} on {}", mask, path.display());
    }

    fn unmatched_move_out(&mut self, pending: PendingRename<PendingOwner>, out: &mut Vec<Delivery>) {
        let Some(watch) = pending.owner.watch.upgrade() else {
            return;
        };
        if !self.registry.is_live(pending.owner.id) {
            return;
        }

        if pending.is_dir {
            // The directory left this watch; its watches would now report
            // paths outside the root.
            self.registry.release_prefix(pending.owner.id, &pending.old_path);
        }

        if watch.wants(EventMask::MOVED_FROM) {
            let mut mask = EventMask::MOVED_FROM;
            if pending.is_dir {
                mask |= EventMask::ISDIR;
            }
            out.push(Delivery {
                event: WatchEvent::new(SemanticEvent::Deleted, pending.old_path).with_mask(mask),
                watch,
            });
        }
    }

    fn handle_ignored(&mut self, handle: WatchId) {
        for entry in self.registry.forget(handle) {
            if !entry.is_root() {
                continue;
            }
            let watch = self
                .registry
                .live_watches()
                .into_iter()
                .find(|w| w.id == entry.owner);
            if let Some(watch) = watch {
                tracing::debug!("Root watch of {} was dropped by the facility", watch.root.display());
                self.retire(entry.owner, &watch);
            }
        }
    }

    /// The root of `watch` is gone: release everything it holds and go idle.
    fn retire(&mut self, owner: OwnerId, watch: &WatchShared) {
        let released = self.registry.release(owner);
        watch.mark_idle();
        tracing::debug!(
            "Watch on {} retired, released {} handles",
            watch.root.display(),
            released
        );
    }

    fn extend(&self, watch: &WatchShared, relative: &Path) {
        let dir = watch.root.join(relative);
        match RecursiveInstaller::new(&self.registry).install(watch, &dir, InstallMode::Extension) {
            Ok(installed) => {
                tracing::debug!("Extended watch to {} ({} new)", dir.display(), installed.len());
            }
            Err(err) => {
                tracing::warn!("Recursive coverage under {} is incomplete: {}", dir.display(), err);
            }
        }
    }
}

/// Hand each notification to its listener. A failing or panicking listener
/// is logged and does not affect the others.
pub(crate) fn deliver(deliveries: Vec<Delivery>) {
    for Delivery { watch, event } in deliveries {
        let Some(listener) = watch.listener() else {
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let failure = WatchError::CallbackFailure {
                    kind: event.kind.to_string(),
                    path: watch.root.join(&event.path),
                    reason: format!("{:#}", err),
                };
                tracing::warn!("{}", failure);
            }
            Err(_) => {
                tracing::error!(
                    "Listener for {} panicked handling {} {}",
                    watch.root.display(),
                    event.kind,
                    event.path.display()
                );
            }
        }
    }
}
