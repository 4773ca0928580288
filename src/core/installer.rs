//! Recursive installation of per-directory watches.
//!
//! Traversal is an explicit worklist, so deep trees cost heap rather than
//! stack. Each directory is registered before its children are listed.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use super::registry::{AddOutcome, RegistryShared};
use crate::watcher::WatchShared;
use crate::{BackendError, WatchError, WatchId};

/// Where an install was requested from, which decides how failures on the
/// starting directory are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstallMode {
    /// `start()` of a watch: the root must be watchable.
    Root,
    /// A directory that appeared under an active watch: best effort only.
    Extension,
}

pub(crate) struct RecursiveInstaller<'a> {
    registry: &'a RegistryShared,
}

impl<'a> RecursiveInstaller<'a> {
    pub(crate) fn new(registry: &'a RegistryShared) -> Self {
        Self { registry }
    }

    /// Install watches on `start` and, for recursive watches, every directory
    /// below it. Returns the handles newly installed.
    ///
    /// Directories that vanish or cannot be read are skipped with their
    /// subtree. Reaching the facility's watch limit aborts the install; the
    /// caller decides whether to tear down what was installed.
    pub(crate) fn install(
        &self,
        watch: &WatchShared,
        start: &Path,
        mode: InstallMode,
    ) -> Result<Vec<WatchId>, WatchError> {
        let mask = watch.mask.install_mask(watch.recursive);
        let mut installed = Vec::new();
        let mut worklist = VecDeque::from([start.to_path_buf()]);

        while let Some(dir) = worklist.pop_front() {
            let Some(suffix) = relative_suffix(&watch.root, &dir) else {
                tracing::warn!("{} is outside watch root {}", dir.display(), watch.root.display());
                continue;
            };

            match self.registry.add_entry(watch.id, &dir, suffix, mask) {
                Ok(AddOutcome::Installed(handle)) => {
                    tracing::debug!("Watching {} as {}", dir.display(), handle);
                    installed.push(handle);
                }
                Ok(AddOutcome::AlreadyWatched(handle)) => {
                    tracing::trace!("{} already watched as {}", dir.display(), handle);
                }
                Ok(AddOutcome::OwnerGone) => {
                    tracing::debug!("Watch on {} stopped during install", watch.root.display());
                    return match mode {
                        InstallMode::Root => Err(WatchError::Cancelled {
                            root: watch.root.clone(),
                        }),
                        InstallMode::Extension => Ok(installed),
                    };
                }
                Err(BackendError::LimitReached) => {
                    return Err(WatchError::WatchLimitExceeded { path: dir });
                }
                Err(err) if mode == InstallMode::Root && dir == start => {
                    return Err(WatchError::Install { path: dir, source: err });
                }
                Err(err) if err.is_not_found() => {
                    tracing::debug!("{} vanished before it could be watched", dir.display());
                    continue;
                }
                Err(err) => {
                    tracing::warn!("Skipping {}: {}", dir.display(), err);
                    continue;
                }
            }

            if watch.recursive {
                worklist.extend(watch.filter.subdirectories(&dir));
            }
        }

        Ok(installed)
    }
}

fn relative_suffix(root: &Path, dir: &Path) -> Option<PathBuf> {
    dir.strip_prefix(root).ok().map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_suffix() {
        let root = Path::new("/w");

        assert_eq!(relative_suffix(root, Path::new("/w")), Some(PathBuf::new()));
        assert_eq!(relative_suffix(root, Path::new("/w/a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(relative_suffix(root, Path::new("/other")), None);
    }
}
