//! Bookkeeping between low-level watch handles and watch owners.
//!
//! Each handle maps to one or more entries (two roots may cover the same
//! directory), each entry naming its owner and its path relative to that
//! owner's root. Owners are held weakly: a dropped owner is detected on the
//! next resolution and purged.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use crate::WatchId;

/// Stable identifier of one watch owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub owner: OwnerId,
    /// Empty for the owner's root directory.
    pub suffix: PathBuf,
}

impl RegistryEntry {
    pub fn is_root(&self) -> bool {
        self.suffix.as_os_str().is_empty()
    }
}

struct OwnerRecord<W> {
    watch: Weak<W>,
    handles: BTreeSet<WatchId>,
}

/// A live owner an event on some handle should reach.
pub struct Target<W> {
    pub owner: OwnerId,
    pub watch: Arc<W>,
    pub suffix: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
    OwnerGone,
}

/// Result of a resolution: the live targets plus handles left with no
/// entries at all, which the caller must unregister.
pub struct Resolution<W> {
    pub targets: Vec<Target<W>>,
    pub released: Vec<WatchId>,
}

pub struct PathTable<W> {
    entries: HashMap<WatchId, Vec<RegistryEntry>>,
    owners: HashMap<OwnerId, OwnerRecord<W>>,
}

impl<W> Default for PathTable<W> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            owners: HashMap::new(),
        }
    }
}

impl<W> PathTable<W> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an owner live. Inserts for owners that are not registered are refused.
    pub fn register_owner(&mut self, owner: OwnerId, watch: Weak<W>) {
        self.owners.entry(owner).or_insert_with(|| OwnerRecord {
            watch,
            handles: BTreeSet::new(),
        });
    }

    pub fn is_live(&self, owner: OwnerId) -> bool {
        self.owners.contains_key(&owner)
    }

    pub fn insert(&mut self, handle: WatchId, owner: OwnerId, suffix: PathBuf) -> InsertOutcome {
        let Some(record) = self.owners.get_mut(&owner) else {
            return InsertOutcome::OwnerGone;
        };

        let entries = self.entries.entry(handle).or_default();
        if entries.iter().any(|e| e.owner == owner) {
            return InsertOutcome::AlreadyPresent;
        }
        entries.push(RegistryEntry { owner, suffix });
        record.handles.insert(handle);
        InsertOutcome::Inserted
    }

    /// Live targets for `handle`. Entries whose owner was dropped are purged
    /// together with everything else that owner held.
    pub fn resolve(&mut self, handle: WatchId) -> Resolution<W> {
        let mut targets = Vec::new();
        let mut dead = Vec::new();

        if let Some(entries) = self.entries.get(&handle) {
            for entry in entries {
                match self.owners.get(&entry.owner).and_then(|r| r.watch.upgrade()) {
                    Some(watch) => targets.push(Target {
                        owner: entry.owner,
                        watch,
                        suffix: entry.suffix.clone(),
                    }),
                    None => dead.push(entry.owner),
                }
            }
        }

        let mut released = Vec::new();
        for owner in dead {
            released.extend(self.release_owner(owner));
        }
        Resolution { targets, released }
    }

    /// Drop an owner and all its entries. Returns handles nobody references anymore.
    pub fn release_owner(&mut self, owner: OwnerId) -> Vec<WatchId> {
        let Some(record) = self.owners.remove(&owner) else {
            return Vec::new();
        };
        record
            .handles
            .into_iter()
            .filter(|handle| self.detach(*handle, owner))
            .collect()
    }

    /// Remove one entry. Returns true if the handle is now unreferenced.
    pub fn remove_entry(&mut self, handle: WatchId, owner: OwnerId) -> bool {
        if let Some(record) = self.owners.get_mut(&owner) {
            record.handles.remove(&handle);
        }
        self.detach(handle, owner)
    }

    /// Forget a handle the facility already dropped. Returns the entries it had.
    pub fn forget_handle(&mut self, handle: WatchId) -> Vec<RegistryEntry> {
        let entries = self.entries.remove(&handle).unwrap_or_default();
        for entry in &entries {
            if let Some(record) = self.owners.get_mut(&entry.owner) {
                record.handles.remove(&handle);
            }
        }
        entries
    }

    /// Rewrite suffixes under `from` to live under `to` after a directory rename.
    pub fn rebase(&mut self, owner: OwnerId, from: &Path, to: &Path) -> usize {
        let mut moved = 0;
        for entries in self.entries.values_mut() {
            for entry in entries.iter_mut().filter(|e| e.owner == owner) {
                if let Ok(rest) = entry.suffix.strip_prefix(from) {
                    entry.suffix = if rest.as_os_str().is_empty() {
                        to.to_path_buf()
                    } else {
                        to.join(rest)
                    };
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Remove the owner's entries at or below `prefix`. Returns unreferenced handles.
    pub fn release_prefix(&mut self, owner: OwnerId, prefix: &Path) -> Vec<WatchId> {
        if prefix.as_os_str().is_empty() {
            return Vec::new();
        }

        let doomed: Vec<WatchId> = self
            .entries
            .iter()
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|e| e.owner == owner && e.suffix.starts_with(prefix))
            })
            .map(|(handle, _)| *handle)
            .collect();

        doomed
            .into_iter()
            .filter(|handle| self.remove_entry(*handle, owner))
            .collect()
    }

    pub fn handles_of(&self, owner: OwnerId) -> Vec<WatchId> {
        self.owners
            .get(&owner)
            .map(|r| r.handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Suffix of the owner's entry on `handle`.
    pub fn suffix_of(&self, handle: WatchId, owner: OwnerId) -> Option<&Path> {
        self.entries
            .get(&handle)?
            .iter()
            .find(|e| e.owner == owner)
            .map(|e| e.suffix.as_path())
    }

    /// Every live owner; dropped owners are purged and their handles returned.
    pub fn live_owners(&mut self) -> (Vec<Arc<W>>, Vec<WatchId>) {
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for (owner, record) in &self.owners {
            match record.watch.upgrade() {
                Some(watch) => live.push(watch),
                None => dead.push(*owner),
            }
        }

        let mut released = Vec::new();
        for owner in dead {
            released.extend(self.release_owner(owner));
        }
        (live, released)
    }

    pub fn handle_count(&self) -> usize {
        self.entries.len()
    }

    fn detach(&mut self, handle: WatchId, owner: OwnerId) -> bool {
        let Some(entries) = self.entries.get_mut(&handle) else {
            return false;
        };
        entries.retain(|e| e.owner != owner);
        if entries.is_empty() {
            self.entries.remove(&handle);
            true
        } else {
            false
        }
    }
}
