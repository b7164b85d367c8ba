//! Synced-resource tracking
//!
//! The tracker holds, per module, the references of every object the engine
//! has confirmed applied. It is only ever updated from confirmed batch
//! outcomes, never speculatively before dispatch, so an interrupted cycle
//! leaves it at its last confirmed state.

use std::collections::{BTreeMap, BTreeSet};

use crate::crd::{ModuleStatus, SyncedResource};

/// Per-module set of synced resource references
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncedResourceTracker {
    entries: BTreeMap<String, BTreeSet<SyncedResource>>,
}

impl SyncedResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the tracker from persisted module statuses
    pub fn from_module_statuses(modules: &[ModuleStatus]) -> Self {
        let entries = modules
            .iter()
            .map(|m| (m.name.clone(), m.synced.iter().cloned().collect()))
            .collect();
        Self { entries }
    }

    /// References currently tracked for `module`, in a stable order
    pub fn synced(&self, module: &str) -> Vec<SyncedResource> {
        self.entries
            .get(module)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, module: &str, resource: &SyncedResource) -> bool {
        self.entries
            .get(module)
            .is_some_and(|set| set.contains(resource))
    }

    /// Tracked references of `module` that are not part of `desired`
    ///
    /// These must be pruned before they can be forgotten.
    pub fn stale<'a>(
        &self,
        module: &str,
        desired: impl IntoIterator<Item = &'a SyncedResource>,
    ) -> Vec<SyncedResource> {
        let desired: BTreeSet<&SyncedResource> = desired.into_iter().collect();
        self.entries
            .get(module)
            .map(|set| {
                set.iter()
                    .filter(|r| !desired.contains(r))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record the confirmed result of an apply-and-prune cycle for `module`
    ///
    /// The new set is every object whose apply succeeded, plus previously
    /// tracked objects whose apply failed (they still exist from an earlier
    /// cycle), plus stale objects whose prune failed. Nothing applied
    /// successfully is ever dropped and nothing still present is orphaned.
    pub fn record_sync<'a>(
        &mut self,
        module: &str,
        applied: impl IntoIterator<Item = &'a SyncedResource>,
        apply_failed: impl IntoIterator<Item = &'a SyncedResource>,
        prune_failed: impl IntoIterator<Item = &'a SyncedResource>,
    ) {
        let previous = self.entries.remove(module).unwrap_or_default();
        let mut next: BTreeSet<SyncedResource> = applied.into_iter().cloned().collect();
        next.extend(
            apply_failed
                .into_iter()
                .filter(|r| previous.contains(*r))
                .cloned(),
        );
        next.extend(prune_failed.into_iter().cloned());
        self.entries.insert(module.to_string(), next);
    }

    /// Drop references whose removal was confirmed
    pub fn record_pruned<'a>(
        &mut self,
        module: &str,
        pruned: impl IntoIterator<Item = &'a SyncedResource>,
    ) {
        if let Some(set) = self.entries.get_mut(module) {
            for resource in pruned {
                set.remove(resource);
            }
        }
    }

    /// Forget a module once nothing is tracked for it anymore
    ///
    /// Returns `false` and keeps the entry while references remain.
    pub fn forget_module(&mut self, module: &str) -> bool {
        match self.entries.get(module) {
            Some(set) if !set.is_empty() => false,
            _ => {
                self.entries.remove(module);
                true
            }
        }
    }

    /// Total number of tracked references across all modules
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeSet::len).sum()
    }

    /// True when no module tracks any reference
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
