//! Process-wide cache of dependency values.
//!
//! The Brain is the only state shared between views, dedup followers and the
//! rendering loop. Every write goes through [`Brain::remember`], which
//! applies two rules atomically per dependency:
//!
//! - Monotonic index: a value is stored only when its index is greater than
//!   the stored one. Late or replayed responses are dropped.
//! - Change detection: subscribers are notified only when the stored value
//!   actually differs. Index-only refreshes advance the index quietly.
//!
//! Notifications are sent after the entry is written, so a subscriber that
//! receives an identity can always `recall` the new value.


use std::collections::HashSet;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::trace;

use crate::metrics::BRAIN_UPDATES;
use crate::DependencyId;
use crate::DependencyValue;

/// Last stored value of one dependency.
#[derive(Debug, Clone, PartialEq)]
pub struct BrainEntry {
    pub value: DependencyValue,
    pub index: u64,
}

/// What a call to [`Brain::remember`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberOutcome {
    /// Index not newer than the stored one
    Ignored,
    /// Index advanced, value unchanged
    Refreshed,
    /// Value stored and differs from the previous one
    Changed,
}

impl RememberOutcome {
    pub fn is_stored(&self) -> bool {
        !matches!(self, RememberOutcome::Ignored)
    }
}

/// Stream of changed dependency identities.
pub type ChangeStream = UnboundedReceiverStream<DependencyId>;

#[derive(Debug, Default)]
pub struct Brain {
    entries: DashMap<DependencyId, BrainEntry>,
    recently_updated: Mutex<HashSet<DependencyId>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<DependencyId>>>,
}

impl Brain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` for `dependency` iff `index` is newer than the stored
    /// index (or nothing is stored yet).
    pub fn remember(
        &self,
        dependency: &DependencyId,
        value: DependencyValue,
        index: u64,
    ) -> RememberOutcome {
        let outcome = match self.entries.entry(dependency.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(BrainEntry { value, index });
                RememberOutcome::Changed
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                if index <= stored.index {
                    RememberOutcome::Ignored
                } else {
                    let changed = stored.value != value;
                    stored.index = index;
                    stored.value = value;
                    if changed {
                        RememberOutcome::Changed
                    } else {
                        RememberOutcome::Refreshed
                    }
                }
            }
        };

        trace!(%dependency, index, ?outcome, "remember");

        if outcome.is_stored() {
            self.recently_updated.lock().insert(dependency.clone());
        }
        if outcome == RememberOutcome::Changed {
            BRAIN_UPDATES.inc();
            self.notify(dependency);
        }
        outcome
    }

    /// Stores `value` unconditionally, replacing any stored index.
    ///
    /// Used by the owner of a dependency after the backend reported an index
    /// lower than one already seen (e.g. the backend lost its state). Emits a
    /// change event only when the value differs.
    pub fn reset(
        &self,
        dependency: &DependencyId,
        value: DependencyValue,
        index: u64,
    ) -> RememberOutcome {
        let previous = self
            .entries
            .insert(dependency.clone(), BrainEntry { value: value.clone(), index });
        let outcome = match previous {
            Some(prev) if prev.value == value => RememberOutcome::Refreshed,
            _ => RememberOutcome::Changed,
        };

        debug!(%dependency, index, ?outcome, "reset after index regression");

        self.recently_updated.lock().insert(dependency.clone());
        if outcome == RememberOutcome::Changed {
            BRAIN_UPDATES.inc();
            self.notify(dependency);
        }
        outcome
    }

    pub fn recall(
        &self,
        dependency: &DependencyId,
    ) -> Option<DependencyValue> {
        self.entries.get(dependency).map(|e| e.value.clone())
    }

    pub fn recall_entry(
        &self,
        dependency: &DependencyId,
    ) -> Option<BrainEntry> {
        self.entries.get(dependency).map(|e| e.clone())
    }

    pub fn forget(
        &self,
        dependency: &DependencyId,
    ) -> bool {
        self.recently_updated.lock().remove(dependency);
        self.entries.remove(dependency).is_some()
    }

    /// Forgets every dependency not in `live`. Returns the forgotten ids.
    pub fn retain(
        &self,
        live: &HashSet<DependencyId>,
    ) -> Vec<DependencyId> {
        let stale: Vec<DependencyId> = self
            .entries
            .iter()
            .filter(|e| !live.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();

        for id in &stale {
            self.forget(id);
        }
        stale
    }

    /// Identities stored since the previous call. Drains the set.
    pub fn recently_updated(&self) -> HashSet<DependencyId> {
        std::mem::take(&mut *self.recently_updated.lock())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscribes to change events. Each subscriber gets its own unbounded
    /// queue; dropping the stream unsubscribes.
    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    fn notify(
        &self,
        dependency: &DependencyId,
    ) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(dependency.clone()).is_ok());
    }
}
