//! In-process coordination backend.
//!
//! Keeps revisioned keys, TTL leases and lease-bound locks behind one mutex.
//! Every dependency is served from the key named by its identity, so
//! `put_value(&Dependency::kv("/a"), ..)` writes key `kv:/a`.
//!
//! Leases expire lazily: every operation first reaps expired leases and the
//! lock keys bound to them.
//!
//! Handles returned by [`MemCoordinator::client`] share the store but carry
//! their own fault switches, which lets one simulated instance lose the
//! backend while the others keep working.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

use crate::ClientError;
use crate::CoordinationClient;
use crate::Dependency;
use crate::DependencyValue;
use crate::FetchResponse;
use crate::KeyRecord;
use crate::LeaseId;
use crate::WriteOutcome;

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct LeaseState {
    ttl: Duration,
    expires_at: Instant,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct Store {
    revision: u64,
    entries: HashMap<String, Entry>,
    /// Revision at which a key was last deleted
    tombstones: HashMap<String, u64>,
    leases: HashMap<LeaseId, LeaseState>,
}

impl Store {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Revision a blocking reader compares against.
    fn key_revision(
        &self,
        key: &str,
    ) -> u64 {
        self.entries
            .get(key)
            .map(|e| e.mod_revision)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(0)
    }

    fn delete(
        &mut self,
        key: &str,
    ) -> bool {
        if self.entries.remove(key).is_some() {
            let rev = self.bump();
            self.tombstones.insert(key.to_string(), rev);
            true
        } else {
            false
        }
    }

    fn drop_lease(
        &mut self,
        lease: LeaseId,
    ) -> bool {
        let Some(state) = self.leases.remove(&lease) else {
            return false;
        };
        for key in state.keys {
            let owned = self.entries.get(&key).map(|e| e.lease == Some(lease)).unwrap_or(false);
            if owned {
                self.delete(&key);
            }
        }
        true
    }

    /// Returns true when anything was removed.
    fn reap_expired(
        &mut self,
        now: Instant,
    ) -> bool {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut changed = false;
        for lease in expired {
            debug!(lease, "lease expired");
            changed |= self.drop_lease(lease);
        }
        changed
    }
}

#[derive(Debug)]
struct Shared {
    store: Mutex<Store>,
    next_lease: AtomicU64,
    revision_tx: watch::Sender<u64>,
    fetch_counts: DashMap<String, u64>,
}

impl Shared {
    fn notify(&self) {
        let rev = self.store.lock().revision;
        self.revision_tx.send_replace(rev);
    }

    /// Reaps expired leases and wakes blocked readers if that changed keys.
    fn reap(&self) {
        let changed = self.store.lock().reap_expired(Instant::now());
        if changed {
            self.notify();
        }
    }
}

/// Shared in-memory store.
#[derive(Debug, Clone)]
pub struct MemCoordinator {
    shared: Arc<Shared>,
}

impl Default for MemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemCoordinator {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::default()),
                next_lease: AtomicU64::new(1),
                revision_tx,
                fetch_counts: DashMap::new(),
            }),
        }
    }

    /// New handle onto this store with its own fault switches.
    pub fn client(&self) -> MemClient {
        MemClient {
            shared: self.shared.clone(),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Writes `value` for `dependency`, returning the new index.
    pub fn put_value(
        &self,
        dependency: &Dependency,
        value: DependencyValue,
    ) -> u64 {
        self.put(dependency.id().as_str(), Bytes::from(value.to_string()))
    }

    /// Unconditional raw write, returning the new revision.
    pub fn put(
        &self,
        key: &str,
        value: Bytes,
    ) -> u64 {
        let rev = {
            let mut store = self.shared.store.lock();
            let rev = store.bump();
            let lease = store.entries.get(key).and_then(|e| e.lease);
            store.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    mod_revision: rev,
                    lease,
                },
            );
            rev
        };
        self.shared.notify();
        rev
    }

    pub fn delete(
        &self,
        key: &str,
    ) -> bool {
        let deleted = self.shared.store.lock().delete(key);
        if deleted {
            self.shared.notify();
        }
        deleted
    }

    /// Current raw value of `key`, after reaping expired leases.
    pub fn get(
        &self,
        key: &str,
    ) -> Option<KeyRecord> {
        self.shared.reap();
        self.shared.store.lock().entries.get(key).map(|e| KeyRecord {
            value: e.value.clone(),
            revision: e.mod_revision,
        })
    }

    /// Lease currently holding `key`, if any.
    pub fn lock_holder(
        &self,
        key: &str,
    ) -> Option<LeaseId> {
        self.shared.reap();
        self.shared.store.lock().entries.get(key).and_then(|e| e.lease)
    }

    pub fn live_leases(&self) -> usize {
        self.shared.reap();
        self.shared.store.lock().leases.len()
    }

    /// Number of `fetch` calls issued for a dependency across all clients.
    pub fn fetch_count(
        &self,
        dependency: &Dependency,
    ) -> u64 {
        self.shared
            .fetch_counts
            .get(dependency.id().as_str())
            .map(|c| *c)
            .unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_renewals: AtomicBool,
    fetch_failures: DashMap<String, usize>,
}

/// One instance's connection to a [`MemCoordinator`].
#[derive(Debug, Clone)]
pub struct MemClient {
    shared: Arc<Shared>,
    faults: Arc<Faults>,
}

impl MemClient {
    /// Every call fails with `ClientError::Unavailable` while set.
    pub fn set_unavailable(
        &self,
        unavailable: bool,
    ) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Only lease renewals fail while set.
    pub fn set_fail_renewals(
        &self,
        fail: bool,
    ) {
        self.faults.fail_renewals.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` fetches of `dependency`.
    pub fn fail_fetches(
        &self,
        dependency: &Dependency,
        count: usize,
    ) {
        self.faults.fetch_failures.insert(dependency.id().to_string(), count);
    }

    fn check_available(&self) -> Result<(), ClientError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("injected partition".into()));
        }
        Ok(())
    }

    fn take_fetch_failure(
        &self,
        key: &str,
    ) -> bool {
        let mut injected = false;
        self.faults.fetch_failures.remove_if_mut(key, |_, remaining| {
            injected = *remaining > 0;
            *remaining = remaining.saturating_sub(1);
            *remaining == 0
        });
        injected
    }

    /// Waits until `key` moves past `last_revision` or `max_wait` elapses.
    async fn block_on_key(
        &self,
        key: &str,
        last_revision: u64,
        max_wait: Duration,
    ) -> Result<(Option<Entry>, u64), ClientError> {
        let deadline = Instant::now() + max_wait;
        let mut revision_rx = self.shared.revision_tx.subscribe();

        loop {
            self.check_available()?;
            self.shared.reap();
            {
                let store = self.shared.store.lock();
                let current = store.key_revision(key);
                if last_revision == 0 || current > last_revision || Instant::now() >= deadline {
                    return Ok((store.entries.get(key).cloned(), current));
                }
            }

            // Wake on the next write, or re-check when the deadline passes
            // or the earliest lease could have expired.
            let wake_at = self.next_expiry().map(|e| e.min(deadline)).unwrap_or(deadline);
            match tokio::time::timeout_at(wake_at, revision_rx.changed()).await {
                Ok(Ok(())) | Err(_) => continue,
                Ok(Err(_)) => return Err(ClientError::Unavailable("store dropped".into())),
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.shared.store.lock().leases.values().map(|l| l.expires_at).min()
    }
}

#[async_trait]
impl CoordinationClient for MemClient {
    async fn fetch(
        &self,
        dependency: &Dependency,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<FetchResponse, ClientError> {
        let key = dependency.id().as_str();
        *self.shared.fetch_counts.entry(key.to_string()).or_insert(0) += 1;

        self.check_available()?;
        if self.take_fetch_failure(key) {
            return Err(ClientError::Backend(format!("injected failure for {key}")));
        }

        let (entry, revision) = self.block_on_key(key, last_index, max_wait).await?;

        let value = match entry {
            Some(e) => serde_json::from_slice(&e.value)
                .unwrap_or_else(|_| DependencyValue::String(String::from_utf8_lossy(&e.value).into_owned())),
            None => DependencyValue::Null,
        };
        let index = revision.max(last_index).max(1);
        trace!(dependency = %dependency, index, "fetch returned");

        Ok(FetchResponse { value, index })
    }

    async fn read_key(
        &self,
        key: &str,
        last_revision: u64,
        max_wait: Duration,
    ) -> Result<Option<KeyRecord>, ClientError> {
        let (entry, _) = self.block_on_key(key, last_revision, max_wait).await?;
        Ok(entry.map(|e| KeyRecord {
            value: e.value,
            revision: e.mod_revision,
        }))
    }

    async fn write_key(
        &self,
        key: &str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome, ClientError> {
        self.check_available()?;
        self.shared.reap();

        let outcome = {
            let mut store = self.shared.store.lock();
            let current = store.entries.get(key).map(|e| e.mod_revision).unwrap_or(0);
            let allowed = match expected_revision {
                None => true,
                Some(expected) => expected == current,
            };
            if !allowed {
                return Ok(WriteOutcome {
                    ok: false,
                    revision: current,
                });
            }

            let rev = store.bump();
            let lease = store.entries.get(key).and_then(|e| e.lease);
            store.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    mod_revision: rev,
                    lease,
                },
            );
            WriteOutcome { ok: true, revision: rev }
        };

        self.shared.notify();
        Ok(outcome)
    }

    async fn create_lease(
        &self,
        ttl: Duration,
    ) -> Result<LeaseId, ClientError> {
        self.check_available()?;
        let id = self.shared.next_lease.fetch_add(1, Ordering::SeqCst);
        self.shared.store.lock().leases.insert(
            id,
            LeaseState {
                ttl,
                expires_at: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn renew_lease(
        &self,
        lease: LeaseId,
    ) -> Result<(), ClientError> {
        self.check_available()?;
        if self.faults.fail_renewals.load(Ordering::SeqCst) {
            return Err(ClientError::Unavailable("injected renewal failure".into()));
        }
        self.shared.reap();

        let mut store = self.shared.store.lock();
        let state = store.leases.get_mut(&lease).ok_or(ClientError::LeaseNotFound(lease))?;
        state.expires_at = Instant::now() + state.ttl;
        Ok(())
    }

    async fn release_lease(
        &self,
        lease: LeaseId,
    ) -> Result<(), ClientError> {
        self.check_available()?;
        let dropped = self.shared.store.lock().drop_lease(lease);
        if dropped {
            self.shared.notify();
        }
        Ok(())
    }

    async fn acquire_lock(
        &self,
        key: &str,
        lease: LeaseId,
        value: Bytes,
    ) -> Result<bool, ClientError> {
        self.check_available()?;
        self.shared.reap();

        {
            let mut store = self.shared.store.lock();
            if !store.leases.contains_key(&lease) {
                return Err(ClientError::LeaseNotFound(lease));
            }
            if let Some(holder) = store.entries.get(key).and_then(|e| e.lease) {
                if holder != lease {
                    return Ok(false);
                }
            }

            let rev = store.bump();
            store.entries.insert(
                key.to_string(),
                Entry {
                    value,
                    mod_revision: rev,
                    lease: Some(lease),
                },
            );
            if let Some(state) = store.leases.get_mut(&lease) {
                state.keys.insert(key.to_string());
            }
        }

        self.shared.notify();
        Ok(true)
    }
}
