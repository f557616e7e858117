//! Coordination service capability
//!
//! The watch core talks to the coordination service (key/value store,
//! secret engine, scheduler catalog) exclusively through
//! [`CoordinationClient`]. Backend-specific wire protocols live behind
//! implementations of this trait:
//! - [`MemCoordinator`] - in-process backend for tests and single-node runs
//!
//! # Blocking reads
//! `fetch` and `read_key` are long polls: they return as soon as the data
//! changes past the supplied index, or after `max_wait` with the unchanged
//! data. An index of `0` never blocks.
//!
//! # Leases and locks
//! `acquire_lock` binds a key to a lease. When the lease is released or
//! expires, the backend drops the key, so at most one live holder exists per
//! key at any instant.

mod mem;

pub use mem::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;

use crate::ClientError;
use crate::Dependency;
use crate::DependencyValue;

pub type LeaseId = u64;

/// Client handle shared by every view and dedup instance of a process.
pub type SharedClient = Arc<dyn CoordinationClient>;

/// Result of a blocking dependency fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub value: DependencyValue,
    /// Backend-assigned modification index, monotonic per dependency
    pub index: u64,
}

/// Raw key as stored in the coordination service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub value: Bytes,
    /// Revision of the last write to this key
    pub revision: u64,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub ok: bool,
    /// New revision when `ok`, otherwise the revision currently stored (0
    /// when the key is absent)
    pub revision: u64,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Blocking read of one dependency.
    async fn fetch(
        &self,
        dependency: &Dependency,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<FetchResponse, ClientError>;

    /// Blocking read of a raw key. `None` when the key does not exist once
    /// the wait ends.
    async fn read_key(
        &self,
        key: &str,
        last_revision: u64,
        max_wait: Duration,
    ) -> Result<Option<KeyRecord>, ClientError>;

    /// Conditional write.
    ///
    /// `expected_revision`: `None` writes unconditionally, `Some(0)` only
    /// creates, `Some(r)` requires the stored revision to equal `r`.
    async fn write_key(
        &self,
        key: &str,
        value: Bytes,
        expected_revision: Option<u64>,
    ) -> Result<WriteOutcome, ClientError>;

    async fn create_lease(
        &self,
        ttl: Duration,
    ) -> Result<LeaseId, ClientError>;

    /// Extends the lease by its ttl. `ClientError::LeaseNotFound` once it
    /// has expired.
    async fn renew_lease(
        &self,
        lease: LeaseId,
    ) -> Result<(), ClientError>;

    /// Revokes the lease and drops every key locked with it.
    async fn release_lease(
        &self,
        lease: LeaseId,
    ) -> Result<(), ClientError>;

    /// Atomically creates `key` bound to `lease`. `false` when another live
    /// lease holds the key; `true` when it is free or already held by
    /// `lease` (the value is refreshed in both successful cases).
    async fn acquire_lock(
        &self,
        key: &str,
        lease: LeaseId,
        value: Bytes,
    ) -> Result<bool, ClientError>;
}
