use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::interval_at;
use tokio::time::sleep;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::election;
use super::DedupKeys;
use super::SharedRenderData;
use super::SharedValue;
use crate::async_task::task_with_timeout_and_exponential_backoff;
use crate::metrics::DEDUP_ROLE;
use crate::metrics::LEADERSHIP_TRANSITIONS;
use crate::metrics::SHARED_DATA_PUBLISHED;
use crate::metrics::SHARED_DATA_REJECTED;
use crate::time::get_now_as_millis;
use crate::version::VERSION;
use crate::BackoffPolicy;
use crate::Brain;
use crate::ClientError;
use crate::DedupError;
use crate::DedupPolicy;
use crate::DependencyId;
use crate::Error;
use crate::KeyRecord;
use crate::LeaseId;
use crate::Result;
use crate::SharedClient;
use crate::Template;
use crate::Watcher;

/// Role of this instance for one deduplicated template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupRole {
    Following,
    Leading,
    Stopped,
}

/// Snapshot of one dedup instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupStatus {
    pub role: DedupRole,
    /// Term held while leading, otherwise the newest term adopted
    pub term: u64,
}

/// Process-wide collaborators shared by every dedup instance.
pub(crate) struct InstanceContext {
    pub(crate) client: SharedClient,
    pub(crate) brain: Arc<Brain>,
    pub(crate) watcher: Arc<Watcher>,
    pub(crate) instance_id: String,
    pub(crate) prefix: String,
    pub(crate) publish_policy: BackoffPolicy,
}

enum Leadership {
    /// Lock lost or lease gone; go back to following
    Abdicated,
    Stopped,
}

/// Election and data sharing for one template.
///
/// Following: keeps only non-shareable dependencies watched locally,
/// long-polls the shared data key and retries the election on a fixed
/// interval. Leading: watches every dependency, publishes a snapshot on
/// each change and renews the lease on the heartbeat interval.
pub(crate) struct DedupInstance {
    ctx: Arc<InstanceContext>,
    template: Template,
    template_rx: watch::Receiver<Template>,
    keys: DedupKeys,
    policy: DedupPolicy,
    status: Arc<Mutex<DedupStatus>>,
    cancel: CancellationToken,
    /// Newest term adopted or held; snapshots below it are discarded
    last_term: u64,
}

impl DedupInstance {
    pub(crate) fn new(
        ctx: Arc<InstanceContext>,
        template_rx: watch::Receiver<Template>,
        policy: DedupPolicy,
        status: Arc<Mutex<DedupStatus>>,
        cancel: CancellationToken,
    ) -> Self {
        let template = template_rx.borrow().clone();
        let keys = DedupKeys::for_template(&ctx.prefix, template.id());
        Self {
            ctx,
            template,
            template_rx,
            keys,
            policy,
            status,
            cancel,
            last_term: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(template = %self.template.id(), lock = %self.keys.lock, "dedup instance started");

        while let Some((lease, term)) = self.follow().await {
            match self.lead(lease, term).await {
                Leadership::Abdicated => continue,
                Leadership::Stopped => {
                    self.release(lease).await;
                    break;
                }
            }
        }

        self.ctx.watcher.remove_template(self.template.id());
        self.set_status(DedupRole::Stopped, self.last_term);
        let _ = DEDUP_ROLE.remove_label_values(&[self.template.id().as_str()]);
        info!(template = %self.template.id(), "dedup instance stopped");
    }

    /// Runs the follower loop until this instance wins the election.
    /// `None` once cancelled.
    async fn follow(&mut self) -> Option<(LeaseId, u64)> {
        self.ctx.watcher.add_template(&self.template.local_only());
        self.set_status(DedupRole::Following, self.last_term);
        DEDUP_ROLE.with_label_values(&[self.template.id().as_str()]).set(0);

        let mut acquire = interval(self.policy.acquire_retry_interval);
        acquire.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_revision = 0;
        let mut poll = self.poll_shared(0, Duration::ZERO);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                changed = self.template_rx.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                    self.template = self.template_rx.borrow_and_update().clone();
                    self.ctx.watcher.add_template(&self.template.local_only());
                }
                _ = acquire.tick() => {
                    match self.try_become_leader().await {
                        Ok(Some(won)) => return Some(won),
                        Ok(None) => {}
                        Err(e) => debug!(template = %self.template.id(), "election attempt failed: {:?}", e),
                    }
                }
                polled = &mut poll => {
                    poll = match polled {
                        Ok(Some(record)) => {
                            if record.revision != last_revision {
                                last_revision = record.revision;
                                self.adopt(&record.value);
                            }
                            self.poll_shared(last_revision, Duration::ZERO)
                        }
                        Ok(None) => {
                            last_revision = 0;
                            self.poll_shared(0, self.policy.acquire_retry_interval)
                        }
                        Err(e) => {
                            debug!(template = %self.template.id(), "shared data poll failed: {:?}", e);
                            self.poll_shared(last_revision, self.policy.acquire_retry_interval)
                        }
                    };
                }
            }
        }
    }

    /// Runs the leader loop for the term just won.
    async fn lead(
        &mut self,
        lease: LeaseId,
        term: u64,
    ) -> Leadership {
        let id = self.template.id().clone();
        info!(template = %id, term, lease, "leading");
        self.last_term = term;
        self.set_status(DedupRole::Leading, term);
        DEDUP_ROLE.with_label_values(&[id.as_str()]).set(1);
        LEADERSHIP_TRANSITIONS.with_label_values(&[id.as_str()]).inc();

        let mut changes = self.ctx.brain.subscribe();
        self.ctx.watcher.add_template(&self.template);

        let heartbeat_every = self.policy.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_renewal = Instant::now();
        let mut data_revision: Option<u64> = None;
        let mut dirty = true;
        let mut publish_failed = false;

        let outcome = loop {
            if dirty {
                dirty = false;
                match self.publish(term, &mut data_revision).await {
                    Ok(()) => publish_failed = false,
                    Err(Error::Dedup(DedupError::StaleWriteRejected { key, expected })) => {
                        debug!(template = %id, %key, ?expected, "publish rejected, re-checking election record");
                        if self.still_leader(lease).await {
                            data_revision = None;
                            dirty = true;
                        } else {
                            let lost = DedupError::LeadershipLost {
                                template: id.to_string(),
                                term,
                            };
                            warn!("{}", lost);
                            break Leadership::Abdicated;
                        }
                    }
                    Err(e) => {
                        warn!(template = %id, "publish failed, retrying on next heartbeat: {:?}", e);
                        publish_failed = true;
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Leadership::Stopped,
                changed = self.template_rx.changed() => {
                    if changed.is_err() {
                        break Leadership::Stopped;
                    }
                    self.template = self.template_rx.borrow_and_update().clone();
                    self.ctx.watcher.add_template(&self.template);
                    dirty = true;
                }
                _ = heartbeat.tick() => {
                    let attempted_at = Instant::now();
                    match self.ctx.client.renew_lease(lease).await {
                        Ok(()) => last_renewal = attempted_at,
                        Err(ClientError::LeaseNotFound(_)) => {
                            warn!(template = %id, term, lease, "lease expired, abdicating");
                            break Leadership::Abdicated;
                        }
                        Err(e) if last_renewal.elapsed() >= self.policy.lease_ttl => {
                            let unavailable = DedupError::BackendUnavailable {
                                template: id.to_string(),
                                reason: e.to_string(),
                            };
                            warn!("{}, abdicating", unavailable);
                            break Leadership::Abdicated;
                        }
                        Err(e) => debug!(template = %id, "lease renewal failed: {:?}", e),
                    }
                    dirty = publish_failed;
                }
                Some(changed) = changes.next() => {
                    dirty = self.is_shared(&changed);
                    // Coalesce changes that are already queued
                    while let Ok(more) = changes.as_mut().try_recv() {
                        dirty |= self.is_shared(&more);
                    }
                }
            }
        };

        if matches!(outcome, Leadership::Abdicated) {
            LEADERSHIP_TRANSITIONS.with_label_values(&[id.as_str()]).inc();
            self.release(lease).await;
        }
        outcome
    }

    async fn try_become_leader(&self) -> Result<Option<(LeaseId, u64)>> {
        let client = &self.ctx.client;
        let lease = client.create_lease(self.policy.lease_ttl).await?;

        let acquired = election::try_acquire(
            client.as_ref(),
            &self.keys,
            &self.ctx.instance_id,
            lease,
            self.policy.lease_ttl,
        )
        .await;

        match acquired {
            Ok(Some(term)) if term > self.last_term => Ok(Some((lease, term))),
            Ok(Some(term)) => {
                // Term key lags behind data we already adopted
                warn!(template = %self.template.id(), term, last_term = self.last_term, "won a stale term, retrying");
                let _ = client.release_lease(lease).await;
                Ok(None)
            }
            Ok(None) => {
                let _ = client.release_lease(lease).await;
                Ok(None)
            }
            Err(e) => {
                let _ = client.release_lease(lease).await;
                Err(e)
            }
        }
    }

    /// Applies a snapshot published by the leader.
    fn adopt(
        &mut self,
        raw: &[u8],
    ) {
        let data = match SharedRenderData::decode(raw) {
            Ok(data) => data,
            Err(e) => {
                self.reject(e.to_string());
                return;
            }
        };
        if data.term < self.last_term {
            self.reject(format!("term {} is older than observed term {}", data.term, self.last_term));
            return;
        }
        if data.version != VERSION {
            debug!(template = %self.template.id(), producer = %data.version, "shared data from a different version");
        }

        let mut stored = 0;
        for (id, shared) in data.values {
            if !self.is_shared(&id) {
                continue;
            }
            if self.ctx.brain.remember(&id, shared.value, shared.index).is_stored() {
                stored += 1;
            }
        }
        self.last_term = data.term;
        self.set_status(DedupRole::Following, data.term);
        debug!(template = %self.template.id(), term = data.term, stored, "adopted shared data");
    }

    fn reject(
        &self,
        reason: String,
    ) {
        SHARED_DATA_REJECTED.with_label_values(&[self.template.id().as_str()]).inc();
        let malformed = DedupError::MalformedSharedData {
            key: self.keys.data.clone(),
            reason,
        };
        warn!("{}, ignored", malformed);
    }

    async fn publish(
        &self,
        term: u64,
        expected_revision: &mut Option<u64>,
    ) -> Result<()> {
        let values: BTreeMap<DependencyId, SharedValue> = self
            .template
            .shareable_dependencies()
            .filter_map(|dep| {
                self.ctx.brain.recall_entry(dep.id()).map(|entry| {
                    (
                        dep.id().clone(),
                        SharedValue {
                            value: entry.value,
                            index: entry.index,
                        },
                    )
                })
            })
            .collect();
        let count = values.len();
        let encoded = SharedRenderData {
            version: VERSION.to_string(),
            term,
            generated_at: get_now_as_millis(),
            values,
        }
        .encode()?;

        let expected = match *expected_revision {
            Some(revision) => revision,
            None => self
                .ctx
                .client
                .read_key(&self.keys.data, 0, Duration::ZERO)
                .await?
                .map(|r| r.revision)
                .unwrap_or(0),
        };

        let client = self.ctx.client.clone();
        let key = self.keys.data.clone();
        let outcome = task_with_timeout_and_exponential_backoff(
            || {
                let client = client.clone();
                let key = key.clone();
                let encoded = encoded.clone();
                async move { client.write_key(&key, encoded, Some(expected)).await.map_err(Error::from) }
            },
            self.ctx.publish_policy,
        )
        .await?;

        if !outcome.ok {
            return Err(Error::Dedup(DedupError::StaleWriteRejected {
                key: self.keys.data.clone(),
                expected: Some(expected),
            }));
        }

        *expected_revision = Some(outcome.revision);
        SHARED_DATA_PUBLISHED.with_label_values(&[self.template.id().as_str()]).inc();
        debug!(template = %self.template.id(), term, values = count, revision = outcome.revision, "published shared data");
        Ok(())
    }

    /// Whether the election record still names our lease.
    async fn still_leader(
        &self,
        lease: LeaseId,
    ) -> bool {
        match election::current_leader(self.ctx.client.as_ref(), &self.keys).await {
            Ok(Some(record)) => record.lease_id == lease && record.leader == self.ctx.instance_id,
            Ok(None) => false,
            Err(e) => {
                debug!(template = %self.template.id(), "could not read election record: {:?}", e);
                false
            }
        }
    }

    /// Best-effort lease release.
    async fn release(
        &self,
        lease: LeaseId,
    ) {
        let client = self.ctx.client.clone();
        let released = task_with_timeout_and_exponential_backoff(
            || {
                let client = client.clone();
                async move { client.release_lease(lease).await.map_err(Error::from) }
            },
            self.ctx.publish_policy,
        )
        .await;
        if let Err(e) = released {
            debug!(template = %self.template.id(), lease, "lease release failed, it will expire: {:?}", e);
        }
    }

    fn is_shared(
        &self,
        id: &DependencyId,
    ) -> bool {
        self.template.shareable_dependencies().any(|d| d.id() == id)
    }

    fn poll_shared(
        &self,
        last_revision: u64,
        delay: Duration,
    ) -> BoxFuture<'static, std::result::Result<Option<KeyRecord>, ClientError>> {
        let client = self.ctx.client.clone();
        let key = self.keys.data.clone();
        let max_wait = self.policy.max_wait;
        async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            client.read_key(&key, last_revision, max_wait).await
        }
        .boxed()
    }

    fn set_status(
        &self,
        role: DedupRole,
        term: u64,
    ) {
        *self.status.lock() = DedupStatus { role, term };
    }
}
