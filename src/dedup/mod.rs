//! Cross-instance deduplication.
//!
//! For every deduplicated template, cooperating instances elect one leader
//! through a lease-bound lock in the coordination service. The leader runs
//! the real dependency views and publishes the template's values; followers
//! adopt the published snapshot instead of watching.
//!
//! ```text
//! <prefix>/<sha256(template id)>/lock   election record, bound to the leader lease
//! <prefix>/<sha256(template id)>/term   monotonic term counter (CAS)
//! <prefix>/<sha256(template id)>/data   gzip JSON snapshot (CAS)
//! ```
//!
//! Followers never adopt a snapshot whose term is older than one they have
//! already seen, and the backend's lock primitive allows a single live
//! holder, so leadership periods are totally ordered by term.

mod election;
mod instance;
mod shared_data;

pub use election::*;
pub use instance::DedupRole;
pub use instance::DedupStatus;
pub use shared_data::*;


use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use instance::DedupInstance;
use instance::InstanceContext;

use crate::BackoffPolicy;
use crate::Brain;
use crate::DedupPolicy;
use crate::SharedClient;
use crate::Template;
use crate::TemplateId;
use crate::TemplateNodeConfig;
use crate::Watcher;

struct InstanceHandle {
    template_tx: watch::Sender<Template>,
    policy: DedupPolicy,
    status: Arc<Mutex<DedupStatus>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs one dedup instance per deduplicated template.
///
/// Instances register their templates with the shared [`Watcher`]: the
/// full dependency set while leading, only the non-shareable part while
/// following.
pub struct DedupManager {
    ctx: Arc<InstanceContext>,
    instances: Mutex<HashMap<TemplateId, InstanceHandle>>,
}

impl std::fmt::Debug for DedupManager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("DedupManager")
            .field("instance_id", &self.ctx.instance_id)
            .field("prefix", &self.ctx.prefix)
            .field("templates", &self.instances.lock().len())
            .finish()
    }
}

impl DedupManager {
    pub fn new(
        client: SharedClient,
        brain: Arc<Brain>,
        watcher: Arc<Watcher>,
        instance_id: impl Into<String>,
        prefix: impl Into<String>,
        publish_policy: BackoffPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(InstanceContext {
                client,
                brain,
                watcher,
                instance_id: instance_id.into(),
                prefix: prefix.into(),
                publish_policy,
            }),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(
        config: &TemplateNodeConfig,
        instance_id: impl Into<String>,
        client: SharedClient,
        brain: Arc<Brain>,
        watcher: Arc<Watcher>,
    ) -> Self {
        Self::new(
            client,
            brain,
            watcher,
            instance_id,
            config.dedup.prefix.clone(),
            config.retry.publish,
        )
    }

    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    /// Starts deduplicating `template`, or updates the dependency set of a
    /// running instance in place.
    ///
    /// A dependency set change never triggers a new election. A policy change
    /// restarts the instance.
    pub async fn add(
        &self,
        template: Template,
        policy: DedupPolicy,
    ) {
        let id = template.id().clone();
        let replaced = {
            let mut instances = self.instances.lock();
            match instances.get(&id).map(|h| h.policy) {
                Some(existing) if existing == policy => {
                    instances[&id].template_tx.send_if_modified(|current| {
                        if *current == template {
                            false
                        } else {
                            *current = template.clone();
                            true
                        }
                    });
                    return;
                }
                Some(_) => instances.remove(&id),
                None => None,
            }
        };

        if let Some(old) = replaced {
            debug!(template = %id, "dedup policy changed, restarting instance");
            Self::shutdown(old).await;
        }

        let (template_tx, template_rx) = watch::channel(template);
        let status = Arc::new(Mutex::new(DedupStatus {
            role: DedupRole::Following,
            term: 0,
        }));
        let cancel = CancellationToken::new();
        let instance = DedupInstance::new(self.ctx.clone(), template_rx, policy, status.clone(), cancel.clone());
        let task = tokio::spawn(instance.run());

        self.instances.lock().insert(
            id,
            InstanceHandle {
                template_tx,
                policy,
                status,
                cancel,
                task,
            },
        );
    }

    /// Stops deduplicating `id`, releasing its lease if leading. Returns
    /// false when the template was not deduplicated.
    pub async fn remove(
        &self,
        id: &TemplateId,
    ) -> bool {
        let Some(handle) = self.instances.lock().remove(id) else {
            return false;
        };
        Self::shutdown(handle).await;
        true
    }

    pub fn contains(
        &self,
        id: &TemplateId,
    ) -> bool {
        self.instances.lock().contains_key(id)
    }

    pub fn templates(&self) -> Vec<TemplateId> {
        self.instances.lock().keys().cloned().collect()
    }

    pub fn status(
        &self,
        id: &TemplateId,
    ) -> Option<DedupStatus> {
        self.instances.lock().get(id).map(|h| *h.status.lock())
    }

    pub fn is_leader(
        &self,
        id: &TemplateId,
    ) -> bool {
        self.status(id).map(|s| s.role == DedupRole::Leading).unwrap_or(false)
    }

    /// Stops every instance. Idempotent.
    pub async fn stop(&self) {
        let handles: Vec<InstanceHandle> = self.instances.lock().drain().map(|(_, h)| h).collect();
        if handles.is_empty() {
            return;
        }
        let count = handles.len();
        futures::future::join_all(handles.into_iter().map(Self::shutdown)).await;
        info!(templates = count, "dedup manager stopped");
    }

    async fn shutdown(handle: InstanceHandle) {
        handle.cancel.cancel();
        if let Err(e) = handle.task.await {
            warn!("dedup instance task failed: {:?}", e);
        }
    }
}

impl Drop for DedupManager {
    fn drop(&mut self) {
        for handle in self.instances.lock().values() {
            handle.cancel.cancel();
        }
    }
}
