//! Entry point for the rendering loop.
//!
//! A [`Manager`] owns the process-wide Brain and Watcher and, when dedup is
//! enabled, a [`DedupManager`]. Each template is routed once per reload:
//! templates matched by a dedup rule go through leader election, the rest
//! keep a private watch.


use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use tracing::info;

use crate::version::human_version;
use crate::Brain;
use crate::ChangeStream;
use crate::DedupManager;
use crate::DedupMatcher;
use crate::DedupPolicy;
use crate::DependencyId;
use crate::DependencyValue;
use crate::Result;
use crate::SharedClient;
use crate::Template;
use crate::TemplateId;
use crate::TemplateNodeConfig;
use crate::ViewSettings;
use crate::WatchError;
use crate::Watcher;

/// How a template is currently served.
#[derive(Debug, Clone, Copy)]
enum Route {
    Private,
    Dedup(DedupPolicy),
}

pub struct Manager {
    instance_id: String,
    brain: Arc<Brain>,
    watcher: Arc<Watcher>,
    dedup: Option<DedupManager>,
    matcher: DedupMatcher,
    /// Active templates and their route. Held across a reload so reloads
    /// never interleave.
    templates: Mutex<HashMap<TemplateId, (Template, Route)>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Manager {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("instance_id", &self.instance_id)
            .field("dedup", &self.dedup.is_some())
            .field("views", &self.watcher.size())
            .finish()
    }
}

impl Manager {
    /// Builds the watch pipeline from a validated configuration.
    ///
    /// # Errors
    /// `Error::Config` when a dedup rule pattern does not compile.
    pub fn new(
        config: &TemplateNodeConfig,
        client: SharedClient,
    ) -> Result<Self> {
        let matcher = config.dedup.compile()?;
        let instance_id = config.node.resolve_instance_id();
        let brain = Arc::new(Brain::new());
        let watcher = Arc::new(Watcher::new(
            client.clone(),
            brain.clone(),
            ViewSettings::from_config(config),
        ));
        let dedup = config.dedup.enabled.then(|| {
            DedupManager::from_config(config, instance_id.clone(), client, brain.clone(), watcher.clone())
        });

        Ok(Self {
            instance_id,
            brain,
            watcher,
            dedup,
            matcher,
            templates: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Starts watching the initial template set.
    pub async fn start(
        &self,
        templates: impl IntoIterator<Item = Template>,
    ) -> Result<()> {
        info!(
            version = %human_version(),
            instance_id = %self.instance_id,
            dedup = self.dedup.is_some(),
            "starting template watch"
        );
        self.set_templates(templates).await
    }

    /// Replaces the template set, e.g. after a configuration reload.
    ///
    /// Dependencies still referenced keep their views. Brain entries no
    /// longer referenced by any template are forgotten afterwards.
    ///
    /// # Errors
    /// `WatchError::Stopped` after [`Manager::stop`].
    pub async fn set_templates(
        &self,
        templates: impl IntoIterator<Item = Template>,
    ) -> Result<()> {
        let mut active = self.templates.lock().await;
        if self.stopped.load(Ordering::Acquire) {
            return Err(WatchError::Stopped.into());
        }

        let next: HashMap<TemplateId, (Template, Route)> = templates
            .into_iter()
            .map(|t| {
                let route = self.route(&t);
                (t.id().clone(), (t, route))
            })
            .collect();

        match &self.dedup {
            None => self.watcher.set_templates(next.values().map(|(t, _)| t)),
            Some(dedup) => self.apply_routes(dedup, &active, &next).await,
        }

        let live: HashSet<DependencyId> = next
            .values()
            .flat_map(|(t, _)| t.dependencies().iter().map(|d| d.id().clone()))
            .collect();
        let forgotten = self.brain.retain(&live);
        if !forgotten.is_empty() {
            debug!(count = forgotten.len(), "forgot unreferenced dependencies");
        }

        info!(
            templates = next.len(),
            deduplicated = next.values().filter(|(_, r)| matches!(r, Route::Dedup(_))).count(),
            "templates applied"
        );
        *active = next;
        Ok(())
    }

    /// One identity per change of a dependency value.
    pub fn events(&self) -> ChangeStream {
        self.brain.subscribe()
    }

    /// Views that gave up after exhausting their retry policy.
    pub fn errors(&self) -> UnboundedReceiverStream<WatchError> {
        self.watcher.errors()
    }

    pub fn recall(
        &self,
        dependency: &DependencyId,
    ) -> Option<DependencyValue> {
        self.brain.recall(dependency)
    }

    /// Whether every dependency of `template` has a value.
    pub async fn ready(
        &self,
        template: &TemplateId,
    ) -> bool {
        let active = self.templates.lock().await;
        match active.get(template) {
            Some((t, _)) => t.dependencies().iter().all(|d| self.brain.recall_entry(d.id()).is_some()),
            None => false,
        }
    }

    /// True only for deduplicated templates this instance currently leads.
    pub fn is_leader(
        &self,
        template: &TemplateId,
    ) -> bool {
        self.dedup.as_ref().map(|d| d.is_leader(template)).unwrap_or(false)
    }

    pub fn is_deduplicated(
        &self,
        template: &TemplateId,
    ) -> bool {
        self.dedup.as_ref().map(|d| d.contains(template)).unwrap_or(false)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn brain(&self) -> &Arc<Brain> {
        &self.brain
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    pub fn dedup(&self) -> Option<&DedupManager> {
        self.dedup.as_ref()
    }

    /// Stops dedup instances (releasing held leases) and then every view.
    /// Idempotent.
    pub async fn stop(&self) {
        let mut active = self.templates.lock().await;
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(dedup) = &self.dedup {
            dedup.stop().await;
        }
        self.watcher.stop().await;
        active.clear();
        info!(instance_id = %self.instance_id, "template watch stopped");
    }

    fn route(
        &self,
        template: &Template,
    ) -> Route {
        match self.matcher.policy_for(template.id()) {
            Some(policy) => Route::Dedup(policy),
            None => Route::Private,
        }
    }

    /// Applies a reload when dedup is enabled.
    ///
    /// Dedup instances own their watcher registration, so private templates
    /// are updated one by one instead of through `Watcher::set_templates`.
    /// A template's route depends only on its id, so it never changes
    /// between reloads.
    async fn apply_routes(
        &self,
        dedup: &DedupManager,
        active: &HashMap<TemplateId, (Template, Route)>,
        next: &HashMap<TemplateId, (Template, Route)>,
    ) {
        for (template, route) in next.values() {
            match route {
                Route::Private => self.watcher.add_template(template),
                Route::Dedup(policy) => dedup.add(template.clone(), *policy).await,
            }
        }

        for (id, (_, route)) in active {
            if next.contains_key(id) {
                continue;
            }
            match route {
                Route::Private => {
                    self.watcher.remove_template(id);
                }
                Route::Dedup(_) => {
                    dedup.remove(id).await;
                }
            }
        }
    }
}
