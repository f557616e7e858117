use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::View;
use super::ViewInfo;
use super::ViewSettings;
use super::ViewState;
use crate::Brain;
use crate::ChangeStream;
use crate::Dependency;
use crate::DependencyId;
use crate::SharedClient;
use crate::Template;
use crate::TemplateId;
use crate::WatchError;

/// Fans watch errors out to every `errors()` subscriber.
#[derive(Debug, Default)]
pub(crate) struct ErrorFanout {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WatchError>>>,
}

impl ErrorFanout {
    pub(crate) fn subscribe(&self) -> UnboundedReceiverStream<WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    pub(crate) fn publish(
        &self,
        error: WatchError,
    ) {
        self.subscribers.lock().retain(|tx| tx.send(error.clone()).is_ok());
    }
}

struct ViewHandle {
    /// Templates referencing the dependency, plus one for a direct `add`
    refs: usize,
    status: Arc<Mutex<ViewInfo>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ViewHandle {
    /// False once the view ended on its own (once mode, retries exhausted).
    fn is_running(&self) -> bool {
        self.status.lock().state != ViewState::Stopped
    }
}

#[derive(Default)]
struct Registry {
    views: HashMap<DependencyId, ViewHandle>,
    templates: HashMap<TemplateId, BTreeSet<Dependency>>,
    direct: HashSet<DependencyId>,
    stopped: bool,
}

/// Registry and scheduler of dependency views.
///
/// Views are reference counted by the templates (and direct `add` calls)
/// that need them. A view starts when its count goes from 0 to 1 and is
/// cancelled when it drops back to 0; views whose dependency stays
/// referenced are never restarted.
///
/// Methods that may start a view must be called from within a tokio
/// runtime.
pub struct Watcher {
    client: SharedClient,
    brain: Arc<Brain>,
    settings: ViewSettings,
    registry: Mutex<Registry>,
    errors: Arc<ErrorFanout>,
    next_instance: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Watcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("Watcher")
            .field("views", &registry.views.len())
            .field("templates", &registry.templates.len())
            .field("stopped", &registry.stopped)
            .finish()
    }
}

impl Watcher {
    pub fn new(
        client: SharedClient,
        brain: Arc<Brain>,
        settings: ViewSettings,
    ) -> Self {
        Self {
            client,
            brain,
            settings,
            registry: Mutex::new(Registry::default()),
            errors: Arc::new(ErrorFanout::default()),
            next_instance: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn brain(&self) -> &Arc<Brain> {
        &self.brain
    }

    /// Replaces the active template set.
    ///
    /// Views for dependencies shared between the old and new set keep
    /// running untouched.
    pub fn set_templates<'a>(
        &self,
        templates: impl IntoIterator<Item = &'a Template>,
    ) {
        let next: HashMap<TemplateId, BTreeSet<Dependency>> = templates
            .into_iter()
            .map(|t| (t.id().clone(), t.dependencies().clone()))
            .collect();

        let mut registry = self.registry.lock();
        if registry.stopped {
            warn!("set_templates on a stopped watcher");
            return;
        }

        // Acquire before release so shared dependencies never reach zero
        for deps in next.values() {
            for dep in deps {
                self.acquire(&mut registry, dep);
            }
        }
        let previous = std::mem::replace(&mut registry.templates, next);
        for deps in previous.values() {
            for dep in deps {
                self.release(&mut registry, dep.id());
            }
        }

        info!(
            templates = registry.templates.len(),
            views = registry.views.len(),
            "template set updated"
        );
    }

    /// Adds or replaces one template, keyed by its id.
    pub fn add_template(
        &self,
        template: &Template,
    ) {
        let mut registry = self.registry.lock();
        if registry.stopped {
            return;
        }

        for dep in template.dependencies() {
            self.acquire(&mut registry, dep);
        }
        let previous = registry
            .templates
            .insert(template.id().clone(), template.dependencies().clone());
        for dep in previous.iter().flatten() {
            self.release(&mut registry, dep.id());
        }
        debug!(template = %template.id(), "template added");
    }

    /// Returns false when the template was not registered.
    pub fn remove_template(
        &self,
        id: &TemplateId,
    ) -> bool {
        let mut registry = self.registry.lock();
        let Some(deps) = registry.templates.remove(id) else {
            return false;
        };
        for dep in &deps {
            self.release(&mut registry, dep.id());
        }
        debug!(template = %id, "template removed");
        true
    }

    /// Watches `dependency` independently of any template. Returns true when
    /// this started a new view.
    pub fn add(
        &self,
        dependency: Dependency,
    ) -> bool {
        let mut registry = self.registry.lock();
        if registry.stopped || !registry.direct.insert(dependency.id().clone()) {
            return false;
        }
        self.acquire(&mut registry, &dependency)
    }

    /// Drops a reference taken with [`Watcher::add`]. Returns true when the
    /// dependency had been added directly.
    pub fn remove(
        &self,
        id: &DependencyId,
    ) -> bool {
        let mut registry = self.registry.lock();
        if !registry.direct.remove(id) {
            return false;
        }
        self.release(&mut registry, id);
        true
    }

    /// Whether a view for `id` is running.
    pub fn watching(
        &self,
        id: &DependencyId,
    ) -> bool {
        self.registry.lock().views.get(id).is_some_and(ViewHandle::is_running)
    }

    /// Number of distinct dependencies with a running view.
    pub fn size(&self) -> usize {
        self.registry.lock().views.values().filter(|h| h.is_running()).count()
    }

    pub fn dependencies(&self) -> BTreeSet<DependencyId> {
        self.registry
            .lock()
            .views
            .iter()
            .filter(|(_, h)| h.is_running())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Status of the view for `id`. A view that ended on its own stays
    /// visible here as `Stopped` until it is released or re-acquired.
    pub fn view_info(
        &self,
        id: &DependencyId,
    ) -> Option<ViewInfo> {
        self.registry.lock().views.get(id).map(|h| h.status.lock().clone())
    }

    /// One identity per change of a dependency value in the brain.
    pub fn events(&self) -> ChangeStream {
        self.brain.subscribe()
    }

    /// Views that gave up after exhausting their retry policy.
    pub fn errors(&self) -> UnboundedReceiverStream<WatchError> {
        self.errors.subscribe()
    }

    /// Cancels every view and waits for them to finish. Idempotent.
    pub async fn stop(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.registry.lock();
            if registry.stopped {
                return;
            }
            registry.stopped = true;
            registry.templates.clear();
            registry.direct.clear();
            registry.views.drain().map(|(_, h)| h.task).collect()
        };

        self.shutdown.cancel();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("view task failed: {:?}", e);
            }
        }
        info!("watcher stopped");
    }

    /// Returns true when a new view was spawned. A view that ended on its
    /// own is replaced, so a reload that still references its dependency
    /// watches it again.
    fn acquire(
        &self,
        registry: &mut Registry,
        dependency: &Dependency,
    ) -> bool {
        let refs = match registry.views.get_mut(dependency.id()) {
            Some(handle) if handle.is_running() => {
                handle.refs += 1;
                return false;
            }
            Some(handle) => handle.refs + 1,
            None => 1,
        };

        let instance_id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let status = Arc::new(Mutex::new(ViewInfo::new(instance_id)));
        let cancel = self.shutdown.child_token();
        let view = View::new(
            dependency.clone(),
            self.client.clone(),
            self.brain.clone(),
            self.settings,
            status.clone(),
            cancel.clone(),
            self.errors.clone(),
        );
        let task = tokio::spawn(view.run());

        debug!(dependency = %dependency, instance_id, refs, "view spawned");
        registry.views.insert(
            dependency.id().clone(),
            ViewHandle {
                refs,
                status,
                cancel,
                task,
            },
        );
        true
    }

    fn release(
        &self,
        registry: &mut Registry,
        id: &DependencyId,
    ) {
        let Some(handle) = registry.views.get_mut(id) else {
            return;
        };
        handle.refs = handle.refs.saturating_sub(1);
        if handle.refs == 0 {
            if let Some(handle) = registry.views.remove(id) {
                handle.cancel.cancel();
                debug!(dependency = %id, "view cancelled");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
