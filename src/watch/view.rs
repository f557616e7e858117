use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::ErrorFanout;
use crate::backoff::ExponentialBackoff;
use crate::metrics::ACTIVE_VIEWS;
use crate::metrics::FETCH_ERRORS;
use crate::time::get_now_as_millis;
use crate::BackoffPolicy;
use crate::Brain;
use crate::ClientError;
use crate::Dependency;
use crate::FetchResponse;
use crate::SharedClient;
use crate::TemplateNodeConfig;
use crate::WatchError;

/// Lifecycle of a view.
///
/// `Idle -> Fetching -> (Delivered | Errored) -> Fetching -> ...` until
/// `Stopped`, which is terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Idle,
    Fetching,
    Delivered,
    Errored,
    Stopped,
}

/// Point-in-time snapshot of a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewInfo {
    /// Unique per spawned view; survives template set changes as long as the
    /// dependency stays referenced
    pub instance_id: u64,
    pub state: ViewState,
    pub last_index: u64,
    /// Total failed fetches since the view started
    pub error_count: u64,
    /// Milliseconds since the unix epoch of the last completed fetch
    pub last_fetch_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl ViewInfo {
    pub(crate) fn new(instance_id: u64) -> Self {
        Self {
            instance_id,
            state: ViewState::Idle,
            last_index: 0,
            error_count: 0,
            last_fetch_ms: None,
            last_error: None,
        }
    }
}

/// Fetch cadence shared by all views of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewSettings {
    pub max_wait: Duration,
    pub min_fetch_interval: Duration,
    pub once: bool,
    pub retry: BackoffPolicy,
}

impl ViewSettings {
    pub fn from_config(config: &TemplateNodeConfig) -> Self {
        Self {
            max_wait: config.watch.max_wait(),
            min_fetch_interval: config.watch.min_fetch_interval(),
            once: config.watch.once,
            retry: config.retry.fetch,
        }
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::from_config(&TemplateNodeConfig::default())
    }
}

/// Watch loop of one dependency.
pub(crate) struct View {
    dependency: Dependency,
    client: SharedClient,
    brain: Arc<Brain>,
    settings: ViewSettings,
    status: Arc<Mutex<ViewInfo>>,
    cancel: CancellationToken,
    errors: Arc<ErrorFanout>,
}

impl View {
    pub(crate) fn new(
        dependency: Dependency,
        client: SharedClient,
        brain: Arc<Brain>,
        settings: ViewSettings,
        status: Arc<Mutex<ViewInfo>>,
        cancel: CancellationToken,
        errors: Arc<ErrorFanout>,
    ) -> Self {
        Self {
            dependency,
            client,
            brain,
            settings,
            status,
            cancel,
            errors,
        }
    }

    pub(crate) async fn run(self) {
        ACTIVE_VIEWS.inc();
        debug!(dependency = %self.dependency, "view started");

        self.watch_loop().await;

        self.update(|s| s.state = ViewState::Stopped);
        ACTIVE_VIEWS.dec();
        debug!(dependency = %self.dependency, "view stopped");
    }

    async fn watch_loop(&self) {
        let id = self.dependency.id();
        let retry = self.settings.retry;
        let mut backoff = ExponentialBackoff::new(&retry);
        let mut last_index = 0;
        let mut failures = 0;
        // Set after a regression; the next delivery replaces the stored index
        let mut index_reset = false;

        loop {
            self.update(|s| s.state = ViewState::Fetching);
            let started = Instant::now();

            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                r = timeout(
                    retry.timeout(),
                    self.client.fetch(&self.dependency, last_index, self.settings.max_wait),
                ) => r,
            };
            let fetched = fetched.unwrap_or(Err(ClientError::Timeout(retry.timeout())));

            let error = match fetched {
                Ok(FetchResponse { index, .. }) if index < last_index => {
                    let error = WatchError::IndexRegressed {
                        dependency: id.clone(),
                        last: last_index,
                        received: index,
                    };
                    last_index = 0;
                    index_reset = true;
                    error
                }
                Ok(FetchResponse { value, index }) => {
                    // A released view must not re-create an entry its owner
                    // already dropped from the brain
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    let unchanged = index == last_index;
                    let outcome = if index_reset {
                        self.brain.reset(id, value, index)
                    } else {
                        self.brain.remember(id, value, index)
                    };
                    trace!(dependency = %id, index, ?outcome, "delivered");

                    index_reset = false;
                    last_index = index;
                    failures = 0;
                    backoff.reset();
                    self.update(|s| {
                        s.state = ViewState::Delivered;
                        s.last_index = index;
                        s.last_fetch_ms = Some(get_now_as_millis());
                        s.last_error = None;
                    });

                    if self.settings.once {
                        debug!(dependency = %id, "once mode, view done");
                        return;
                    }

                    let elapsed = started.elapsed();
                    if unchanged && elapsed < self.settings.min_fetch_interval {
                        if !self.pause(self.settings.min_fetch_interval - elapsed).await {
                            return;
                        }
                    }
                    continue;
                }
                Err(source) => WatchError::Fetch {
                    dependency: id.clone(),
                    source,
                },
            };

            failures += 1;
            FETCH_ERRORS.with_label_values(&[self.dependency.kind().tag()]).inc();
            self.update(|s| {
                s.state = ViewState::Errored;
                s.error_count += 1;
                s.last_fetch_ms = Some(get_now_as_millis());
                s.last_error = Some(error.to_string());
            });

            if retry.is_exhausted(failures) {
                warn!(dependency = %id, attempts = failures, %error, "giving up on dependency");
                self.errors.publish(WatchError::RetriesExhausted {
                    dependency: id.clone(),
                    attempts: failures,
                });
                return;
            }

            let delay = backoff.next_delay();
            debug!(dependency = %id, %error, ?delay, "fetch failed, backing off");
            if !self.pause(delay).await {
                return;
            }
        }
    }

    /// Sleeps for `delay`. Returns false when cancelled first.
    async fn pause(
        &self,
        delay: Duration,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    fn update(
        &self,
        f: impl FnOnce(&mut ViewInfo),
    ) {
        f(&mut self.status.lock());
    }
}
