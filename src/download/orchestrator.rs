//! Bounded worker pool that turns a list of items into a batch result.
//!
//! Every item is queued up front on a channel sized to the batch; a fixed
//! number of workers drain it. Each item ends in exactly one terminal
//! state and no single item's failure stops the batch. A panic anywhere in
//! an item's processing, hooks included, fails only that item.

use std::ffi::OsStr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::DEFAULT_WORKERS;
use super::{
    DownloadError, DownloadItem, HandlerOutput, ItemStatus, NormalHandler, OrchestratorError,
    ProgressTracker, ProtectedHandler, Source,
};
use crate::collab::{HookContext, HookError, ScriptHook, is_skip_output};

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Concurrent workers; 0 is treated as 1.
    pub workers: usize,
    /// Root that relative item paths are joined onto.
    pub output_root: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            output_root: None,
        }
    }
}

/// One failed item.
#[derive(Debug)]
pub struct BatchError {
    /// The item id.
    pub item_id: u64,
    /// Direct or manifest URL of the item.
    pub source: String,
    /// What went wrong.
    pub error: DownloadError,
}

/// Outcome of one [`Orchestrator::run`].
#[derive(Debug, Default)]
pub struct BatchResult {
    /// Items in the batch.
    pub total: usize,
    /// Items committed.
    pub succeeded: usize,
    /// Items failed.
    pub failed: usize,
    /// Items skipped.
    pub skipped: usize,
    /// HTTP retries performed while the batch ran.
    pub retried: u64,
    /// Failures, in completion order.
    pub errors: Vec<BatchError>,
}

impl BatchResult {
    /// At least one item failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Items failed and none succeeded.
    #[must_use]
    pub fn is_total_failure(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

/// Locked aggregate owned by one run.
#[derive(Debug)]
struct ResultCollector {
    inner: Mutex<BatchResult>,
}

impl ResultCollector {
    fn new(total: usize) -> Self {
        Self {
            inner: Mutex::new(BatchResult {
                total,
                ..BatchResult::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BatchResult> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_success(&self) {
        self.lock().succeeded += 1;
    }

    fn record_skipped(&self) {
        self.lock().skipped += 1;
    }

    fn record_failure(&self, item_id: u64, source: String, error: DownloadError) {
        let mut result = self.lock();
        result.failed += 1;
        result.errors.push(BatchError {
            item_id,
            source,
            error,
        });
    }

    fn finish(&self, retried: u64) -> BatchResult {
        let mut result = std::mem::take(&mut *self.lock());
        result.retried = retried;
        result
    }
}

/// Runs download batches over a normal and a protected handler.
pub struct Orchestrator {
    config: OrchestratorConfig,
    normal: Arc<NormalHandler>,
    protected: Arc<ProtectedHandler>,
    skip_hook: Option<Arc<dyn ScriptHook>>,
    naming_hook: Option<Arc<dyn ScriptHook>>,
    progress: Option<Arc<ProgressTracker>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("skip_hook", &self.skip_hook.is_some())
            .field("naming_hook", &self.naming_hook.is_some())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        normal: Arc<NormalHandler>,
        protected: Arc<ProtectedHandler>,
    ) -> Self {
        Self {
            config,
            normal,
            protected,
            skip_hook: None,
            naming_hook: None,
            progress: None,
        }
    }

    /// Consults `hook` before each item; truthy output skips it.
    #[must_use]
    pub fn with_skip_hook(mut self, hook: Arc<dyn ScriptHook>) -> Self {
        self.skip_hook = Some(hook);
        self
    }

    /// Consults `hook` for each item's file name.
    #[must_use]
    pub fn with_naming_hook(mut self, hook: Arc<dyn ScriptHook>) -> Self {
        self.naming_hook = Some(hook);
        self
    }

    /// Reports item outcomes to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Settings.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Processes `items`, updating each one's `attempted` and `status` in
    /// place.
    ///
    /// Per-item failures are recorded in the returned [`BatchResult`] and
    /// never abort the batch. Items still queued when `cancel` fires are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::OutputRoot`] if the configured output
    /// root cannot be created.
    #[instrument(skip_all, fields(total = items.len(), workers = self.config.workers.max(1)))]
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        items: &mut [DownloadItem],
    ) -> Result<BatchResult, OrchestratorError> {
        if items.is_empty() {
            debug!("empty batch");
            return Ok(BatchResult::default());
        }

        if let Some(root) = &self.config.output_root {
            tokio::fs::create_dir_all(root)
                .await
                .map_err(|source| OrchestratorError::OutputRoot {
                    path: root.clone(),
                    source,
                })?;
        }

        let total = items.len();
        let workers = self.config.workers.max(1);
        let retries_before = self.normal.executor().retries();
        let collector = Arc::new(ResultCollector::new(total));
        if let Some(progress) = &self.progress {
            progress.set_total(total);
        }

        info!("starting batch");

        let (tx, rx) = mpsc::channel(total);
        for (index, item) in items.iter().enumerate() {
            if tx.send((index, item.clone())).await.is_err() {
                break;
            }
        }
        drop(tx);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            normal: Arc::clone(&self.normal),
            protected: Arc::clone(&self.protected),
            skip_hook: self.skip_hook.clone(),
            naming_hook: self.naming_hook.clone(),
            progress: self.progress.clone(),
            collector: Arc::clone(&collector),
            output_root: self.config.output_root.clone(),
            total,
        };

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let worker = worker.clone();
            let rx = Arc::clone(&rx);
            let done = done_tx.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some((index, mut item)) = next else {
                        break;
                    };
                    let caught = AssertUnwindSafe(worker.process(&cancel, &mut item))
                        .catch_unwind()
                        .await;
                    let outcome = caught.unwrap_or_else(|payload| Outcome::Failed {
                        source: item
                            .source()
                            .map(|source| source.url().to_string())
                            .unwrap_or_default(),
                        error: DownloadError::panicked(payload.as_ref()),
                    });
                    let event = worker.settle(&mut item, outcome);
                    // The receiver lives until every worker has finished.
                    let _ = done.send((index, item));
                    worker.notify(event);
                }
            }));
        }
        drop(done_tx);

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "download worker stopped unexpectedly");
            }
        }
        while let Some((index, item)) = done_rx.recv().await {
            if let Some(slot) = items.get_mut(index) {
                *slot = item;
            }
        }
        // Only reachable if every worker died; keep the counts exact.
        while let Ok((index, mut item)) = rx.lock().await.try_recv() {
            let event = worker.settle(&mut item, Outcome::Skipped("no worker left"));
            worker.notify(event);
            if let Some(slot) = items.get_mut(index) {
                *slot = item;
            }
        }

        let retried = self
            .normal
            .executor()
            .retries()
            .saturating_sub(retries_before);
        let result = collector.finish(retried);
        info!(
            succeeded = result.succeeded,
            failed = result.failed,
            skipped = result.skipped,
            retried = result.retried,
            "batch complete"
        );
        Ok(result)
    }
}

/// Owned source reference, detached from the item borrow.
#[derive(Debug, Clone)]
enum Job {
    Direct(String),
    Protected(String),
}

impl Job {
    fn url(&self) -> &str {
        match self {
            Self::Direct(url) | Self::Protected(url) => url,
        }
    }

    fn download_type(&self) -> &'static str {
        match self {
            Self::Direct(_) => "normal",
            Self::Protected(_) => "protected",
        }
    }

    fn failed(&self, error: DownloadError) -> Outcome {
        Outcome::Failed {
            source: self.url().to_string(),
            error,
        }
    }
}

impl From<Source<'_>> for Job {
    fn from(source: Source<'_>) -> Self {
        match source {
            Source::Direct(url) => Self::Direct(url.to_string()),
            Source::Protected(url) => Self::Protected(url.to_string()),
        }
    }
}

/// State shared by all worker tasks of one run.
#[derive(Clone)]
struct Worker {
    normal: Arc<NormalHandler>,
    protected: Arc<ProtectedHandler>,
    skip_hook: Option<Arc<dyn ScriptHook>>,
    naming_hook: Option<Arc<dyn ScriptHook>>,
    progress: Option<Arc<ProgressTracker>>,
    collector: Arc<ResultCollector>,
    output_root: Option<PathBuf>,
    total: usize,
}

/// How one item ended, before it is recorded.
enum Outcome {
    Skipped(&'static str),
    Succeeded(HandlerOutput),
    Failed { source: String, error: DownloadError },
}

/// Progress notification owed for a settled item.
#[derive(Debug, Clone, Copy)]
enum Settled {
    Completed(u64),
    Failed,
    Skipped,
}

impl Worker {
    #[instrument(skip_all, fields(item_id = item.id))]
    async fn process(&self, cancel: &CancellationToken, item: &mut DownloadItem) -> Outcome {
        if cancel.is_cancelled() {
            return Outcome::Skipped("batch cancelled");
        }
        let Some(job) = item.source().map(Job::from) else {
            return Outcome::Skipped("no source reference");
        };

        let ctx = self.hook_context(item, &job);
        if let Some(hook) = &self.skip_hook {
            match hook.run(cancel, &ctx).await {
                Ok(output) if is_skip_output(&output) => return Outcome::Skipped("skip hook"),
                Ok(_) => {}
                Err(HookError::Cancelled) => return Outcome::Skipped("batch cancelled"),
                Err(e) => warn!(error = %e, "skip hook failed, continuing"),
            }
        }

        let Some(mut destination) = item.destination(self.output_root.as_deref()) else {
            item.attempted = true;
            return job.failed(DownloadError::MissingDestination { item_id: item.id });
        };

        if let Some(hook) = &self.naming_hook {
            match hook.run(cancel, &ctx).await {
                Ok(name) => rename_destination(&mut destination, &name),
                Err(HookError::Cancelled) => return Outcome::Skipped("batch cancelled"),
                Err(e) => warn!(error = %e, "naming hook failed, keeping path"),
            }
        }

        item.attempted = true;
        match self.dispatch(cancel, item.id, &job, &destination).await {
            Ok(output) => Outcome::Succeeded(output),
            Err(error) => job.failed(error),
        }
    }

    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        item_id: u64,
        job: &Job,
        destination: &Path,
    ) -> Result<HandlerOutput, DownloadError> {
        match job {
            Job::Direct(url) => self.normal.download(cancel, url, destination).await,
            Job::Protected(manifest) => {
                self.protected
                    .download(cancel, item_id, manifest, destination)
                    .await
            }
        }
    }

    fn hook_context(&self, item: &DownloadItem, job: &Job) -> HookContext {
        HookContext {
            media_id: item.id,
            post_id: item.meta.post_id,
            media_type: item.meta.media_type.clone(),
            username: item.meta.username.clone(),
            source_url: job.url().to_string(),
            total_count: self.total,
            download_type: job.download_type().to_string(),
        }
    }

    /// Writes the terminal status onto the item and into the batch result.
    fn settle(&self, item: &mut DownloadItem, outcome: Outcome) -> Settled {
        match outcome {
            Outcome::Skipped(reason) => {
                debug!(item_id = item.id, reason, "item skipped");
                item.status = ItemStatus::Skipped;
                self.collector.record_skipped();
                Settled::Skipped
            }
            Outcome::Succeeded(output) => {
                debug!(
                    item_id = item.id,
                    path = %output.path.display(),
                    bytes = output.bytes,
                    "item succeeded"
                );
                item.status = ItemStatus::Succeeded;
                self.collector.record_success();
                Settled::Completed(output.bytes)
            }
            Outcome::Failed { source, error } => {
                warn!(
                    item_id = item.id,
                    url = %source,
                    category = error.category().label(),
                    error = %error,
                    "item failed"
                );
                item.status = ItemStatus::Failed;
                self.collector.record_failure(item.id, source, error);
                Settled::Failed
            }
        }
    }

    /// Reports a settled item; a panicking observer cannot stop the worker.
    fn notify(&self, settled: Settled) {
        let Some(progress) = &self.progress else {
            return;
        };
        let notified = std::panic::catch_unwind(AssertUnwindSafe(|| match settled {
            Settled::Completed(bytes) => progress.add_completed(bytes),
            Settled::Failed => progress.add_failed(),
            Settled::Skipped => progress.add_skipped(),
        }));
        if let Err(payload) = notified {
            warn!(
                error = %DownloadError::panicked(payload.as_ref()),
                "progress observer panicked"
            );
        }
    }
}

/// Replaces the file name with a naming hook's answer when it is a plain
/// file name.
fn rename_destination(destination: &mut PathBuf, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    if Path::new(name).file_name() == Some(OsStr::new(name)) {
        destination.set_file_name(name);
    } else {
        warn!(name, "naming hook output is not a plain file name, ignoring");
    }
}
