//! Export coordinator
//!
//! Owns the pending queue, the fixed pool of worker slots and the archive of
//! finished jobs. Lock order is queue before slot; the archive is a
//! concurrent map and is never held across another lock acquisition except
//! for the insert performed while finishing a slot.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExportConfig;
use crate::error::{ExportError, Result};

use super::job::{
    AddCode, CustomQuery, DeleteCode, ExportItem, ExportPayload, ExportStatus, ExtraParams,
    FactRef, normalize_file_name,
};
use super::notifier::{ExportNotification, Notifier};
use super::source::HitSource;
use super::transform::CsvParams;
use super::worker::{ExportWorker, WorkerReport};
use super::writers::ensure_dir;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts from one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub files_removed: usize,
    pub entries_removed: usize,
}

struct WorkerSlot {
    available: bool,
    /// Job being processed; only meaningful while not available
    item: Option<ExportItem>,
    cancel_tx: mpsc::Sender<()>,
    /// Held here between jobs, lent to the worker while it runs
    cancel_rx: Option<mpsc::Receiver<()>>,
}

impl WorkerSlot {
    fn new() -> Self {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        Self {
            available: true,
            item: None,
            cancel_tx,
            cancel_rx: Some(cancel_rx),
        }
    }

    fn reset_cancel_channel(&mut self) {
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        self.cancel_tx = cancel_tx;
        self.cancel_rx = Some(cancel_rx);
    }

    fn live_item(&self) -> Option<&ExportItem> {
        if self.available {
            None
        } else {
            self.item.as_ref()
        }
    }
}

struct Inner {
    config: ExportConfig,
    queue: Mutex<VecDeque<ExportItem>>,
    slots: Vec<Mutex<WorkerSlot>>,
    workers: Vec<Arc<ExportWorker>>,
    archive: DashMap<String, ExportItem>,
    notifier: Arc<dyn Notifier>,
    done_tx: mpsc::UnboundedSender<WorkerReport>,
    done_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerReport>>>,
    shutdown: CancellationToken,
    initialized: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Queue, worker pool and archive of export jobs
///
/// Cloning is cheap and yields a handle to the same coordinator.
#[derive(Clone)]
pub struct ExportWrapper {
    inner: Arc<Inner>,
}

impl ExportWrapper {
    /// Create a coordinator; background loops start with [`ExportWrapper::init`]
    ///
    /// # Arguments
    /// * `config` - Queue, pool and retention settings
    /// * `source` - Backend the workers read hits from
    /// * `notifier` - Receiver of job lifecycle notifications
    pub fn new(
        config: ExportConfig,
        source: Arc<dyn HitSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;

        let workers = (0..config.pool_size)
            .map(|id| Arc::new(ExportWorker::new(id, &config, source.clone(), notifier.clone())))
            .collect();
        let slots = (0..config.pool_size)
            .map(|_| Mutex::new(WorkerSlot::new()))
            .collect();
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                queue: Mutex::new(VecDeque::new()),
                slots,
                workers,
                archive: DashMap::new(),
                notifier,
                done_tx,
                done_rx: Mutex::new(Some(done_rx)),
                shutdown: CancellationToken::new(),
                initialized: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.inner.config
    }

    /// Create the output directory and start the dispatch, completion and
    /// retention loops. Calling it again is a no-op.
    pub fn init(&self) -> Result<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        ensure_dir(&self.inner.config.output_dir)?;

        let done_rx = lock(&self.inner.done_rx)
            .take()
            .ok_or_else(|| ExportError::Generic("export coordinator already shut down".into()))?;

        let mut tasks = lock(&self.inner.tasks);
        tasks.push(tokio::spawn(self.clone().dispatch_loop()));
        tasks.push(tokio::spawn(self.clone().completion_loop(done_rx)));
        tasks.push(tokio::spawn(self.clone().sweep_loop()));

        info!(
            "Export coordinator started: {} workers, queue size {}, output {}",
            self.inner.config.pool_size,
            self.inner.config.queue_max_size,
            self.inner.config.output_dir.display()
        );
        Ok(())
    }

    /// Stop the background loops
    ///
    /// Running jobs are canceled and archived before this returns. Queued
    /// jobs stay in the queue.
    pub async fn shutdown(&self) {
        if !self.inner.initialized.load(Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let tasks: Vec<_> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Export coordinator task ended abnormally: {}", e);
            }
        }
        info!("Export coordinator stopped");
    }

    /// Submit a fact export on behalf of `user`
    pub fn add_to_queue(
        &self,
        facts: Vec<FactRef>,
        title: &str,
        params: CsvParams,
        user: &str,
        extra: ExtraParams,
        notify: bool,
    ) -> Result<AddCode> {
        if facts.is_empty() {
            return Err(ExportError::Generic("no facts to export".into()));
        }
        self.enqueue(ExportPayload::Facts(facts), title, params, user, extra, notify)
    }

    /// Submit a raw query export on behalf of `user`
    pub fn add_to_queue_custom(
        &self,
        query: CustomQuery,
        title: &str,
        params: CsvParams,
        user: &str,
        extra: ExtraParams,
        notify: bool,
    ) -> Result<AddCode> {
        if query.indices.is_empty() {
            return Err(ExportError::Generic("no indices to export".into()));
        }
        self.enqueue(ExportPayload::Custom(query), title, params, user, extra, notify)
    }

    fn enqueue(
        &self,
        payload: ExportPayload,
        title: &str,
        params: CsvParams,
        user: &str,
        extra: ExtraParams,
        notify: bool,
    ) -> Result<AddCode> {
        params.validate()?;
        if user.trim().is_empty() {
            return Err(ExportError::Generic("user must not be empty".into()));
        }
        let file_name = normalize_file_name(title, !params.uncompressed_output);

        let mut queue = lock(&self.inner.queue);
        if let Some(item) = queue
            .iter_mut()
            .find(|item| item.is_same_job(&payload, &file_name, &params))
        {
            if item.add_user(user) {
                debug!(job = %item.id, "User {} joined queued export {}", user, item.file_name);
                return Ok(AddCode::UserAdded);
            }
            return Ok(AddCode::UserExists);
        }

        if queue.len() >= self.inner.config.queue_max_size {
            warn!("Export queue full, rejecting {} for {}", file_name, user);
            return Ok(AddCode::QueueFull);
        }

        let item = ExportItem::new(payload, file_name, params, user, extra, notify);
        info!(job = %item.id, "Queued export {} for {}", item.file_name, user);
        queue.push_back(item);
        Ok(AddCode::Added)
    }

    /// Assign queued jobs to free workers, head first
    ///
    /// Started jobs are spawned onto the current Tokio runtime, so this must
    /// be called from within one. Nothing is started once
    /// [`ExportWrapper::shutdown`] has begun.
    ///
    /// # Returns
    /// * `usize` - Number of jobs started
    pub fn dispatch(&self) -> usize {
        let mut queue = lock(&self.inner.queue);
        if self.inner.shutdown.is_cancelled() {
            return 0;
        }
        let mut started = 0;

        for (index, slot) in self.inner.slots.iter().enumerate() {
            if queue.is_empty() {
                break;
            }
            let mut slot = lock(slot);
            if !slot.available {
                continue;
            }
            if slot.cancel_rx.is_none() {
                slot.reset_cancel_channel();
            }
            let (Some(mut cancel_rx), Some(mut item)) = (slot.cancel_rx.take(), queue.pop_front())
            else {
                break;
            };
            while cancel_rx.try_recv().is_ok() {}

            item.status = ExportStatus::Running;
            slot.item = Some(item.clone());
            slot.available = false;
            drop(slot);

            debug!(worker = index, job = %item.id, "Dispatching export {}", item.file_name);
            self.launch(index, item, cancel_rx);
            started += 1;
        }
        started
    }

    fn launch(&self, index: usize, item: ExportItem, cancel_rx: mpsc::Receiver<()>) {
        let worker = self.inner.workers[index].clone();
        let ctx = self.inner.shutdown.clone();
        let done_tx = self.inner.done_tx.clone();

        let handle = tokio::spawn(async move { worker.start(item, cancel_rx, ctx).await });
        tokio::spawn(async move {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(worker = index, "Export worker task failed: {}", e);
                    WorkerReport::failed(index, format!("worker task failed: {e}"))
                }
            };
            if done_tx.send(report).is_err() {
                warn!(worker = index, "Export coordinator gone, dropping worker report");
            }
        });
    }

    /// Archive a worker's job and free its slot
    fn finish(&self, report: WorkerReport) {
        let Some(slot) = self.inner.slots.get(report.worker_id) else {
            warn!("Report from unknown worker {}", report.worker_id);
            return;
        };
        let mut slot = lock(slot);

        match report.cancel_rx {
            Some(rx) => slot.cancel_rx = Some(rx),
            None => slot.reset_cancel_channel(),
        }

        if let Some(mut item) = slot.item.take() {
            item.status = report.status;
            item.error = report.error;
            item.rows = report.rows;
            item.size_bytes = report.size_bytes;

            if item.notify {
                let notification = ExportNotification::for_item(&item, item.status);
                if let Err(e) = self.inner.notifier.notify(notification) {
                    warn!(job = %item.id, "Failed to send completion notification: {}", e);
                }
            }
            debug!(job = %item.id, "Archiving export {} as {}", item.file_name, item.status);
            self.inner.archive.insert(item.id.clone(), item);
        }
        slot.available = true;
    }

    async fn dispatch_loop(self) {
        let token = self.inner.shutdown.clone();
        let mut ticker = tokio::time::interval(self.inner.config.dispatch_interval());
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch();
                }
            }
        }
        debug!("Dispatch loop stopped");
    }

    async fn completion_loop(self, mut done_rx: mpsc::UnboundedReceiver<WorkerReport>) {
        let token = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                Some(report) = done_rx.recv() => self.finish(report),
                _ = token.cancelled(), if self.busy_workers() == 0 => {
                    // A dispatch holding the queue lock may still fill a slot
                    let _queue = lock(&self.inner.queue);
                    if self.busy_workers() == 0 {
                        break;
                    }
                }
                else => break,
            }
        }
        debug!("Completion loop stopped");
    }

    async fn sweep_loop(self) {
        let token = self.inner.shutdown.clone();
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval());
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let this = self.clone();
                    match tokio::task::spawn_blocking(move || this.check_for_expired_files()).await {
                        Ok(stats) if stats != SweepStats::default() => info!(
                            "Retention sweep removed {} files and {} archive entries",
                            stats.files_removed,
                            stats.entries_removed
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Retention sweep failed: {}", e),
                    }
                }
            }
        }
        debug!("Sweep loop stopped");
    }

    /// Find a job owned by `user`
    ///
    /// Looks in the archive, then the queue, then busy worker slots. A job
    /// archived while the slots were scanned is picked up by a second look
    /// at the archive.
    pub fn get_user_export(&self, id: &str, user: &str) -> Option<ExportItem> {
        if let Some(item) = self.archived_export(id, user) {
            return Some(item);
        }

        if let Some(item) = lock(&self.inner.queue)
            .iter()
            .find(|item| item.id == id && item.has_user(user))
        {
            return Some(item.clone());
        }

        self.inner
            .slots
            .iter()
            .find_map(|slot| {
                lock(slot)
                    .live_item()
                    .filter(|item| item.id == id && item.has_user(user))
                    .cloned()
            })
            .or_else(|| self.archived_export(id, user))
    }

    fn archived_export(&self, id: &str, user: &str) -> Option<ExportItem> {
        self.inner
            .archive
            .get(id)
            .filter(|item| item.has_user(user))
            .map(|item| item.value().clone())
    }

    /// All jobs owned by `user`: archived, queued, then running
    pub fn get_user_exports(&self, user: &str) -> Vec<ExportItem> {
        let mut seen = HashSet::new();
        let mut items = Vec::new();
        let mut keep = |item: &ExportItem| {
            if item.has_user(user) && seen.insert(item.id.clone()) {
                items.push(item.clone());
            }
        };

        self.sorted_archive().iter().for_each(&mut keep);

        lock(&self.inner.queue).iter().for_each(&mut keep);

        for slot in &self.inner.slots {
            if let Some(item) = lock(slot).live_item() {
                keep(item);
            }
        }

        // Jobs that finished during the slot scan
        self.sorted_archive().iter().for_each(&mut keep);
        items
    }

    fn sorted_archive(&self) -> Vec<ExportItem> {
        let mut archived: Vec<ExportItem> = self
            .inner
            .archive
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        archived.sort_by_key(|item| item.date);
        archived
    }

    /// Remove `user` from a job, deleting or canceling it when they were
    /// the last owner
    pub fn delete_export(&self, id: &str, user: &str) -> DeleteCode {
        {
            let mut queue = lock(&self.inner.queue);
            if let Some(pos) = queue
                .iter()
                .position(|item| item.id == id && item.has_user(user))
            {
                if !queue[pos].is_sole_owner(user) {
                    queue[pos].remove_shared_user(user);
                    return DeleteCode::UserDeleted;
                }
                if let Some(item) = queue.remove(pos) {
                    info!(job = %item.id, "Removed queued export {}", item.file_name);
                }
                return DeleteCode::Deleted;
            }

            for (index, slot) in self.inner.slots.iter().enumerate() {
                let mut slot = lock(slot);
                if slot.available {
                    continue;
                }
                let Some(item) = slot.item.as_mut() else {
                    continue;
                };
                if item.id != id || !item.has_user(user) {
                    continue;
                }
                if !item.is_sole_owner(user) {
                    item.remove_shared_user(user);
                    return DeleteCode::UserDeleted;
                }
                match slot.cancel_tx.try_send(()) {
                    Ok(()) => info!(worker = index, job = %id, "Cancel sent to worker"),
                    Err(TrySendError::Full(())) => debug!(worker = index, "Cancel already pending"),
                    Err(TrySendError::Closed(())) => {
                        warn!(worker = index, "Worker no longer listening for cancel")
                    }
                }
                return DeleteCode::Canceled;
            }
        }

        if let Entry::Occupied(mut entry) = self.inner.archive.entry(id.to_string()) {
            if entry.get().has_user(user) {
                if !entry.get().is_sole_owner(user) {
                    entry.get_mut().remove_shared_user(user);
                    return DeleteCode::UserDeleted;
                }
                let item = entry.remove();
                if item.status == ExportStatus::Done {
                    self.remove_output(&item.file_name);
                }
                info!(job = %item.id, "Deleted export {}", item.file_name);
                return DeleteCode::Deleted;
            }
        }

        DeleteCode::NotFound
    }

    /// Location of a finished export owned by `user`
    pub fn download_path(&self, id: &str, user: &str) -> Option<PathBuf> {
        let item = self.inner.archive.get(id)?;
        if item.status != ExportStatus::Done || !item.has_user(user) {
            return None;
        }
        Some(self.inner.config.output_dir.join(&item.file_name))
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Number of worker slots currently running a job
    pub fn busy_workers(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|&slot| !lock(slot).available)
            .count()
    }

    pub fn archive_len(&self) -> usize {
        self.inner.archive.len()
    }

    /// Delete output files and archive entries older than the retention window
    ///
    /// Failures on individual files are logged and skipped.
    pub fn check_for_expired_files(&self) -> SweepStats {
        let retention = self.inner.config.retention();
        let mut stats = SweepStats::default();

        let dir = &self.inner.config.output_dir;
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                let now = SystemTime::now();
                for entry in entries {
                    let entry = match entry {
                        Ok(entry) => entry,
                        Err(e) => {
                            warn!("Failed to read entry in {}: {}", dir.display(), e);
                            continue;
                        }
                    };
                    let path = entry.path();
                    let modified = match entry.metadata().and_then(|m| {
                        if m.is_file() {
                            m.modified().map(Some)
                        } else {
                            Ok(None)
                        }
                    }) {
                        Ok(Some(modified)) => modified,
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("Failed to stat {}: {}", path.display(), e);
                            continue;
                        }
                    };
                    let age = now.duration_since(modified).unwrap_or_default();
                    if age <= retention {
                        continue;
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            debug!("Removed expired export file {}", path.display());
                            stats.files_removed += 1;
                        }
                        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Output directory {} does not exist yet", dir.display());
            }
            Err(e) => warn!("Failed to scan {}: {}", dir.display(), e),
        }

        let now = Utc::now();
        let before = self.inner.archive.len();
        self.inner.archive.retain(|_, item| {
            let age = (now - item.date).to_std().unwrap_or_default();
            age <= retention
        });
        stats.entries_removed = before.saturating_sub(self.inner.archive.len());

        stats
    }

    fn remove_output(&self, file_name: &str) {
        let path = self.inner.config.output_dir.join(file_name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed export file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OUTPUT_EXISTS_MESSAGE;
    use crate::export::notifier::{ChannelNotifier, LogNotifier};
    use crate::export::source::{HitStream, MemorySource, SourceTarget};
    use crate::export::transform::{ColumnFormat, Hit};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    struct SlowSource;
    struct SlowStream;

    #[async_trait]
    impl HitSource for SlowSource {
        async fn open(&self, _target: &SourceTarget, _extra: &ExtraParams) -> Result<Box<dyn HitStream>> {
            Ok(Box::new(SlowStream))
        }
    }

    #[async_trait]
    impl HitStream for SlowStream {
        async fn next_batch(&mut self, _max: usize) -> Result<Option<Vec<Hit>>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(Some(vec![hit(json!({"id": 1}))]))
        }
    }

    fn hit(value: serde_json::Value) -> Hit {
        value.as_object().cloned().unwrap()
    }

    fn orders() -> Vec<FactRef> {
        vec![FactRef::new(1, "orders")]
    }

    fn params() -> CsvParams {
        CsvParams {
            uncompressed_output: true,
            columns: vec![ColumnFormat::new("id")],
            ..CsvParams::default()
        }
    }

    fn config(dir: &Path, queue_max_size: usize) -> ExportConfig {
        let mut config = ExportConfig::new(dir, queue_max_size, 1, 1);
        config.dispatch_interval_ms = 10;
        config
    }

    fn wrapper(dir: &Path, queue_max_size: usize) -> ExportWrapper {
        let source = MemorySource::new().with_set("orders", vec![hit(json!({"id": 1}))]);
        ExportWrapper::new(config(dir, queue_max_size), Arc::new(source), Arc::new(LogNotifier))
            .unwrap()
    }

    fn add(wrapper: &ExportWrapper, title: &str, user: &str) -> AddCode {
        wrapper
            .add_to_queue(orders(), title, params(), user, ExtraParams::new(), false)
            .unwrap()
    }

    /// Put a job on worker slot 0 as if it had been dispatched
    fn occupy(wrapper: &ExportWrapper, item: ExportItem) {
        let mut slot = lock(&wrapper.inner.slots[0]);
        slot.item = Some(item);
        slot.available = false;
    }

    fn archived(users: &[&str], status: ExportStatus, file_name: &str) -> ExportItem {
        let mut item = ExportItem::new(
            ExportPayload::Facts(orders()),
            file_name.to_string(),
            params(),
            users[0],
            ExtraParams::new(),
            false,
        );
        for user in &users[1..] {
            item.add_user(user);
        }
        item.status = status;
        item
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_same_job_merges_users() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);

        assert_eq!(add(&wrapper, "orders", "alice"), AddCode::Added);
        assert_eq!(add(&wrapper, "orders", "bob"), AddCode::UserAdded);
        assert_eq!(add(&wrapper, "orders.csv", "bob"), AddCode::UserExists);
        assert_eq!(wrapper.queue_len(), 1);

        let items = wrapper.get_user_exports("bob");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].users, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(items[0].file_name, "orders.csv");
    }

    #[test]
    fn test_different_params_are_distinct_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);

        assert_eq!(add(&wrapper, "orders", "alice"), AddCode::Added);
        let other = CsvParams {
            separator: ';',
            ..params()
        };
        let code = wrapper
            .add_to_queue(orders(), "orders", other, "alice", ExtraParams::new(), false)
            .unwrap();
        assert_eq!(code, AddCode::Added);
        assert_eq!(wrapper.queue_len(), 2);
    }

    #[test]
    fn test_custom_queries_merge_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        let query = |connection: &str| CustomQuery {
            indices: vec!["logs".into(), "audit".into()],
            requests: vec![json!({"level": "error"})],
            connection: connection.to_string(),
        };
        let submit = |query: CustomQuery, user: &str| {
            wrapper
                .add_to_queue_custom(query, "errors", params(), user, ExtraParams::new(), false)
                .unwrap()
        };

        assert_eq!(submit(query("primary"), "alice"), AddCode::Added);
        assert_eq!(submit(query("replica"), "bob"), AddCode::UserAdded);
        let mut other = query("primary");
        other.requests = vec![json!({"level": "warn"})];
        assert_eq!(submit(other, "alice"), AddCode::Added);
        assert_eq!(wrapper.queue_len(), 2);

        let empty = CustomQuery {
            indices: vec![],
            requests: vec![],
            connection: "primary".into(),
        };
        assert!(
            wrapper
                .add_to_queue_custom(empty, "x", params(), "alice", ExtraParams::new(), false)
                .is_err()
        );
    }

    #[test]
    fn test_queue_full_rejects_distinct_job() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 1);

        assert_eq!(add(&wrapper, "orders", "alice"), AddCode::Added);
        assert_eq!(add(&wrapper, "other", "alice"), AddCode::QueueFull);
        assert_eq!(wrapper.queue_len(), 1);
        // Joining an existing job needs no room
        assert_eq!(add(&wrapper, "orders", "bob"), AddCode::UserAdded);
    }

    #[test]
    fn test_invalid_submissions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);

        let bad = CsvParams {
            list_separator: ',',
            ..params()
        };
        assert!(matches!(
            wrapper.add_to_queue(orders(), "x", bad, "alice", ExtraParams::new(), false),
            Err(ExportError::Format(_))
        ));
        assert!(
            wrapper
                .add_to_queue(orders(), "x", params(), " ", ExtraParams::new(), false)
                .is_err()
        );
        assert!(
            wrapper
                .add_to_queue(vec![], "x", params(), "alice", ExtraParams::new(), false)
                .is_err()
        );
        assert_eq!(wrapper.queue_len(), 0);
    }

    #[test]
    fn test_delete_queued_job() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        add(&wrapper, "orders", "alice");
        add(&wrapper, "orders", "bob");
        let id = wrapper.get_user_exports("alice")[0].id.clone();

        assert_eq!(wrapper.delete_export(&id, "alice"), DeleteCode::UserDeleted);
        assert!(wrapper.get_user_export(&id, "alice").is_none());
        let item = wrapper.get_user_export(&id, "bob").unwrap();
        assert_eq!(item.users, vec!["bob".to_string()]);

        assert_eq!(wrapper.delete_export(&id, "bob"), DeleteCode::Deleted);
        assert_eq!(wrapper.queue_len(), 0);
        assert_eq!(wrapper.delete_export(&id, "bob"), DeleteCode::NotFound);
    }

    #[test]
    fn test_delete_archived_job() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);

        let shared = archived(&["alice", "bob"], ExportStatus::Done, "shared.csv");
        std::fs::write(dir.path().join("shared.csv"), "id\n1\n").unwrap();
        let shared_id = shared.id.clone();
        wrapper.inner.archive.insert(shared_id.clone(), shared);

        assert_eq!(wrapper.delete_export(&shared_id, "carol"), DeleteCode::NotFound);
        assert_eq!(wrapper.delete_export(&shared_id, "alice"), DeleteCode::UserDeleted);
        assert!(dir.path().join("shared.csv").exists());
        assert_eq!(wrapper.delete_export(&shared_id, "bob"), DeleteCode::Deleted);
        assert!(!dir.path().join("shared.csv").exists());
        assert_eq!(wrapper.archive_len(), 0);

        // A failed job's file name may belong to a file it never wrote
        let failed = archived(&["alice"], ExportStatus::Error, "taken.csv");
        std::fs::write(dir.path().join("taken.csv"), "keep").unwrap();
        let failed_id = failed.id.clone();
        wrapper.inner.archive.insert(failed_id.clone(), failed);
        assert_eq!(wrapper.delete_export(&failed_id, "alice"), DeleteCode::Deleted);
        assert!(dir.path().join("taken.csv").exists());
    }

    #[test]
    fn test_delete_running_job_signals_cancel_once() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        let mut item = archived(&["alice"], ExportStatus::Running, "running.csv");
        item.add_user("bob");
        let id = item.id.clone();
        occupy(&wrapper, item);

        assert_eq!(wrapper.busy_workers(), 1);
        assert_eq!(wrapper.delete_export(&id, "bob"), DeleteCode::UserDeleted);
        assert_eq!(wrapper.delete_export(&id, "alice"), DeleteCode::Canceled);
        assert_eq!(wrapper.delete_export(&id, "alice"), DeleteCode::Canceled);

        let mut slot = lock(&wrapper.inner.slots[0]);
        let rx = slot.cancel_rx.as_mut().unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        // Users never drop to zero on a live job
        assert_eq!(slot.item.as_ref().unwrap().users, vec!["alice".to_string()]);
    }

    #[test]
    fn test_free_slot_item_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        let item = archived(&["alice"], ExportStatus::Running, "stale.csv");
        let id = item.id.clone();
        {
            let mut slot = lock(&wrapper.inner.slots[0]);
            slot.item = Some(item);
            slot.available = true;
        }

        assert!(wrapper.get_user_export(&id, "alice").is_none());
        assert!(wrapper.get_user_exports("alice").is_empty());
        assert_eq!(wrapper.delete_export(&id, "alice"), DeleteCode::NotFound);
    }

    #[test]
    fn test_sweep_removes_expired_files_and_entries() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);

        let old_path = dir.path().join("old.csv");
        let file = std::fs::File::create(&old_path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3 * 24 * 60 * 60))
            .unwrap();
        drop(file);
        let fresh_path = dir.path().join("fresh.csv");
        std::fs::write(&fresh_path, "id\n").unwrap();

        let mut old = archived(&["alice"], ExportStatus::Done, "old.csv");
        old.date = Utc::now() - chrono::Duration::days(3);
        let old_id = old.id.clone();
        let fresh = archived(&["alice"], ExportStatus::Done, "fresh.csv");
        let fresh_id = fresh.id.clone();
        wrapper.inner.archive.insert(old_id.clone(), old);
        wrapper.inner.archive.insert(fresh_id.clone(), fresh);

        let stats = wrapper.check_for_expired_files();
        assert_eq!(
            stats,
            SweepStats {
                files_removed: 1,
                entries_removed: 1
            }
        );
        assert!(!old_path.exists());
        assert!(fresh_path.exists());
        assert!(wrapper.get_user_export(&old_id, "alice").is_none());
        assert!(wrapper.get_user_export(&fresh_id, "alice").is_some());

        assert_eq!(wrapper.check_for_expired_files(), SweepStats::default());
    }

    #[test]
    fn test_sweep_with_unbounded_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExportConfig::new(dir.path(), 10, 1, u64::MAX);
        let wrapper =
            ExportWrapper::new(config, Arc::new(MemorySource::new()), Arc::new(LogNotifier))
                .unwrap();
        let file = std::fs::File::create(dir.path().join("old.csv")).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(400 * 24 * 60 * 60))
            .unwrap();
        drop(file);
        let mut old = archived(&["alice"], ExportStatus::Done, "old.csv");
        old.date = Utc::now() - chrono::Duration::days(400);
        wrapper.inner.archive.insert(old.id.clone(), old);

        assert_eq!(wrapper.check_for_expired_files(), SweepStats::default());
        assert!(dir.path().join("old.csv").exists());
        assert_eq!(wrapper.archive_len(), 1);
    }

    #[test]
    fn test_sweep_tolerates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(&dir.path().join("missing"), 10);
        assert_eq!(wrapper.check_for_expired_files(), SweepStats::default());
    }

    #[tokio::test]
    async fn test_job_runs_to_done() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new().with_set(
            "orders",
            vec![hit(json!({"id": 1})), hit(json!({"id": 2}))],
        );
        let (notifier, mut events) = ChannelNotifier::new();
        let wrapper =
            ExportWrapper::new(config(dir.path(), 10), Arc::new(source), Arc::new(notifier))
                .unwrap();
        wrapper.init().unwrap();

        let code = wrapper
            .add_to_queue(orders(), "orders", params(), "alice", ExtraParams::new(), true)
            .unwrap();
        assert_eq!(code, AddCode::Added);
        let id = wrapper.get_user_exports("alice")[0].id.clone();

        wait_until(|| wrapper.archive_len() == 1).await;
        let item = wrapper.get_user_export(&id, "alice").unwrap();
        assert_eq!(item.status, ExportStatus::Done);
        assert_eq!(item.rows, 2);
        assert!(item.error.is_empty());

        let path = wrapper.download_path(&id, "alice").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id\n1\n2\n");
        assert_eq!(item.size_bytes, 7);
        assert!(wrapper.download_path(&id, "bob").is_none());

        assert_eq!(events.recv().await.unwrap().status, ExportStatus::Running);
        assert_eq!(events.recv().await.unwrap().status, ExportStatus::Done);

        wrapper.shutdown().await;
        assert_eq!(wrapper.busy_workers(), 0);
    }

    #[tokio::test]
    async fn test_existing_output_fails_job_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("orders.csv.gz");
        std::fs::write(&existing, "previous export").unwrap();

        let wrapper = wrapper(dir.path(), 1);
        wrapper.init().unwrap();
        let code = wrapper
            .add_to_queue(
                orders(),
                "orders",
                CsvParams::default(),
                "alice",
                ExtraParams::new(),
                false,
            )
            .unwrap();
        assert_eq!(code, AddCode::Added);

        wait_until(|| wrapper.archive_len() == 1).await;
        let item = wrapper.get_user_exports("alice").remove(0);
        assert_eq!(item.status, ExportStatus::Error);
        assert_eq!(item.error, OUTPUT_EXISTS_MESSAGE);
        assert_eq!(item.users, vec!["alice".to_string()]);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "previous export");

        wrapper.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleting_running_job_cancels_it() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper =
            ExportWrapper::new(config(dir.path(), 10), Arc::new(SlowSource), Arc::new(LogNotifier))
                .unwrap();
        wrapper.init().unwrap();
        add(&wrapper, "slow", "alice");
        let id = wrapper.get_user_exports("alice")[0].id.clone();

        wait_until(|| wrapper.busy_workers() == 1).await;
        let running = wrapper.get_user_export(&id, "alice").unwrap();
        assert_eq!(running.status, ExportStatus::Running);

        assert_eq!(wrapper.delete_export(&id, "alice"), DeleteCode::Canceled);
        wait_until(|| wrapper.archive_len() == 1).await;

        let item = wrapper.get_user_export(&id, "alice").unwrap();
        assert_eq!(item.status, ExportStatus::Canceled);
        assert!(!dir.path().join("slow.csv").exists());
        assert_eq!(wrapper.busy_workers(), 0);

        wrapper.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_cancels_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper =
            ExportWrapper::new(config(dir.path(), 10), Arc::new(SlowSource), Arc::new(LogNotifier))
                .unwrap();
        wrapper.init().unwrap();
        add(&wrapper, "slow", "alice");
        wait_until(|| wrapper.busy_workers() == 1).await;

        wrapper.shutdown().await;

        assert_eq!(wrapper.busy_workers(), 0);
        let items = wrapper.get_user_exports("alice");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ExportStatus::Canceled);
        assert!(!dir.path().join("slow.csv").exists());
    }

    #[tokio::test]
    async fn test_queue_is_fifo_on_single_worker() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        add(&wrapper, "first", "alice");
        add(&wrapper, "second", "alice");

        assert_eq!(wrapper.dispatch(), 1);
        assert_eq!(wrapper.queue_len(), 1);
        let running: Vec<_> = wrapper
            .get_user_exports("alice")
            .into_iter()
            .filter(|item| item.status == ExportStatus::Running)
            .collect();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].file_name, "first.csv");
        // Slot stays busy until its report is processed
        assert_eq!(wrapper.dispatch(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        wrapper.init().unwrap();
        wrapper.shutdown().await;

        assert_eq!(add(&wrapper, "late", "alice"), AddCode::Added);
        assert_eq!(wrapper.dispatch(), 0);
        assert_eq!(wrapper.busy_workers(), 0);
        assert_eq!(wrapper.queue_len(), 1);

        let items = wrapper.get_user_exports("alice");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ExportStatus::Pending);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_during_dispatch_leaves_no_busy_slot() {
        for _ in 0..20 {
            let dir = tempfile::tempdir().unwrap();
            let mut config = ExportConfig::new(dir.path(), 50, 3, 1);
            config.dispatch_interval_ms = 1;
            let wrapper = ExportWrapper::new(config, Arc::new(SlowSource), Arc::new(LogNotifier))
                .unwrap();
            wrapper.init().unwrap();
            for i in 0..10 {
                add(&wrapper, &format!("job-{i}"), "alice");
            }

            let hammer = {
                let wrapper = wrapper.clone();
                tokio::spawn(async move {
                    for _ in 0..200 {
                        wrapper.dispatch();
                        tokio::task::yield_now().await;
                    }
                })
            };
            tokio::time::sleep(Duration::from_millis(3)).await;
            wrapper.shutdown().await;
            hammer.await.unwrap();

            assert_eq!(wrapper.busy_workers(), 0);
            let items = wrapper.get_user_exports("alice");
            assert_eq!(items.len(), 10);
            assert!(items.iter().all(|item| item.status != ExportStatus::Running));
            assert_eq!(wrapper.queue_len() + wrapper.archive_len(), 10);
        }
    }

    #[test]
    fn test_finished_job_is_found_once_after_archiving() {
        let dir = tempfile::tempdir().unwrap();
        let wrapper = wrapper(dir.path(), 10);
        let item = archived(&["alice"], ExportStatus::Running, "moving.csv");
        let id = item.id.clone();
        occupy(&wrapper, item);
        assert_eq!(
            wrapper.get_user_export(&id, "alice").unwrap().status,
            ExportStatus::Running
        );

        wrapper.finish(WorkerReport {
            worker_id: 0,
            status: ExportStatus::Done,
            error: String::new(),
            rows: 3,
            size_bytes: 12,
            cancel_rx: None,
        });

        assert_eq!(wrapper.busy_workers(), 0);
        let item = wrapper.get_user_export(&id, "alice").unwrap();
        assert_eq!(item.status, ExportStatus::Done);
        assert_eq!(item.rows, 3);
        let items = wrapper.get_user_exports("alice");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, ExportStatus::Done);
    }
}
