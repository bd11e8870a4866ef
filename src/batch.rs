//! Chunked, bounded-concurrency batch processing
//!
//! Items are split into fixed-size chunks that run one after another. Inside
//! a chunk at most `max_workers` tasks are in flight; as each finishes the next
//! item is spawned. Every item yields exactly one result, whether its
//! processing function succeeds, returns an error, or panics.
//!
//! Results arrive in completion order. Callers needing input order must
//! re-sort by label.

use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Instant;
use tokio::task::JoinSet;

/// One model file to resolve
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTask {
    pub file_path: PathBuf,
    /// Precomputed content hash; computed on demand when absent or when `verify_hash` is set
    pub file_hash: Option<String>,
    pub verify_hash: bool,
    pub force_refresh: bool,
}

impl BatchTask {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            file_hash: None,
            verify_hash: true,
            force_refresh: false,
        }
    }
}

/// Identity used to report an item's result and failure reason
pub trait BatchItem: Send + 'static {
    fn label(&self) -> String;
}

impl BatchItem for BatchTask {
    fn label(&self) -> String {
        self.file_path.display().to_string()
    }
}

impl BatchItem for PathBuf {
    fn label(&self) -> String {
        self.display().to_string()
    }
}

impl BatchItem for String {
    fn label(&self) -> String {
        self.clone()
    }
}

impl BatchItem for u64 {
    fn label(&self) -> String {
        self.to_string()
    }
}

/// Outcome of a whole batch run
#[derive(Debug)]
pub struct BatchReport<T> {
    /// One entry per input item, in completion order
    pub results: Vec<(String, Option<T>)>,
    /// `(label, reason)` for every item that failed
    pub failures: Vec<(String, String)>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn success_count(&self) -> usize {
        self.results.len() - self.failures.len()
    }

    /// Results re-sorted by label
    pub fn sorted(mut self) -> Self {
        self.results.sort_by(|a, b| a.0.cmp(&b.0));
        self
    }
}

/// Success/failure bookkeeping with periodic log lines
///
/// Purely observational; nothing reads it to make decisions.
#[derive(Debug)]
pub struct ProgressTracker {
    description: String,
    total_batches: usize,
    total_items: usize,
    current_batch: usize,
    processed: usize,
    successes: usize,
    failures: usize,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(description: impl Into<String>, total_batches: usize, total_items: usize) -> Self {
        Self {
            description: description.into(),
            total_batches,
            total_items,
            current_batch: 0,
            processed: 0,
            successes: 0,
            failures: 0,
            started: Instant::now(),
        }
    }

    pub fn start_batch(&mut self, batch_number: usize, batch_size: usize) {
        self.current_batch = batch_number;
        tracing::info!(
            description = %self.description,
            batch = batch_number,
            total_batches = self.total_batches,
            items = batch_size,
            "Starting batch"
        );
    }

    pub fn update(&mut self, success: bool) {
        self.processed += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        crate::metrics::record_batch_item(success);
    }

    pub fn end_batch(&mut self) {
        tracing::info!(
            description = %self.description,
            batch = self.current_batch,
            total_batches = self.total_batches,
            batch_percent = percent(self.current_batch, self.total_batches),
            item_percent = percent(self.processed, self.total_items),
            "Batch complete"
        );
    }

    pub fn finish(&self) {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let items_per_sec = if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        };

        tracing::info!(
            description = %self.description,
            processed = self.processed,
            total = self.total_items,
            successes = self.successes,
            failures = self.failures,
            elapsed_ms = elapsed.as_millis() as u64,
            items_per_sec = %format!("{items_per_sec:.2}"),
            "Processing complete"
        );
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn successes(&self) -> usize {
        self.successes
    }

    pub fn failures(&self) -> usize {
        self.failures
    }
}

fn percent(done: usize, total: usize) -> usize {
    if total == 0 { 100 } else { done * 100 / total }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Fans items out over a bounded pool of tokio tasks, one chunk at a time
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    batch_size: usize,
    max_workers: usize,
}

impl BatchCoordinator {
    /// Zero sizes are clamped to one
    pub fn new(batch_size: usize, max_workers: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_workers: max_workers.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run `process` over every item
    ///
    /// Never fails as a whole: errors and panics from `process` become a
    /// `(label, None)` result plus a `(label, reason)` failure.
    pub async fn process_in_batches<I, T, F, Fut>(
        &self,
        description: &str,
        items: Vec<I>,
        process: F,
    ) -> BatchReport<T>
    where
        I: BatchItem,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let total_items = items.len();
        let total_batches = total_items.div_ceil(self.batch_size);
        let mut tracker = ProgressTracker::new(description, total_batches, total_items);
        let mut report = BatchReport::default();

        tracing::info!(
            description,
            items = total_items,
            batches = total_batches,
            batch_size = self.batch_size,
            max_workers = self.max_workers,
            "Processing items in batches"
        );

        let mut items = items.into_iter();
        for batch_number in 1..=total_batches {
            let chunk: Vec<I> = items.by_ref().take(self.batch_size).collect();
            tracker.start_batch(batch_number, chunk.len());
            self.run_chunk(chunk, &process, &mut tracker, &mut report)
                .await;
            tracker.end_batch();
        }

        tracker.finish();

        if !report.failures.is_empty() {
            tracing::warn!(
                description,
                failures = report.failures.len(),
                "Some items failed"
            );
        }

        report
    }

    async fn run_chunk<I, T, F, Fut>(
        &self,
        chunk: Vec<I>,
        process: &F,
        tracker: &mut ProgressTracker,
        report: &mut BatchReport<T>,
    ) where
        I: BatchItem,
        T: Send + 'static,
        F: Fn(I) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let mut pending = chunk.into_iter();
        let mut in_flight = JoinSet::new();

        let spawn = |set: &mut JoinSet<(String, Result<T, String>)>, item: I| {
            let label = item.label();

            // `process` may panic before handing back its future
            let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| process(item))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind(),
                Err(payload) => {
                    let reason = format!("panicked: {}", panic_message(payload.as_ref()));
                    set.spawn(async move { (label, Err(reason)) });
                    return;
                }
            };

            set.spawn(async move {
                let outcome = match fut.await {
                    Ok(result) => result.map_err(|e| format!("{e:#}")),
                    Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
                };
                (label, outcome)
            });
        };

        for item in pending.by_ref().take(self.max_workers) {
            spawn(&mut in_flight, item);
        }

        while let Some(joined) = in_flight.join_next().await {
            match joined {
                Ok((label, Ok(value))) => {
                    tracker.update(true);
                    report.results.push((label, Some(value)));
                }
                Ok((label, Err(reason))) => {
                    tracing::error!(item = %label, error = %reason, "Item failed");
                    tracker.update(false);
                    report.results.push((label.clone(), None));
                    report.failures.push((label, reason));
                }
                Err(e) => {
                    // Tasks are never aborted, so this only fires on runtime shutdown
                    tracing::error!(error = %e, "Batch worker did not complete");
                    tracker.update(false);
                    let label = "<unknown>".to_string();
                    report.results.push((label.clone(), None));
                    report.failures.push((label, e.to_string()));
                }
            }

            if let Some(item) = pending.next() {
                spawn(&mut in_flight, item);
            }
        }
    }
}
