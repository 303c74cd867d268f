use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

/// Counters shared between the coordinator thread and observers.
#[derive(Clone, Default)]
pub struct IndexingProgress {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    files_total: AtomicUsize,
    files_processed: AtomicUsize,
    names_indexed: AtomicUsize,
    errors: AtomicUsize,
    is_active: AtomicBool,
    started_at: Mutex<Option<Instant>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub is_active: bool,
    pub files_total: usize,
    pub files_processed: usize,
    pub names_indexed: usize,
    pub errors: usize,
    pub elapsed_ms: u64,
    pub progress_pct: f64,
    pub eta_ms: Option<u64>,
}

impl IndexingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new batch. A batch scheduled while another is running adds to
    /// the running totals instead.
    pub fn start(&self, total_files: usize) {
        if self.inner.is_active.swap(true, Ordering::AcqRel) {
            self.inner.files_total.fetch_add(total_files, Ordering::AcqRel);
            return;
        }
        self.inner.files_total.store(total_files, Ordering::Release);
        self.inner.files_processed.store(0, Ordering::Release);
        self.inner.names_indexed.store(0, Ordering::Release);
        self.inner.errors.store(0, Ordering::Release);
        *self.started_at() = Some(Instant::now());
    }

    pub fn inc(&self, names: usize) {
        self.inner.files_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.names_indexed.fetch_add(names, Ordering::Relaxed);
    }

    pub fn inc_error(&self) {
        self.inner.files_processed.fetch_add(1, Ordering::Relaxed);
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.inner.is_active.store(false, Ordering::Release);
    }

    fn started_at(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.inner
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let is_active = self.inner.is_active.load(Ordering::Acquire);
        let files_total = self.inner.files_total.load(Ordering::Acquire);
        let files_processed = self.inner.files_processed.load(Ordering::Acquire);
        let names_indexed = self.inner.names_indexed.load(Ordering::Acquire);
        let errors = self.inner.errors.load(Ordering::Acquire);

        let elapsed_ms = self
            .started_at()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let progress_pct = if files_total > 0 {
            (files_processed as f64 / files_total as f64) * 100.0
        } else {
            0.0
        };

        let eta_ms = if is_active && files_processed > 0 && files_processed < files_total {
            let remaining = files_total - files_processed;
            let ms_per_file = elapsed_ms as f64 / files_processed as f64;
            Some((remaining as f64 * ms_per_file) as u64)
        } else {
            None
        };

        ProgressSnapshot {
            is_active,
            files_total,
            files_processed,
            names_indexed,
            errors,
            elapsed_ms,
            progress_pct,
            eta_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_percentage() {
        let progress = IndexingProgress::new();
        progress.start(4);
        progress.inc(10);
        progress.inc_error();
        let snapshot = progress.snapshot();
        assert!(snapshot.is_active);
        assert_eq!(snapshot.files_processed, 2);
        assert_eq!(snapshot.names_indexed, 10);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.progress_pct - 50.0).abs() < f64::EPSILON);

        progress.finish();
        assert!(!progress.snapshot().is_active);
        assert_eq!(progress.snapshot().eta_ms, None);
    }

    #[test]
    fn test_overlapping_batches_accumulate() {
        let progress = IndexingProgress::new();
        progress.start(2);
        progress.inc(1);
        progress.start(3);
        let snapshot = progress.snapshot();
        assert_eq!(snapshot.files_total, 5);
        assert_eq!(snapshot.files_processed, 1);
    }
}
