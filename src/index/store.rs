//! Fragment store: one persisted index per project.
//!
//! Content lives in memory behind a [`FragmentLock`]. Reads go through a
//! [`ReadGuard`]; writes are staged in a [`WriteTransaction`] and applied
//! atomically at commit, then written through to SQLite.

use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::index::fragment::{ApplyOutcome, FileUpdate, FragmentData, StagedOp};
use crate::index::lock::FragmentLock;
use crate::index::sqlite::SqliteFragment;
use crate::index::{Linkage, SignificantMacros};
use crate::location::LocationKey;

/// Identity of a fragment; composite views lock fragments in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub u32);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fragment#{}", self.0)
    }
}

pub struct FragmentStore {
    id: FragmentId,
    project: String,
    lock: FragmentLock,
    data: RwLock<FragmentData>,
    sqlite: Mutex<Option<SqliteFragment>>,
    db_path: Option<PathBuf>,
    lock_timeout: Option<Duration>,
    needs_rebuild: AtomicBool,
    storage_failed: AtomicBool,
}

impl fmt::Debug for FragmentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentStore")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("db_path", &self.db_path)
            .finish()
    }
}

impl FragmentStore {
    /// Opens a persisted fragment; fails with `CorruptFragment` if the
    /// database cannot be trusted.
    pub fn open(id: FragmentId, project: &str, db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let sqlite = SqliteFragment::open(&db_path)?;
        let data = sqlite.load()?;
        sqlite.set_meta("project", project)?;
        tracing::debug!(
            "Opened {} for {} with {} files",
            id,
            project,
            data.stats().files
        );
        Ok(Self::assemble(id, project, data, Some(sqlite), Some(db_path)))
    }

    /// Opens a persisted fragment, discarding it and starting empty when it is
    /// corrupt. A discarded fragment reports [`FragmentStore::needs_rebuild`].
    pub fn open_or_rebuild(id: FragmentId, project: &str, db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let existed = db_path.exists();
        match Self::open(id, project, db_path) {
            Ok(store) => {
                if !existed {
                    store.needs_rebuild.store(true, Ordering::SeqCst);
                }
                Ok(store)
            }
            Err(err) if err.is_corruption() => {
                tracing::warn!(
                    "Fragment for {} at {} is corrupt, rebuilding: {}",
                    project,
                    db_path.display(),
                    err
                );
                remove_database_files(db_path)?;
                let store = Self::open(id, project, db_path)?;
                store.needs_rebuild.store(true, Ordering::SeqCst);
                Ok(store)
            }
            Err(err) => Err(err),
        }
    }

    /// Fragment without persistence.
    pub fn in_memory(id: FragmentId, project: &str) -> Self {
        Self::assemble(id, project, FragmentData::new(), None, None)
    }

    fn assemble(
        id: FragmentId,
        project: &str,
        data: FragmentData,
        sqlite: Option<SqliteFragment>,
        db_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            project: project.to_string(),
            lock: FragmentLock::new(),
            data: RwLock::new(data),
            sqlite: Mutex::new(sqlite),
            db_path,
            lock_timeout: None,
            needs_rebuild: AtomicBool::new(false),
            storage_failed: AtomicBool::new(false),
        }
    }

    /// Timeout applied by [`FragmentStore::acquire_read`] and
    /// [`FragmentStore::begin_write`].
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn id(&self) -> FragmentId {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// True when the content was discarded and a full reindex is required.
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::SeqCst)
    }

    pub fn clear_rebuild_flag(&self) {
        self.needs_rebuild.store(false, Ordering::SeqCst);
    }

    /// True after a write-through failed; the disk copy is stale.
    pub fn storage_failed(&self) -> bool {
        self.storage_failed.load(Ordering::SeqCst)
    }

    pub fn has_waiting_readers(&self) -> bool {
        self.lock.has_waiting_readers()
    }

    fn sqlite(&self) -> MutexGuard<'_, Option<SqliteFragment>> {
        self.sqlite.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    pub fn acquire_read(&self) -> Result<ReadGuard<'_>> {
        self.acquire_read_timeout(self.lock_timeout)
    }

    pub fn acquire_read_timeout(&self, timeout: Option<Duration>) -> Result<ReadGuard<'_>> {
        self.lock.lock_read(timeout)?;
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(ReadGuard {
            store: self,
            data: Some(data),
            thread: thread::current().id(),
        })
    }

    pub fn begin_write(&self) -> Result<WriteTransaction<'_>> {
        self.begin_write_timeout(self.lock_timeout)
    }

    pub fn begin_write_timeout(&self, timeout: Option<Duration>) -> Result<WriteTransaction<'_>> {
        self.lock.lock_write(timeout)?;
        Ok(WriteTransaction {
            store: self,
            ops: Vec::new(),
            finished: false,
        })
    }

    /// Swaps in new content wholesale, as done by snapshot import.
    pub fn replace_all(&self, data: FragmentData) -> Result<()> {
        data.check_integrity()?;
        let txn = self.begin_write()?;
        {
            let mut current = self.data.write().unwrap_or_else(PoisonError::into_inner);
            *current = data;
            current.take_dirty();
            if let Some(sqlite) = self.sqlite().as_ref() {
                if let Err(err) = sqlite.replace_all(&current) {
                    self.storage_failed.store(true, Ordering::SeqCst);
                    return Err(IndexerError::CorruptFragment(err.to_string()));
                }
            }
        }
        txn.abort();
        Ok(())
    }

    /// Discards content and backing database; the fragment starts empty and
    /// is flagged for a full reindex.
    pub fn reset(&self) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut current = self.data.write().unwrap_or_else(PoisonError::into_inner);
            *current = FragmentData::new();
            let mut sqlite = self.sqlite();
            if let Some(path) = &self.db_path {
                *sqlite = None;
                remove_database_files(path)?;
                *sqlite = Some(SqliteFragment::open(path)?);
                if let Some(db) = sqlite.as_ref() {
                    db.set_meta("project", &self.project)?;
                }
            }
        }
        self.storage_failed.store(false, Ordering::SeqCst);
        self.needs_rebuild.store(true, Ordering::SeqCst);
        txn.abort();
        Ok(())
    }

    /// Closes the database and deletes its files.
    pub fn destroy(&self) -> Result<()> {
        let txn = self.begin_write()?;
        {
            let mut current = self.data.write().unwrap_or_else(PoisonError::into_inner);
            *current = FragmentData::new();
            *self.sqlite() = None;
            if let Some(path) = &self.db_path {
                remove_database_files(path)?;
            }
        }
        txn.abort();
        Ok(())
    }

    fn commit_ops(&self, ops: Vec<StagedOp>) -> Result<ApplyOutcome> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let outcome = data.apply(ops)?;
        let dirty = data.take_dirty();
        if let Some(sqlite) = self.sqlite().as_ref() {
            if let Err(err) = sqlite.flush(&data, &dirty) {
                tracing::warn!("Write-through for {} failed: {}", self.project, err);
                self.storage_failed.store(true, Ordering::SeqCst);
                return Err(IndexerError::CorruptFragment(err.to_string()));
            }
        }
        tracing::debug!(
            "Committed {} written, {} removed to {}",
            outcome.written.len(),
            outcome.removed.len(),
            self.id
        );
        Ok(outcome)
    }
}

fn remove_database_files(path: &Path) -> Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut target = path.as_os_str().to_owned();
        target.push(suffix);
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read hold on a fragment. Records borrowed through it stay valid until it is
/// dropped.
pub struct ReadGuard<'a> {
    store: &'a FragmentStore,
    data: Option<RwLockReadGuard<'a, FragmentData>>,
    thread: ThreadId,
}

impl<'a> ReadGuard<'a> {
    pub fn store(&self) -> &'a FragmentStore {
        self.store
    }

    pub fn fragment_id(&self) -> FragmentId {
        self.store.id
    }

    pub fn data(&self) -> &FragmentData {
        self
    }

    /// Explicit release; dropping the guard has the same effect.
    pub fn release(self) {}
}

impl Deref for ReadGuard<'_> {
    type Target = FragmentData;

    fn deref(&self) -> &FragmentData {
        match &self.data {
            Some(data) => &**data,
            None => unreachable!("read guard used after release"),
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.data.take();
        self.store.lock.unlock_read_for(self.thread);
    }
}

/// Exclusive write hold with staged operations. Dropping it without
/// [`WriteTransaction::commit`] discards the staged operations.
pub struct WriteTransaction<'a> {
    store: &'a FragmentStore,
    ops: Vec<StagedOp>,
    finished: bool,
}

impl WriteTransaction<'_> {
    pub fn replace_file(&mut self, update: FileUpdate) -> &mut Self {
        self.ops.push(StagedOp::ReplaceFile(Box::new(update)));
        self
    }

    pub fn remove_location(&mut self, location: LocationKey) -> &mut Self {
        self.ops.push(StagedOp::RemoveLocation(location));
        self
    }

    /// Removes the variant of `location` processed under `significant_macros`.
    pub fn remove_variant(
        &mut self,
        location: LocationKey,
        linkage: Linkage,
        significant_macros: SignificantMacros,
    ) -> &mut Self {
        self.ops.push(StagedOp::RemoveVariant {
            location,
            linkage,
            significant_macros,
        });
        self
    }

    pub fn mark_failed(
        &mut self,
        location: LocationKey,
        linkage: Linkage,
        reason: impl Into<String>,
    ) -> &mut Self {
        self.ops.push(StagedOp::MarkFailed {
            location,
            linkage,
            reason: reason.into(),
        });
        self
    }

    pub fn clear(&mut self) -> &mut Self {
        self.ops.push(StagedOp::Clear);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies all staged operations atomically and releases the lock.
    pub fn commit(mut self) -> Result<ApplyOutcome> {
        let ops = std::mem::take(&mut self.ops);
        self.finish();
        if ops.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        self.store.commit_ops(ops)
    }

    pub fn abort(mut self) {
        self.ops.clear();
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.ops.is_empty() {
            tracing::debug!(
                "Discarding {} staged operations on {}",
                self.ops.len(),
                self.store.id
            );
        }
        self.store.lock.unlock_write();
    }
}
