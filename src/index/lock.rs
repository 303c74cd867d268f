//! Readers-writer lock guarding one fragment.
//!
//! Read locks are counted per thread and are reentrant: a thread that already
//! reads may read again even while a writer waits. New readers otherwise queue
//! behind waiting writers, which bounds writer starvation.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{IndexerError, Result};

#[derive(Debug, Default)]
struct LockState {
    readers: HashMap<ThreadId, usize>,
    writer: Option<ThreadId>,
    waiting_writers: usize,
    waiting_readers: usize,
}

impl LockState {
    fn holds_read(&self, thread: ThreadId) -> bool {
        self.readers.contains_key(&thread)
    }
}

#[derive(Debug, Default)]
pub struct FragmentLock {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl FragmentLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits on the condvar until `ready` holds or the deadline passes.
    fn wait_until<'a>(
        &self,
        mut state: MutexGuard<'a, LockState>,
        deadline: Option<Instant>,
        ready: impl Fn(&LockState) -> bool,
    ) -> (MutexGuard<'a, LockState>, bool) {
        while !ready(&state) {
            match deadline {
                None => {
                    state = self
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (state, false);
                    }
                    state = self
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        (state, true)
    }

    pub fn lock_read(&self, timeout: Option<Duration>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.holds_read(me) {
            *state.readers.entry(me).or_insert(0) += 1;
            return Ok(());
        }
        if state.writer == Some(me) {
            return Err(IndexerError::Index(
                "read lock requested by the thread holding the write lock".to_string(),
            ));
        }

        state.waiting_readers += 1;
        let deadline = timeout.map(|t| Instant::now() + t);
        let (mut state, acquired) = self.wait_until(state, deadline, |s| {
            s.writer.is_none() && s.waiting_writers == 0
        });
        state.waiting_readers -= 1;
        if !acquired {
            drop(state);
            self.changed.notify_all();
            return Err(timeout_error("read", timeout));
        }
        state.readers.insert(me, 1);
        Ok(())
    }

    /// Releases one read hold of the calling thread.
    pub fn unlock_read(&self) {
        self.unlock_read_for(thread::current().id());
    }

    pub(crate) fn unlock_read_for(&self, thread: ThreadId) {
        let mut state = self.state();
        let last = match state.readers.get_mut(&thread) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => return,
        };
        if last {
            state.readers.remove(&thread);
            drop(state);
            self.changed.notify_all();
        }
    }

    pub fn lock_write(&self, timeout: Option<Duration>) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state();
        if state.holds_read(me) {
            return Err(IndexerError::Index(
                "write lock requested by a thread holding a read lock".to_string(),
            ));
        }
        if state.writer == Some(me) {
            return Err(IndexerError::Index("write lock is not reentrant".to_string()));
        }

        state.waiting_writers += 1;
        let deadline = timeout.map(|t| Instant::now() + t);
        let (mut state, acquired) = self.wait_until(state, deadline, |s| {
            s.writer.is_none() && s.readers.is_empty()
        });
        state.waiting_writers -= 1;
        if !acquired {
            drop(state);
            // Readers held back by this writer may proceed now.
            self.changed.notify_all();
            return Err(timeout_error("write", timeout));
        }
        state.writer = Some(me);
        Ok(())
    }

    pub fn unlock_write(&self) {
        let mut state = self.state();
        state.writer = None;
        drop(state);
        self.changed.notify_all();
    }

    pub fn has_waiting_readers(&self) -> bool {
        self.state().waiting_readers > 0
    }

    pub fn reader_count(&self) -> usize {
        self.state().readers.values().sum()
    }

    pub fn is_write_locked(&self) -> bool {
        self.state().writer.is_some()
    }

    pub fn holds_read(&self) -> bool {
        self.state().holds_read(thread::current().id())
    }
}

fn timeout_error(lock: &'static str, timeout: Option<Duration>) -> IndexerError {
    IndexerError::LockTimeout {
        lock,
        timeout_ms: timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0),
    }
}
