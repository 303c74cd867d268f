//! Indexer notifications.
//!
//! Events are published on a `tokio::sync::broadcast` channel. Publishing
//! never blocks and never runs listener code, so the coordinator can publish
//! right after a commit without extending any critical section. Callback
//! listeners each get a thread of their own draining a receiver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::config::ProjectConfig;
use crate::location::LocationKey;

/// Lifecycle of a project's indexing work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexerState {
    Idle,
    Scheduled,
    Running,
}

/// Locations whose content changed in one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexChangeEvent {
    pub project: String,
    pub written: Vec<LocationKey>,
    pub removed: Vec<LocationKey>,
    /// The fragment was emptied before being written.
    pub cleared: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    State {
        project: String,
        state: IndexerState,
    },
    Change(IndexChangeEvent),
}

/// Workspace change notification fed to the manager.
#[derive(Debug, Clone)]
pub enum ResourceEvent {
    FileCreated(PathBuf),
    FileModified(PathBuf),
    FileDeleted(PathBuf),
    ProjectAdded(ProjectConfig),
    ProjectRemoved(String),
    /// Include paths, defines or dependencies changed.
    ProjectChanged(ProjectConfig),
}

/// Handle returned by [`EventBus::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
    listeners: Mutex<HashMap<ListenerToken, Arc<AtomicBool>>>,
    next_token: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Fire-and-forget; succeeds with no subscribers.
    pub fn publish(&self, event: IndexEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }

    /// Runs `listener` on a dedicated thread for every event published from
    /// now on. A listener that falls behind skips the missed events.
    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&IndexEvent) + Send + 'static,
    {
        let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));
        let mut receiver = self.sender.subscribe();
        let flag = active.clone();
        let spawned = thread::Builder::new()
            .name(format!("index-listener-{}", token.0))
            .spawn(move || loop {
                match receiver.blocking_recv() {
                    Ok(event) => {
                        if !flag.load(Ordering::Acquire) {
                            break;
                        }
                        listener(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Index listener lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            });
        match spawned {
            Ok(_) => {
                self.listeners().insert(token, active);
            }
            Err(e) => tracing::warn!("Failed to start index listener: {}", e),
        }
        token
    }

    /// Stops delivery to a listener. Its thread exits on the next event or
    /// when the bus is dropped.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        match self.listeners().remove(&token) {
            Some(active) => {
                active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<ListenerToken, Arc<AtomicBool>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
