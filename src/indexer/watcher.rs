use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};

use crate::error::{IndexerError, Result};
use crate::indexer::events::ResourceEvent;
use crate::indexer::parse::is_source_file;

type DebounceResult = std::result::Result<Vec<DebouncedEvent>, notify::Error>;

/// Debounced recursive watch over project roots, reporting C/C++ files only.
pub struct FileWatcher {
    debouncer: Debouncer<notify::RecommendedWatcher>,
    receiver: Receiver<DebounceResult>,
    /// Files seen so far, to tell creation from modification.
    known: HashSet<PathBuf>,
}

impl FileWatcher {
    pub fn new(roots: &[PathBuf]) -> Result<Self> {
        let (tx, rx) = channel();

        let debouncer = new_debouncer(Duration::from_millis(500), tx)
            .map_err(|e| IndexerError::Watcher(e.to_string()))?;

        let mut watcher = Self {
            debouncer,
            receiver: rx,
            known: HashSet::new(),
        };
        for root in roots {
            watcher.watch(root)?;
        }
        Ok(watcher)
    }

    pub fn watch(&mut self, root: &Path) -> Result<()> {
        self.debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| IndexerError::Watcher(e.to_string()))
    }

    /// Marks files as already indexed so their next event is a modification.
    pub fn seed(&mut self, files: impl IntoIterator<Item = PathBuf>) {
        self.known.extend(files);
    }

    /// Blocks until the next batch of relevant events. `None` once the
    /// watcher is gone.
    pub fn recv(&mut self) -> Option<Vec<ResourceEvent>> {
        loop {
            match self.receiver.recv() {
                Ok(batch) => {
                    let events = self.translate(batch);
                    if !events.is_empty() {
                        return Some(events);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Like [`FileWatcher::recv`] but gives up after `timeout`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<ResourceEvent>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(batch) => Some(self.translate(batch)).filter(|e| !e.is_empty()),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn translate(&mut self, batch: DebounceResult) -> Vec<ResourceEvent> {
        match batch {
            Ok(events) => translate(&mut self.known, events),
            Err(e) => {
                tracing::warn!("File watcher error: {}", e);
                Vec::new()
            }
        }
    }
}

fn translate(known: &mut HashSet<PathBuf>, events: Vec<DebouncedEvent>) -> Vec<ResourceEvent> {
    let mut out = Vec::new();
    for event in events {
        let path = event.path;
        if !is_source_file(&path) {
            continue;
        }
        if path.is_file() {
            if known.insert(path.clone()) {
                out.push(ResourceEvent::FileCreated(path));
            } else {
                out.push(ResourceEvent::FileModified(path));
            }
        } else if !path.exists() {
            known.remove(&path);
            out.push(ResourceEvent::FileDeleted(path));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_debouncer_mini::DebouncedEventKind;
    use tempfile::TempDir;

    fn event(path: PathBuf) -> DebouncedEvent {
        DebouncedEvent {
            path,
            kind: DebouncedEventKind::Any,
        }
    }

    #[test]
    fn test_translate_classifies_source_events() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.c");
        let notes = dir.path().join("notes.txt");
        std::fs::write(&source, "int a;").unwrap();
        std::fs::write(&notes, "skip").unwrap();

        let mut known = HashSet::new();
        let events = translate(&mut known, vec![event(source.clone()), event(notes)]);
        assert!(matches!(events.as_slice(), [ResourceEvent::FileCreated(p)] if *p == source));

        let events = translate(&mut known, vec![event(source.clone())]);
        assert!(matches!(events.as_slice(), [ResourceEvent::FileModified(_)]));

        std::fs::remove_file(&source).unwrap();
        let events = translate(&mut known, vec![event(source.clone())]);
        assert!(matches!(events.as_slice(), [ResourceEvent::FileDeleted(_)]));
        assert!(known.is_empty());
    }
}
