//! Background update coordinator.
//!
//! One worker thread drains a queue of update tasks. Files of a task are
//! parsed in parallel, then written serially with one write transaction per
//! translation unit so a reader never sees a file's includes ahead of its
//! names. Each scheduled path carries a generation; a path rescheduled before
//! its job runs is skipped by the older job.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::error::{IndexerError, Result};
use crate::index::{
    ApplyOutcome, FileId, FileRecord, FileUpdate, FragmentData, FragmentStore, IncludeRecord,
    Linkage, SignificantMacros,
};
use crate::indexer::events::{EventBus, IndexChangeEvent, IndexEvent, IndexerState};
use crate::indexer::parse::{linkage_for, ParsedFile, SourceParser};
use crate::indexer::progress::IndexingProgress;
use crate::indexer::strategy::{IndexedProject, UpdateTask};
use crate::location::LocationKey;

/// Longest time a writer backs off for waiting readers.
const READER_YIELD: Duration = Duration::from_millis(100);

struct Job {
    project: Arc<IndexedProject>,
    task: UpdateTask,
    generation: u64,
}

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    /// Newest generation scheduled per project and path.
    latest: HashMap<(String, PathBuf), u64>,
    /// Queued plus running jobs per project.
    active: HashMap<String, usize>,
    next_generation: u64,
    running: bool,
    shutdown: bool,
}

impl Queue {
    fn is_idle(&self) -> bool {
        self.jobs.is_empty() && !self.running
    }
}

struct Shared {
    queue: Mutex<Queue>,
    work: Condvar,
    idle: Condvar,
    parser: Arc<dyn SourceParser>,
    events: Arc<EventBus>,
    progress: IndexingProgress,
}

pub struct Coordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Starts the worker thread.
    pub fn start(parser: Arc<dyn SourceParser>, events: Arc<EventBus>) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
            parser,
            events,
            progress: IndexingProgress::new(),
        });
        let worker_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("index-coordinator".to_string())
            .spawn(move || worker_shared.run())?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues a task. Paths it shares with queued jobs are taken away from
    /// those jobs.
    pub fn schedule(&self, project: Arc<IndexedProject>, task: UpdateTask) {
        if task.is_empty() {
            return;
        }
        let name = project.name.clone();
        {
            let mut queue = self.shared.lock();
            if queue.shutdown {
                tracing::debug!("Coordinator is shut down, dropping task for {}", name);
                return;
            }
            queue.next_generation += 1;
            let generation = queue.next_generation;
            for path in task.paths() {
                queue.latest.insert((name.clone(), path.clone()), generation);
            }
            queue.jobs.push_back(Job {
                project,
                task,
                generation,
            });
            let count = queue.active.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                tracing::debug!("Indexer for {} scheduled", name);
                self.shared.publish_state(&name, IndexerState::Scheduled);
            }
        }
        self.shared.work.notify_one();
    }

    /// Drops queued jobs of `project`. A running job completes.
    pub fn cancel(&self, project: &str) {
        {
            let mut queue = self.shared.lock();
            let before = queue.jobs.len();
            queue.jobs.retain(|job| job.project.name != project);
            let dropped = before - queue.jobs.len();
            queue.latest.retain(|(name, _), _| name != project);
            let remaining = match queue.active.get_mut(project) {
                Some(count) => {
                    *count = count.saturating_sub(dropped);
                    *count
                }
                None => return,
            };
            if remaining == 0 {
                queue.active.remove(project);
                if dropped > 0 {
                    self.shared.publish_state(project, IndexerState::Idle);
                }
            }
        }
        self.shared.idle.notify_all();
    }

    pub fn is_idle(&self) -> bool {
        self.shared.lock().is_idle()
    }

    /// Waits until the queue is drained. `None` waits forever. Returns false
    /// on timeout.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.shared.lock();
        while !queue.is_idle() && !queue.shutdown {
            match deadline {
                None => {
                    queue = self
                        .shared
                        .idle
                        .wait(queue)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    queue = self
                        .shared
                        .idle
                        .wait_timeout(queue, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        queue.is_idle()
    }

    pub fn progress(&self) -> &IndexingProgress {
        &self.shared.progress
    }

    /// Stops the worker after the running job. Queued jobs are dropped.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            queue.shutdown = true;
            queue.jobs.clear();
            queue.latest.clear();
        }
        self.shared.work.notify_all();
        self.shared.idle.notify_all();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::warn!("Index coordinator thread panicked");
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        while let Some(job) = self.next_job() {
            if let Err(e) = self.execute(&job) {
                tracing::warn!("Indexing {} failed: {}", job.project.name, e);
            }
            self.finish_job(&job);
        }
        tracing::debug!("Index coordinator stopped");
    }

    fn next_job(&self) -> Option<Job> {
        let mut queue = self.lock();
        loop {
            if queue.shutdown {
                return None;
            }
            if let Some(job) = queue.jobs.pop_front() {
                queue.running = true;
                tracing::debug!("Indexer for {} running", job.project.name);
                self.publish_state(&job.project.name, IndexerState::Running);
                return Some(job);
            }
            queue = self.work.wait(queue).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish_job(&self, job: &Job) {
        let name = &job.project.name;
        {
            let mut queue = self.lock();
            queue.running = false;
            for path in job.task.paths() {
                let key = (name.clone(), path.clone());
                if queue.latest.get(&key) == Some(&job.generation) {
                    queue.latest.remove(&key);
                }
            }
            let remaining = match queue.active.get_mut(name) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                queue.active.remove(name);
                tracing::debug!("Indexer for {} idle", name);
                self.publish_state(name, IndexerState::Idle);
            }
        }
        self.idle.notify_all();
    }

    fn is_current(&self, job: &Job, path: &Path) -> bool {
        let queue = self.lock();
        !queue.shutdown
            && queue
                .latest
                .get(&(job.project.name.clone(), path.to_path_buf()))
                .map(|g| *g == job.generation)
                .unwrap_or(false)
    }

    fn execute(&self, job: &Job) -> Result<()> {
        let project = &job.project;
        let store = &project.store;
        let task = &job.task;
        let started = Instant::now();

        if task.clear || !task.removed.is_empty() {
            yield_to_readers(store);
            let mut txn = store.begin_write()?;
            if task.clear {
                txn.clear();
            }
            for location in &task.removed {
                txn.remove_location(location.clone());
            }
            let outcome = txn.commit()?;
            self.publish_change(&project.name, outcome);
        }

        let units: Vec<&PathBuf> = task
            .units
            .iter()
            .filter(|p| self.is_current(job, p))
            .collect();
        self.progress.start(units.len());

        let parsed: Vec<(&PathBuf, Result<Vec<ParsedFile>>)> = units
            .par_iter()
            .map(|path| (*path, self.parser.parse(&project.request(path))))
            .collect();
        for (path, result) in parsed {
            if !self.is_current(job, path) {
                tracing::debug!("Skipping superseded update of {}", path.display());
                continue;
            }
            self.apply_unit(project, path, result);
        }

        for header in &task.orphans {
            if !header.is_file() || !self.is_current(job, header) || self.is_reached(project, header)? {
                continue;
            }
            self.progress.start(1);
            let result = self.parser.parse(&project.request(header));
            self.apply_unit(project, header, result);
        }

        self.progress.finish();
        tracing::info!(
            "Indexed {} units of {} in {:?}",
            units.len(),
            project.name,
            started.elapsed()
        );
        Ok(())
    }

    /// True when some translation unit already stored a variant of `header`.
    fn is_reached(&self, project: &IndexedProject, header: &Path) -> Result<bool> {
        let Some(key) = project.registry().normalize_path(header) else {
            return Ok(true);
        };
        let data = project.store.acquire_read()?;
        Ok(!data.includers_of(&key).is_empty())
    }

    fn apply_unit(&self, project: &IndexedProject, path: &Path, result: Result<Vec<ParsedFile>>) {
        let written = result
            .and_then(|files| to_updates(project, files))
            .and_then(|updates| self.write_unit(project, updates));
        match written {
            Ok(names) => self.progress.inc(names),
            Err(e) => self.fail(project, path, e),
        }
    }

    /// Writes one translation unit and its header variants. Stored variants
    /// that the new ones supersede are removed in the same transaction.
    fn write_unit(&self, project: &IndexedProject, updates: Vec<FileUpdate>) -> Result<usize> {
        let store = &project.store;
        let (stale, abandoned) = {
            let data = store.acquire_read()?;
            (stale_locations(&data, &updates), abandoned_variants(&data, &updates))
        };

        let names = updates.iter().map(|u| u.names.len()).sum();
        yield_to_readers(store);
        let mut txn = store.begin_write()?;
        for (location, linkage, macros) in abandoned {
            if !stale.contains(&location) {
                tracing::debug!("Dropping unused variant of {}", location);
                txn.remove_variant(location, linkage, macros);
            }
        }
        for location in stale {
            txn.remove_location(location);
        }
        for update in updates {
            txn.replace_file(update);
        }
        let outcome = txn.commit()?;
        self.publish_change(&project.name, outcome);
        Ok(names)
    }

    /// Leaves the stored content in place, marks the file failed so the next
    /// freshness pass retries it.
    fn fail(&self, project: &IndexedProject, path: &Path, error: IndexerError) {
        let failure = IndexerError::PartialUpdateFailure {
            location: path.display().to_string(),
            reason: error.to_string(),
        };
        tracing::warn!("{}", failure);
        self.progress.inc_error();

        if error.is_corruption() || matches!(error, IndexerError::LockTimeout { .. }) {
            return;
        }
        let Some(location) = project.registry().normalize_path(path) else {
            return;
        };
        let linkage = linkage_for(path, project.header_linkage);
        let marked = project.store.begin_write().and_then(|mut txn| {
            txn.mark_failed(location, linkage, error.to_string());
            txn.commit()
        });
        match marked {
            Ok(outcome) => self.publish_change(&project.name, outcome),
            Err(e) => tracing::warn!("Failed to mark {} as failed: {}", path.display(), e),
        }
    }

    /// Called with the queue locked so state events stay ordered. Sending
    /// never blocks and runs no listener code.
    fn publish_state(&self, project: &str, state: IndexerState) {
        self.events.publish(IndexEvent::State {
            project: project.to_string(),
            state,
        });
    }

    fn publish_change(&self, project: &str, outcome: ApplyOutcome) {
        if outcome.is_empty() {
            return;
        }
        self.events.publish(IndexEvent::Change(IndexChangeEvent {
            project: project.to_string(),
            written: outcome.written.into_iter().collect(),
            removed: outcome.removed.into_iter().collect(),
            cleared: outcome.cleared,
        }));
    }
}

/// Converts parse results. Header variants without a stable location are
/// dropped; the unit itself must resolve.
fn to_updates(project: &IndexedProject, files: Vec<ParsedFile>) -> Result<Vec<FileUpdate>> {
    let registry = project.registry();
    let mut updates = Vec::with_capacity(files.len());
    for (i, file) in files.into_iter().enumerate() {
        let path = file.path.clone();
        match file.into_update(&registry) {
            Ok(update) => updates.push(update),
            Err(e) if i == 0 => return Err(e),
            Err(e) => tracing::debug!("Skipping header {}: {}", path.display(), e),
        }
    }
    if updates.is_empty() {
        return Err(IndexerError::Parse("parser returned no files".to_string()));
    }
    Ok(updates)
}

fn yield_to_readers(store: &FragmentStore) {
    let deadline = Instant::now() + READER_YIELD;
    while store.has_waiting_readers() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

/// Locations whose stored variants the new parse supersedes: the unit when
/// its own context changed, headers whose content changed.
fn stale_locations(data: &FragmentData, updates: &[FileUpdate]) -> BTreeSet<LocationKey> {
    updates
        .iter()
        .enumerate()
        .filter(|(i, update)| {
            let stored = data.get_files(&update.location);
            if *i == 0 {
                stored.iter().any(|f| {
                    f.significant_macros != update.significant_macros
                        || f.linkage != update.linkage
                })
            } else {
                stored.iter().any(|f| f.fingerprint != update.fingerprint)
            }
        })
        .map(|(_, update)| update.location.clone())
        .collect()
}

/// Header variants the unit's previous parse reached that neither the new
/// parse nor any other stored file still includes.
fn abandoned_variants(
    data: &FragmentData,
    updates: &[FileUpdate],
) -> Vec<(LocationKey, Linkage, SignificantMacros)> {
    let Some(unit) = updates.first() else {
        return Vec::new();
    };
    let rewritten: HashSet<(&LocationKey, &SignificantMacros)> = updates
        .iter()
        .map(|u| (&u.location, &u.significant_macros))
        .collect();
    let included: HashSet<(&LocationKey, &SignificantMacros)> = updates
        .iter()
        .flat_map(|u| active_includes(&u.includes))
        .collect();

    let mut reached: HashMap<FileId, &FileRecord> = HashMap::new();
    let mut pending = data.get_files(&unit.location);
    while let Some(file) = pending.pop() {
        for (target, macros) in active_includes(&file.includes) {
            for variant in data.get_files(target) {
                if variant.significant_macros == *macros
                    && variant.location != unit.location
                    && reached.insert(variant.id, variant).is_none()
                {
                    pending.push(variant);
                }
            }
        }
    }
    let mut abandoned: HashMap<FileId, &FileRecord> = reached
        .into_iter()
        .filter(|(_, f)| {
            let variant = (&f.location, &f.significant_macros);
            !rewritten.contains(&variant) && !included.contains(&variant)
        })
        .collect();

    // Another includer keeps a variant alive unless it is itself abandoned
    // or about to be rewritten with the includes already accounted for.
    loop {
        let alive: Vec<FileId> = abandoned
            .values()
            .filter(|variant| {
                data.includers_of(&variant.location).iter().any(|includer| {
                    includer.location != unit.location
                        && !abandoned.contains_key(&includer.id)
                        && !rewritten.contains(&(&includer.location, &includer.significant_macros))
                        && active_includes(&includer.includes).any(|(target, macros)| {
                            *target == variant.location && *macros == variant.significant_macros
                        })
                })
            })
            .map(|f| f.id)
            .collect();
        if alive.is_empty() {
            break;
        }
        for id in alive {
            abandoned.remove(&id);
        }
    }

    abandoned
        .into_values()
        .map(|f| (f.location.clone(), f.linkage, f.significant_macros.clone()))
        .collect()
}

fn active_includes(
    includes: &[IncludeRecord],
) -> impl Iterator<Item = (&LocationKey, &SignificantMacros)> {
    includes
        .iter()
        .filter(|i| i.active)
        .filter_map(|i| Some((i.target.as_ref()?, &i.target_macros)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FragmentId, Linkage, NameMask};
    use crate::indexer::frontend::TreeSitterFrontend;
    use crate::location::LocationRegistry;
    use std::collections::BTreeMap;
    use std::sync::RwLock;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        project: Arc<IndexedProject>,
        coordinator: Coordinator,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut registry = LocationRegistry::new();
        registry.register_project("p", dir.path());
        let project = Arc::new(IndexedProject {
            name: "p".to_string(),
            root: dir.path().to_path_buf(),
            include_paths: Vec::new(),
            defines: BTreeMap::new(),
            header_linkage: Linkage::Cpp,
            store: Arc::new(FragmentStore::in_memory(FragmentId(1), "p")),
            registry: Arc::new(RwLock::new(registry)),
        });
        let events = Arc::new(EventBus::new(64));
        let coordinator =
            Coordinator::start(Arc::new(TreeSitterFrontend::new()), events.clone()).unwrap();
        Fixture {
            dir,
            project,
            coordinator,
            events,
        }
    }

    impl Fixture {
        fn write(&self, name: &str, content: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            path
        }

        fn run(&self, task: UpdateTask) {
            self.coordinator.schedule(self.project.clone(), task);
            assert!(self.coordinator.join(Some(Duration::from_secs(30))));
        }
    }

    fn units(paths: Vec<PathBuf>) -> UpdateTask {
        UpdateTask {
            units: paths,
            ..Default::default()
        }
    }

    #[test]
    fn test_indexes_units_and_publishes_events() {
        let f = fixture();
        let mut subscriber = f.events.subscribe();
        let main = f.write("main.c", "int var;\nvoid func(void);\nint main(void) { func(); var = 1; return 0; }\n");

        f.run(units(vec![main]));

        let data = f.project.store.acquire_read().unwrap();
        assert_eq!(data.stats().files, 1);
        let var = data.find_bindings_by_exact_name(&["var"], &crate::index::Filter::all());
        assert_eq!(var.len(), 1);
        assert_eq!(data.find_names(var[0].id, NameMask::REFERENCES).len(), 1);
        drop(data);

        let mut states = Vec::new();
        let mut changes = 0;
        while let Ok(event) = subscriber.try_recv() {
            match event {
                IndexEvent::State { state, .. } => states.push(state),
                IndexEvent::Change(change) => {
                    changes += 1;
                    assert_eq!(change.written.len(), 1);
                }
            }
        }
        assert_eq!(
            states,
            vec![IndexerState::Scheduled, IndexerState::Running, IndexerState::Idle]
        );
        assert_eq!(changes, 1);
        assert_eq!(f.coordinator.progress().snapshot().files_processed, 1);
    }

    #[test]
    fn test_missing_file_is_marked_failed() {
        let f = fixture();
        let ok = f.write("ok.c", "int ok;");
        let missing = f.dir.path().join("missing.c");

        f.run(units(vec![ok, missing.clone()]));

        let data = f.project.store.acquire_read().unwrap();
        let key = f.project.registry().normalize_path(&missing).unwrap();
        let files = data.get_files(&key);
        assert_eq!(files.len(), 1);
        assert!(matches!(files[0].state, crate::index::FileState::Failed { .. }));
        assert_eq!(data.stats().files, 2);
        assert_eq!(f.coordinator.progress().snapshot().errors, 1);
    }

    #[test]
    fn test_removed_locations_and_clear() {
        let f = fixture();
        let a = f.write("a.c", "int a;");
        let b = f.write("b.c", "int b;");
        f.run(units(vec![a.clone(), b]));
        let key = f.project.registry().normalize_path(&a).unwrap();

        f.run(UpdateTask {
            removed: vec![key.clone()],
            ..Default::default()
        });
        {
            let data = f.project.store.acquire_read().unwrap();
            assert!(data.get_files(&key).is_empty());
            assert_eq!(data.stats().files, 1);
        }

        f.run(UpdateTask {
            clear: true,
            ..Default::default()
        });
        assert_eq!(f.project.store.acquire_read().unwrap().stats().files, 0);
    }

    #[test]
    fn test_orphan_header_parsed_only_when_unreached() {
        let f = fixture();
        let used = f.write("used.h", "int used;");
        let lonely = f.write("lonely.h", "int lonely;");
        let main = f.write("main.c", "#include \"used.h\"\nint main(void) { return used; }\n");

        f.run(UpdateTask {
            units: vec![main],
            orphans: vec![used.clone(), lonely.clone()],
            ..Default::default()
        });

        let registry = f.project.registry();
        let data = f.project.store.acquire_read().unwrap();
        assert_eq!(data.get_files(&registry.normalize_path(&used).unwrap()).len(), 1);
        assert_eq!(data.get_files(&registry.normalize_path(&lonely).unwrap()).len(), 1);
    }

    #[test]
    fn test_join_when_idle_and_schedule_after_shutdown() {
        let f = fixture();
        assert!(f.coordinator.is_idle());
        assert!(f.coordinator.join(Some(Duration::from_millis(10))));
        f.coordinator.shutdown();
        let a = f.write("a.c", "int a;");
        f.coordinator.schedule(f.project.clone(), units(vec![a]));
        assert_eq!(f.project.store.acquire_read().unwrap().stats().files, 0);
    }
}
