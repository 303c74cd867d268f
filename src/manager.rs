//! Workspace facade: one fragment per project, one coordinator per workspace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{ProjectConfig, WorkspaceConfig};
use crate::error::{IndexerError, Result};
use crate::index::{CompositeView, FragmentId, FragmentStore, IndexStats};
use crate::indexer::{
    strategy_for, Coordinator, EventBus, FastStrategy, FileSet, FileWalker, FullStrategy,
    IndexEvent, IndexedProject, IndexerStrategy, IndexingProgress, ListenerToken, ResourceEvent,
    SourceParser, TreeSitterFrontend, UpdateTask,
};
use crate::location::{LocationKey, LocationRegistry, ProjectRelativeConverter};
use crate::project::{Direction, ProjectGraph};
use crate::snapshot::{self, ExportOptions, ImportOptions, SnapshotHeader};

/// Fragments selected for one query. Lock it to read.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    projects: Vec<String>,
    stores: Vec<Arc<FragmentStore>>,
}

impl IndexHandle {
    pub fn projects(&self) -> &[String] {
        &self.projects
    }

    pub fn stores(&self) -> &[Arc<FragmentStore>] {
        &self.stores
    }

    /// Read-locks every fragment of the handle.
    pub fn lock(&self) -> Result<CompositeView<'_>> {
        CompositeView::lock(&self.stores)
    }
}

struct ProjectEntry {
    config: ProjectConfig,
    indexed: Arc<IndexedProject>,
    walker: FileWalker,
}

#[derive(Default)]
struct State {
    projects: BTreeMap<String, ProjectEntry>,
    graph: ProjectGraph,
    next_fragment: u32,
}

pub struct IndexManager {
    root: PathBuf,
    data_dir: PathBuf,
    lock_timeout: Option<Duration>,
    registry: Arc<RwLock<LocationRegistry>>,
    state: RwLock<State>,
    strategy: Arc<dyn IndexerStrategy>,
    events: Arc<EventBus>,
    coordinator: Coordinator,
}

impl IndexManager {
    /// Manager with the tree-sitter front end and the configured strategy.
    pub fn new(config: WorkspaceConfig) -> Result<Self> {
        let strategy = strategy_for(&config.workspace.indexer)?;
        Self::with_components(config, Arc::new(TreeSitterFrontend::new()), strategy)
    }

    /// Loads `cxx-index.toml` (or defaults) and builds the manager.
    pub fn open(config_path: &Path) -> Result<Self> {
        Self::new(WorkspaceConfig::load_or_default(config_path)?)
    }

    pub fn with_components(
        config: WorkspaceConfig,
        parser: Arc<dyn SourceParser>,
        strategy: Arc<dyn IndexerStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        let root = absolute(&config.workspace.root)?;
        let events = Arc::new(EventBus::new(config.workspace.event_buffer));
        let coordinator = Coordinator::start(parser, events.clone())?;
        let manager = Self {
            data_dir: root.join(&config.workspace.data_dir),
            root,
            lock_timeout: config.lock_timeout(),
            registry: Arc::new(RwLock::new(LocationRegistry::new())),
            state: RwLock::new(State {
                next_fragment: 1,
                ..State::default()
            }),
            strategy,
            events,
            coordinator,
        };
        for project in config.projects {
            manager.add_project(project)?;
        }
        tracing::info!(
            "Opened workspace {} with {} projects, strategy {}",
            manager.root.display(),
            manager.projects().len(),
            manager.strategy.id()
        );
        Ok(manager)
    }

    fn state(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, LocationRegistry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn strategy(&self) -> &dyn IndexerStrategy {
        self.strategy.as_ref()
    }

    pub fn projects(&self) -> Vec<String> {
        self.state().projects.keys().cloned().collect()
    }

    /// Filesystem path of an indexed location.
    pub fn path_of(&self, location: &LocationKey) -> Option<PathBuf> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .to_path(location)
    }

    pub fn project_config(&self, project: &str) -> Option<ProjectConfig> {
        self.state().projects.get(project).map(|e| e.config.clone())
    }

    /// Registers a project and opens (or creates) its fragment. A fragment
    /// that had to be discarded is rebuilt by the next [`IndexManager::reindex`].
    pub fn add_project(&self, config: ProjectConfig) -> Result<()> {
        let mut state = self.state_mut();
        if state.projects.contains_key(&config.name) {
            return Err(IndexerError::Config(format!(
                "project {} already exists",
                config.name
            )));
        }
        if let Some(missing) = config
            .depends_on
            .iter()
            .find(|d| !state.projects.contains_key(d.as_str()))
        {
            return Err(IndexerError::ProjectNotFound(missing.clone()));
        }

        let id = FragmentId(state.next_fragment);
        let db_path = self.data_dir.join(format!("{}.db", config.name));
        let store = FragmentStore::open_or_rebuild(id, &config.name, &db_path)?
            .with_lock_timeout(self.lock_timeout);
        let entry = self.entry(config, Arc::new(store))?;
        state.next_fragment += 1;
        state.graph.add_project(&entry.config.name);
        state
            .graph
            .set_dependencies(&entry.config.name, &entry.config.depends_on);
        tracing::info!(
            "Added project {} at {}",
            entry.config.name,
            entry.indexed.root.display()
        );
        state.projects.insert(entry.config.name.clone(), entry);
        Ok(())
    }

    fn entry(&self, config: ProjectConfig, store: Arc<FragmentStore>) -> Result<ProjectEntry> {
        let walker = FileWalker::with_excludes(&config.exclude)?;
        let root = self.root.join(&config.root);
        self.registry_mut().register_project(&config.name, &root);
        let indexed = IndexedProject {
            name: config.name.clone(),
            include_paths: config.include_paths.iter().map(|p| root.join(p)).collect(),
            defines: config.defines.clone(),
            header_linkage: config.header_linkage,
            root,
            store,
            registry: self.registry.clone(),
        };
        Ok(ProjectEntry {
            walker,
            config,
            indexed: Arc::new(indexed),
        })
    }

    /// Drops a project and deletes its fragment. A project added later under
    /// the same name starts empty.
    pub fn remove_project(&self, project: &str) -> Result<()> {
        self.coordinator.cancel(project);
        let entry = {
            let mut state = self.state_mut();
            let entry = state
                .projects
                .remove(project)
                .ok_or_else(|| IndexerError::ProjectNotFound(project.to_string()))?;
            state.graph.remove_project(project);
            entry
        };
        self.registry_mut().unregister_project(project);
        entry.indexed.store.destroy()?;
        tracing::info!("Removed project {}", project);
        Ok(())
    }

    /// Applies a changed project description. Changes that affect parsing
    /// clear the fragment and reindex it in full.
    pub fn update_project(&self, config: ProjectConfig) -> Result<()> {
        let (indexed, reparse) = {
            let mut state = self.state_mut();
            if let Some(missing) = config
                .depends_on
                .iter()
                .find(|d| !state.projects.contains_key(d.as_str()))
            {
                return Err(IndexerError::ProjectNotFound(missing.clone()));
            }
            let old = state
                .projects
                .remove(&config.name)
                .ok_or_else(|| IndexerError::ProjectNotFound(config.name.clone()))?;
            let reparse = old.config.affects_parsing(&config);
            let entry = match self.entry(config, old.indexed.store.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    state.projects.insert(old.config.name.clone(), old);
                    return Err(e);
                }
            };
            state
                .graph
                .set_dependencies(&entry.config.name, &entry.config.depends_on);
            let indexed = entry.indexed.clone();
            state.projects.insert(entry.config.name.clone(), entry);
            (indexed, reparse)
        };
        if reparse {
            tracing::info!("Description of {} changed, reindexing", indexed.name);
            self.coordinator.cancel(&indexed.name);
            let files = self.walk(&indexed.name)?;
            let mut task = FullStrategy
                .create_task(&indexed, FileSet::complete(files))?
                .unwrap_or_default();
            task.clear = true;
            self.coordinator.schedule(indexed, task);
        }
        Ok(())
    }

    fn indexed(&self, project: &str) -> Result<Arc<IndexedProject>> {
        self.state()
            .projects
            .get(project)
            .map(|e| e.indexed.clone())
            .ok_or_else(|| IndexerError::ProjectNotFound(project.to_string()))
    }

    /// The fragment of `project`. A fragment whose storage failed is reset
    /// and queued for a full rebuild first.
    pub fn fragment(&self, project: &str) -> Result<Arc<FragmentStore>> {
        let indexed = self.indexed(project)?;
        self.ensure_healthy(&indexed)?;
        Ok(indexed.store.clone())
    }

    fn ensure_healthy(&self, indexed: &Arc<IndexedProject>) -> Result<()> {
        if !indexed.store.storage_failed() {
            return Ok(());
        }
        tracing::warn!("Storage of {} failed, rebuilding", indexed.name);
        indexed.store.reset()?;
        self.reindex(&indexed.name)?;
        Ok(())
    }

    /// `project` composed with the projects reachable in `direction`.
    pub fn index(&self, project: &str, direction: Direction) -> Result<IndexHandle> {
        let projects = {
            let state = self.state();
            if !state.projects.contains_key(project) {
                return Err(IndexerError::ProjectNotFound(project.to_string()));
            }
            state.graph.closure(project, direction)
        };
        self.index_for(&projects)
    }

    /// Composite over an explicit set of projects.
    pub fn index_for<S: AsRef<str>>(&self, projects: &[S]) -> Result<IndexHandle> {
        let mut handle = IndexHandle {
            projects: Vec::with_capacity(projects.len()),
            stores: Vec::with_capacity(projects.len()),
        };
        for project in projects {
            let project = project.as_ref();
            if handle.projects.iter().any(|p| p == project) {
                continue;
            }
            handle.stores.push(self.fragment(project)?);
            handle.projects.push(project.to_string());
        }
        Ok(handle)
    }

    fn walk(&self, project: &str) -> Result<Vec<PathBuf>> {
        let state = self.state();
        let entry = state
            .projects
            .get(project)
            .ok_or_else(|| IndexerError::ProjectNotFound(project.to_string()))?;
        entry.walker.walk(&entry.indexed.root)
    }

    /// Walks the project and schedules whatever the strategy finds stale.
    /// A fragment flagged for rebuild is reindexed in full. Returns whether
    /// work was scheduled.
    pub fn reindex(&self, project: &str) -> Result<bool> {
        let indexed = self.indexed(project)?;
        let files = FileSet::complete(self.walk(project)?);
        let task = if indexed.store.needs_rebuild() {
            let task = FullStrategy.create_task(&indexed, files)?;
            indexed.store.clear_rebuild_flag();
            task
        } else {
            self.strategy.create_task(&indexed, files)?
        };
        Ok(self.schedule(indexed, task))
    }

    pub fn reindex_all(&self) -> Result<()> {
        for project in self.projects() {
            self.reindex(&project)?;
        }
        Ok(())
    }

    /// Schedules explicit file changes for one project.
    pub fn index_files(&self, project: &str, files: FileSet) -> Result<bool> {
        let indexed = self.indexed(project)?;
        let task = self.strategy.create_task(&indexed, files)?;
        Ok(self.schedule(indexed, task))
    }

    fn schedule(&self, indexed: Arc<IndexedProject>, task: Option<UpdateTask>) -> bool {
        match task {
            Some(task) => {
                self.coordinator.schedule(indexed, task);
                true
            }
            None => {
                tracing::debug!("Nothing to index for {}", indexed.name);
                false
            }
        }
    }

    /// Feeds a workspace change notification into the indexer.
    pub fn handle_event(&self, event: ResourceEvent) -> Result<()> {
        match event {
            ResourceEvent::FileCreated(path) => self.file_event(&path, |p| FileSet {
                added: [p].into(),
                ..FileSet::default()
            }),
            ResourceEvent::FileModified(path) => {
                self.file_event(&path, |p| FileSet::changed(vec![p]))
            }
            ResourceEvent::FileDeleted(path) => {
                self.file_event(&path, |p| FileSet::removed(vec![p]))
            }
            ResourceEvent::ProjectAdded(config) => {
                let name = config.name.clone();
                self.add_project(config)?;
                self.reindex(&name).map(|_| ())
            }
            ResourceEvent::ProjectRemoved(name) => self.remove_project(&name),
            ResourceEvent::ProjectChanged(config) => self.update_project(config),
        }
    }

    /// Offers a file change to every project; strategies ignore files a
    /// project neither owns nor includes.
    fn file_event(&self, path: &Path, files: impl Fn(PathBuf) -> FileSet) -> Result<()> {
        let targets: Vec<String> = {
            let state = self.state();
            state
                .projects
                .values()
                .filter(|e| !e.walker.is_excluded(&e.indexed.root, path))
                .map(|e| e.config.name.clone())
                .collect()
        };
        for project in targets {
            self.index_files(&project, files(path.to_path_buf()))?;
        }
        Ok(())
    }

    /// Waits for the coordinator to go idle. `None` waits forever.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        self.coordinator.join(timeout)
    }

    pub fn progress(&self) -> &IndexingProgress {
        self.coordinator.progress()
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: Fn(&IndexEvent) + Send + 'static,
    {
        self.events.add_listener(listener)
    }

    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.events.remove_listener(token)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self, project: &str) -> Result<IndexStats> {
        let store = self.fragment(project)?;
        let data = store.acquire_read()?;
        Ok(data.stats())
    }

    /// Writes a snapshot of `project`. Portable snapshots store paths
    /// relative to the project root and skip files outside it.
    pub fn export(&self, project: &str, destination: &Path, portable: bool) -> Result<SnapshotHeader> {
        let store = self.fragment(project)?;
        let options = if portable {
            ExportOptions::portable(Arc::new(ProjectRelativeConverter::new(project)))
        } else {
            ExportOptions::default()
        };
        snapshot::export_to_path(&store, destination, &options)
    }

    /// Replaces the fragment of `project` with a snapshot, then schedules a
    /// freshness pass against the files on disk.
    pub fn import(&self, project: &str, source: &Path) -> Result<SnapshotHeader> {
        let indexed = self.indexed(project)?;
        self.coordinator.cancel(project);
        let options = ImportOptions {
            converter: Some(Arc::new(ProjectRelativeConverter::new(project))),
        };
        let header = snapshot::import_from_path(&indexed.store, source, &options)?;
        indexed.store.clear_rebuild_flag();

        let files = FileSet::complete(self.walk(project)?);
        let task = FastStrategy.create_task(&indexed, files)?;
        self.schedule(indexed, task);
        Ok(header)
    }

    /// Stops the coordinator. Queued work is dropped.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    crate::location::lexical_normalize(&joined)
        .ok_or_else(|| IndexerError::Config(format!("invalid workspace root {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace(dir: &Path) -> WorkspaceConfig {
        let mut config = WorkspaceConfig::default();
        config.workspace.root = dir.to_path_buf();
        config
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_add_project_rejects_duplicates_and_unknown_dependencies() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new(workspace(dir.path())).unwrap();
        manager.add_project(ProjectConfig::new("core", "core")).unwrap();
        assert!(matches!(
            manager.add_project(ProjectConfig::new("core", "other")),
            Err(IndexerError::Config(_))
        ));
        assert!(matches!(
            manager.add_project(ProjectConfig::new("app", "app").depends_on("missing")),
            Err(IndexerError::ProjectNotFound(_))
        ));
        assert!(matches!(
            manager.fragment("missing"),
            Err(IndexerError::ProjectNotFound(_))
        ));
        assert_eq!(manager.projects(), vec!["core".to_string()]);
    }

    #[test]
    fn test_invalid_excludes_leave_no_registered_root() {
        let dir = TempDir::new().unwrap();
        let manager = IndexManager::new(workspace(dir.path())).unwrap();
        let mut bad = ProjectConfig::new("bad", "bad");
        bad.exclude.push("[unclosed".to_string());
        assert!(matches!(
            manager.add_project(bad),
            Err(IndexerError::Config(_))
        ));
        assert!(manager.projects().is_empty());
        assert!(manager
            .path_of(&LocationKey::workspace("bad", "a.c"))
            .is_none());

        manager.add_project(ProjectConfig::new("core", "core")).unwrap();
        let key = LocationKey::workspace("core", "a.c");
        let before = manager.path_of(&key).unwrap();
        let mut moved = ProjectConfig::new("core", "elsewhere");
        moved.exclude.push("[unclosed".to_string());
        assert!(manager.update_project(moved).is_err());
        assert_eq!(manager.path_of(&key).unwrap(), before);
    }

    #[test]
    fn test_reindex_then_nothing_to_do() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "core/a.c", "int a;\nint get(void) { return a; }\n");
        let mut config = workspace(dir.path());
        config.projects.push(ProjectConfig::new("core", "core"));
        let manager = IndexManager::new(config).unwrap();

        assert!(manager.reindex("core").unwrap());
        assert!(manager.join(Some(Duration::from_secs(30))));
        assert_eq!(manager.stats("core").unwrap().files, 1);

        assert!(!manager.reindex("core").unwrap());
    }

    #[test]
    fn test_remove_project_starts_empty_when_recreated() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "core/a.c", "int a;");
        let mut config = workspace(dir.path());
        config.projects.push(ProjectConfig::new("core", "core"));
        let manager = IndexManager::new(config).unwrap();
        manager.reindex("core").unwrap();
        assert!(manager.join(Some(Duration::from_secs(30))));
        assert_eq!(manager.stats("core").unwrap().files, 1);

        manager
            .handle_event(ResourceEvent::ProjectRemoved("core".to_string()))
            .unwrap();
        assert!(manager.projects().is_empty());
        manager.add_project(ProjectConfig::new("core", "core")).unwrap();
        assert_eq!(manager.stats("core").unwrap().files, 0);
    }

    #[test]
    fn test_file_events_update_the_index() {
        let dir = TempDir::new().unwrap();
        let a = write(dir.path(), "core/a.c", "int a;");
        let mut config = workspace(dir.path());
        config.projects.push(ProjectConfig::new("core", "core"));
        let manager = IndexManager::new(config).unwrap();
        manager.reindex("core").unwrap();
        assert!(manager.join(Some(Duration::from_secs(30))));

        let b = write(dir.path(), "core/b.c", "int b;");
        manager.handle_event(ResourceEvent::FileCreated(b)).unwrap();
        assert!(manager.join(Some(Duration::from_secs(30))));
        assert_eq!(manager.stats("core").unwrap().files, 2);

        std::fs::remove_file(&a).unwrap();
        manager.handle_event(ResourceEvent::FileDeleted(a)).unwrap();
        assert!(manager.join(Some(Duration::from_secs(30))));
        assert_eq!(manager.stats("core").unwrap().files, 1);
    }
}
