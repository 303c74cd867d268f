//! Turns a set of file changes into an update task for one project.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use crate::error::{IndexerError, Result};
use crate::index::{FileState, FragmentData, FragmentStore, Linkage};
use crate::indexer::parse::{
    content_fingerprint, is_translation_unit, modified_ms, ParseRequest,
};
use crate::location::{LocationKey, LocationRegistry};

/// Everything the indexer needs to know about one project.
#[derive(Debug)]
pub struct IndexedProject {
    pub name: String,
    pub root: PathBuf,
    /// Absolute include directories.
    pub include_paths: Vec<PathBuf>,
    pub defines: BTreeMap<String, String>,
    pub header_linkage: Linkage,
    pub store: Arc<FragmentStore>,
    pub registry: Arc<RwLock<LocationRegistry>>,
}

impl IndexedProject {
    pub fn registry(&self) -> RwLockReadGuard<'_, LocationRegistry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build context for parsing `path` inside this project.
    pub fn request(&self, path: &Path) -> ParseRequest {
        ParseRequest::new(path)
            .with_include_paths(self.include_paths.clone())
            .with_defines(self.defines.clone())
            .with_header_linkage(self.header_linkage)
    }
}

/// Files reported as added, changed or removed.
#[derive(Debug, Clone, Default)]
pub struct FileSet {
    pub added: BTreeSet<PathBuf>,
    pub changed: BTreeSet<PathBuf>,
    pub removed: BTreeSet<PathBuf>,
    /// `added` lists every file of the project, so stored locations missing
    /// from it were deleted while nobody watched.
    pub complete: bool,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The full file list of a project, as found by a walk.
    pub fn complete(files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            added: files.into_iter().collect(),
            complete: true,
            ..Self::default()
        }
    }

    pub fn changed(files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            changed: files.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn removed(files: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            removed: files.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty() && !self.complete
    }

    pub fn merge(&mut self, other: FileSet) {
        self.added.extend(other.added);
        self.changed.extend(other.changed);
        self.removed.extend(other.removed);
        self.complete |= other.complete;
    }
}

/// Work for the coordinator. Units are parsed as translation units; orphan
/// headers only when no unit of the task pulled them in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateTask {
    pub units: Vec<PathBuf>,
    pub orphans: Vec<PathBuf>,
    pub removed: Vec<LocationKey>,
    /// Empty the fragment before anything else.
    pub clear: bool,
}

impl UpdateTask {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty() && self.orphans.is_empty() && self.removed.is_empty() && !self.clear
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.units.iter().chain(self.orphans.iter())
    }
}

pub trait IndexerStrategy: Send + Sync {
    fn id(&self) -> &'static str;

    /// `None` when there is nothing to do.
    fn create_task(&self, project: &IndexedProject, files: FileSet) -> Result<Option<UpdateTask>>;
}

/// Never indexes anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStrategy;

impl IndexerStrategy for NullStrategy {
    fn id(&self) -> &'static str {
        "null"
    }

    fn create_task(&self, _project: &IndexedProject, _files: FileSet) -> Result<Option<UpdateTask>> {
        Ok(None)
    }
}

/// Skips files whose stored timestamp or fingerprint still matches the disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct FastStrategy;

impl IndexerStrategy for FastStrategy {
    fn id(&self) -> &'static str {
        "fast"
    }

    fn create_task(&self, project: &IndexedProject, files: FileSet) -> Result<Option<UpdateTask>> {
        plan(project, files, true)
    }
}

/// Reparses every file it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullStrategy;

impl IndexerStrategy for FullStrategy {
    fn id(&self) -> &'static str {
        "full"
    }

    fn create_task(&self, project: &IndexedProject, files: FileSet) -> Result<Option<UpdateTask>> {
        plan(project, files, false)
    }
}

pub fn strategy_for(id: &str) -> Result<Arc<dyn IndexerStrategy>> {
    match id {
        "null" => Ok(Arc::new(NullStrategy)),
        "fast" => Ok(Arc::new(FastStrategy)),
        "full" => Ok(Arc::new(FullStrategy)),
        other => Err(IndexerError::Config(format!(
            "unknown indexer strategy: {} (expected null, fast or full)",
            other
        ))),
    }
}

fn plan(project: &IndexedProject, files: FileSet, skip_unchanged: bool) -> Result<Option<UpdateTask>> {
    let registry = project.registry();
    let data = project.store.acquire_read()?;

    let mut removed = BTreeSet::new();
    // Headers whose includers must be reparsed.
    let mut affected = BTreeSet::new();
    let mut units = BTreeSet::new();
    let mut orphans = BTreeSet::new();

    for path in &files.removed {
        let Some(key) = registry.normalize_path(path) else {
            continue;
        };
        if !data.get_files(&key).is_empty() {
            removed.insert(key.clone());
            affected.insert(key);
        }
    }

    if files.complete {
        let present: HashSet<LocationKey> = files
            .added
            .iter()
            .filter_map(|p| registry.normalize_path(p))
            .collect();
        for location in data.locations() {
            if location.project() == Some(project.name.as_str()) && !present.contains(location) {
                removed.insert(location.clone());
                affected.insert(location.clone());
            }
        }
    }

    for path in files.added.iter().chain(files.changed.iter()) {
        let Some(key) = registry.normalize_path(path) else {
            tracing::debug!("Skipping {}: no stable location", path.display());
            continue;
        };
        let owned = key.project() == Some(project.name.as_str());
        if !owned && data.get_files(&key).is_empty() {
            continue;
        }
        if skip_unchanged && is_fresh(&data, &key, path) {
            continue;
        }
        if is_translation_unit(path) {
            if owned {
                units.insert(path.clone());
            }
        } else {
            affected.insert(key);
            if owned {
                orphans.insert(path.clone());
            }
        }
    }

    for header in &affected {
        collect_units(&data, &registry, header, &mut units);
    }
    let orphans: Vec<PathBuf> = orphans.into_iter().filter(|p| !units.contains(p)).collect();

    let task = UpdateTask {
        units: units.into_iter().collect(),
        orphans,
        removed: removed.into_iter().collect(),
        clear: false,
    };
    tracing::debug!(
        "Planned {} units, {} orphan headers, {} removals for {}",
        task.units.len(),
        task.orphans.len(),
        task.removed.len(),
        project.name
    );
    Ok(Some(task).filter(|t| !t.is_empty()))
}

/// Walks include edges upwards from `header` to the translation units that
/// reach it.
fn collect_units(
    data: &FragmentData,
    registry: &LocationRegistry,
    header: &LocationKey,
    units: &mut BTreeSet<PathBuf>,
) {
    let mut visited = HashSet::new();
    let mut stack = vec![header.clone()];
    while let Some(location) = stack.pop() {
        if !visited.insert(location.clone()) {
            continue;
        }
        for includer in data.includers_of(&location) {
            let Some(path) = registry.to_path(&includer.location) else {
                continue;
            };
            if is_translation_unit(&path) {
                if path.is_file() {
                    units.insert(path);
                }
            } else {
                stack.push(includer.location.clone());
            }
        }
    }
}

fn is_fresh(data: &FragmentData, key: &LocationKey, path: &Path) -> bool {
    let variants = data.get_files(key);
    if variants.is_empty()
        || variants
            .iter()
            .any(|f| matches!(f.state, FileState::Failed { .. }))
    {
        return false;
    }
    let timestamp = modified_ms(path);
    if timestamp != 0 && variants.iter().all(|f| f.timestamp == timestamp) {
        return true;
    }
    match std::fs::read(path) {
        Ok(bytes) => {
            let fingerprint = content_fingerprint(&bytes);
            variants.iter().all(|f| f.fingerprint == fingerprint)
        }
        Err(_) => false,
    }
}
