//! Workspace configuration, read from `cxx-index.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::index::Linkage;

pub const CONFIG_FILE_NAME: &str = "cxx-index.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub workspace: WorkspaceSettings,
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Base for relative project roots and the data directory.
    pub root: PathBuf,
    /// One fragment database per project lives here.
    pub data_dir: PathBuf,
    /// Strategy id: "null", "fast" or "full".
    pub indexer: String,
    pub lock_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            data_dir: PathBuf::from(".cxx-index"),
            indexer: "fast".to_string(),
            lock_timeout_ms: 5000,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub root: PathBuf,
    pub depends_on: Vec<String>,
    /// Relative entries resolve against the project root.
    pub include_paths: Vec<PathBuf>,
    /// Glob patterns relative to the project root.
    pub exclude: Vec<String>,
    /// Linkage of headers, whose extension does not tell.
    pub header_linkage: Linkage,
    pub defines: BTreeMap<String, String>,
}

impl ProjectConfig {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn depends_on(mut self, project: impl Into<String>) -> Self {
        self.depends_on.push(project.into());
        self
    }

    pub fn include_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.include_paths.push(path.into());
        self
    }

    pub fn define(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.defines.insert(name.into(), value.into());
        self
    }

    /// True when reindexing is needed to apply `other`.
    pub fn affects_parsing(&self, other: &ProjectConfig) -> bool {
        self.root != other.root
            || self.include_paths != other.include_paths
            || self.defines != other.defines
            || self.exclude != other.exclude
            || self.header_linkage != other.header_linkage
    }
}

impl WorkspaceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self =
            toml::from_str(&content).map_err(|e| IndexerError::Config(e.to_string()))?;
        // A relative workspace root is relative to the config file.
        if config.workspace.root.is_relative() {
            if let Some(dir) = path.parent() {
                config.workspace.root = dir.join(&config.workspace.root);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults rooted at `path`'s directory when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        if let Some(dir) = path.parent() {
            config.workspace.root = dir.to_path_buf();
        }
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| IndexerError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for project in &self.projects {
            if project.name.is_empty() || project.name.contains('/') {
                return Err(IndexerError::Config(format!(
                    "invalid project name: {:?}",
                    project.name
                )));
            }
            if !seen.insert(project.name.as_str()) {
                return Err(IndexerError::Config(format!(
                    "duplicate project: {}",
                    project.name
                )));
            }
        }
        for project in &self.projects {
            for dependency in &project.depends_on {
                if !seen.contains(dependency.as_str()) {
                    return Err(IndexerError::Config(format!(
                        "project {} depends on unknown project {}",
                        project.name, dependency
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn project(&self, name: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Absolute project root.
    pub fn project_root(&self, project: &ProjectConfig) -> PathBuf {
        self.workspace.root.join(&project.root)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.workspace.root.join(&self.workspace.data_dir)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        match self.workspace.lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: WorkspaceConfig = toml::from_str(
            r#"
[[projects]]
name = "core"
root = "core"
"#,
        )
        .unwrap();
        assert_eq!(config.workspace.indexer, "fast");
        assert_eq!(config.workspace.event_buffer, 256);
        assert_eq!(config.projects.len(), 1);
        assert_eq!(config.projects[0].header_linkage, Linkage::Cpp);
        assert!(config.projects[0].depends_on.is_empty());
    }

    #[test]
    fn test_full_project_section() {
        let config: WorkspaceConfig = toml::from_str(
            r#"
[workspace]
indexer = "full"
lock_timeout_ms = 0

[[projects]]
name = "core"
root = "core"

[[projects]]
name = "app"
root = "app"
depends_on = ["core"]
include_paths = ["include"]
defines = { DEBUG = "1" }
exclude = ["third_party/**"]
header_linkage = "c"
"#,
        )
        .unwrap();
        config.validate().unwrap();
        let app = config.project("app").unwrap();
        assert_eq!(app.depends_on, vec!["core".to_string()]);
        assert_eq!(app.defines.get("DEBUG").map(String::as_str), Some("1"));
        assert_eq!(app.header_linkage, Linkage::C);
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_unknown_dependency_and_duplicates() {
        let mut config = WorkspaceConfig::default();
        config
            .projects
            .push(ProjectConfig::new("app", "app").depends_on("core"));
        assert!(matches!(config.validate(), Err(IndexerError::Config(_))));

        config.projects = vec![ProjectConfig::new("a", "a"), ProjectConfig::new("a", "b")];
        assert!(matches!(config.validate(), Err(IndexerError::Config(_))));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        let mut config = WorkspaceConfig::default();
        config.workspace.root = dir.path().to_path_buf();
        config.projects.push(
            ProjectConfig::new("core", "core")
                .include_path("include")
                .define("NDEBUG", "1"),
        );
        config.save(&path).unwrap();

        let loaded = WorkspaceConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.data_dir(), dir.path().join(".cxx-index"));
    }

    #[test]
    fn test_load_or_default_without_file() {
        let dir = TempDir::new().unwrap();
        let config = WorkspaceConfig::load_or_default(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(config.workspace.root, dir.path());
        assert!(config.projects.is_empty());
    }

    #[test]
    fn test_affects_parsing() {
        let base = ProjectConfig::new("app", "app");
        assert!(!base.affects_parsing(&base.clone().depends_on("core")));
        assert!(base.affects_parsing(&base.clone().define("X", "1")));
    }
}
