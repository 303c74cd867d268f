use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use ignore::WalkBuilder;

use crate::error::{IndexerError, Result};
use crate::indexer::parse::is_source_file;

/// Finds the C/C++ sources and headers of a project.
#[derive(Debug, Clone, Default)]
pub struct FileWalker {
    excludes: Vec<Pattern>,
}

impl FileWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude patterns are matched against the path relative to the walked
    /// root, e.g. `third_party/**`.
    pub fn with_excludes<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let excludes = patterns
            .iter()
            .map(|p| {
                Pattern::new(p.as_ref()).map_err(|e| {
                    IndexerError::Config(format!("invalid exclude pattern {}: {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { excludes })
    }

    pub fn walk(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        let walker = WalkBuilder::new(root)
            .hidden(true)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .ignore(true)
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if path.is_file() && self.is_supported(path) && !self.is_excluded(root, path) {
                files.push(path.to_path_buf());
            }
        }
        files.sort();

        Ok(files)
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        is_source_file(path)
    }

    pub fn is_excluded(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.excludes
            .iter()
            .any(|p| p.matches_path_with(relative, options))
    }
}
