//! Converters between internal location keys and portable forms used when a
//! fragment is shared across machines.

use std::path::{Path, PathBuf};

use url::Url;

use super::{lexical_normalize, path_to_slashes, LocationKey};

/// Maps location keys to and from a portable text form.
///
/// For every key `k` a converter accepts, `to_internal(&from_internal(k)?)`
/// yields `k` again.
pub trait LocationConverter: Send + Sync {
    /// Portable form of `key`, or `None` if this converter cannot express it.
    fn from_internal(&self, key: &LocationKey) -> Option<String>;

    /// Key for a portable form produced by [`LocationConverter::from_internal`].
    fn to_internal(&self, portable: &str) -> Option<LocationKey>;
}

/// Expresses the files of one project relative to the project root.
#[derive(Debug, Clone)]
pub struct ProjectRelativeConverter {
    project: String,
}

impl ProjectRelativeConverter {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    /// Converter that re-homes relative paths into another project, used when a
    /// snapshot is imported under a different project name.
    pub fn rehome(&self, project: impl Into<String>) -> Self {
        Self::new(project)
    }
}

impl LocationConverter for ProjectRelativeConverter {
    fn from_internal(&self, key: &LocationKey) -> Option<String> {
        match key {
            LocationKey::Workspace { project, path } if *project == self.project => {
                Some(path.clone())
            }
            _ => None,
        }
    }

    fn to_internal(&self, portable: &str) -> Option<LocationKey> {
        let normalized = normalize_relative(portable)?;
        Some(LocationKey::workspace(self.project.clone(), normalized))
    }
}

/// Expresses external files relative to a base directory URI.
#[derive(Debug, Clone)]
pub struct UriRelativeConverter {
    base: String,
}

impl UriRelativeConverter {
    /// `base` is an absolute directory path or `file://` URI.
    pub fn new(base: impl AsRef<str>) -> Option<Self> {
        let base = base.as_ref();
        let path = if base.starts_with("file:") {
            Url::parse(base).ok()?.to_file_path().ok()?
        } else {
            PathBuf::from(base)
        };
        if !path.is_absolute() {
            return None;
        }
        let normalized = lexical_normalize(&path)?;
        Some(Self {
            base: path_to_slashes(&normalized).trim_end_matches('/').to_string(),
        })
    }

    pub fn base(&self) -> &Path {
        Path::new(&self.base)
    }
}

impl LocationConverter for UriRelativeConverter {
    fn from_internal(&self, key: &LocationKey) -> Option<String> {
        match key {
            LocationKey::External { path } => {
                let rest = path.strip_prefix(&self.base)?;
                let rest = rest.strip_prefix('/')?;
                if rest.is_empty() {
                    None
                } else {
                    Some(rest.to_string())
                }
            }
            LocationKey::Workspace { .. } => None,
        }
    }

    fn to_internal(&self, portable: &str) -> Option<LocationKey> {
        let normalized = normalize_relative(portable)?;
        Some(LocationKey::external(format!("{}/{}", self.base, normalized)))
    }
}

/// Normalizes a relative `/`-separated path; rejects absolute input and `..`
/// that would leave the base.
fn normalize_relative(raw: &str) -> Option<String> {
    let raw = raw.replace('\\', "/");
    if raw.starts_with('/') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}
