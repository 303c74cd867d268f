//! Location Registry
//!
//! Maps raw paths and `file://` URIs to canonical [`LocationKey`]s. Files that
//! live under a registered project root become workspace keys (project name +
//! root-relative path); everything else becomes an external absolute key.
//! Keys never contain `.` or `..` segments.

pub mod converter;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{IndexerError, Result};

pub use converter::{LocationConverter, ProjectRelativeConverter, UriRelativeConverter};

const FILE_URI_PREFIX: &str = "file://";

/// Characters escaped in the path of a `file://` URI.
const URI_PATH: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Canonical identity of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LocationKey {
    /// A file inside a project root. `path` is `/`-separated and relative.
    Workspace { project: String, path: String },
    /// A file outside every project root. `path` is absolute.
    External { path: String },
}

impl LocationKey {
    pub fn workspace(project: impl Into<String>, path: impl Into<String>) -> Self {
        LocationKey::Workspace {
            project: project.into(),
            path: path.into(),
        }
    }

    pub fn external(path: impl Into<String>) -> Self {
        LocationKey::External { path: path.into() }
    }

    /// Project owning this location, if it is a workspace location.
    pub fn project(&self) -> Option<&str> {
        match self {
            LocationKey::Workspace { project, .. } => Some(project),
            LocationKey::External { .. } => None,
        }
    }

    /// Last path segment.
    pub fn file_name(&self) -> &str {
        let path = match self {
            LocationKey::Workspace { path, .. } => path,
            LocationKey::External { path } => path,
        };
        path.rsplit('/').next().unwrap_or(path)
    }

    /// True when no segment of the key is `.` or `..`.
    pub fn is_resolved(&self) -> bool {
        let path = match self {
            LocationKey::Workspace { path, .. } => path.as_str(),
            LocationKey::External { path } => path.as_str(),
        };
        path.split('/').all(|seg| seg != ".." && seg != ".")
    }
}

impl fmt::Display for LocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationKey::Workspace { project, path } => write!(f, "/{}/{}", project, path),
            LocationKey::External { path } => match Url::from_file_path(path) {
                Ok(url) => write!(f, "{}", url),
                // Paths of another platform, e.g. `C:/x` on unix.
                Err(()) => write!(
                    f,
                    "{}/{}",
                    FILE_URI_PREFIX,
                    utf8_percent_encode(path.trim_start_matches('/'), URI_PATH)
                ),
            },
        }
    }
}

impl FromStr for LocationKey {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(FILE_URI_PREFIX) {
            let unresolvable = || IndexerError::UnresolvableLocation(s.to_string());
            let url = Url::parse(s).map_err(|_| unresolvable())?;
            if !matches!(url.host_str(), None | Some("") | Some("localhost")) {
                return Err(unresolvable());
            }
            let path = percent_decode_str(url.path())
                .decode_utf8()
                .map_err(|_| unresolvable())?
                .into_owned();
            // `file:///C:/x` carries a leading slash before the drive letter
            let path = match path.as_bytes() {
                [b'/', drive, b':', ..] if drive.is_ascii_alphabetic() => path[1..].to_string(),
                _ => path,
            };
            if path.is_empty() {
                return Err(IndexerError::UnresolvableLocation(s.to_string()));
            }
            return Ok(LocationKey::External { path });
        }
        let trimmed = s
            .strip_prefix('/')
            .ok_or_else(|| IndexerError::UnresolvableLocation(s.to_string()))?;
        match trimmed.split_once('/') {
            Some((project, path)) if !project.is_empty() && !path.is_empty() => {
                Ok(LocationKey::workspace(project, path))
            }
            _ => Err(IndexerError::UnresolvableLocation(s.to_string())),
        }
    }
}

impl From<LocationKey> for String {
    fn from(key: LocationKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for LocationKey {
    type Error = IndexerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Registry of project roots used to normalize file identities.
#[derive(Debug, Clone, Default)]
pub struct LocationRegistry {
    roots: BTreeMap<String, PathBuf>,
}

impl LocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or moves) a project root.
    pub fn register_project(&mut self, project: impl Into<String>, root: impl AsRef<Path>) {
        let root = root.as_ref();
        let root = canonical_or_lexical(root).unwrap_or_else(|| root.to_path_buf());
        self.roots.insert(project.into(), root);
    }

    pub fn unregister_project(&mut self, project: &str) {
        self.roots.remove(project);
    }

    pub fn project_root(&self, project: &str) -> Option<&Path> {
        self.roots.get(project).map(|p| p.as_path())
    }

    /// Normalizes a raw path or `file://` URI into a canonical key.
    pub fn normalize(&self, raw: &str) -> Result<LocationKey> {
        let raw_path = if raw.starts_with(FILE_URI_PREFIX) {
            Url::parse(raw)
                .ok()
                .and_then(|url| url.to_file_path().ok())
                .ok_or_else(|| IndexerError::UnresolvableLocation(raw.to_string()))?
        } else {
            PathBuf::from(raw)
        };
        self.normalize_path(&raw_path)
            .ok_or_else(|| IndexerError::UnresolvableLocation(raw.to_string()))
    }

    /// Normalizes a filesystem path. Returns `None` when the path has no
    /// stable identity.
    pub fn normalize_path(&self, path: &Path) -> Option<LocationKey> {
        if !path.is_absolute() {
            return None;
        }
        let lexical = lexical_normalize(path)?;
        let exists = lexical.exists();
        let resolved = if exists {
            std::fs::canonicalize(&lexical).ok().map(strip_verbatim)?
        } else {
            lexical
        };

        if let Some(key) = self.workspace_key(&resolved) {
            return Some(key);
        }
        if !exists {
            return None;
        }
        Some(LocationKey::External {
            path: path_to_slashes(&resolved),
        })
    }

    /// Maps a key back to a filesystem path.
    pub fn to_path(&self, key: &LocationKey) -> Option<PathBuf> {
        match key {
            LocationKey::Workspace { project, path } => {
                let root = self.roots.get(project)?;
                Some(path.split('/').fold(root.clone(), |acc, seg| acc.join(seg)))
            }
            LocationKey::External { path } => Some(PathBuf::from(path)),
        }
    }

    fn workspace_key(&self, resolved: &Path) -> Option<LocationKey> {
        // Longest root wins so nested projects own their own files.
        self.roots
            .iter()
            .filter_map(|(project, root)| {
                resolved
                    .strip_prefix(root)
                    .ok()
                    .map(|rel| (project, root.components().count(), rel))
            })
            .filter(|(_, _, rel)| rel.components().next().is_some())
            .max_by_key(|(_, depth, _)| *depth)
            .map(|(project, _, rel)| LocationKey::Workspace {
                project: project.clone(),
                path: path_to_slashes(rel),
            })
    }
}

/// Resolves `.` and `..` without touching the filesystem. Fails when `..`
/// climbs above the root.
pub fn lexical_normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(seg) => {
                out.push(seg);
                depth += 1;
            }
        }
    }
    Some(out)
}

fn canonical_or_lexical(path: &Path) -> Option<PathBuf> {
    let lexical = if path.is_absolute() {
        lexical_normalize(path)?
    } else {
        lexical_normalize(&std::env::current_dir().ok()?.join(path))?
    };
    Some(
        std::fs::canonicalize(&lexical)
            .map(strip_verbatim)
            .unwrap_or(lexical),
    )
}

/// Removes the `\\?\` prefix Windows adds to canonicalized paths.
fn strip_verbatim(path: PathBuf) -> PathBuf {
    let text = path.to_string_lossy();
    match text.strip_prefix(r"\\?\") {
        Some(rest) => PathBuf::from(rest),
        None => path,
    }
}

fn path_to_slashes(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        match component {
            Component::RootDir => out.push('/'),
            Component::Prefix(prefix) => out.push_str(&prefix.as_os_str().to_string_lossy()),
            Component::Normal(seg) => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&seg.to_string_lossy());
            }
            Component::CurDir | Component::ParentDir => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn registry_with(dir: &TempDir) -> LocationRegistry {
        let mut registry = LocationRegistry::new();
        registry.register_project("app", dir.path().join("app"));
        registry.register_project("lib", dir.path().join("app").join("lib"));
        registry
    }

    fn create(dir: &Path, rel: &str) -> PathBuf {
        let path = dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn test_workspace_key_strips_parent_segments() {
        let dir = TempDir::new().unwrap();
        create(dir.path(), "app/src/main.cpp");
        let registry = registry_with(&dir);

        let raw = dir.path().join("app/include/../src/./main.cpp");
        let key = registry.normalize(&raw.to_string_lossy()).unwrap();

        assert_eq!(key, LocationKey::workspace("app", "src/main.cpp"));
        assert!(key.is_resolved());
    }

    #[test]
    fn test_nested_project_owns_its_files() {
        let dir = TempDir::new().unwrap();
        let path = create(dir.path(), "app/lib/util.h");
        let registry = registry_with(&dir);

        let key = registry.normalize(&path.to_string_lossy()).unwrap();
        assert_eq!(key, LocationKey::workspace("lib", "util.h"));
    }

    #[test]
    fn test_missing_external_file_is_unresolvable() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir);

        let raw = dir.path().join("elsewhere/missing.h");
        let err = registry.normalize(&raw.to_string_lossy()).unwrap_err();
        assert!(matches!(err, IndexerError::UnresolvableLocation(_)));
    }

    #[test]
    fn test_missing_workspace_file_keeps_identity() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("app")).unwrap();
        let registry = registry_with(&dir);

        let raw = dir.path().join("app/deleted.cpp");
        let key = registry.normalize(&raw.to_string_lossy()).unwrap();
        assert_eq!(key, LocationKey::workspace("app", "deleted.cpp"));
    }

    #[test]
    fn test_relative_input_is_unresolvable() {
        let registry = LocationRegistry::new();
        assert!(registry.normalize("src/main.cpp").is_err());
        assert!(registry.normalize("../main.cpp").is_err());
    }

    #[test]
    fn test_external_uri_with_escapes() {
        let dir = TempDir::new().unwrap();
        let path = create(dir.path(), "sys include/stdio.h");
        let registry = LocationRegistry::new();

        let canonical = fs::canonicalize(&path).unwrap();
        let uri = format!(
            "file://{}",
            path_to_slashes(&canonical).replace(' ', "%20")
        );
        let key = registry.normalize(&uri).unwrap();
        match &key {
            LocationKey::External { path } => assert!(path.ends_with("sys include/stdio.h")),
            other => panic!("expected external key, got {:?}", other),
        }
        assert!(key.is_resolved());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_alias_collapses() {
        let dir = TempDir::new().unwrap();
        let real = create(dir.path(), "app/real/a.h");
        std::os::unix::fs::symlink(real.parent().unwrap(), dir.path().join("app/alias")).unwrap();
        let registry = registry_with(&dir);

        let via_alias = registry
            .normalize(&dir.path().join("app/alias/a.h").to_string_lossy())
            .unwrap();
        let direct = registry.normalize(&real.to_string_lossy()).unwrap();
        assert_eq!(via_alias, direct);
    }

    #[test]
    fn test_key_text_form_round_trips() {
        let keys = [
            LocationKey::workspace("app", "src/main.cpp"),
            LocationKey::external("/usr/include/stdio.h"),
        ];
        for key in keys {
            let text = key.to_string();
            assert_eq!(text.parse::<LocationKey>().unwrap(), key);
        }
        assert_eq!(
            LocationKey::workspace("app", "a/b.h").to_string(),
            "/app/a/b.h"
        );
        assert_eq!(
            LocationKey::external("/usr/include/x.h").to_string(),
            "file:///usr/include/x.h"
        );
    }

    #[test]
    fn test_escaped_key_text_form() {
        let key = LocationKey::external("/opt/my sdk/a#b.h");
        let text = key.to_string();
        assert_eq!(text, "file:///opt/my%20sdk/a%23b.h");
        assert_eq!(text.parse::<LocationKey>().unwrap(), key);

        let drive: LocationKey = "file:///C:/sdk/x.h".parse().unwrap();
        assert_eq!(drive, LocationKey::external("C:/sdk/x.h"));
        assert!("file://remote-host/x.h".parse::<LocationKey>().is_err());
    }

    #[test]
    fn test_to_path_maps_back() {
        let dir = TempDir::new().unwrap();
        let path = create(dir.path(), "app/src/x.cpp");
        let registry = registry_with(&dir);

        let key = registry.normalize(&path.to_string_lossy()).unwrap();
        let back = registry.to_path(&key).unwrap();
        assert_eq!(fs::canonicalize(back).unwrap(), fs::canonicalize(path).unwrap());
    }

    #[test]
    fn test_lexical_normalize_rejects_escape() {
        assert!(lexical_normalize(Path::new("/../etc")).is_none());
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d")).unwrap(),
            PathBuf::from("/a/c/d")
        );
    }
}
