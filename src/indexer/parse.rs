//! Boundary between the C/C++ front end and the index.
//!
//! A parser turns one translation unit into a list of [`ParsedFile`]s: the
//! unit itself plus every header variant it pulled in. Each carries the facts
//! the index stores; nothing here knows about fragments or locks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{IndexerError, Result};
use crate::index::{FileId, FileUpdate, IncludeRecord, MacroRecord, NameUpdate};
pub use crate::index::{Linkage, NameRole, SignificantMacros, SymbolRef};
use crate::indexer::access::{access_flags, AccessStep};
use crate::location::{LocationKey, LocationRegistry};

/// How a callee receives an argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ParamPassing {
    Value,
    Reference {
        is_const: bool,
    },
    /// One constness flag per pointer level, outermost pointee first:
    /// `const int**` is `[false, true]`.
    Pointer {
        levels: Vec<bool>,
    },
    /// The callee is unknown or has fewer parameters than arguments.
    Unknown,
}

/// Syntactic context of an occurrence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameSyntax {
    /// Written with a scope qualifier (`A::f`, `::g`).
    pub qualified: bool,
    /// Callee position of a call expression.
    pub call: bool,
    /// Expression wrappers from the name outwards.
    pub access: Vec<AccessStep>,
}

impl NameSyntax {
    pub fn plain() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedName {
    pub target: SymbolRef,
    pub offset: u32,
    pub length: u32,
    pub role: NameRole,
    /// Body byte range for function definitions.
    pub body_extent: Option<(u32, u32)>,
    pub syntax: NameSyntax,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInclude {
    /// Raw directive text, e.g. `#include "a.h"`.
    pub directive: String,
    /// Resolved file, `None` when no candidate exists.
    pub target_path: Option<PathBuf>,
    /// Macro context the target variant was parsed under.
    pub target_macros: SignificantMacros,
    pub offset: u32,
    pub name_offset: u32,
    pub name_length: u32,
    pub system: bool,
    /// False inside an inactive conditional branch.
    pub active: bool,
}

/// Parse result for one file variant.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub path: PathBuf,
    /// Filled in when the front end already knows the canonical key.
    pub location: Option<LocationKey>,
    pub linkage: Linkage,
    pub significant_macros: SignificantMacros,
    pub fingerprint: u64,
    pub timestamp: i64,
    pub includes: Vec<ParsedInclude>,
    pub macros: Vec<MacroRecord>,
    pub names: Vec<ParsedName>,
}

impl ParsedFile {
    /// Converts the parse result into a fragment update. Include edges whose
    /// target has no stable location are kept as unresolved.
    pub fn into_update(self, registry: &LocationRegistry) -> Result<FileUpdate> {
        let location = match self.location {
            Some(key) => key,
            None => registry.normalize_path(&self.path).ok_or_else(|| {
                IndexerError::UnresolvableLocation(self.path.display().to_string())
            })?,
        };
        let linkage = self.linkage;
        let includes = self
            .includes
            .into_iter()
            .map(|inc| {
                let target = inc
                    .target_path
                    .as_deref()
                    .and_then(|p| registry.normalize_path(p));
                if inc.target_path.is_some() && target.is_none() {
                    tracing::debug!("Unresolvable include target in {}: {}", location, inc.directive);
                }
                IncludeRecord {
                    includer: FileId(0),
                    target,
                    target_macros: inc.target_macros,
                    directive: inc.directive,
                    offset: inc.offset,
                    name_offset: inc.name_offset,
                    name_length: inc.name_length,
                    system: inc.system,
                    active: inc.active,
                }
            })
            .collect();
        let names = self
            .names
            .into_iter()
            .map(|n| {
                let (is_read, is_write) = access_flags(n.role, &n.syntax.access, linkage);
                NameUpdate {
                    symbol: n.target,
                    offset: n.offset,
                    length: n.length,
                    role: n.role,
                    body_extent: n.body_extent,
                    is_read,
                    is_write,
                    qualified: n.syntax.qualified,
                }
            })
            .collect();
        Ok(FileUpdate {
            location,
            linkage,
            significant_macros: self.significant_macros,
            fingerprint: self.fingerprint,
            timestamp: self.timestamp,
            includes,
            macros: self.macros,
            names,
        })
    }
}

/// Build context for one translation unit.
#[derive(Debug, Clone, Default)]
pub struct ParseRequest {
    pub path: PathBuf,
    /// Directories searched for `#include` targets after the includer's own.
    pub include_paths: Vec<PathBuf>,
    /// Command-line macros (`-D`).
    pub defines: BTreeMap<String, String>,
    /// Linkage for headers and unknown extensions.
    pub header_linkage: Linkage,
    /// Source text overriding the file content.
    pub content: Option<String>,
}

impl ParseRequest {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn with_include_paths(mut self, include_paths: Vec<PathBuf>) -> Self {
        self.include_paths = include_paths;
        self
    }

    pub fn with_defines(mut self, defines: BTreeMap<String, String>) -> Self {
        self.defines = defines;
        self
    }

    pub fn with_header_linkage(mut self, linkage: Linkage) -> Self {
        self.header_linkage = linkage;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Produces parse results for translation units.
pub trait SourceParser: Send + Sync {
    /// Parses `request.path` and every header it includes. The first entry is
    /// the translation unit itself.
    fn parse(&self, request: &ParseRequest) -> Result<Vec<ParsedFile>>;
}

/// Fingerprint stored with every file variant.
pub fn content_fingerprint(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

/// Modification time in milliseconds since the epoch, 0 when unknown.
pub fn modified_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Linkage implied by a file extension.
pub fn linkage_for(path: &Path, header_linkage: Linkage) -> Linkage {
    match path.extension().and_then(|e| e.to_str()) {
        Some("c") => Linkage::C,
        Some("cc" | "cpp" | "cxx" | "c++" | "C" | "hpp" | "hh" | "hxx" | "ipp" | "tpp") => {
            Linkage::Cpp
        }
        _ => header_linkage,
    }
}

/// True for extensions that name a translation unit rather than a header.
pub fn is_translation_unit(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("c" | "cc" | "cpp" | "cxx" | "c++" | "C")
    )
}

/// True for any C/C++ source or header extension.
pub fn is_source_file(path: &Path) -> bool {
    is_translation_unit(path)
        || matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("h" | "hh" | "hpp" | "hxx" | "h++" | "ipp" | "tpp" | "inl")
        )
}
