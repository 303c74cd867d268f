//! Fragment snapshots.
//!
//! A snapshot is two lines of JSON: a small header naming the format and
//! version, then the body with every file, binding and name record. Ids are
//! preserved, so importing reproduces the exported fragment exactly. The
//! header is checked before the body is read.

use std::collections::{BTreeSet, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IndexerError, Result};
use crate::index::{
    BindingRecord, FileId, FileRecord, FileState, FragmentData, FragmentStore, IncludeRecord,
    Linkage, MacroRecord, NameId, NameRecord, SignificantMacros, TemplateLink,
};
use crate::location::{LocationConverter, LocationKey};

pub const SNAPSHOT_FORMAT: &str = "cxx-indexer.fragment";
pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub format: String,
    pub version: String,
    pub snapshot_id: String,
    pub project: String,
    pub created_at_ms: i64,
    /// Locations were written through a converter.
    pub portable: bool,
}

impl SnapshotHeader {
    fn check(&self) -> Result<()> {
        let major = self.version.split('.').next().unwrap_or("");
        let supported = SNAPSHOT_VERSION.split('.').next().unwrap_or("");
        if self.format != SNAPSHOT_FORMAT || major != supported {
            return Err(IndexerError::UnsupportedSnapshotFormat {
                format: self.format.clone(),
                version: self.version.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct ExportOptions {
    pub converter: Option<Arc<dyn LocationConverter>>,
    /// Drop files the converter cannot express instead of failing.
    pub skip_unconvertible: bool,
}

impl ExportOptions {
    pub fn portable(converter: Arc<dyn LocationConverter>) -> Self {
        Self {
            converter: Some(converter),
            skip_unconvertible: true,
        }
    }
}

#[derive(Clone, Default)]
pub struct ImportOptions {
    /// Required for portable snapshots.
    pub converter: Option<Arc<dyn LocationConverter>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum StoredLocation {
    Key(LocationKey),
    Portable(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct IncludeEntry {
    target: Option<StoredLocation>,
    target_macros: SignificantMacros,
    directive: String,
    offset: u32,
    name_offset: u32,
    name_length: u32,
    system: bool,
    active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    id: FileId,
    location: StoredLocation,
    linkage: Linkage,
    fingerprint: u64,
    timestamp: i64,
    significant_macros: SignificantMacros,
    includes: Vec<IncludeEntry>,
    macros: Vec<MacroRecord>,
    names: Vec<NameId>,
    state: FileState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotBody {
    files: Vec<FileEntry>,
    bindings: Vec<BindingRecord>,
    names: Vec<NameRecord>,
}

/// Writes a snapshot of `store`. The read lock is held only while records
/// are copied.
pub fn export<W: Write>(
    store: &FragmentStore,
    destination: W,
    options: &ExportOptions,
) -> Result<SnapshotHeader> {
    let body = {
        let data = store.acquire_read()?;
        collect_body(&data, options)?
    };
    let header = SnapshotHeader {
        format: SNAPSHOT_FORMAT.to_string(),
        version: SNAPSHOT_VERSION.to_string(),
        snapshot_id: Uuid::new_v4().to_string(),
        project: store.project().to_string(),
        created_at_ms: now_ms(),
        portable: options.converter.is_some(),
    };

    let mut out = BufWriter::new(destination);
    serde_json::to_writer(&mut out, &header)?;
    out.write_all(b"\n")?;
    serde_json::to_writer(&mut out, &body)?;
    out.write_all(b"\n")?;
    out.flush()?;

    tracing::info!(
        "Exported {} files, {} bindings, {} names of {}",
        body.files.len(),
        body.bindings.len(),
        body.names.len(),
        header.project
    );
    Ok(header)
}

pub fn export_to_path(
    store: &FragmentStore,
    path: &Path,
    options: &ExportOptions,
) -> Result<SnapshotHeader> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    export(store, File::create(path)?, options)
}

/// Reads only the header line.
pub fn read_header<R: BufRead>(source: &mut R) -> Result<SnapshotHeader> {
    let mut line = String::new();
    source.read_line(&mut line)?;
    let header: SnapshotHeader =
        serde_json::from_str(line.trim_end()).map_err(|_| IndexerError::UnsupportedSnapshotFormat {
            format: "unknown".to_string(),
            version: String::new(),
        })?;
    header.check()?;
    Ok(header)
}

/// Replaces the content of `store` with a snapshot. The store is untouched
/// when the snapshot is rejected.
pub fn import<R: Read>(
    store: &FragmentStore,
    source: R,
    options: &ImportOptions,
) -> Result<SnapshotHeader> {
    let mut reader = BufReader::new(source);
    let header = read_header(&mut reader)?;
    if header.portable && options.converter.is_none() {
        return Err(IndexerError::Index(
            "portable snapshot needs a location converter".to_string(),
        ));
    }

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let body: SnapshotBody = serde_json::from_str(line.trim_end())?;
    let data = restore_body(body, options)?;
    let stats = data.stats();
    store.replace_all(data)?;

    tracing::info!(
        "Imported snapshot {} of {} into {}: {} files, {} bindings, {} names",
        header.snapshot_id,
        header.project,
        store.project(),
        stats.files,
        stats.bindings,
        stats.names
    );
    Ok(header)
}

pub fn import_from_path(
    store: &FragmentStore,
    path: &Path,
    options: &ImportOptions,
) -> Result<SnapshotHeader> {
    import(store, File::open(path)?, options)
}

fn collect_body(data: &FragmentData, options: &ExportOptions) -> Result<SnapshotBody> {
    let store_location = |key: &LocationKey| -> Option<StoredLocation> {
        match &options.converter {
            Some(converter) => converter.from_internal(key).map(StoredLocation::Portable),
            None => Some(StoredLocation::Key(key.clone())),
        }
    };

    let mut body = SnapshotBody::default();
    let mut skipped: HashSet<FileId> = HashSet::new();
    for file in data.files() {
        let Some(location) = store_location(&file.location) else {
            if options.skip_unconvertible {
                tracing::debug!("Skipping unconvertible location {}", file.location);
                skipped.insert(file.id);
                continue;
            }
            return Err(IndexerError::UnresolvableLocation(file.location.to_string()));
        };
        let includes = file
            .includes
            .iter()
            .map(|inc| IncludeEntry {
                // Targets outside the converter's reach keep their key.
                target: inc.target.as_ref().map(|t| {
                    store_location(t).unwrap_or_else(|| StoredLocation::Key(t.clone()))
                }),
                target_macros: inc.target_macros.clone(),
                directive: inc.directive.clone(),
                offset: inc.offset,
                name_offset: inc.name_offset,
                name_length: inc.name_length,
                system: inc.system,
                active: inc.active,
            })
            .collect();
        body.files.push(FileEntry {
            id: file.id,
            location,
            linkage: file.linkage,
            fingerprint: file.fingerprint,
            timestamp: file.timestamp,
            significant_macros: file.significant_macros.clone(),
            includes,
            macros: file.macros.clone(),
            names: file.names.clone(),
            state: file.state.clone(),
        });
    }

    let mut dropped: BTreeSet<NameId> = BTreeSet::new();
    for name in data.names() {
        if skipped.contains(&name.file) {
            dropped.insert(name.id);
        } else {
            body.names.push(name.clone());
        }
    }
    for binding in data.bindings() {
        let mut binding = binding.clone();
        binding.names.retain(|id| !dropped.contains(id));
        if binding.names.is_empty()
            && !dropped.is_empty()
            && matches!(binding.template, TemplateLink::None)
        {
            continue;
        }
        body.bindings.push(binding);
    }
    Ok(body)
}

fn restore_body(body: SnapshotBody, options: &ImportOptions) -> Result<FragmentData> {
    let restore = |stored: StoredLocation| -> Result<LocationKey> {
        match stored {
            StoredLocation::Key(key) => Ok(key),
            StoredLocation::Portable(text) => options
                .converter
                .as_ref()
                .and_then(|c| c.to_internal(&text))
                .ok_or_else(|| IndexerError::UnresolvableLocation(text.clone())),
        }
    };

    let files = body
        .files
        .into_iter()
        .map(|entry| {
            let includes = entry
                .includes
                .into_iter()
                .map(|inc| {
                    Ok(IncludeRecord {
                        includer: entry.id,
                        target: inc.target.map(&restore).transpose()?,
                        target_macros: inc.target_macros,
                        directive: inc.directive,
                        offset: inc.offset,
                        name_offset: inc.name_offset,
                        name_length: inc.name_length,
                        system: inc.system,
                        active: inc.active,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(FileRecord {
                id: entry.id,
                location: restore(entry.location)?,
                linkage: entry.linkage,
                fingerprint: entry.fingerprint,
                timestamp: entry.timestamp,
                significant_macros: entry.significant_macros,
                includes,
                macros: entry.macros,
                names: entry.names,
                state: entry.state,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    FragmentData::from_records(files, body.bindings, body.names)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
