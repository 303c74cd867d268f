//! In-memory content of one fragment: record arenas, lookup indexes, the
//! query surface and delta application.
//!
//! Queries borrow records for as long as the caller holds the fragment's read
//! lock. Mutation only happens through [`FragmentData::apply`], which runs
//! under the write lock at commit time.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use regex::Regex;

use crate::error::{IndexerError, Result};
use crate::index::arena::Arena;
use crate::index::filter::Filter;
use crate::index::{
    BindingId, BindingKey, BindingRecord, FileId, FileRecord, FileState, IncludeRecord,
    IndexStats, Linkage, MacroRecord, NameId, NameMask, NameRecord, NameRole, SignificantMacros,
    SymbolRef, TemplateLink,
};
use crate::location::LocationKey;

/// Qualified-name pattern: one anchored regex per name component.
#[derive(Debug, Clone)]
pub struct NamePattern {
    components: Vec<Regex>,
}

impl NamePattern {
    /// Each component must match a whole name component.
    pub fn new<S: AsRef<str>>(components: &[S]) -> Result<Self> {
        let components = components
            .iter()
            .map(|c| {
                Regex::new(&format!("^(?:{})$", c.as_ref()))
                    .map_err(|e| IndexerError::Index(format!("invalid name pattern: {}", e)))
            })
            .collect::<Result<Vec<_>>>()?;
        if components.is_empty() {
            return Err(IndexerError::Index("empty name pattern".to_string()));
        }
        Ok(Self { components })
    }

    /// Splits `a::b.*` into per-component patterns.
    pub fn parse(pattern: &str) -> Result<Self> {
        let parts: Vec<&str> = pattern.trim_start_matches("::").split("::").collect();
        Self::new(&parts)
    }

    /// `anchored` requires the pattern to start at global scope; otherwise it
    /// matches the trailing components of the name.
    pub fn matches(&self, qualified_name: &[String], anchored: bool) -> bool {
        let n = self.components.len();
        if qualified_name.len() < n || (anchored && qualified_name.len() != n) {
            return false;
        }
        let tail = &qualified_name[qualified_name.len() - n..];
        self.components
            .iter()
            .zip(tail)
            .all(|(re, comp)| re.is_match(comp))
    }
}

/// Reference to a binding as seen by one file update.
#[derive(Debug, Clone, PartialEq)]
pub struct NameUpdate {
    pub symbol: SymbolRef,
    pub offset: u32,
    pub length: u32,
    pub role: NameRole,
    /// Byte range of the body when this name defines a function.
    pub body_extent: Option<(u32, u32)>,
    pub is_read: bool,
    pub is_write: bool,
    pub qualified: bool,
}

/// New content for one file variant.
#[derive(Debug, Clone, PartialEq)]
pub struct FileUpdate {
    pub location: LocationKey,
    pub linkage: Linkage,
    pub significant_macros: SignificantMacros,
    pub fingerprint: u64,
    pub timestamp: i64,
    /// `includer` is assigned when the update is applied.
    pub includes: Vec<IncludeRecord>,
    pub macros: Vec<MacroRecord>,
    pub names: Vec<NameUpdate>,
}

/// Operation staged in a write transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum StagedOp {
    ReplaceFile(Box<FileUpdate>),
    /// Removes every variant of a location.
    RemoveLocation(LocationKey),
    RemoveVariant {
        location: LocationKey,
        linkage: Linkage,
        significant_macros: SignificantMacros,
    },
    MarkFailed {
        location: LocationKey,
        linkage: Linkage,
        reason: String,
    },
    Clear,
}

impl StagedOp {
    fn validate(&self) -> Result<()> {
        let check = |key: &LocationKey| {
            if key.is_resolved() {
                Ok(())
            } else {
                Err(IndexerError::UnresolvableLocation(key.to_string()))
            }
        };
        match self {
            StagedOp::ReplaceFile(update) => {
                check(&update.location)?;
                for include in &update.includes {
                    if let Some(target) = &include.target {
                        check(target)?;
                    }
                }
                for name in &update.names {
                    if name.symbol.qualified_name.is_empty() {
                        return Err(IndexerError::Index(format!(
                            "unnamed binding at {}:{}",
                            update.location, name.offset
                        )));
                    }
                }
                Ok(())
            }
            StagedOp::RemoveLocation(key)
            | StagedOp::RemoveVariant { location: key, .. }
            | StagedOp::MarkFailed { location: key, .. } => check(key),
            StagedOp::Clear => Ok(()),
        }
    }
}

/// Locations touched by one applied transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub written: BTreeSet<LocationKey>,
    pub removed: BTreeSet<LocationKey>,
    pub cleared: bool,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty() && !self.cleared
    }
}

/// Records changed since the last flush to disk.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    pub cleared: bool,
    pub files: BTreeSet<FileId>,
    pub bindings: BTreeSet<BindingId>,
    pub names: BTreeSet<NameId>,
}

impl DirtySet {
    pub fn is_empty(&self) -> bool {
        !self.cleared && self.files.is_empty() && self.bindings.is_empty() && self.names.is_empty()
    }
}

type OccurrenceKey = (u32, u32, NameRole, BindingId);

#[derive(Debug, Clone, Default)]
pub struct FragmentData {
    files: Arena<FileId, FileRecord>,
    bindings: Arena<BindingId, BindingRecord>,
    names: Arena<NameId, NameRecord>,
    by_location: HashMap<LocationKey, Vec<FileId>>,
    by_key: HashMap<BindingKey, BindingId>,
    /// Enclosing scope (qualified name minus last component) to bindings.
    by_scope: HashMap<Vec<String>, BTreeSet<BindingId>>,
    /// Lowercased last component to bindings.
    by_lower_name: BTreeMap<String, BTreeSet<BindingId>>,
    dirty: DirtySet,
}

impl FragmentData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a fragment from persisted records and checks its integrity.
    pub fn from_records(
        files: Vec<FileRecord>,
        bindings: Vec<BindingRecord>,
        names: Vec<NameRecord>,
    ) -> Result<Self> {
        let mut data = FragmentData {
            files: Arena::from_records(files.into_iter().map(|f| (f.id, f))),
            bindings: Arena::from_records(bindings.into_iter().map(|b| (b.id, b))),
            names: Arena::from_records(names.into_iter().map(|n| (n.id, n))),
            ..Default::default()
        };
        let file_index: Vec<(LocationKey, FileId)> = data
            .files
            .values()
            .map(|f| (f.location.clone(), f.id))
            .collect();
        for (location, id) in file_index {
            data.by_location.entry(location).or_default().push(id);
        }
        let binding_index: Vec<(BindingKey, BindingId, Vec<String>)> = data
            .bindings
            .values()
            .map(|b| (b.key(), b.id, b.qualified_name.clone()))
            .collect();
        for (key, id, qualified_name) in binding_index {
            if data.by_key.insert(key.clone(), id).is_some() {
                return Err(IndexerError::CorruptFragment(format!(
                    "duplicate binding {}",
                    key
                )));
            }
            data.index_binding_name(id, &qualified_name);
        }
        data.check_integrity()?;
        Ok(data)
    }

    // ------------------------------------------------------------------
    // Record access
    // ------------------------------------------------------------------

    pub fn file(&self, id: FileId) -> Option<&FileRecord> {
        self.files.get(id)
    }

    pub fn binding(&self, id: BindingId) -> Option<&BindingRecord> {
        self.bindings.get(id)
    }

    pub fn name(&self, id: NameId) -> Option<&NameRecord> {
        self.names.get(id)
    }

    pub fn binding_by_key(&self, key: &BindingKey) -> Option<&BindingRecord> {
        self.by_key.get(key).and_then(|id| self.bindings.get(*id))
    }

    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn bindings(&self) -> impl Iterator<Item = &BindingRecord> {
        self.bindings.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &NameRecord> {
        self.names.values()
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            files: self.files.len(),
            bindings: self.bindings.len(),
            names: self.names.len(),
            failed_files: self.files.values().filter(|f| f.is_failed()).count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.bindings.is_empty()
    }

    // ------------------------------------------------------------------
    // Binding queries
    // ------------------------------------------------------------------

    pub fn find_bindings(
        &self,
        pattern: &NamePattern,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<&BindingRecord> {
        self.collect_bindings(
            self.bindings
                .values()
                .filter(|b| pattern.matches(&b.qualified_name, file_scope_only)),
            filter,
        )
    }

    /// Bindings whose last name component equals `name`.
    pub fn find_bindings_by_name(
        &self,
        name: &str,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<&BindingRecord> {
        let candidates = self
            .by_lower_name
            .get(&name.to_lowercase())
            .into_iter()
            .flatten()
            .filter_map(|id| self.bindings.get(*id))
            .filter(|b| b.name() == name && (!file_scope_only || b.is_file_scope()));
        self.collect_bindings(candidates, filter)
    }

    /// Bindings with exactly this qualified name, one per kind and linkage.
    pub fn find_bindings_by_exact_name<S: AsRef<str>>(
        &self,
        qualified_name: &[S],
        filter: &Filter,
    ) -> Vec<&BindingRecord> {
        let Some((last, scope)) = qualified_name.split_last() else {
            return Vec::new();
        };
        let scope: Vec<String> = scope.iter().map(|s| s.as_ref().to_string()).collect();
        let candidates = self
            .by_scope
            .get(&scope)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bindings.get(*id))
            .filter(|b| b.name() == last.as_ref());
        self.collect_bindings(candidates, filter)
    }

    /// Case-insensitive prefix match on the last name component.
    pub fn find_bindings_by_prefix(
        &self,
        prefix: &str,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<&BindingRecord> {
        let lower = prefix.to_lowercase();
        let candidates = self
            .by_lower_name
            .range(lower.clone()..)
            .take_while(|(name, _)| name.starts_with(&lower))
            .flat_map(|(_, ids)| ids.iter())
            .filter_map(|id| self.bindings.get(*id))
            .filter(|b| !file_scope_only || b.is_file_scope());
        self.collect_bindings(candidates, filter)
    }

    /// Bindings nested directly inside `binding`.
    pub fn members(&self, binding: BindingId) -> Vec<&BindingRecord> {
        let Some(owner) = self.bindings.get(binding) else {
            return Vec::new();
        };
        self.by_scope
            .get(&owner.qualified_name)
            .into_iter()
            .flatten()
            .filter_map(|id| self.bindings.get(*id))
            .collect()
    }

    fn collect_bindings<'a>(
        &'a self,
        candidates: impl Iterator<Item = &'a BindingRecord>,
        filter: &Filter,
    ) -> Vec<&'a BindingRecord> {
        let mut out: Vec<&BindingRecord> = candidates.filter(|b| filter.accepts(self, b)).collect();
        out.sort_by_key(|b| b.id);
        out
    }

    // ------------------------------------------------------------------
    // File queries
    // ------------------------------------------------------------------

    pub fn get_file(
        &self,
        linkage: Linkage,
        location: &LocationKey,
        significant_macros: &SignificantMacros,
    ) -> Option<&FileRecord> {
        self.find_variant(location, significant_macros, linkage)
            .and_then(|id| self.files.get(id))
    }

    /// All variants of a location.
    pub fn get_files(&self, location: &LocationKey) -> Vec<&FileRecord> {
        self.by_location
            .get(location)
            .into_iter()
            .flatten()
            .filter_map(|id| self.files.get(*id))
            .collect()
    }

    pub fn get_all_files(&self) -> Vec<&FileRecord> {
        self.files.values().collect()
    }

    pub fn locations(&self) -> impl Iterator<Item = &LocationKey> {
        self.by_location.keys()
    }

    /// Files with an include directive resolving to `location`.
    pub fn includers_of(&self, location: &LocationKey) -> Vec<&FileRecord> {
        self.files
            .values()
            .filter(|f| {
                f.includes
                    .iter()
                    .any(|inc| inc.target.as_ref() == Some(location))
            })
            .collect()
    }

    fn find_variant(
        &self,
        location: &LocationKey,
        significant_macros: &SignificantMacros,
        linkage: Linkage,
    ) -> Option<FileId> {
        self.by_location.get(location)?.iter().copied().find(|id| {
            self.files
                .get(*id)
                .map(|f| f.linkage == linkage && f.significant_macros == *significant_macros)
                .unwrap_or(false)
        })
    }

    // ------------------------------------------------------------------
    // Name queries
    // ------------------------------------------------------------------

    pub fn find_names(&self, binding: BindingId, mask: NameMask) -> Vec<&NameRecord> {
        let Some(record) = self.bindings.get(binding) else {
            return Vec::new();
        };
        let mut out: Vec<&NameRecord> = record
            .names
            .iter()
            .filter_map(|id| self.names.get(*id))
            .filter(|n| mask.accepts(n.role))
            .collect();
        out.sort_by_key(|n| (n.file, n.offset));
        out
    }

    /// Names of one file variant ordered by offset.
    pub fn names_in_file(&self, file: FileId) -> Vec<&NameRecord> {
        self.files
            .get(file)
            .map(|f| f.names.iter().filter_map(|id| self.names.get(*id)).collect())
            .unwrap_or_default()
    }

    /// Narrowest name covering `offset` in a file variant.
    pub fn name_at(&self, file: FileId, offset: u32) -> Option<&NameRecord> {
        self.names_in_file(file)
            .into_iter()
            .filter(|n| n.offset <= offset && offset < n.end().max(n.offset + 1))
            .min_by_key(|n| n.length)
    }

    /// Files holding at least one occurrence of `binding`.
    pub fn binding_files(&self, binding: BindingId) -> BTreeSet<FileId> {
        self.bindings
            .get(binding)
            .map(|b| {
                b.names
                    .iter()
                    .filter_map(|id| self.names.get(*id))
                    .map(|n| n.file)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Applies staged operations in order. Every operation is validated
    /// before the first one is applied, so a rejected batch changes nothing.
    pub fn apply(&mut self, ops: Vec<StagedOp>) -> Result<ApplyOutcome> {
        for op in &ops {
            op.validate()?;
        }
        let mut outcome = ApplyOutcome::default();
        for op in ops {
            match op {
                StagedOp::ReplaceFile(update) => {
                    outcome.removed.remove(&update.location);
                    outcome.written.insert(update.location.clone());
                    self.replace_file(*update);
                }
                StagedOp::RemoveLocation(location) => {
                    if self.remove_location(&location) {
                        outcome.written.remove(&location);
                        outcome.removed.insert(location);
                    }
                }
                StagedOp::RemoveVariant {
                    location,
                    linkage,
                    significant_macros,
                } => {
                    if self.remove_variant(&location, &significant_macros, linkage) {
                        if self.by_location.contains_key(&location) {
                            outcome.written.insert(location);
                        } else {
                            outcome.written.remove(&location);
                            outcome.removed.insert(location);
                        }
                    }
                }
                StagedOp::MarkFailed {
                    location,
                    linkage,
                    reason,
                } => {
                    self.mark_failed(&location, linkage, reason);
                    outcome.written.insert(location);
                }
                StagedOp::Clear => {
                    self.clear();
                    outcome.written.clear();
                    outcome.removed.clear();
                    outcome.cleared = true;
                }
            }
        }
        Ok(outcome)
    }

    /// Takes the set of records changed since the last call.
    pub fn take_dirty(&mut self) -> DirtySet {
        std::mem::take(&mut self.dirty)
    }

    fn clear(&mut self) {
        *self = FragmentData::default();
        self.dirty.cleared = true;
    }

    fn replace_file(&mut self, update: FileUpdate) {
        let FileUpdate {
            location,
            linkage,
            significant_macros,
            fingerprint,
            timestamp,
            mut includes,
            macros,
            names,
        } = update;

        let file_id = match self.find_variant(&location, &significant_macros, linkage) {
            Some(id) => id,
            None => {
                let id = self.files.alloc(|id| FileRecord {
                    id,
                    location: location.clone(),
                    linkage,
                    fingerprint,
                    timestamp,
                    significant_macros: significant_macros.clone(),
                    includes: Vec::new(),
                    macros: Vec::new(),
                    names: Vec::new(),
                    state: FileState::Indexed,
                });
                self.by_location.entry(location.clone()).or_default().push(id);
                id
            }
        };

        let old_names = self
            .files
            .get_mut(file_id)
            .map(|f| std::mem::take(&mut f.names))
            .unwrap_or_default();
        let mut touched: BTreeSet<BindingId> = BTreeSet::new();
        let mut reusable: HashMap<OccurrenceKey, NameId> = HashMap::new();
        for id in old_names {
            if let Some(n) = self.names.get(id) {
                touched.insert(n.binding);
                reusable.insert((n.offset, n.length, n.role, n.binding), id);
            }
        }

        // Bindings first so every payload of this file is merged before
        // polymorphism is decided.
        let mut became_virtual = Vec::new();
        let resolved: Vec<BindingId> = names
            .iter()
            .map(|n| self.get_or_create_binding(&n.symbol, &mut became_virtual, &mut touched))
            .collect();

        let mut seen: HashSet<OccurrenceKey> = HashSet::new();
        let mut assigned: Vec<Option<NameId>> = Vec::with_capacity(names.len());
        for (update, &binding) in names.iter().zip(&resolved) {
            let key = (update.offset, update.length, update.role, binding);
            if !seen.insert(key) {
                assigned.push(None);
                continue;
            }
            let polymorphic = self.polymorphic(update.role, update.qualified, binding);
            let id = match reusable.remove(&key) {
                Some(id) => {
                    if let Some(n) = self.names.get_mut(id) {
                        n.is_read = update.is_read;
                        n.is_write = update.is_write;
                        n.qualified = update.qualified;
                        n.could_be_polymorphic = polymorphic;
                    }
                    id
                }
                None => {
                    let id = self.names.alloc(|id| NameRecord {
                        id,
                        file: file_id,
                        offset: update.offset,
                        length: update.length,
                        role: update.role,
                        binding,
                        enclosing: None,
                        is_read: update.is_read,
                        is_write: update.is_write,
                        qualified: update.qualified,
                        could_be_polymorphic: polymorphic,
                    });
                    if let Some(b) = self.bindings.get_mut(binding) {
                        b.names.push(id);
                    }
                    self.dirty.bindings.insert(binding);
                    id
                }
            };
            self.dirty.names.insert(id);
            assigned.push(Some(id));
        }

        let enclosing = enclosing_definitions(&names, &assigned);
        for (id, enclosing) in assigned.iter().zip(enclosing) {
            let Some(id) = id else { continue };
            if let Some(n) = self.names.get_mut(*id) {
                n.enclosing = enclosing;
            }
        }

        for (_, id) in reusable {
            self.remove_name(id);
        }

        let mut file_names: Vec<NameId> = assigned.into_iter().flatten().collect();
        file_names.sort_by_key(|id| self.names.get(*id).map(|n| n.offset).unwrap_or(0));
        for include in &mut includes {
            include.includer = file_id;
        }
        if let Some(file) = self.files.get_mut(file_id) {
            file.fingerprint = fingerprint;
            file.timestamp = timestamp;
            file.includes = includes;
            file.macros = macros;
            file.names = file_names;
            file.state = FileState::Indexed;
        }
        self.dirty.files.insert(file_id);

        self.collect_garbage(touched);
        for binding in became_virtual {
            self.reflag_polymorphic(binding);
        }
    }

    fn remove_location(&mut self, location: &LocationKey) -> bool {
        let Some(ids) = self.by_location.remove(location) else {
            return false;
        };
        let mut touched = BTreeSet::new();
        for id in ids {
            self.drop_file(id, &mut touched);
        }
        self.collect_garbage(touched);
        true
    }

    fn remove_variant(
        &mut self,
        location: &LocationKey,
        significant_macros: &SignificantMacros,
        linkage: Linkage,
    ) -> bool {
        let Some(id) = self.find_variant(location, significant_macros, linkage) else {
            return false;
        };
        if let Some(ids) = self.by_location.get_mut(location) {
            ids.retain(|v| *v != id);
            if ids.is_empty() {
                self.by_location.remove(location);
            }
        }
        let mut touched = BTreeSet::new();
        self.drop_file(id, &mut touched);
        self.collect_garbage(touched);
        true
    }

    fn drop_file(&mut self, id: FileId, touched: &mut BTreeSet<BindingId>) {
        if let Some(file) = self.files.remove(id) {
            for name in file.names {
                if let Some(binding) = self.remove_name(name) {
                    touched.insert(binding);
                }
            }
            self.dirty.files.insert(id);
        }
    }

    fn mark_failed(&mut self, location: &LocationKey, linkage: Linkage, reason: String) {
        let ids = self.by_location.get(location).cloned().unwrap_or_default();
        if ids.is_empty() {
            // Placeholder so the failure is visible and the file is retried.
            let id = self.files.alloc(|id| FileRecord {
                id,
                location: location.clone(),
                linkage,
                fingerprint: 0,
                timestamp: 0,
                significant_macros: SignificantMacros::new(),
                includes: Vec::new(),
                macros: Vec::new(),
                names: Vec::new(),
                state: FileState::Failed {
                    reason: reason.clone(),
                },
            });
            self.by_location.entry(location.clone()).or_default().push(id);
            self.dirty.files.insert(id);
            return;
        }
        for id in ids {
            if let Some(file) = self.files.get_mut(id) {
                file.state = FileState::Failed {
                    reason: reason.clone(),
                };
                // Forces the next freshness pass to reparse.
                file.fingerprint = 0;
                self.dirty.files.insert(id);
            }
        }
    }

    /// Detaches a name from its binding and deletes it. Returns the binding.
    fn remove_name(&mut self, id: NameId) -> Option<BindingId> {
        let name = self.names.remove(id)?;
        self.dirty.names.insert(id);
        if let Some(b) = self.bindings.get_mut(name.binding) {
            b.names.retain(|n| *n != id);
            self.dirty.bindings.insert(name.binding);
        }
        Some(name.binding)
    }

    fn get_or_create_binding(
        &mut self,
        symbol: &SymbolRef,
        became_virtual: &mut Vec<BindingId>,
        touched: &mut BTreeSet<BindingId>,
    ) -> BindingId {
        let key = symbol.key();
        let id = match self.by_key.get(&key).copied() {
            Some(id) => {
                if let Some(b) = self.bindings.get_mut(id) {
                    if b.kind.merge(&symbol.kind) {
                        became_virtual.push(id);
                    }
                    b.implicit &= symbol.implicit;
                }
                id
            }
            None => {
                let id = self.bindings.alloc(|id| BindingRecord {
                    id,
                    qualified_name: symbol.qualified_name.clone(),
                    kind: symbol.kind.clone(),
                    linkage: symbol.linkage,
                    template: TemplateLink::None,
                    implicit: symbol.implicit,
                    names: Vec::new(),
                });
                self.by_key.insert(key, id);
                self.index_binding_name(id, &symbol.qualified_name);
                id
            }
        };
        self.dirty.bindings.insert(id);

        if let Some(primary_name) = &symbol.instance_of {
            let primary_symbol =
                SymbolRef::new(primary_name.clone(), symbol.kind.bare(), symbol.linkage);
            let primary = self.get_or_create_binding(&primary_symbol, became_virtual, touched);
            // The primary may have been created just now; it lives while it
            // has instances or occurrences.
            touched.insert(primary);
            if primary != id {
                self.link_instance(id, primary, touched);
            }
        }
        id
    }

    fn link_instance(
        &mut self,
        instance: BindingId,
        primary: BindingId,
        touched: &mut BTreeSet<BindingId>,
    ) {
        let previous = match self.bindings.get(instance).map(|b| &b.template) {
            Some(TemplateLink::Instance { primary: p }) if *p == primary => return,
            Some(TemplateLink::Instance { primary: p }) => Some(*p),
            _ => None,
        };
        if let Some(old) = previous {
            self.unlink_instance(instance, old);
            touched.insert(old);
        }
        if let Some(b) = self.bindings.get_mut(instance) {
            b.template = TemplateLink::Instance { primary };
        }
        if let Some(p) = self.bindings.get_mut(primary) {
            match &mut p.template {
                TemplateLink::Primary { instances } => {
                    if !instances.contains(&instance) {
                        instances.push(instance);
                    }
                }
                other => {
                    *other = TemplateLink::Primary {
                        instances: vec![instance],
                    }
                }
            }
        }
        self.dirty.bindings.insert(primary);
    }

    fn unlink_instance(&mut self, instance: BindingId, primary: BindingId) {
        if let Some(p) = self.bindings.get_mut(primary) {
            if let TemplateLink::Primary { instances } = &mut p.template {
                instances.retain(|i| *i != instance);
                if instances.is_empty() {
                    p.template = TemplateLink::None;
                }
            }
            self.dirty.bindings.insert(primary);
        }
    }

    /// Deletes candidate bindings that lost their last occurrence and have
    /// no template instances.
    fn collect_garbage(&mut self, candidates: BTreeSet<BindingId>) {
        let mut queue: Vec<BindingId> = candidates.into_iter().collect();
        while let Some(id) = queue.pop() {
            let removable = match self.bindings.get(id) {
                Some(b) => {
                    b.names.is_empty()
                        && !matches!(&b.template, TemplateLink::Primary { instances } if !instances.is_empty())
                }
                None => false,
            };
            if !removable {
                continue;
            }
            let Some(binding) = self.bindings.remove(id) else {
                continue;
            };
            self.dirty.bindings.insert(id);
            self.by_key.remove(&binding.key());
            self.unindex_binding_name(id, &binding.qualified_name);
            if let TemplateLink::Instance { primary } = binding.template {
                self.unlink_instance(id, primary);
                queue.push(primary);
            }
        }
    }

    fn polymorphic(&self, role: NameRole, qualified: bool, binding: BindingId) -> bool {
        role == NameRole::Reference
            && !qualified
            && self
                .bindings
                .get(binding)
                .map(|b| b.kind.is_virtual())
                .unwrap_or(false)
    }

    fn reflag_polymorphic(&mut self, binding: BindingId) {
        let ids = self
            .bindings
            .get(binding)
            .map(|b| b.names.clone())
            .unwrap_or_default();
        for id in ids {
            let Some(n) = self.names.get(id) else { continue };
            let flag = self.polymorphic(n.role, n.qualified, binding);
            if n.could_be_polymorphic != flag {
                if let Some(n) = self.names.get_mut(id) {
                    n.could_be_polymorphic = flag;
                }
                self.dirty.names.insert(id);
            }
        }
    }

    fn index_binding_name(&mut self, id: BindingId, qualified_name: &[String]) {
        let Some((last, scope)) = qualified_name.split_last() else {
            return;
        };
        self.by_scope.entry(scope.to_vec()).or_default().insert(id);
        self.by_lower_name
            .entry(last.to_lowercase())
            .or_default()
            .insert(id);
    }

    fn unindex_binding_name(&mut self, id: BindingId, qualified_name: &[String]) {
        let Some((last, scope)) = qualified_name.split_last() else {
            return;
        };
        if let Some(set) = self.by_scope.get_mut(scope) {
            set.remove(&id);
            if set.is_empty() {
                self.by_scope.remove(scope);
            }
        }
        let lower = last.to_lowercase();
        if let Some(set) = self.by_lower_name.get_mut(&lower) {
            set.remove(&id);
            if set.is_empty() {
                self.by_lower_name.remove(&lower);
            }
        }
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Verifies cross-record references. Any violation means the fragment
    /// cannot be trusted.
    pub fn check_integrity(&self) -> Result<()> {
        let corrupt = |msg: String| Err(IndexerError::CorruptFragment(msg));
        for file in self.files.values() {
            if !file.location.is_resolved() {
                return corrupt(format!("unresolved location {}", file.location));
            }
            for id in &file.names {
                match self.names.get(*id) {
                    Some(n) if n.file == file.id => {}
                    _ => return corrupt(format!("file {} lists foreign name {}", file.id, id)),
                }
            }
            for include in &file.includes {
                if include.includer != file.id {
                    return corrupt(format!("include of file {} has wrong includer", file.id));
                }
            }
        }
        for name in self.names.values() {
            let Some(file) = self.files.get(name.file) else {
                return corrupt(format!("name {} has no file", name.id));
            };
            if !file.names.contains(&name.id) {
                return corrupt(format!("name {} missing from its file", name.id));
            }
            let Some(binding) = self.bindings.get(name.binding) else {
                return corrupt(format!("name {} has no binding", name.id));
            };
            if !binding.names.contains(&name.id) {
                return corrupt(format!("name {} missing from its binding", name.id));
            }
            if let Some(enclosing) = name.enclosing {
                if name.is_definition() {
                    return corrupt(format!("definition {} has an enclosing name", name.id));
                }
                match self.names.get(enclosing) {
                    Some(e) if e.is_definition() => {}
                    _ => return corrupt(format!("name {} has a bad enclosing name", name.id)),
                }
            }
        }
        for binding in self.bindings.values() {
            for id in &binding.names {
                if self.names.get(*id).map(|n| n.binding) != Some(binding.id) {
                    return corrupt(format!("binding {} lists foreign name {}", binding.id, id));
                }
            }
            match &binding.template {
                TemplateLink::Instance { primary } => {
                    let ok = matches!(
                        self.bindings.get(*primary).map(|p| &p.template),
                        Some(TemplateLink::Primary { instances }) if instances.contains(&binding.id)
                    );
                    if !ok {
                        return corrupt(format!("binding {} has a dangling primary", binding.id));
                    }
                }
                TemplateLink::Primary { instances } => {
                    for i in instances {
                        let ok = matches!(
                            self.bindings.get(*i).map(|b| &b.template),
                            Some(TemplateLink::Instance { primary }) if *primary == binding.id
                        );
                        if !ok {
                            return corrupt(format!(
                                "binding {} lists a foreign instance {}",
                                binding.id, i
                            ));
                        }
                    }
                }
                TemplateLink::None => {}
            }
        }
        Ok(())
    }
}

/// For each name of an update, the innermost function definition of the
/// same update whose body contains it. Definitions themselves get `None`.
///
/// Bodies are swept in start order with a stack of the scopes still open.
fn enclosing_definitions(names: &[NameUpdate], assigned: &[Option<NameId>]) -> Vec<Option<NameId>> {
    let mut scopes: Vec<(u32, u32, NameId)> = names
        .iter()
        .zip(assigned)
        .filter(|(n, _)| n.role == NameRole::Definition)
        .filter_map(|(n, id)| {
            let (start, end) = n.body_extent?;
            Some((start, end, (*id)?))
        })
        .collect();
    // Outer scopes first when two bodies start together.
    scopes.sort_by_key(|&(start, end, _)| (start, std::cmp::Reverse(end)));

    let mut targets: Vec<usize> = (0..names.len())
        .filter(|&i| names[i].role != NameRole::Definition)
        .collect();
    targets.sort_by_key(|&i| names[i].offset);

    let mut result = vec![None; names.len()];
    let mut open: Vec<(u32, u32, NameId)> = Vec::new();
    let mut next = scopes.iter().peekable();
    for i in targets {
        let start = names[i].offset;
        let end = start + names[i].length;
        while let Some(&&scope) = next.peek() {
            if scope.0 > start {
                break;
            }
            while open.last().is_some_and(|top| top.1 < scope.0) {
                open.pop();
            }
            open.push(scope);
            next.next();
        }
        while open.last().is_some_and(|top| top.1 < start) {
            open.pop();
        }
        result[i] = open
            .iter()
            .rev()
            .find(|(body_start, body_end, _)| *body_start <= start && end <= *body_end)
            .map(|(_, _, id)| *id);
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::index::{BindingKind, ClassKey, ConstValue};

    pub(crate) fn sym(name: &str, kind: BindingKind) -> SymbolRef {
        SymbolRef::new(
            name.split("::").map(String::from).collect(),
            kind,
            Linkage::Cpp,
        )
    }

    pub(crate) fn occurrence(symbol: SymbolRef, offset: u32, role: NameRole) -> NameUpdate {
        let length = symbol
            .qualified_name
            .last()
            .map(|s| s.len() as u32)
            .unwrap_or(0);
        NameUpdate {
            symbol,
            offset,
            length,
            role,
            body_extent: None,
            is_read: role == NameRole::Reference,
            is_write: false,
            qualified: false,
        }
    }

    pub(crate) fn update(location: LocationKey, names: Vec<NameUpdate>) -> FileUpdate {
        FileUpdate {
            location,
            linkage: Linkage::Cpp,
            significant_macros: SignificantMacros::new(),
            fingerprint: 1,
            timestamp: 1,
            includes: Vec::new(),
            macros: Vec::new(),
            names,
        }
    }

    fn class() -> BindingKind {
        BindingKind::Class {
            key: ClassKey::Class,
        }
    }

    fn func(is_virtual: bool) -> BindingKind {
        BindingKind::Function { is_virtual }
    }

    fn replace(data: &mut FragmentData, u: FileUpdate) {
        data.apply(vec![StagedOp::ReplaceFile(Box::new(u))]).unwrap();
    }

    #[test]
    fn test_prefix_search_case_insensitive_with_scope_switch() {
        // class a; class A; namespace aa { class a { class e { class AA { class A{}; }; }; }; }
        let loc = LocationKey::workspace("p", "a.cpp");
        let names = vec![
            occurrence(sym("a", class()), 6, NameRole::Declaration),
            occurrence(sym("A", class()), 15, NameRole::Declaration),
            occurrence(sym("aa", BindingKind::Namespace), 28, NameRole::Definition),
            occurrence(sym("aa::a", class()), 39, NameRole::Definition),
            occurrence(sym("aa::a::e", class()), 49, NameRole::Definition),
            occurrence(sym("aa::a::e::AA", class()), 59, NameRole::Definition),
            occurrence(sym("aa::a::e::AA::A", class()), 70, NameRole::Definition),
            occurrence(sym("aFunc", func(false)), 90, NameRole::Declaration),
        ];
        let mut data = FragmentData::new();
        replace(&mut data, update(loc, names));

        let filter = Filter::non_functions();
        assert_eq!(data.find_bindings_by_prefix("a", true, &filter).len(), 3);
        assert_eq!(data.find_bindings_by_prefix("a", false, &filter).len(), 6);
        assert_eq!(data.find_bindings_by_prefix("aA", true, &filter).len(), 1);
        assert_eq!(data.find_bindings_by_prefix("aA", false, &filter).len(), 2);
        assert_eq!(data.find_bindings_by_prefix("a", true, &Filter::all()).len(), 4);
    }

    #[test]
    fn test_pattern_search_anchoring() {
        let loc = LocationKey::workspace("p", "a.cpp");
        let names = vec![
            occurrence(sym("ns", BindingKind::Namespace), 0, NameRole::Definition),
            occurrence(sym("ns::Widget", class()), 10, NameRole::Definition),
            occurrence(sym("Widget", class()), 30, NameRole::Definition),
            occurrence(sym("ns::Widget::draw", func(false)), 40, NameRole::Declaration),
        ];
        let mut data = FragmentData::new();
        replace(&mut data, update(loc, names));

        let all = Filter::all();
        let widget = NamePattern::parse("Widget").unwrap();
        assert_eq!(data.find_bindings(&widget, true, &all).len(), 1);
        assert_eq!(data.find_bindings(&widget, false, &all).len(), 2);

        let qualified = NamePattern::parse("ns::W.*").unwrap();
        assert_eq!(data.find_bindings(&qualified, true, &all).len(), 1);
        let partial = NamePattern::parse("Wid").unwrap();
        assert!(data.find_bindings(&partial, false, &all).is_empty());

        let exact = data.find_bindings_by_exact_name(&["ns", "Widget"], &all);
        assert_eq!(exact.len(), 1);
        assert_eq!(data.members(exact[0].id).len(), 1);
        assert_eq!(data.find_bindings_by_name("draw", false, &all).len(), 1);
        assert!(data.find_bindings_by_name("draw", true, &all).is_empty());
    }

    #[test]
    fn test_reapply_keeps_identities() {
        let loc = LocationKey::workspace("p", "a.cpp");
        let names = vec![
            occurrence(sym("f", func(false)), 5, NameRole::Definition),
            occurrence(sym("g", func(false)), 20, NameRole::Reference),
        ];
        let mut data = FragmentData::new();
        replace(&mut data, update(loc.clone(), names.clone()));
        let before: Vec<(NameId, BindingId)> = data.names().map(|n| (n.id, n.binding)).collect();
        let stats = data.stats();

        replace(&mut data, update(loc, names));
        let after: Vec<(NameId, BindingId)> = data.names().map(|n| (n.id, n.binding)).collect();
        assert_eq!(before, after);
        assert_eq!(stats, data.stats());
    }

    #[test]
    fn test_binding_removed_with_last_occurrence() {
        let a = LocationKey::workspace("p", "a.cpp");
        let b = LocationKey::workspace("p", "b.cpp");
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(a.clone(), vec![occurrence(sym("shared", func(false)), 0, NameRole::Reference)]),
        );
        replace(
            &mut data,
            update(b.clone(), vec![occurrence(sym("shared", func(false)), 0, NameRole::Definition)]),
        );
        assert_eq!(data.stats().bindings, 1);

        data.apply(vec![StagedOp::RemoveLocation(a)]).unwrap();
        assert_eq!(data.stats().bindings, 1);
        replace(&mut data, update(b, Vec::new()));
        assert_eq!(data.stats().bindings, 0);
        assert_eq!(data.stats().names, 0);
        data.check_integrity().unwrap();
    }

    #[test]
    fn test_enclosing_definition() {
        // void func(); int var; int main() { func(); var = 1; }
        let loc = LocationKey::workspace("p", "main.cpp");
        let mut main_def = occurrence(sym("main", func(false)), 26, NameRole::Definition);
        main_def.body_extent = Some((33, 55));
        let mut write = occurrence(
            sym(
                "var",
                BindingKind::Variable {
                    value: ConstValue::Unknown,
                },
            ),
            43,
            NameRole::Reference,
        );
        write.is_read = false;
        write.is_write = true;
        let names = vec![
            occurrence(sym("func", func(false)), 5, NameRole::Declaration),
            occurrence(
                sym(
                    "var",
                    BindingKind::Variable {
                        value: ConstValue::Unknown,
                    },
                ),
                17,
                NameRole::Definition,
            ),
            main_def,
            occurrence(sym("func", func(false)), 35, NameRole::Reference),
            write,
        ];
        let mut data = FragmentData::new();
        replace(&mut data, update(loc, names));

        let all = Filter::all();
        let main = data.find_bindings_by_name("main", true, &all)[0].id;
        let main_name = data.find_names(main, NameMask::DEFINITIONS)[0].id;
        assert!(data.name(main_name).unwrap().enclosing.is_none());

        let refs: Vec<&NameRecord> = data
            .names()
            .filter(|n| n.role == NameRole::Reference)
            .collect();
        assert_eq!(refs.len(), 2);
        for r in refs {
            assert_eq!(r.enclosing, Some(main_name));
        }
        for n in data.names().filter(|n| n.role != NameRole::Reference) {
            assert!(n.enclosing.is_none());
        }
    }

    #[test]
    fn test_virtual_merge_reflags_references() {
        let use_site = LocationKey::workspace("p", "use.cpp");
        let header = LocationKey::workspace("p", "a.h");
        let mut qualified = occurrence(sym("A::f", func(false)), 30, NameRole::Reference);
        qualified.qualified = true;
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(
                use_site,
                vec![occurrence(sym("A::f", func(false)), 10, NameRole::Reference), qualified],
            ),
        );
        assert!(data.names().all(|n| !n.could_be_polymorphic));

        replace(
            &mut data,
            update(header, vec![occurrence(sym("A::f", func(true)), 3, NameRole::Declaration)]),
        );
        let flagged: Vec<u32> = data
            .names()
            .filter(|n| n.could_be_polymorphic)
            .map(|n| n.offset)
            .collect();
        assert_eq!(flagged, vec![10]);
    }

    #[test]
    fn test_remove_variant_keeps_other_contexts() {
        let header = LocationKey::workspace("p", "h.h");
        let variant = |macros: SignificantMacros, name: &str| FileUpdate {
            significant_macros: macros,
            ..update(
                header.clone(),
                vec![occurrence(sym(name, func(false)), 5, NameRole::Declaration)],
            )
        };
        let with_a = SignificantMacros::new().defined("A", "1");
        let without_a = SignificantMacros::new().undefined("A");
        let mut data = FragmentData::new();
        replace(&mut data, variant(with_a.clone(), "foo"));
        replace(&mut data, variant(without_a.clone(), "bar"));
        assert_eq!(data.get_files(&header).len(), 2);

        let remove = |macros: &SignificantMacros| StagedOp::RemoveVariant {
            location: header.clone(),
            linkage: Linkage::Cpp,
            significant_macros: macros.clone(),
        };
        let outcome = data.apply(vec![remove(&with_a)]).unwrap();
        assert!(outcome.written.contains(&header));
        assert!(outcome.removed.is_empty());
        assert_eq!(data.get_files(&header).len(), 1);
        assert!(data.find_bindings_by_name("foo", true, &Filter::all()).is_empty());
        assert_eq!(data.find_bindings_by_name("bar", true, &Filter::all()).len(), 1);

        let outcome = data.apply(vec![remove(&without_a)]).unwrap();
        assert!(outcome.removed.contains(&header));
        assert!(data.locations().next().is_none());
        assert_eq!(data.stats().bindings, 0);
        data.check_integrity().unwrap();
    }

    #[test]
    fn test_enclosing_definition_picks_innermost_scope() {
        // void outer() { struct L { void inner() { g(); } }; g(); }  g();
        let loc = LocationKey::workspace("p", "nested.cpp");
        let mut outer = occurrence(sym("outer", func(false)), 5, NameRole::Definition);
        outer.body_extent = Some((13, 60));
        let mut inner = occurrence(sym("outer::L::inner", func(false)), 31, NameRole::Definition);
        inner.body_extent = Some((39, 48));
        let names = vec![
            occurrence(sym("g", func(false)), 62, NameRole::Reference),
            occurrence(sym("g", func(false)), 52, NameRole::Reference),
            inner,
            occurrence(sym("g", func(false)), 41, NameRole::Reference),
            outer,
        ];
        let mut data = FragmentData::new();
        replace(&mut data, update(loc, names));

        let enclosing_of = |offset: u32| {
            let name = data
                .names()
                .find(|n| n.offset == offset && n.role == NameRole::Reference)
                .unwrap();
            name.enclosing
                .and_then(|id| data.name(id))
                .and_then(|n| data.binding(n.binding))
                .map(|b| b.qualified())
        };
        assert_eq!(enclosing_of(41).as_deref(), Some("outer::L::inner"));
        assert_eq!(enclosing_of(52).as_deref(), Some("outer"));
        assert_eq!(enclosing_of(62), None);
    }

    #[test]
    fn test_template_instance_keeps_primary_alive() {
        let loc = LocationKey::workspace("p", "t.cpp");
        let mut instance = sym("Box<int>", class());
        instance.instance_of = Some(vec!["Box".to_string()]);
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(loc.clone(), vec![occurrence(instance, 4, NameRole::Reference)]),
        );

        let all = Filter::all();
        let primary = data.find_bindings_by_name("Box", true, &all)[0];
        assert!(primary.names.is_empty());
        assert!(matches!(&primary.template, TemplateLink::Primary { instances } if instances.len() == 1));
        data.check_integrity().unwrap();

        data.apply(vec![StagedOp::RemoveLocation(loc)]).unwrap();
        assert_eq!(data.stats().bindings, 0);
    }

    #[test]
    fn test_mark_failed_keeps_content() {
        let loc = LocationKey::workspace("p", "a.cpp");
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(loc.clone(), vec![occurrence(sym("f", func(false)), 0, NameRole::Definition)]),
        );
        data.apply(vec![StagedOp::MarkFailed {
            location: loc.clone(),
            linkage: Linkage::Cpp,
            reason: "boom".into(),
        }])
        .unwrap();
        let files = data.get_files(&loc);
        assert_eq!(files.len(), 1);
        assert!(files[0].is_failed());
        assert_eq!(data.stats().names, 1);
        assert_eq!(data.stats().failed_files, 1);
    }

    #[test]
    fn test_rejected_batch_changes_nothing() {
        let mut data = FragmentData::new();
        let good = update(LocationKey::workspace("p", "a.cpp"), Vec::new());
        let bad = update(LocationKey::workspace("p", "../b.cpp"), Vec::new());
        let err = data
            .apply(vec![
                StagedOp::ReplaceFile(Box::new(good)),
                StagedOp::ReplaceFile(Box::new(bad)),
            ])
            .unwrap_err();
        assert!(matches!(err, IndexerError::UnresolvableLocation(_)));
        assert!(data.is_empty());
    }

    #[test]
    fn test_from_records_round_trip() {
        let loc = LocationKey::workspace("p", "a.cpp");
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(
                loc,
                vec![
                    occurrence(sym("f", func(false)), 0, NameRole::Definition),
                    occurrence(sym("g", func(false)), 9, NameRole::Reference),
                ],
            ),
        );
        let rebuilt = FragmentData::from_records(
            data.files().cloned().collect(),
            data.bindings().cloned().collect(),
            data.names().cloned().collect(),
        )
        .unwrap();
        assert_eq!(rebuilt.stats(), data.stats());
        assert_eq!(
            rebuilt
                .find_bindings_by_prefix("", false, &Filter::all())
                .len(),
            2
        );
    }

    #[test]
    fn test_from_records_detects_dangling_name() {
        let loc = LocationKey::workspace("p", "a.cpp");
        let mut data = FragmentData::new();
        replace(
            &mut data,
            update(loc, vec![occurrence(sym("f", func(false)), 0, NameRole::Definition)]),
        );
        let err = FragmentData::from_records(
            data.files().cloned().collect(),
            Vec::new(),
            data.names().cloned().collect(),
        )
        .unwrap_err();
        assert!(err.is_corruption());
    }
}
