//! Read-only union of several fragments.
//!
//! Bindings with the same qualified name, kind and linkage are one entity in
//! the view; occurrences contributed by several fragments at the same place
//! are reported once.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::index::filter::Filter;
use crate::index::fragment::{FragmentData, NamePattern};
use crate::index::store::{FragmentId, FragmentStore, ReadGuard};
use crate::index::{
    BindingId, BindingKey, BindingKind, BindingRecord, FileRecord, IndexStats, Linkage, NameMask,
    NameRecord, NameRole, SignificantMacros,
};
use crate::location::LocationKey;

/// A binding merged across fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeBinding {
    pub key: BindingKey,
    pub kind: BindingKind,
    pub parts: Vec<(FragmentId, BindingId)>,
}

impl CompositeBinding {
    pub fn qualified(&self) -> String {
        self.key.qualified_name.join("::")
    }

    pub fn name(&self) -> &str {
        self.key
            .qualified_name
            .last()
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// An occurrence together with the fragment and file it came from.
#[derive(Debug, Clone, Copy)]
pub struct CompositeName<'v> {
    pub fragment: FragmentId,
    pub location: &'v LocationKey,
    pub record: &'v NameRecord,
}

impl CompositeName<'_> {
    pub fn role(&self) -> NameRole {
        self.record.role
    }
}

pub struct CompositeView<'a> {
    guards: Vec<ReadGuard<'a>>,
}

impl<'a> CompositeView<'a> {
    /// Read-locks every store in ascending fragment order.
    pub fn lock(stores: &'a [Arc<FragmentStore>]) -> Result<Self> {
        let mut ordered: Vec<&'a FragmentStore> = stores.iter().map(|s| s.as_ref()).collect();
        ordered.sort_by_key(|s| s.id());
        ordered.dedup_by_key(|s| s.id());
        let mut guards = Vec::with_capacity(ordered.len());
        for store in ordered {
            guards.push(store.acquire_read()?);
        }
        Ok(Self { guards })
    }

    pub fn fragment_ids(&self) -> Vec<FragmentId> {
        self.guards.iter().map(|g| g.fragment_id()).collect()
    }

    pub fn fragment(&self, id: FragmentId) -> Option<&FragmentData> {
        self.guards
            .iter()
            .find(|g| g.fragment_id() == id)
            .map(|g| g.data())
    }

    pub fn fragments(&self) -> impl Iterator<Item = (FragmentId, &FragmentData)> {
        self.guards.iter().map(|g| (g.fragment_id(), g.data()))
    }

    pub fn binding(&self, fragment: FragmentId, id: BindingId) -> Option<&BindingRecord> {
        self.fragment(fragment)?.binding(id)
    }

    // ------------------------------------------------------------------
    // Binding queries
    // ------------------------------------------------------------------

    pub fn find_bindings(
        &self,
        pattern: &NamePattern,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<CompositeBinding> {
        self.merge(filter, |data, all| data.find_bindings(pattern, file_scope_only, all))
    }

    pub fn find_bindings_by_name(
        &self,
        name: &str,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<CompositeBinding> {
        self.merge(filter, |data, all| data.find_bindings_by_name(name, file_scope_only, all))
    }

    pub fn find_bindings_by_exact_name<S: AsRef<str>>(
        &self,
        qualified_name: &[S],
        filter: &Filter,
    ) -> Vec<CompositeBinding> {
        self.merge(filter, |data, all| data.find_bindings_by_exact_name(qualified_name, all))
    }

    pub fn find_bindings_by_prefix(
        &self,
        prefix: &str,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Vec<CompositeBinding> {
        self.merge(filter, |data, all| data.find_bindings_by_prefix(prefix, file_scope_only, all))
    }

    /// Union of the members every part of `binding` has in its fragment.
    pub fn members(&self, binding: &CompositeBinding) -> Vec<CompositeBinding> {
        self.merge_parts(&binding.parts, |data, id| data.members(id))
    }

    /// Looks up a binding by key in every fragment.
    pub fn binding_by_key(&self, key: &BindingKey) -> Option<CompositeBinding> {
        self.merge(&Filter::all(), |data, _| data.binding_by_key(key).into_iter().collect())
            .into_iter()
            .next()
    }

    /// Runs `query` unfiltered in every fragment and merges the results by
    /// key. A merged binding is kept when `filter` accepts any of its parts,
    /// and then carries all of them.
    fn merge<'v>(
        &'v self,
        filter: &Filter,
        query: impl Fn(&'v FragmentData, &Filter) -> Vec<&'v BindingRecord>,
    ) -> Vec<CompositeBinding> {
        let all = Filter::all();
        let mut merged: BTreeMap<BindingKey, CompositeBinding> = BTreeMap::new();
        let mut accepted: HashSet<BindingKey> = HashSet::new();
        for guard in &self.guards {
            let fragment = guard.fragment_id();
            let data = guard.data();
            for record in query(data, &all) {
                if filter.accepts(data, record) {
                    accepted.insert(record.key());
                }
                accumulate(&mut merged, fragment, record);
            }
        }
        merged
            .into_iter()
            .filter(|(key, _)| accepted.contains(key))
            .map(|(_, binding)| binding)
            .collect()
    }

    fn merge_parts<'v>(
        &'v self,
        parts: &[(FragmentId, BindingId)],
        query: impl Fn(&'v FragmentData, BindingId) -> Vec<&'v BindingRecord>,
    ) -> Vec<CompositeBinding> {
        let mut merged: BTreeMap<BindingKey, CompositeBinding> = BTreeMap::new();
        for (fragment, id) in parts {
            if let Some(data) = self.fragment(*fragment) {
                for record in query(data, *id) {
                    accumulate(&mut merged, *fragment, record);
                }
            }
        }
        merged.into_values().collect()
    }

    // ------------------------------------------------------------------
    // Name and file queries
    // ------------------------------------------------------------------

    /// Occurrences of a merged binding, one per physical place.
    pub fn find_names(&self, binding: &CompositeBinding, mask: NameMask) -> Vec<CompositeName<'_>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (fragment, id) in &binding.parts {
            let Some(data) = self.fragment(*fragment) else {
                continue;
            };
            for record in data.find_names(*id, mask) {
                let Some(file) = data.file(record.file) else {
                    continue;
                };
                let key = (&file.location, record.offset, record.length, record.role);
                if seen.insert(key) {
                    out.push(CompositeName {
                        fragment: *fragment,
                        location: &file.location,
                        record,
                    });
                }
            }
        }
        out.sort_by(|a, b| {
            (a.location, a.record.offset).cmp(&(b.location, b.record.offset))
        });
        out
    }

    pub fn get_file(
        &self,
        linkage: Linkage,
        location: &LocationKey,
        significant_macros: &SignificantMacros,
    ) -> Option<(FragmentId, &FileRecord)> {
        self.guards.iter().find_map(|g| {
            g.data()
                .get_file(linkage, location, significant_macros)
                .map(|f| (g.fragment_id(), f))
        })
    }

    pub fn get_files(&self, location: &LocationKey) -> Vec<(FragmentId, &FileRecord)> {
        self.guards
            .iter()
            .flat_map(|g| {
                let id = g.fragment_id();
                g.data().get_files(location).into_iter().map(move |f| (id, f))
            })
            .collect()
    }

    pub fn get_all_files(&self) -> Vec<(FragmentId, &FileRecord)> {
        self.guards
            .iter()
            .flat_map(|g| {
                let id = g.fragment_id();
                g.data().get_all_files().into_iter().map(move |f| (id, f))
            })
            .collect()
    }

    /// Distinct bindings across all fragments.
    pub fn binding_count(&self) -> usize {
        let keys: HashSet<BindingKey> = self
            .guards
            .iter()
            .flat_map(|g| g.data().bindings().map(|b| b.key()))
            .collect();
        keys.len()
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for guard in &self.guards {
            let s = guard.data().stats();
            stats.files += s.files;
            stats.names += s.names;
            stats.failed_files += s.failed_files;
        }
        stats.bindings = self.binding_count();
        stats
    }
}

fn accumulate(
    merged: &mut BTreeMap<BindingKey, CompositeBinding>,
    fragment: FragmentId,
    record: &BindingRecord,
) {
    let entry = merged
        .entry(record.key())
        .or_insert_with(|| CompositeBinding {
            key: record.key(),
            kind: record.kind.clone(),
            parts: Vec::new(),
        });
    entry.kind.merge(&record.kind);
    if !entry.parts.contains(&(fragment, record.id)) {
        entry.parts.push((fragment, record.id));
    }
}
