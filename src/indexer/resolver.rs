//! Answers "what is this name" and "where is this binding" over a locked
//! composite view. Everything returned borrows from the view.

use crate::error::{IndexerError, Result};
use crate::index::{
    CompositeBinding, CompositeName, CompositeView, Filter, NameMask, NamePattern, SymbolRef,
};
use crate::location::LocationKey;

pub struct BindingResolver<'v, 'a> {
    view: &'v CompositeView<'a>,
}

impl<'v, 'a> BindingResolver<'v, 'a> {
    pub fn new(view: &'v CompositeView<'a>) -> Self {
        Self { view }
    }

    pub fn view(&self) -> &'v CompositeView<'a> {
        self.view
    }

    /// Binding a parsed name refers to, if it has been indexed.
    pub fn resolve(&self, symbol: &SymbolRef) -> Option<CompositeBinding> {
        self.view.binding_by_key(&symbol.key())
    }

    /// Binding of the narrowest indexed name covering `offset` in any variant
    /// of `location`.
    pub fn resolve_at(&self, location: &LocationKey, offset: u32) -> Option<CompositeBinding> {
        self.name_at(location, offset).and_then(|name| self.binding_of(&name))
    }

    /// Narrowest indexed name covering `offset` in any variant of `location`.
    pub fn name_at(&self, location: &LocationKey, offset: u32) -> Option<CompositeName<'v>> {
        let mut best: Option<CompositeName<'v>> = None;
        for (fragment, file) in self.view.get_files(location) {
            let Some(data) = self.view.fragment(fragment) else {
                continue;
            };
            let Some(record) = data.name_at(file.id, offset) else {
                continue;
            };
            if best.map(|b| record.length < b.record.length).unwrap_or(true) {
                best = Some(CompositeName {
                    fragment,
                    location: &file.location,
                    record,
                });
            }
        }
        best
    }

    /// Merged binding an occurrence resolved to.
    pub fn binding_of(&self, name: &CompositeName<'_>) -> Option<CompositeBinding> {
        let record = self.view.binding(name.fragment, name.record.binding)?;
        self.view.binding_by_key(&record.key())
    }

    pub fn find_definitions(&self, binding: &CompositeBinding) -> Vec<CompositeName<'v>> {
        self.view.find_names(binding, NameMask::DEFINITIONS)
    }

    pub fn find_declarations(&self, binding: &CompositeBinding) -> Vec<CompositeName<'v>> {
        self.view.find_names(binding, NameMask::DECLARATIONS)
    }

    pub fn find_references(&self, binding: &CompositeBinding) -> Vec<CompositeName<'v>> {
        self.view.find_names(binding, NameMask::REFERENCES)
    }

    /// References that assign or otherwise modify the binding.
    pub fn find_writes(&self, binding: &CompositeBinding) -> Vec<CompositeName<'v>> {
        self.find_references(binding)
            .into_iter()
            .filter(|n| n.record.is_write)
            .collect()
    }

    /// References that may dispatch to an override.
    pub fn find_polymorphic_references(&self, binding: &CompositeBinding) -> Vec<CompositeName<'v>> {
        self.find_references(binding)
            .into_iter()
            .filter(|n| n.record.could_be_polymorphic)
            .collect()
    }

    /// Innermost definition whose body contains `name`; `None` at file scope
    /// and for definitions themselves.
    pub fn enclosing_definition(&self, name: &CompositeName<'_>) -> Option<CompositeName<'v>> {
        let data = self.view.fragment(name.fragment)?;
        let enclosing = data.name(name.record.enclosing?)?;
        let file = data.file(enclosing.file)?;
        Some(CompositeName {
            fragment: name.fragment,
            location: &file.location,
            record: enclosing,
        })
    }

    /// Bindings whose qualified name matches `pattern`, e.g. `ns::Wid.*`.
    pub fn find_bindings(
        &self,
        pattern: &str,
        file_scope_only: bool,
        filter: &Filter,
    ) -> Result<Vec<CompositeBinding>> {
        let pattern = NamePattern::parse(pattern)?;
        Ok(self.view.find_bindings(&pattern, file_scope_only, filter))
    }

    /// The single binding with this exact qualified name and kind tag.
    pub fn find_exact(&self, qualified_name: &str, tag: Option<&str>) -> Result<CompositeBinding> {
        let components: Vec<&str> = qualified_name.trim_start_matches("::").split("::").collect();
        let mut matches: Vec<CompositeBinding> = self
            .view
            .find_bindings_by_exact_name(&components, &Filter::all())
            .into_iter()
            .filter(|b| tag.map(|t| b.key.tag == t).unwrap_or(true))
            .collect();
        match matches.len() {
            0 => Err(IndexerError::Index(format!(
                "no binding named {}",
                qualified_name
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(IndexerError::Index(format!(
                "{} bindings named {}; pass a kind",
                n, qualified_name
            ))),
        }
    }
}
