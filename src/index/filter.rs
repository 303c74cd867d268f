use std::fmt;
use std::sync::Arc;

use crate::index::{BindingRecord, FragmentData, Linkage};

/// Predicate over bindings, applied by the query surface.
pub trait IndexFilter: Send + Sync {
    fn accepts(&self, fragment: &FragmentData, binding: &BindingRecord) -> bool;
}

/// Shared, cloneable filter handle.
#[derive(Clone)]
pub struct Filter(Arc<dyn IndexFilter>);

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter")
    }
}

impl Filter {
    pub fn new(filter: impl IndexFilter + 'static) -> Self {
        Filter(Arc::new(filter))
    }

    /// Accepts every binding.
    pub fn all() -> Self {
        Self::from_fn(|_, _| true)
    }

    /// Accepts bindings with at least one declaration or definition.
    pub fn all_declared() -> Self {
        Self::from_fn(|fragment, binding| {
            binding.names.iter().any(|id| {
                fragment
                    .name(*id)
                    .map(|n| !n.is_reference())
                    .unwrap_or(false)
            })
        })
    }

    pub fn linkage(linkage: Linkage) -> Self {
        Self::from_fn(move |_, binding| binding.linkage == linkage)
    }

    pub fn exclude_implicit() -> Self {
        Self::from_fn(|_, binding| !binding.implicit)
    }

    /// Everything except functions; used by content assist on type names.
    pub fn non_functions() -> Self {
        Self::from_fn(|_, binding| !binding.kind.is_function())
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&FragmentData, &BindingRecord) -> bool + Send + Sync + 'static,
    {
        Filter(Arc::new(FnFilter(f)))
    }

    /// Both filters must accept.
    pub fn and(self, other: Filter) -> Self {
        Self::from_fn(move |fragment, binding| {
            self.accepts(fragment, binding) && other.accepts(fragment, binding)
        })
    }

    pub fn accepts(&self, fragment: &FragmentData, binding: &BindingRecord) -> bool {
        self.0.accepts(fragment, binding)
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::all()
    }
}

struct FnFilter<F>(F);

impl<F> IndexFilter for FnFilter<F>
where
    F: Fn(&FragmentData, &BindingRecord) -> bool + Send + Sync,
{
    fn accepts(&self, fragment: &FragmentData, binding: &BindingRecord) -> bool {
        (self.0)(fragment, binding)
    }
}
