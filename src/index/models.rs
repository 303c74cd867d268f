use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::index::arena::ArenaId;
use crate::location::LocationKey;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl ArenaId for $name {
            fn from_index(index: usize) -> Self {
                $name(index as u32)
            }

            fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Id of a [`FileRecord`] within one fragment.
    FileId
);
record_id!(
    /// Id of a [`BindingRecord`] within one fragment.
    BindingId
);
record_id!(
    /// Id of a [`NameRecord`] within one fragment.
    NameId
);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Linkage {
    C,
    #[default]
    Cpp,
}

impl Linkage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Linkage::C => "c",
            Linkage::Cpp => "cpp",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "c" => Some(Linkage::C),
            "cpp" | "c++" | "cxx" => Some(Linkage::Cpp),
            _ => None,
        }
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Macro context selecting one variant of a file: macro name to expansion,
/// `None` meaning the macro was undefined when the file was processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignificantMacros(BTreeMap<String, Option<String>>);

impl SignificantMacros {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defined(mut self, name: impl Into<String>, expansion: impl Into<String>) -> Self {
        self.0.insert(name.into(), Some(expansion.into()));
        self
    }

    pub fn undefined(mut self, name: impl Into<String>) -> Self {
        self.0.insert(name.into(), None);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, expansion: Option<String>) {
        self.0.insert(name.into(), expansion);
    }

    pub fn get(&self, name: &str) -> Option<&Option<String>> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

impl fmt::Display for SignificantMacros {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match value {
                Some(v) => write!(f, "{}={}", name, v)?,
                None => write!(f, "!{}", name)?,
            }
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FileState {
    Indexed,
    /// The last update of this file failed; its content is stale.
    Failed { reason: String },
}

/// One variant of a source file: a location parsed under one macro context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub location: LocationKey,
    pub linkage: Linkage,
    /// xxh3 of the file content.
    pub fingerprint: u64,
    /// Modification time in milliseconds since the epoch.
    pub timestamp: i64,
    pub significant_macros: SignificantMacros,
    pub includes: Vec<IncludeRecord>,
    pub macros: Vec<MacroRecord>,
    pub names: Vec<NameId>,
    pub state: FileState,
}

impl FileRecord {
    /// Macro definitions of this file, skipping `#undef`s.
    pub fn defined_macros(&self) -> impl Iterator<Item = &MacroRecord> {
        self.macros.iter().filter(|m| m.is_definition())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, FileState::Failed { .. })
    }

    pub fn variant_key(&self) -> (LocationKey, SignificantMacros, Linkage) {
        (
            self.location.clone(),
            self.significant_macros.clone(),
            self.linkage,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeRecord {
    pub includer: FileId,
    /// `None` when the directive could not be resolved.
    pub target: Option<LocationKey>,
    /// Macro context of the included variant.
    #[serde(default)]
    pub target_macros: SignificantMacros,
    pub directive: String,
    pub offset: u32,
    pub name_offset: u32,
    pub name_length: u32,
    pub system: bool,
    pub active: bool,
}

impl IncludeRecord {
    pub fn is_resolved(&self) -> bool {
        self.target.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroRecord {
    pub name: String,
    /// `None` for `#undef`.
    pub expansion: Option<String>,
    pub offset: u32,
}

impl MacroRecord {
    pub fn is_definition(&self) -> bool {
        self.expansion.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassKey {
    Class,
    Struct,
    Union,
}

impl ClassKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassKey::Class => "class",
            ClassKey::Struct => "struct",
            ClassKey::Union => "union",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstValue {
    Known(i64),
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingKind {
    Namespace,
    Class { key: ClassKey },
    Enumeration,
    Enumerator { value: ConstValue },
    Typedef,
    Function { is_virtual: bool },
    Variable { value: ConstValue },
    Field,
}

impl BindingKind {
    /// Identity part of the kind. Payloads never change a binding's identity.
    pub fn tag(&self) -> &'static str {
        match self {
            BindingKind::Namespace => "namespace",
            BindingKind::Class { .. } => "class",
            BindingKind::Enumeration => "enum",
            BindingKind::Enumerator { .. } => "enumerator",
            BindingKind::Typedef => "typedef",
            BindingKind::Function { .. } => "function",
            BindingKind::Variable { .. } => "variable",
            BindingKind::Field => "field",
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, BindingKind::Function { .. })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, BindingKind::Function { is_virtual: true })
    }

    /// Folds the payload of another occurrence of the same binding into this
    /// one. Returns true when the binding became virtual.
    pub fn merge(&mut self, other: &BindingKind) -> bool {
        match (self, other) {
            (BindingKind::Function { is_virtual }, BindingKind::Function { is_virtual: v }) => {
                let became = !*is_virtual && *v;
                *is_virtual |= *v;
                became
            }
            (BindingKind::Enumerator { value }, BindingKind::Enumerator { value: v })
            | (BindingKind::Variable { value }, BindingKind::Variable { value: v }) => {
                if let ConstValue::Known(_) = v {
                    *value = *v;
                }
                false
            }
            _ => false,
        }
    }

    /// Same kind with payloads reset; used for bindings created on behalf of
    /// another occurrence, such as a primary template.
    pub fn bare(&self) -> BindingKind {
        match self {
            BindingKind::Class { key } => BindingKind::Class { key: *key },
            BindingKind::Enumerator { .. } => BindingKind::Enumerator {
                value: ConstValue::Unknown,
            },
            BindingKind::Function { .. } => BindingKind::Function { is_virtual: false },
            BindingKind::Variable { .. } => BindingKind::Variable {
                value: ConstValue::Unknown,
            },
            other => other.clone(),
        }
    }

    pub fn value(&self) -> Option<ConstValue> {
        match self {
            BindingKind::Enumerator { value } | BindingKind::Variable { value } => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "template", rename_all = "snake_case")]
pub enum TemplateLink {
    #[default]
    None,
    Primary { instances: Vec<BindingId> },
    Instance { primary: BindingId },
}

/// Identity of a binding across fragments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingKey {
    pub qualified_name: Vec<String>,
    pub tag: &'static str,
    pub linkage: Linkage,
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.tag,
            self.qualified_name.join("::"),
            self.linkage
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub id: BindingId,
    pub qualified_name: Vec<String>,
    pub kind: BindingKind,
    pub linkage: Linkage,
    #[serde(default)]
    pub template: TemplateLink,
    /// Compiler-synthesized member.
    #[serde(default)]
    pub implicit: bool,
    pub names: Vec<NameId>,
}

impl BindingRecord {
    pub fn name(&self) -> &str {
        self.qualified_name.last().map(String::as_str).unwrap_or("")
    }

    pub fn qualified(&self) -> String {
        self.qualified_name.join("::")
    }

    pub fn is_file_scope(&self) -> bool {
        self.qualified_name.len() == 1
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            qualified_name: self.qualified_name.clone(),
            tag: self.kind.tag(),
            linkage: self.linkage,
        }
    }
}

/// Description of the entity an occurrence refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRef {
    pub qualified_name: Vec<String>,
    pub kind: BindingKind,
    pub linkage: Linkage,
    /// Qualified name of the primary template when this is an instance.
    #[serde(default)]
    pub instance_of: Option<Vec<String>>,
    #[serde(default)]
    pub implicit: bool,
}

impl SymbolRef {
    pub fn new(qualified_name: Vec<String>, kind: BindingKind, linkage: Linkage) -> Self {
        Self {
            qualified_name,
            kind,
            linkage,
            instance_of: None,
            implicit: false,
        }
    }

    pub fn key(&self) -> BindingKey {
        BindingKey {
            qualified_name: self.qualified_name.clone(),
            tag: self.kind.tag(),
            linkage: self.linkage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameRole {
    Declaration,
    Definition,
    Reference,
}

impl NameRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NameRole::Declaration => "declaration",
            NameRole::Definition => "definition",
            NameRole::Reference => "reference",
        }
    }
}

/// One physical occurrence of a binding's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRecord {
    pub id: NameId,
    pub file: FileId,
    pub offset: u32,
    pub length: u32,
    pub role: NameRole,
    pub binding: BindingId,
    /// Innermost enclosing definition; `None` at file scope and for definitions.
    pub enclosing: Option<NameId>,
    pub is_read: bool,
    pub is_write: bool,
    /// Written with an explicit qualifier (`A::f`).
    #[serde(default)]
    pub qualified: bool,
    pub could_be_polymorphic: bool,
}

impl NameRecord {
    pub fn is_declaration(&self) -> bool {
        self.role == NameRole::Declaration
    }

    pub fn is_definition(&self) -> bool {
        self.role == NameRole::Definition
    }

    pub fn is_reference(&self) -> bool {
        self.role == NameRole::Reference
    }

    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

/// Selects occurrence roles in [`crate::index::FragmentData::find_names`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NameMask(u8);

impl NameMask {
    pub const DECLARATIONS: NameMask = NameMask(1);
    pub const DEFINITIONS: NameMask = NameMask(2);
    pub const REFERENCES: NameMask = NameMask(4);
    pub const DECLARATIONS_DEFINITIONS: NameMask = NameMask(3);
    pub const ALL: NameMask = NameMask(7);

    pub fn accepts(self, role: NameRole) -> bool {
        let bit = match role {
            NameRole::Declaration => Self::DECLARATIONS.0,
            NameRole::Definition => Self::DEFINITIONS.0,
            NameRole::Reference => Self::REFERENCES.0,
        };
        self.0 & bit != 0
    }
}

impl BitOr for NameMask {
    type Output = NameMask;

    fn bitor(self, rhs: NameMask) -> NameMask {
        NameMask(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub files: usize,
    pub bindings: usize,
    pub names: usize,
    pub failed_files: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_merge_keeps_virtual_and_values() {
        let mut f = BindingKind::Function { is_virtual: false };
        assert!(f.merge(&BindingKind::Function { is_virtual: true }));
        assert!(!f.merge(&BindingKind::Function { is_virtual: false }));
        assert!(f.is_virtual());

        let mut v = BindingKind::Variable {
            value: ConstValue::Unknown,
        };
        v.merge(&BindingKind::Variable {
            value: ConstValue::Known(4),
        });
        v.merge(&BindingKind::Variable {
            value: ConstValue::Unknown,
        });
        assert_eq!(v.value(), Some(ConstValue::Known(4)));
    }

    #[test]
    fn test_key_ignores_payload() {
        let a = SymbolRef::new(
            vec!["A".into()],
            BindingKind::Class {
                key: ClassKey::Struct,
            },
            Linkage::Cpp,
        );
        let b = SymbolRef::new(
            vec!["A".into()],
            BindingKind::Class {
                key: ClassKey::Class,
            },
            Linkage::Cpp,
        );
        assert_eq!(a.key(), b.key());
        let c = SymbolRef::new(vec!["A".into()], BindingKind::Typedef, Linkage::Cpp);
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_significant_macros_display_and_order() {
        let macros = SignificantMacros::new().undefined("B").defined("A", "1");
        assert_eq!(macros.to_string(), "{A=1,!B}");
        assert_eq!(macros.get("B"), Some(&None));
        assert_eq!(macros.len(), 2);
    }

    #[test]
    fn test_name_mask() {
        let mask = NameMask::DECLARATIONS | NameMask::REFERENCES;
        assert!(mask.accepts(NameRole::Declaration));
        assert!(mask.accepts(NameRole::Reference));
        assert!(!mask.accepts(NameRole::Definition));
        assert!(NameMask::ALL.accepts(NameRole::Definition));
    }

    #[test]
    fn test_defined_macros_skips_undefs() {
        let file = FileRecord {
            id: FileId(0),
            location: LocationKey::workspace("p", "a.h"),
            linkage: Linkage::Cpp,
            fingerprint: 0,
            timestamp: 0,
            significant_macros: SignificantMacros::new(),
            includes: Vec::new(),
            macros: vec![
                MacroRecord {
                    name: "X".into(),
                    expansion: Some("1".into()),
                    offset: 0,
                },
                MacroRecord {
                    name: "X".into(),
                    expansion: None,
                    offset: 12,
                },
                MacroRecord {
                    name: "X".into(),
                    expansion: Some("2".into()),
                    offset: 22,
                },
            ],
            names: Vec::new(),
            state: FileState::Indexed,
        };
        assert_eq!(file.defined_macros().count(), 2);
        assert_eq!(file.macros.len(), 3);
    }
}
