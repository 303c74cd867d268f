//! Read/write classification of reference occurrences.
//!
//! The front end records the chain of expression wrappers around each
//! referenced name (`*p = 1` is `[Deref, AssignTarget]`). The chain is walked
//! outwards while tracking how many levels of indirection separate the value
//! at hand from the named object: taking the address adds a level,
//! dereferencing removes one. The first assigning or passing step decides.
//!
//! | context at level 0                  | read | write |
//! |-------------------------------------|------|-------|
//! | `x = v`                             |      |   x   |
//! | `x += v`, `x++`                     |  x   |   x   |
//! | `f(x)`, by value or const reference |  x   |       |
//! | `f(x)`, non-const reference         |  x   |   x   |
//! | `T& r = x`                          |  x   |   x   |
//! | `f(x)`, callee unknown, C++         |  x   |   x   |
//! | `f(x)`, callee unknown, C           |  x   |       |
//!
//! At level 1 and deeper (`f(&x)`, `f(&&x)` through `T**`) the constness of
//! the matching pointee decides: writable pointees give read and write,
//! const pointees give read. An unknown callee receiving an address counts as
//! a write in both languages. Negative levels (`*p = 1`) only read the named
//! pointer. Declarations and definitions carry neither flag.

use serde::{Deserialize, Serialize};

use crate::index::{Linkage, NameRole};
use crate::indexer::parse::ParamPassing;

/// One expression wrapper around an occurrence, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum AccessStep {
    /// Left operand of `=`.
    AssignTarget,
    /// Left operand of `+=`, `<<=` and friends.
    CompoundAssignTarget,
    /// Operand of `++` or `--`.
    IncDec,
    /// Operand of unary `&`.
    AddressOf,
    /// Operand of unary `*` or the left side of `->`.
    Deref,
    /// Object of `.`; the member is part of the named object.
    MemberOf,
    /// Array of `a[i]`; the element is part of the named object.
    Subscript,
    /// Argument of a call.
    Argument { param: ParamPassing },
    /// Initializer of a reference variable.
    BindReference { is_const: bool },
}

/// Returns `(is_read, is_write)` for an occurrence.
pub fn access_flags(role: NameRole, steps: &[AccessStep], linkage: Linkage) -> (bool, bool) {
    if role != NameRole::Reference {
        return (false, false);
    }
    let mut level: i32 = 0;
    for step in steps {
        match step {
            AccessStep::AddressOf => level += 1,
            AccessStep::Deref => level -= 1,
            AccessStep::MemberOf | AccessStep::Subscript => {}
            AccessStep::AssignTarget => {
                return if level == 0 { (false, true) } else { READ };
            }
            AccessStep::CompoundAssignTarget | AccessStep::IncDec => {
                return if level == 0 { READ_WRITE } else { READ };
            }
            AccessStep::BindReference { is_const } => {
                return if level == 0 && !is_const {
                    READ_WRITE
                } else {
                    READ
                };
            }
            AccessStep::Argument { param } => return argument_flags(param, level, linkage),
        }
    }
    READ
}

const READ: (bool, bool) = (true, false);
const READ_WRITE: (bool, bool) = (true, true);

fn argument_flags(param: &ParamPassing, level: i32, linkage: Linkage) -> (bool, bool) {
    match param {
        ParamPassing::Value => READ,
        ParamPassing::Reference { is_const } => {
            if level == 0 && !is_const {
                READ_WRITE
            } else {
                READ
            }
        }
        ParamPassing::Pointer { levels } => {
            if level <= 0 {
                return READ;
            }
            match levels.get(level as usize - 1) {
                Some(false) => READ_WRITE,
                _ => READ,
            }
        }
        ParamPassing::Unknown => match (level, linkage) {
            (l, _) if l > 0 => READ_WRITE,
            (0, Linkage::Cpp) => READ_WRITE,
            _ => READ,
        },
    }
}
