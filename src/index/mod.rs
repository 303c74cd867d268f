pub mod arena;
pub mod composite;
pub mod filter;
pub mod fragment;
pub mod lock;
pub mod migrations;
pub mod models;
pub mod sqlite;
pub mod store;

pub use composite::{CompositeBinding, CompositeName, CompositeView};
pub use filter::{Filter, IndexFilter};
pub use fragment::{
    ApplyOutcome, FileUpdate, FragmentData, NamePattern, NameUpdate, StagedOp,
};
pub use models::*;
pub use store::{FragmentId, FragmentStore, ReadGuard, WriteTransaction};
