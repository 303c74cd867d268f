pub mod config;
pub mod error;
pub mod index;
pub mod indexer;
pub mod location;
pub mod manager;
pub mod project;
pub mod snapshot;

pub use config::{ProjectConfig, WorkspaceConfig, WorkspaceSettings, CONFIG_FILE_NAME};
pub use error::{IndexerError, Result};
pub use index::{
    BindingKey, BindingKind, BindingRecord, CompositeBinding, CompositeName, CompositeView,
    FileRecord, FileState, Filter, FragmentData, FragmentId, FragmentStore, IndexFilter,
    IndexStats, Linkage, NameMask, NameRecord, NameRole,
};
pub use indexer::{
    BindingResolver, Coordinator, EventBus, FileSet, IndexEvent, IndexerState, IndexerStrategy,
    IndexChangeEvent, ResourceEvent, SourceParser, TreeSitterFrontend, UpdateTask,
};
pub use location::{LocationConverter, LocationKey, LocationRegistry, ProjectRelativeConverter};
pub use manager::{IndexHandle, IndexManager};
pub use project::{Direction, ProjectGraph};
pub use snapshot::{ExportOptions, ImportOptions, SnapshotHeader};
