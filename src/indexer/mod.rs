pub mod access;
pub mod coordinator;
pub mod events;
pub mod frontend;
pub mod parse;
pub mod progress;
pub mod resolver;
pub mod strategy;
pub mod walker;
pub mod watcher;

pub use access::{access_flags, AccessStep};
pub use coordinator::Coordinator;
pub use events::{
    EventBus, IndexChangeEvent, IndexEvent, IndexerState, ListenerToken, ResourceEvent,
};
pub use frontend::TreeSitterFrontend;
pub use parse::{
    NameSyntax, ParamPassing, ParseRequest, ParsedFile, ParsedInclude, ParsedName, SourceParser,
};
pub use progress::{IndexingProgress, ProgressSnapshot};
pub use resolver::BindingResolver;
pub use strategy::{
    strategy_for, FastStrategy, FileSet, FullStrategy, IndexedProject, IndexerStrategy,
    NullStrategy, UpdateTask,
};
pub use walker::FileWalker;
pub use watcher::FileWatcher;
