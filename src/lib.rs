// Core functionality
pub mod core {
    pub mod config;
    pub mod error;
    pub mod model;
}

// Persistent index
pub mod storage {
    pub mod index;
}

// Digests, discovery and extraction
pub mod indexing {
    pub mod digest;
    pub mod discovery;
    pub mod extract;
    pub mod java;
    pub mod mapper_xml;
    pub mod targets;
}

// Cache engine and scheduling
pub mod engine;

// Project-scoped context
pub mod project;

// User interfaces
pub mod ui {
    pub mod cli;
    pub mod watch;
}

// Re-export commonly used types
pub use core::config::Config;
pub use core::error::{Error, Result};
pub use core::model::{
    CodeElementRecord, ElementKind, FileState, LogicalIdRecords, MarkupElementRecord,
    RefreshScope, TableCounts,
};
pub use engine::progress::{CancellationToken, LogProgress, ProgressSink, RefreshReport, ScanReport};
pub use engine::scheduler::{Job, JobQueue, Scheduler, SchedulerHandle};
pub use engine::{CacheEngine, EngineStats, InvalidationOutcome};
pub use indexing::digest::{compute_digest, compute_digests_parallel, DigestOptions};
pub use indexing::discovery::ProjectLayout;
pub use indexing::extract::{Extractors, SourceFile};
pub use project::Project;
pub use storage::index::IndexStore;
pub use ui::cli;
pub use ui::watch::FileWatcher;
