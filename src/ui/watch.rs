use crate::core::error::{Error, Result};
use crate::engine::scheduler::{Job, JobQueue};
use crate::indexing::discovery::ProjectLayout;
use notify_debouncer_full::{
    new_debouncer,
    notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Quiet period before a burst of file events is delivered
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Modified,
    Deleted,
}

/// A change to a tracked file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn into_job(self) -> Job {
        Job::Invalidate(self.path)
    }
}

/// Translate raw notify events into changes of tracked files.
///
/// Access events are ignored; paths outside the layout are filtered out. When
/// one path appears several times the last event wins.
pub fn collect_events<'a>(
    layout: &ProjectLayout,
    events: impl IntoIterator<Item = &'a Event>,
) -> Vec<WatchEvent> {
    let mut latest = BTreeMap::new();
    for event in events {
        let removed = match event.kind {
            EventKind::Remove(_) => true,
            EventKind::Create(_) | EventKind::Modify(_) => false,
            _ => continue,
        };
        for path in &event.paths {
            if layout.is_candidate(path).is_none() {
                tracing::debug!(path = %path.display(), "ignoring event for untracked path");
                continue;
            }
            let kind = if removed || !path.exists() {
                WatchEventKind::Deleted
            } else {
                WatchEventKind::Modified
            };
            latest.insert(path.clone(), kind);
        }
    }
    latest
        .into_iter()
        .map(|(path, kind)| WatchEvent { path, kind })
        .collect()
}

/// Watches the project root and queues an invalidation for every tracked
/// change. The callback never blocks; a full queue drops the event.
pub struct FileWatcher {
    _debouncer: Debouncer<RecommendedWatcher, FileIdMap>,
}

impl FileWatcher {
    pub fn start(layout: ProjectLayout, queue: JobQueue, debounce: Duration) -> Result<Self> {
        let root = layout.root().to_path_buf();

        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    let changes = collect_events(&layout, events.iter().map(|e| &e.event));
                    for change in changes {
                        tracing::debug!(path = %change.path.display(), kind = ?change.kind, "file changed");
                        queue.enqueue(change.into_job());
                    }
                }
                Err(errors) => {
                    for error in errors {
                        tracing::warn!(error = %error, "file watcher error");
                    }
                }
            }
        })
        .map_err(|e| Error::Watch(format!("Failed to create file watcher: {}", e)))?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| Error::Watch(format!("Failed to watch {}: {}", root.display(), e)))?;

        tracing::info!(root = %root.display(), "watching for changes");
        Ok(Self {
            _debouncer: debouncer,
        })
    }
}
