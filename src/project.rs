use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::engine::scheduler::{JobQueue, Scheduler, SchedulerHandle};
use crate::engine::CacheEngine;
use std::path::Path;
use std::sync::Arc;

/// Everything bound to one open project root: configuration, the engine and,
/// once started, its scheduler.
///
/// Dropping the project (or calling [`Project::close`]) flushes and stops the
/// scheduler before the store is released.
pub struct Project {
    config: Config,
    engine: Arc<CacheEngine>,
    scheduler: Option<SchedulerHandle>,
}

impl Project {
    /// Open the project at `root`. A malformed config file is logged and the
    /// defaults are used instead.
    pub fn open(root: &Path) -> Result<Self> {
        let root = root.canonicalize()?;
        let config = match Config::load(&root) {
            Ok(config) => config,
            Err(Error::Config(msg)) => {
                tracing::warn!(error = %msg, "falling back to default configuration");
                Config::new(&root)
            }
            Err(e) => return Err(e),
        };
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let engine = Arc::new(CacheEngine::open(&config)?);
        tracing::debug!(root = %config.project_root.display(), "project opened");
        Ok(Self {
            config,
            engine,
            scheduler: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    /// Start the background scheduler if it is not running yet
    pub fn start_scheduler(&mut self) -> Result<JobQueue> {
        if let Some(scheduler) = &self.scheduler {
            return Ok(scheduler.queue());
        }
        let handle = Scheduler::start(Arc::clone(&self.engine), &self.config)?;
        let queue = handle.queue();
        self.scheduler = Some(handle);
        Ok(queue)
    }

    pub fn close(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.close();
        }
        tracing::debug!(root = %self.config.project_root.display(), "project closed");
    }
}
