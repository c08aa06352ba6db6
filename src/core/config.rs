use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project data directory
pub const DATA_DIR_NAME: &str = ".mapperlink";

const CONFIG_FILE_NAME: &str = "config.toml";
const STORE_FILE_NAME: &str = "index.redb";

/// Configuration for one project root
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project root all relative paths are resolved against
    #[serde(skip)]
    pub project_root: PathBuf,
    /// Directory holding the store and the project config file
    #[serde(skip)]
    pub data_dir: PathBuf,
    /// Path to the index store
    #[serde(skip)]
    pub store_path: PathBuf,

    /// Source roots, relative to the project root
    pub source_roots: Vec<PathBuf>,
    /// Directory names never descended into
    pub excluded_dirs: Vec<String>,
    /// Extensions of code files (declarations and usages)
    pub code_extensions: Vec<String>,
    /// Extensions of markup files (mapper statements)
    pub markup_extensions: Vec<String>,
    /// Fully-qualified class patterns whose string-first methods are call-site targets.
    /// Empty means the built-in list.
    pub target_class_patterns: Vec<String>,
    pub scan_interval_secs: u64,
    pub digest_timeout_ms: u64,
    pub digest_batch_timeout_ms: u64,
    /// Capacity of the scheduler's job queue
    pub queue_capacity: usize,
    /// Extraction threads; 0 means one per CPU
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: PathBuf::new(),
            data_dir: PathBuf::new(),
            store_path: PathBuf::new(),
            source_roots: vec![PathBuf::from(".")],
            excluded_dirs: [
                "target",
                "build",
                "out",
                ".git",
                ".idea",
                ".gradle",
                "node_modules",
                DATA_DIR_NAME,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            code_extensions: vec!["java".to_string()],
            markup_extensions: vec!["xml".to_string()],
            target_class_patterns: Vec::new(),
            scan_interval_secs: 300,
            digest_timeout_ms: 5_000,
            digest_batch_timeout_ms: 60_000,
            queue_capacity: 1024,
            worker_threads: 0,
        }
    }
}

impl Config {
    /// Create a default configuration rooted at `project_root`
    pub fn new(project_root: &Path) -> Self {
        let mut config = Self::default();
        config.set_root(project_root);
        config
    }

    /// Load the configuration for `project_root`.
    ///
    /// The project file `<root>/.mapperlink/config.toml` wins over the user-wide
    /// `<config_dir>/mapperlink/config.toml`; with neither present the defaults apply.
    pub fn load(project_root: &Path) -> Result<Self> {
        let project_file = project_root.join(DATA_DIR_NAME).join(CONFIG_FILE_NAME);
        let candidates = std::iter::once(project_file).chain(Self::user_config_path());

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let mut config: Config = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            config.set_root(project_root);
            tracing::debug!(path = %path.display(), "loaded configuration");
            return Ok(config);
        }

        Ok(Self::new(project_root))
    }

    /// User-wide configuration file, if a config directory can be determined
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mapperlink").join(CONFIG_FILE_NAME))
    }

    /// Path of the project-level configuration file
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE_NAME)
    }

    /// Create the data directory
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Check if the data directory and config file exist
    pub fn is_initialized(&self) -> bool {
        self.data_dir.exists() && self.config_path().exists()
    }

    /// Write this configuration to the project config file
    pub fn save(&self) -> Result<()> {
        self.init()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(self.config_path(), content)?;
        Ok(())
    }

    /// Source roots resolved against the project root
    pub fn resolved_source_roots(&self) -> Vec<PathBuf> {
        self.source_roots
            .iter()
            .map(|root| {
                if root.is_absolute() {
                    root.clone()
                } else if root == Path::new(".") {
                    self.project_root.clone()
                } else {
                    self.project_root.join(root)
                }
            })
            .collect()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs.max(1))
    }

    pub fn digest_timeout(&self) -> Duration {
        Duration::from_millis(self.digest_timeout_ms)
    }

    pub fn digest_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.digest_batch_timeout_ms)
    }

    /// Worker count with 0 resolved to the available parallelism
    pub fn workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn set_root(&mut self, project_root: &Path) {
        self.project_root = project_root.to_path_buf();
        self.data_dir = project_root.join(DATA_DIR_NAME);
        self.store_path = self.data_dir.join(STORE_FILE_NAME);
    }
}
