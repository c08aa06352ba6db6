use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::model::FileKind;
use ignore::WalkBuilder;
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// A candidate file found under one of the source roots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Store key: path relative to the project root, `/`-separated
    pub relative_path: String,
    pub kind: FileKind,
}

/// Which files of a project are indexed, and how paths map to store keys
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    root: PathBuf,
    source_roots: Vec<PathBuf>,
    excluded_dirs: HashSet<String>,
    code_extensions: Vec<String>,
    markup_extensions: Vec<String>,
}

impl ProjectLayout {
    pub fn from_config(config: &Config) -> Self {
        let lower = |exts: &[String]| -> Vec<String> {
            exts.iter()
                .map(|ext| ext.trim_start_matches('.').to_lowercase())
                .collect()
        };
        Self {
            root: config.project_root.clone(),
            source_roots: config.resolved_source_roots(),
            excluded_dirs: config.excluded_dirs.iter().cloned().collect(),
            code_extensions: lower(&config.code_extensions),
            markup_extensions: lower(&config.markup_extensions),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Route a path by extension alone
    pub fn classify(&self, path: &Path) -> Option<FileKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if self.code_extensions.contains(&ext) {
            Some(FileKind::Code)
        } else if self.markup_extensions.contains(&ext) {
            Some(FileKind::Markup)
        } else {
            None
        }
    }

    /// Recognized extension, inside a source root, and not under an excluded
    /// directory. Works for paths that no longer exist.
    pub fn is_candidate(&self, path: &Path) -> Option<FileKind> {
        let kind = self.classify(path)?;
        let absolute = self.absolutize(path);
        if !self.source_roots.iter().any(|root| absolute.starts_with(root)) {
            return None;
        }
        let relative = absolute.strip_prefix(&self.root).ok()?;
        let excluded = relative.parent().into_iter().flat_map(Path::components).any(|c| {
            matches!(c, Component::Normal(name) if name.to_str().is_some_and(|n| self.excluded_dirs.contains(n)))
        });
        if excluded {
            None
        } else {
            Some(kind)
        }
    }

    /// Store key for a path under the project root
    pub fn relative_key(&self, path: &Path) -> Option<String> {
        let absolute = self.absolutize(path);
        let relative = absolute.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative
            .components()
            .map(|c| match c {
                Component::Normal(name) => name.to_str(),
                _ => None,
            })
            .collect();
        let parts = parts?;
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }

    /// Filesystem path for a store key
    pub fn absolute(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }

    /// Enumerate every candidate file, respecting `.gitignore` rules
    pub fn discover(&self) -> Result<Vec<DiscoveredFile>> {
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "Project root is not a directory: {}",
                self.root.display()
            )));
        }

        let mut found = BTreeMap::new();
        for source_root in &self.source_roots {
            if !source_root.is_dir() {
                tracing::warn!(root = %source_root.display(), "source root does not exist, skipping");
                continue;
            }

            let excluded = self.excluded_dirs.clone();
            let walker = WalkBuilder::new(source_root)
                .hidden(false)
                .git_ignore(true)
                .git_exclude(true)
                .filter_entry(move |entry| {
                    let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
                    !(is_dir && entry.file_name().to_str().is_some_and(|n| excluded.contains(n)))
                })
                .build();

            for result in walker {
                let entry = match result {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to access file during discovery");
                        continue;
                    }
                };
                if !entry.file_type().is_some_and(|t| t.is_file()) {
                    continue;
                }

                let path = entry.path();
                let Some(kind) = self.is_candidate(path) else {
                    continue;
                };
                let Some(relative_path) = self.relative_key(path) else {
                    tracing::debug!(path = %path.display(), "skipping path without a store key");
                    continue;
                };
                found.entry(relative_path.clone()).or_insert(DiscoveredFile {
                    path: path.to_path_buf(),
                    relative_path,
                    kind,
                });
            }
        }

        Ok(found.into_values().collect())
    }

    fn absolutize(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}
