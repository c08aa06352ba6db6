//! Cache engine: per-file state, invalidation propagation, refresh and scans.

pub mod health;
pub mod progress;
pub mod scheduler;

use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::model::{
    CodeElementRecord, FileKind, FileState, LogicalIdRecords, MarkupElementRecord,
    RefreshScope, TableCounts,
};
use crate::indexing::digest::{compute_digest, compute_digests_parallel, DigestOptions};
use crate::indexing::discovery::{DiscoveredFile, ProjectLayout};
use crate::indexing::extract::{Extractors, SourceFile};
use crate::indexing::targets::TargetSet;
use crate::storage::index::IndexStore;
use health::{Advisory, HealthMonitor};
use progress::{
    CancellationToken, PhaseFailure, Progress, ProgressSink, RefreshReport, ScanReport,
};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

/// What happened to one `invalidate_file` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationOutcome {
    /// Not a tracked file
    Ignored,
    /// Already being reparsed; folded into the running propagation
    Coalesced,
    /// A refresh is running; handled once it finishes
    Deferred,
    Reparsed {
        reparsed: usize,
        purged: usize,
        failed: usize,
    },
}

/// Counters of one propagation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationOutcome {
    pub reparsed: usize,
    pub purged: usize,
    pub failed: usize,
}

impl PropagationOutcome {
    fn touched_store(&self) -> bool {
        self.reparsed + self.purged + self.failed > 0
    }
}

impl AddAssign for PropagationOutcome {
    fn add_assign(&mut self, other: Self) {
        self.reparsed += other.reparsed;
        self.purged += other.purged;
        self.failed += other.failed;
    }
}

/// Snapshot of the engine's in-memory counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub reparsed: u64,
    pub purged: u64,
}

#[derive(Default)]
struct StatsCounters {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    reparsed: AtomicU64,
    purged: AtomicU64,
}

impl StatsCounters {
    fn lookup(&self, found: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if found {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            reparsed: self.reparsed.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Test-and-set flag released on drop
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of extracting one file
enum Extracted {
    Records {
        code: Vec<CodeElementRecord>,
        markup: Vec<MarkupElementRecord>,
        digest: String,
    },
    /// Gone from disk or no longer a candidate
    Missing,
    Failed(Error),
}

/// One pass of a refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Markup,
    Code,
    Usage,
}

impl Phase {
    fn for_scope(scope: RefreshScope) -> Vec<Phase> {
        let mut phases = Vec::new();
        if scope.includes_markup() {
            phases.push(Phase::Markup);
        }
        if scope.includes_code() {
            phases.push(Phase::Code);
        }
        if scope.includes_usage() {
            phases.push(Phase::Usage);
        }
        phases
    }

    fn name(&self) -> &'static str {
        match self {
            Phase::Markup => "markup",
            Phase::Code => "code",
            Phase::Usage => "usage",
        }
    }

    fn file_kind(&self) -> FileKind {
        match self {
            Phase::Markup => FileKind::Markup,
            Phase::Code | Phase::Usage => FileKind::Code,
        }
    }
}

/// Per-phase tallies folded into the refresh report
#[derive(Default)]
struct PhaseTally {
    processed: usize,
    failed: usize,
    written: usize,
}

/// The cache engine for one project root.
///
/// All mutation of the index goes through here. A scan and a refresh never run
/// at the same time; invalidations are serialized against each other and
/// deferred while a refresh runs.
pub struct CacheEngine {
    layout: ProjectLayout,
    store: IndexStore,
    extractors: Extractors,
    digest_options: DigestOptions,
    pool: rayon::ThreadPool,
    chunk_size: usize,
    states: Mutex<HashMap<String, FileState>>,
    requeued: Mutex<BTreeSet<String>>,
    deferred: Mutex<BTreeSet<String>>,
    propagation: Mutex<()>,
    busy: AtomicBool,
    refreshing: AtomicBool,
    version: AtomicU64,
    targets: RwLock<Option<Arc<TargetSet>>>,
    health: HealthMonitor,
    stats: StatsCounters,
}

impl CacheEngine {
    /// Open the project's store and wire up the built-in extractors
    pub fn open(config: &Config) -> Result<Self> {
        let store = IndexStore::open(&config.store_path)?;
        let extractors = Extractors::with_patterns(&config.target_class_patterns)?;
        Self::new(config, store, extractors)
    }

    pub fn new(config: &Config, store: IndexStore, extractors: Extractors) -> Result<Self> {
        let workers = config.workers();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("mapperlink-extract-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("Failed to start extraction workers: {}", e)))?;

        Ok(Self {
            layout: ProjectLayout::from_config(config),
            store,
            extractors,
            digest_options: DigestOptions::from_config(config),
            pool,
            chunk_size: workers * 4,
            states: Mutex::new(HashMap::new()),
            requeued: Mutex::new(BTreeSet::new()),
            deferred: Mutex::new(BTreeSet::new()),
            propagation: Mutex::new(()),
            busy: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            version: AtomicU64::new(1),
            targets: RwLock::new(None),
            health: HealthMonitor::new(),
            stats: StatsCounters::default(),
        })
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    // ---- queries ----

    /// Logical ids of every record owned by `file` (absolute or root-relative)
    pub fn get_logical_ids_for(&self, file: &Path) -> Result<BTreeSet<String>> {
        let Some(key) = self.layout.relative_key(file) else {
            self.stats.lookup(false);
            return Ok(BTreeSet::new());
        };
        let ids = self.store.query_logical_ids_by_file(&key)?;
        self.stats.lookup(!ids.is_empty());
        Ok(ids)
    }

    /// Files owning at least one record under any of `logical_ids`
    pub fn get_files_for<I, S>(&self, logical_ids: I) -> Result<BTreeSet<String>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = logical_ids.into_iter().map(Into::into).collect();
        let files = self.store.find_files_by_logical_ids(&ids)?;
        self.stats.lookup(!files.is_empty());
        Ok(files)
    }

    /// Both sides of a logical id
    pub fn records_for(&self, logical_id: &str) -> Result<LogicalIdRecords> {
        let records = self.store.query_by_logical_id(logical_id)?;
        self.stats.lookup(!records.is_empty());
        Ok(records)
    }

    pub fn get_cache_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_version_current(&self, version: u64) -> bool {
        version == self.get_cache_version()
    }

    pub fn counts(&self) -> Result<TableCounts> {
        self.store.counts_by_table()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.snapshot()
    }

    /// Lifecycle state of `file`; untracked files with a stored digest are Fresh
    pub fn file_state(&self, file: &Path) -> Result<FileState> {
        let Some(key) = self.layout.relative_key(file) else {
            return Ok(FileState::Unknown);
        };
        if let Some(state) = lock(&self.states).get(&key) {
            return Ok(*state);
        }
        Ok(match self.store.digest_for(&key)? {
            Some(_) => FileState::Fresh,
            None => FileState::Unknown,
        })
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    // ---- health ----

    /// Raise an advisory if the table counts look inconsistent.
    ///
    /// Silent while a refresh runs and after an advisory was already raised.
    pub fn run_health_check(&self) -> Result<Option<Advisory>> {
        if self.is_refreshing() {
            return Ok(None);
        }
        let counts = self.store.counts_by_table()?;
        let advisory = self.health.check(&counts);
        if let Some(advisory) = &advisory {
            tracing::warn!(
                scope = %advisory.suggested_scope,
                code = counts.code,
                markup = counts.markup,
                digests = counts.digests,
                usages = counts.usages,
                "{}",
                advisory
            );
        }
        Ok(advisory)
    }

    pub fn dismiss_advisory(&self) {
        self.health.dismiss();
    }

    pub fn reset_advisory(&self) {
        self.health.reset();
    }

    // ---- invalidation ----

    /// React to a change or deletion of `path`.
    ///
    /// Every file sharing a logical id with `path` is reparsed along with it.
    pub fn invalidate_file(&self, path: &Path) -> Result<InvalidationOutcome> {
        let Some(key) = self.tracked_key(path) else {
            tracing::debug!(path = %path.display(), "ignoring untracked path");
            return Ok(InvalidationOutcome::Ignored);
        };
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);

        if self.is_refreshing() {
            tracing::debug!(path = %key, "refresh running, deferring invalidation");
            lock(&self.deferred).insert(key);
            return Ok(InvalidationOutcome::Deferred);
        }

        let claimed = self.claim(std::iter::once(key));
        if claimed.is_empty() {
            return Ok(InvalidationOutcome::Coalesced);
        }

        let mut outcome = self.propagate(claimed)?;
        outcome += self.drain_requeued()?;
        if outcome.touched_store() {
            self.bump_version();
        }
        Ok(InvalidationOutcome::Reparsed {
            reparsed: outcome.reparsed,
            purged: outcome.purged,
            failed: outcome.failed,
        })
    }

    fn tracked_key(&self, path: &Path) -> Option<String> {
        self.layout.is_candidate(path)?;
        self.layout.relative_key(path)
    }

    /// Move `keys` to Reparsing. Keys already being reparsed are requeued and
    /// left out of the result.
    fn claim(&self, keys: impl IntoIterator<Item = String>) -> BTreeSet<String> {
        let mut states = lock(&self.states);
        let mut claimed = BTreeSet::new();
        for key in keys {
            if states.get(&key) == Some(&FileState::Reparsing) {
                lock(&self.requeued).insert(key);
            } else {
                states.insert(key.clone(), FileState::Reparsing);
                claimed.insert(key);
            }
        }
        claimed
    }

    fn set_state(&self, key: &str, state: FileState) {
        lock(&self.states).insert(key.to_string(), state);
    }

    /// Re-run requeued files whose content changed since their last commit
    fn drain_requeued(&self) -> Result<PropagationOutcome> {
        let mut total = PropagationOutcome::default();
        loop {
            let pending = std::mem::take(&mut *lock(&self.requeued));
            if pending.is_empty() {
                return Ok(total);
            }
            let changed: Vec<String> = pending
                .into_iter()
                .filter(|key| self.needs_reparse(key))
                .collect();
            let claimed = self.claim(changed);
            if !claimed.is_empty() {
                total += self.propagate(claimed)?;
            }
        }
    }

    fn needs_reparse(&self, key: &str) -> bool {
        let stored = match self.store.digest_for(key) {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(path = %key, error = %e, "failed to read stored digest");
                return true;
            }
        };
        match (compute_digest(&self.layout.absolute(key)), stored) {
            (Ok(current), Some(stored)) => current != stored,
            (Err(_), None) => false,
            _ => true,
        }
    }

    /// Purge every logical id owned by `changed` and rebuild all files that
    /// shared one of them. Callers must have claimed `changed`.
    fn propagate(&self, changed: BTreeSet<String>) -> Result<PropagationOutcome> {
        let _serial = lock(&self.propagation);
        let mut touched = changed.clone();
        let result = self.propagate_locked(&changed, &mut touched);
        if result.is_err() {
            let mut states = lock(&self.states);
            for key in &touched {
                if states.get(key) == Some(&FileState::Reparsing) {
                    states.insert(key.clone(), FileState::Stale);
                }
            }
        }
        result
    }

    fn propagate_locked(
        &self,
        changed: &BTreeSet<String>,
        touched: &mut BTreeSet<String>,
    ) -> Result<PropagationOutcome> {
        let mut ids = BTreeSet::new();
        for key in changed {
            ids.extend(self.store.query_logical_ids_by_file(key)?);
        }
        let mut affected = self.store.find_files_by_logical_ids(&ids)?;
        affected.extend(changed.iter().cloned());
        // Nothing below the purge may bail out, or the purged rows are lost
        let targets = self.targets()?;
        {
            let mut states = lock(&self.states);
            for key in &affected {
                states.insert(key.clone(), FileState::Reparsing);
            }
        }
        touched.extend(affected.iter().cloned());

        let removed = self.store.delete_by_logical_ids(&ids)?;
        tracing::debug!(
            changed = changed.len(),
            affected = affected.len(),
            ids = ids.len(),
            removed,
            "propagating invalidation"
        );

        let keys: Vec<&String> = affected.iter().collect();
        let extracted: Vec<(&String, Extracted)> = self.pool.install(|| {
            keys.par_iter()
                .map(|key| (*key, self.extract_tracked(key, &targets)))
                .collect()
        });

        let mut outcome = PropagationOutcome::default();
        for (key, result) in extracted {
            match result {
                Extracted::Records {
                    code,
                    markup,
                    digest,
                } => match self.store.commit_file(key, &code, &markup, &digest) {
                    Ok(_) => {
                        self.set_state(key, FileState::Fresh);
                        outcome.reparsed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %key, error = %e, "failed to commit reparsed file");
                        self.purge_failed(key);
                        outcome.failed += 1;
                    }
                },
                Extracted::Missing => match self.store.delete_by_file(key) {
                    Ok(_) => {
                        self.set_state(key, FileState::Unknown);
                        outcome.purged += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %key, error = %e, "failed to purge deleted file");
                        self.set_state(key, FileState::Stale);
                        outcome.failed += 1;
                    }
                },
                Extracted::Failed(e) => {
                    tracing::warn!(path = %key, error = %e, "failed to reparse file");
                    self.purge_failed(key);
                    outcome.failed += 1;
                }
            }
        }

        self.stats
            .reparsed
            .fetch_add(outcome.reparsed as u64, Ordering::Relaxed);
        self.stats
            .purged
            .fetch_add(outcome.purged as u64, Ordering::Relaxed);
        Ok(outcome)
    }

    /// Drop a failed file's rows so the next scan sees it as new and retries
    fn purge_failed(&self, key: &str) {
        if let Err(e) = self.store.delete_by_file(key) {
            tracing::warn!(path = %key, error = %e, "failed to purge file after failure");
        }
        self.set_state(key, FileState::Stale);
    }

    /// Full extraction of a tracked file: declarations and usages for code
    fn extract_tracked(&self, key: &str, targets: &TargetSet) -> Extracted {
        let path = self.layout.absolute(key);
        let Some(kind) = self.layout.is_candidate(&path) else {
            return Extracted::Missing;
        };
        let file = match self.read_source(&path, key) {
            Ok(Some(file)) => file,
            Ok(None) => return Extracted::Missing,
            Err(e) => return Extracted::Failed(e),
        };

        let result = match kind {
            FileKind::Markup => self
                .extractors
                .markup
                .extract_markup(&file)
                .map(|markup| (Vec::new(), markup)),
            FileKind::Code => self.extractors.code.extract_code(&file).and_then(|mut code| {
                code.extend(self.extractors.code.extract_usages(&file, targets)?);
                Ok((code, Vec::new()))
            }),
        };
        match result {
            Ok((code, markup)) => Extracted::Records {
                code,
                markup,
                digest: file.digest,
            },
            Err(e) => Extracted::Failed(e),
        }
    }

    fn read_source(&self, path: &Path, key: &str) -> Result<Option<SourceFile>> {
        match SourceFile::read(path, key) {
            Ok(file) => Ok(Some(file)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cached target set, resolved from the project's code files on first use
    fn targets(&self) -> Result<Arc<TargetSet>> {
        if let Some(targets) = self
            .targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return Ok(Arc::clone(targets));
        }

        let code_files: Vec<DiscoveredFile> = self
            .layout
            .discover()?
            .into_iter()
            .filter(|f| f.kind == FileKind::Code)
            .collect();
        let sources = self.read_sources(&code_files);
        self.resolve_targets(&sources)
    }

    fn resolve_targets(&self, sources: &[SourceFile]) -> Result<Arc<TargetSet>> {
        let targets = Arc::new(self.extractors.targets.resolve(sources)?);
        *self.targets.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&targets));
        Ok(targets)
    }

    /// Read files in parallel, skipping (and logging) those that fail
    fn read_sources(&self, files: &[DiscoveredFile]) -> Vec<SourceFile> {
        self.pool.install(|| {
            files
                .par_iter()
                .filter_map(|f| match SourceFile::read(&f.path, &f.relative_path) {
                    Ok(source) => Some(source),
                    Err(e) => {
                        tracing::debug!(path = %f.relative_path, error = %e, "skipping unreadable source");
                        None
                    }
                })
                .collect()
        })
    }

    fn bump_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ---- periodic scan ----

    /// Reconcile the store with the files on disk.
    ///
    /// Returns `None` without doing anything when a scan or refresh is already
    /// running.
    pub fn periodic_scan(&self) -> Result<Option<ScanReport>> {
        let Some(_busy) = FlagGuard::try_acquire(&self.busy) else {
            tracing::debug!("scan already in flight, dropping request");
            return Ok(None);
        };

        let stored = self.store.all_digests()?;
        let mut report = ScanReport::default();
        let mut changed = BTreeSet::new();

        let mut existing: Vec<(PathBuf, &String)> = Vec::new();
        for key in stored.keys() {
            let path = self.layout.absolute(key);
            if path.is_file() && self.layout.is_candidate(&path).is_some() {
                existing.push((path, key));
            } else {
                report.deleted += 1;
                changed.insert(key.clone());
            }
        }

        let paths: Vec<PathBuf> = existing.iter().map(|(path, _)| path.clone()).collect();
        let digests = compute_digests_parallel(&paths, &self.digest_options)?;
        for (path, key) in &existing {
            match digests.get(path) {
                Some(digest) if Some(digest) != stored.get(*key) => {
                    report.changed += 1;
                    changed.insert((*key).clone());
                }
                Some(_) => {}
                None => {
                    // Keep the stored rows; the next cycle hashes it again
                    report.unreadable += 1;
                    self.set_state(key, FileState::Stale);
                }
            }
        }

        for file in self.layout.discover()? {
            if !stored.contains_key(&file.relative_path) {
                report.added += 1;
                changed.insert(file.relative_path);
            }
        }

        if !changed.is_empty() {
            {
                let mut states = lock(&self.states);
                for key in &changed {
                    if states.get(key) != Some(&FileState::Reparsing) {
                        states.insert(key.clone(), FileState::Stale);
                    }
                }
            }
            let claimed = self.claim(changed);
            let mut outcome = PropagationOutcome::default();
            if !claimed.is_empty() {
                outcome += self.propagate(claimed)?;
            }
            outcome += self.drain_requeued()?;
            report.reparsed = outcome.reparsed;
            report.failed = outcome.failed;
            self.bump_version();
        }

        if report.has_changes() || report.unreadable > 0 {
            tracing::info!(
                changed = report.changed,
                deleted = report.deleted,
                added = report.added,
                unreadable = report.unreadable,
                failed = report.failed,
                version = self.get_cache_version(),
                "periodic scan finished"
            );
        }
        Ok(Some(report))
    }

    // ---- refresh ----

    pub fn refresh_all(
        &self,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        self.refresh_scope(RefreshScope::All, sink, cancel)
    }

    /// Rebuild the part of the index named by `scope`.
    ///
    /// Store failures abort only the phase they happen in and are listed in the
    /// report. Fails with `Error::Busy` when a scan or refresh is running.
    pub fn refresh_scope(
        &self,
        scope: RefreshScope,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport> {
        let Some(busy) = FlagGuard::try_acquire(&self.busy) else {
            return Err(Error::Busy);
        };
        let refreshing = FlagGuard::try_acquire(&self.refreshing);
        self.health.disarm();

        let started = Instant::now();
        let mut report = RefreshReport::new(scope);
        let mut progress = Progress::new(sink);
        tracing::info!(scope = %scope, "refresh started");

        self.run_phases(scope, &mut progress, cancel, &mut report);

        drop(refreshing);
        self.process_deferred(&mut report);
        drop(busy);

        report.version = self.bump_version();
        self.health.rearm();
        report.duration = started.elapsed();
        progress.report(1.0, "Refresh finished");
        sink.on_finished(&report);
        tracing::info!("{}", report.summary());
        Ok(report)
    }

    fn run_phases(
        &self,
        scope: RefreshScope,
        progress: &mut Progress<'_>,
        cancel: &CancellationToken,
        report: &mut RefreshReport,
    ) {
        // Invalidations that slipped past the refreshing flag wait here
        let _serial = lock(&self.propagation);
        progress.report(0.0, "Clearing index");
        match self.store.clear_scope(scope) {
            Ok(removed) => tracing::debug!(scope = %scope, removed, "cleared index"),
            Err(e) => {
                tracing::error!(scope = %scope, error = %e, "failed to clear index");
                report.phase_failures.push(PhaseFailure {
                    phase: "clear",
                    error: e.to_string(),
                });
            }
        }
        if scope == RefreshScope::All {
            lock(&self.states).clear();
        }

        let files = match self.layout.discover() {
            Ok(files) => files,
            Err(e) => {
                tracing::error!(error = %e, "file discovery failed");
                report.phase_failures.push(PhaseFailure {
                    phase: "discover",
                    error: e.to_string(),
                });
                return;
            }
        };

        let phases = Phase::for_scope(scope);
        let share = 1.0 / phases.len() as f64;
        let mut failed_keys = BTreeSet::new();
        let mut declared = BTreeMap::new();

        for (index, phase) in phases.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let phase_files: Vec<&DiscoveredFile> = files
                .iter()
                .filter(|f| f.kind == phase.file_kind())
                .filter(|f| !failed_keys.contains(&f.relative_path))
                .collect();
            let base = index as f64 * share;

            let result = self.run_phase(
                *phase,
                &phase_files,
                |done, total| {
                    let fraction = if total == 0 {
                        1.0
                    } else {
                        done as f64 / total as f64
                    };
                    progress.report(
                        base + fraction * share,
                        &format!("Indexing {} ({}/{})", phase.name(), done, total),
                    )
                },
                cancel,
                &mut failed_keys,
                &mut declared,
            );

            match result {
                Ok(tally) => {
                    report.files_processed += tally.processed;
                    report.files_failed += tally.failed;
                    report.records_written += tally.written;
                }
                Err((tally, Error::Cancelled)) => {
                    report.files_processed += tally.processed;
                    report.files_failed += tally.failed;
                    report.records_written += tally.written;
                    report.cancelled = true;
                    break;
                }
                Err((tally, e)) => {
                    tracing::error!(phase = phase.name(), error = %e, "refresh phase aborted");
                    report.files_processed += tally.processed;
                    report.files_failed += tally.failed;
                    report.records_written += tally.written;
                    report.phase_failures.push(PhaseFailure {
                        phase: phase.name(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Extract `files` in parallel chunks and commit each file in its own
    /// transaction. Cancellation is checked before every commit.
    ///
    /// A markup file's digest is written with its records. A code file's
    /// digest is written only by the usage phase, and only when it matches the
    /// digest its declarations were extracted from in this refresh, so a code
    /// file left half indexed keeps no fresh digest and the next scan redoes it.
    fn run_phase(
        &self,
        phase: Phase,
        files: &[&DiscoveredFile],
        mut on_progress: impl FnMut(usize, usize),
        cancel: &CancellationToken,
        failed_keys: &mut BTreeSet<String>,
        declared: &mut BTreeMap<String, String>,
    ) -> std::result::Result<PhaseTally, (PhaseTally, Error)> {
        let mut tally = PhaseTally::default();
        let total = files.len();
        on_progress(0, total);

        let targets = if phase == Phase::Usage {
            let owned: Vec<DiscoveredFile> = files.iter().map(|f| (*f).clone()).collect();
            let sources = self.read_sources(&owned);
            match self.resolve_targets(&sources) {
                Ok(targets) => targets,
                Err(e) => return Err((tally, e)),
            }
        } else {
            Arc::new(TargetSet::default())
        };
        if phase == Phase::Usage && targets.is_empty() {
            tracing::warn!("no target methods resolved, usage phase finds nothing");
        }

        for chunk in files.chunks(self.chunk_size.max(1)) {
            if cancel.is_cancelled() {
                return Err((tally, Error::Cancelled));
            }
            let extracted: Vec<(&DiscoveredFile, Extracted)> = self.pool.install(|| {
                chunk
                    .par_iter()
                    .map(|file| (*file, self.extract_phase(phase, file, &targets)))
                    .collect()
            });

            for (file, result) in extracted {
                if cancel.is_cancelled() {
                    return Err((tally, Error::Cancelled));
                }
                let key = &file.relative_path;
                match result {
                    Extracted::Records {
                        code,
                        markup,
                        digest,
                    } => {
                        let mut digests = BTreeMap::new();
                        let state = match phase {
                            Phase::Markup => {
                                digests.insert(key.clone(), digest);
                                Some(FileState::Fresh)
                            }
                            Phase::Code => {
                                declared.insert(key.clone(), digest);
                                None
                            }
                            Phase::Usage => match declared.get(key) {
                                Some(expected) if *expected == digest => {
                                    digests.insert(key.clone(), digest);
                                    Some(FileState::Fresh)
                                }
                                // Changed between the code and usage phases
                                Some(_) => Some(FileState::Stale),
                                None => Some(FileState::Fresh),
                            },
                        };
                        match self.store.commit_batch(&code, &markup, &digests) {
                            Ok(written) => {
                                tally.written += written;
                                tally.processed += 1;
                                if let Some(state) = state {
                                    self.set_state(key, state);
                                }
                            }
                            Err(e) => return Err((tally, e)),
                        }
                    }
                    Extracted::Missing => {
                        tracing::debug!(path = %key, "file vanished during refresh");
                        if let Err(e) = self.store.delete_by_file(key) {
                            return Err((tally, e));
                        }
                        self.set_state(key, FileState::Unknown);
                    }
                    Extracted::Failed(e) => {
                        tracing::warn!(path = %key, phase = phase.name(), error = %e, "failed to index file");
                        self.purge_failed(key);
                        failed_keys.insert(key.clone());
                        tally.failed += 1;
                    }
                }
                on_progress(tally.processed + tally.failed, total);
            }
        }
        Ok(tally)
    }

    fn extract_phase(&self, phase: Phase, file: &DiscoveredFile, targets: &TargetSet) -> Extracted {
        let source = match self.read_source(&file.path, &file.relative_path) {
            Ok(Some(source)) => source,
            Ok(None) => return Extracted::Missing,
            Err(e) => return Extracted::Failed(e),
        };
        let result = match phase {
            Phase::Markup => self
                .extractors
                .markup
                .extract_markup(&source)
                .map(|markup| (Vec::new(), markup)),
            Phase::Code => self
                .extractors
                .code
                .extract_code(&source)
                .map(|code| (code, Vec::new())),
            Phase::Usage => self
                .extractors
                .code
                .extract_usages(&source, targets)
                .map(|code| (code, Vec::new())),
        };
        match result {
            Ok((code, markup)) => Extracted::Records {
                code,
                markup,
                digest: source.digest,
            },
            Err(e) => Extracted::Failed(e),
        }
    }

    /// Handle invalidations that arrived while the refresh ran
    fn process_deferred(&self, report: &mut RefreshReport) {
        let deferred = std::mem::take(&mut *lock(&self.deferred));
        if deferred.is_empty() {
            return;
        }
        let changed: Vec<String> = deferred
            .into_iter()
            .filter(|key| self.needs_reparse(key))
            .collect();
        tracing::debug!(files = changed.len(), "processing deferred invalidations");

        let claimed = self.claim(changed);
        let result = if claimed.is_empty() {
            Ok(PropagationOutcome::default())
        } else {
            self.propagate(claimed)
        };
        if let Err(e) = result.and_then(|_| self.drain_requeued()) {
            tracing::error!(error = %e, "deferred invalidations failed");
            report.phase_failures.push(PhaseFailure {
                phase: "deferred",
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::progress::LogProgress;
    use crate::indexing::targets::TargetMethodResolver;
    use std::fs;
    use tempfile::TempDir;

    const MAPPER_XML: &str = r#"<mapper namespace="com.x.UserMapper">
    <select id="findById">select * from users where id = #{id}</select>
</mapper>
"#;

    const MAPPER_JAVA: &str = r#"package com.x;

public interface UserMapper {
    User findById(String id);
}
"#;

    fn project() -> (TempDir, CacheEngine) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("src/com/x")).unwrap();
        fs::create_dir_all(root.join("res")).unwrap();
        fs::write(root.join("src/com/x/UserMapper.java"), MAPPER_JAVA).unwrap();
        fs::write(root.join("res/UserMapper.xml"), MAPPER_XML).unwrap();

        let mut config = Config::new(root);
        config.worker_threads = 2;
        let engine = CacheEngine::open(&config).unwrap();
        (temp_dir, engine)
    }

    fn refresh(engine: &CacheEngine) -> RefreshReport {
        engine
            .refresh_all(&LogProgress, &CancellationToken::new())
            .unwrap()
    }

    #[test]
    fn test_phases_for_scope() {
        assert_eq!(
            Phase::for_scope(RefreshScope::All),
            vec![Phase::Markup, Phase::Code, Phase::Usage]
        );
        assert_eq!(Phase::for_scope(RefreshScope::Usage), vec![Phase::Usage]);
    }

    #[test]
    fn test_flag_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let guard = FlagGuard::try_acquire(&flag).unwrap();
        assert!(FlagGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(FlagGuard::try_acquire(&flag).is_some());
    }

    #[test]
    fn test_refresh_links_both_sides() {
        let (_temp_dir, engine) = project();
        let report = refresh(&engine);
        assert!(report.is_complete());
        assert_eq!(report.files_processed, 3);

        let files = engine.get_files_for(["com.x.UserMapper.findById"]).unwrap();
        assert_eq!(
            files,
            BTreeSet::from([
                "res/UserMapper.xml".to_string(),
                "src/com/x/UserMapper.java".to_string()
            ])
        );
        assert_eq!(
            engine
                .file_state(Path::new("res/UserMapper.xml"))
                .unwrap(),
            FileState::Fresh
        );
    }

    #[test]
    fn test_refresh_while_busy() {
        let (_temp_dir, engine) = project();
        let _busy = FlagGuard::try_acquire(&engine.busy).unwrap();
        assert!(matches!(
            engine.refresh_all(&LogProgress, &CancellationToken::new()),
            Err(Error::Busy)
        ));
        assert!(engine.periodic_scan().unwrap().is_none());
    }

    #[test]
    fn test_invalidation_deferred_during_refresh() {
        let (temp_dir, engine) = project();
        refresh(&engine);

        let refreshing = FlagGuard::try_acquire(&engine.refreshing).unwrap();
        let path = temp_dir.path().join("res/UserMapper.xml");
        assert_eq!(
            engine.invalidate_file(&path).unwrap(),
            InvalidationOutcome::Deferred
        );
        drop(refreshing);
        assert_eq!(lock(&engine.deferred).len(), 1);
    }

    #[test]
    fn test_coalesced_when_already_reparsing() {
        let (temp_dir, engine) = project();
        refresh(&engine);

        engine.set_state("res/UserMapper.xml", FileState::Reparsing);
        let path = temp_dir.path().join("res/UserMapper.xml");
        assert_eq!(
            engine.invalidate_file(&path).unwrap(),
            InvalidationOutcome::Coalesced
        );
        assert!(lock(&engine.requeued).contains("res/UserMapper.xml"));
    }

    #[test]
    fn test_health_check_quiet_during_refresh() {
        let (_temp_dir, engine) = project();
        let _refreshing = FlagGuard::try_acquire(&engine.refreshing).unwrap();
        assert!(engine.run_health_check().unwrap().is_none());
    }

    #[test]
    fn test_stats_count_lookups() {
        let (_temp_dir, engine) = project();
        refresh(&engine);

        engine.get_files_for(["com.x.UserMapper.findById"]).unwrap();
        engine.get_files_for(["com.x.Missing.nothing"]).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.lookups, 2);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    struct FailingResolver;

    impl TargetMethodResolver for FailingResolver {
        fn resolve(&self, _code_files: &[SourceFile]) -> Result<TargetSet> {
            Err(Error::Extraction("resolver unavailable".to_string()))
        }
    }

    /// A propagation that cannot resolve targets must fail before purging anything
    #[test]
    fn test_failed_target_resolution_keeps_records() {
        let (temp_dir, engine) = project();
        refresh(&engine);
        drop(engine);

        let mut config = Config::new(temp_dir.path());
        config.worker_threads = 2;
        let mut extractors = Extractors::with_patterns(&[]).unwrap();
        extractors.targets = Arc::new(FailingResolver);
        let store = IndexStore::open(&config.store_path).unwrap();
        let engine = CacheEngine::new(&config, store, extractors).unwrap();

        let java = temp_dir.path().join("src/com/x/UserMapper.java");
        assert!(engine.invalidate_file(&java).is_err());

        let records = engine.records_for("com.x.UserMapper.findById").unwrap();
        assert_eq!(records.markup.len(), 1);
        assert_eq!(records.code.len(), 1);
        assert!(engine.store.digest_for("res/UserMapper.xml").unwrap().is_some());
        assert_eq!(engine.file_state(&java).unwrap(), FileState::Stale);
    }
}
