use anyhow::{Context, Result};
use clap::Parser;
use mapperlink::cli::{Cli, Commands};
use mapperlink::engine::progress::{CancellationToken, ProgressSink, RefreshReport};
use mapperlink::{Config, FileWatcher, Project, RefreshScope};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Prints refresh progress in ten-percent steps
struct ConsoleProgress {
    last_step: Mutex<Option<u32>>,
}

impl ProgressSink for ConsoleProgress {
    fn on_progress(&self, fraction: f64, message: &str) {
        let step = (fraction * 10.0).floor() as u32;
        let mut last = self.last_step.lock().unwrap_or_else(|e| e.into_inner());
        if *last != Some(step) {
            *last = Some(step);
            println!("  [{:>3}%] {}", step * 10, message);
        }
    }

    fn on_finished(&self, report: &RefreshReport) {
        println!("\n{}", report.summary());
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { project } => handle_init(&project.project),
        Commands::Refresh { project, scope } => handle_refresh(&project.project, scope.into()),
        Commands::Scan { project } => handle_scan(&project.project),
        Commands::Watch { project } => handle_watch(&project.project),
        Commands::Lookup { project, ids } => handle_lookup(&project.project, &ids),
        Commands::Ids { project, file } => handle_ids(&project.project, &file),
        Commands::Health { project } => handle_health(&project.project),
        Commands::Stats { project } => handle_stats(&project.project),
    }
}

fn open_project(root: &Path) -> Result<Project> {
    Project::open(root).with_context(|| format!("Failed to open project at {}", root.display()))
}

fn handle_init(root: &Path) -> Result<()> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Project root not found: {}", root.display()))?;
    let config = Config::load(&root).unwrap_or_else(|_| Config::new(&root));

    if config.is_initialized() {
        println!("mapperlink is already initialized at: {}", config.data_dir.display());
        return Ok(());
    }

    config.save().context("Failed to write configuration")?;
    println!("✓ Created data directory: {}", config.data_dir.display());
    println!("✓ Wrote configuration: {}", config.config_path().display());
    println!("\nNext steps:");
    println!("  1. Build the index: mapperlink refresh");
    println!("  2. Keep it current: mapperlink watch");
    Ok(())
}

fn handle_refresh(root: &Path, scope: RefreshScope) -> Result<()> {
    let project = open_project(root)?;
    println!("Refreshing index ({}) for {}", scope, project.config().project_root.display());

    let progress = ConsoleProgress {
        last_step: Mutex::new(None),
    };
    let report = project
        .engine()
        .refresh_scope(scope, &progress, &CancellationToken::new())?;

    if report.files_failed > 0 {
        println!("  ⚠ {} files could not be indexed; see the log for details", report.files_failed);
    }
    println!("  Cache version: {}", report.version);
    project.close();
    Ok(())
}

fn handle_scan(root: &Path) -> Result<()> {
    let project = open_project(root)?;
    match project.engine().periodic_scan()? {
        Some(report) => {
            println!("Scan complete!");
            println!("  Changed: {}", report.changed);
            println!("  Deleted: {}", report.deleted);
            println!("  Added: {}", report.added);
            if report.unreadable > 0 {
                println!("  Unreadable (will retry): {}", report.unreadable);
            }
            if report.failed > 0 {
                println!("  Failed: {}", report.failed);
            }
        }
        None => println!("Another scan or refresh is running; nothing done."),
    }
    project.close();
    Ok(())
}

fn handle_watch(root: &Path) -> Result<()> {
    let mut project = open_project(root)?;
    let queue = project.start_scheduler()?;
    let watcher = FileWatcher::start(
        project.engine().layout().clone(),
        queue,
        mapperlink::ui::watch::DEFAULT_DEBOUNCE,
    )?;

    println!("Watching directory: {}", project.config().project_root.display());
    println!("Press Ctrl+C to stop watching...\n");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal handler")?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("Failed to wait for Ctrl+C")?;

    println!("\nStopping...");
    drop(watcher);
    project.close();
    Ok(())
}

fn handle_lookup(root: &Path, ids: &[String]) -> Result<()> {
    let project = open_project(root)?;
    for id in ids {
        let records = project.engine().records_for(id)?;
        println!("{}", id);
        if records.is_empty() {
            println!("  (no records)");
            continue;
        }
        for record in &records.code {
            println!(
                "  {:<16} {}:{}-{}",
                record.kind, record.file_path, record.start_offset, record.end_offset
            );
        }
        for record in &records.markup {
            let variant = if record.variant.is_empty() {
                String::new()
            } else {
                format!(" [{}]", record.variant)
            };
            println!(
                "  {:<16} {}:{}-{}{}",
                record.tag_kind, record.file_path, record.start_offset, record.end_offset, variant
            );
        }
    }
    project.close();
    Ok(())
}

fn handle_ids(root: &Path, file: &Path) -> Result<()> {
    let project = open_project(root)?;
    let file = if file.is_absolute() {
        file.to_path_buf()
    } else {
        std::env::current_dir()?.join(file)
    };
    let file = file.canonicalize().unwrap_or(file);
    let ids = project.engine().get_logical_ids_for(&file)?;
    if ids.is_empty() {
        println!("No logical ids recorded for {}", file.display());
    }
    for id in ids {
        println!("{}", id);
    }
    project.close();
    Ok(())
}

fn handle_health(root: &Path) -> Result<()> {
    let project = open_project(root)?;
    match project.engine().run_health_check()? {
        Some(advisory) => println!("⚠ {}", advisory),
        None => println!("✓ Index looks consistent"),
    }
    project.close();
    Ok(())
}

fn handle_stats(root: &Path) -> Result<()> {
    let project = open_project(root)?;
    let engine = project.engine();
    let counts = engine.counts()?;
    let stats = engine.stats();

    println!("Index statistics for {}", project.config().project_root.display());
    println!("  Code records: {} ({} usages)", counts.code, counts.usages);
    println!("  Markup records: {}", counts.markup);
    println!("  File digests: {}", counts.digests);
    println!("  Cache version: {}", engine.get_cache_version());
    println!(
        "  Session: {} lookups, {} hits, {} misses, {} invalidations",
        stats.lookups, stats.hits, stats.misses, stats.invalidations
    );
    project.close();
    Ok(())
}
