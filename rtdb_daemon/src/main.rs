//! Manager daemon: creates and owns the shared-memory segment, inserts
//! the well-known objects, marks the segment ready and then runs
//! housekeeping until shut down.

mod config;

use anyhow::{bail, Context};
use clap::Parser;
use rtdb_core::alloc::AllocKind;
use rtdb_core::shm::{has_native_shm, segment_path};
use rtdb_core::sync::LockMode;
use rtdb_core::{wellknown, ConnectOptions, Connection, SegmentConfig, SegmentView};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rtdb_daemon")]
#[command(about = "Shared-memory real-time object database manager")]
#[command(version)]
struct Cli {
    /// Database segment name
    #[arg(short = 'n', long = "name")]
    name: Option<String>,

    /// Configuration file (TOML)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Heap arena size in MiB
    #[arg(long = "heap-mib")]
    heap_mib: Option<u64>,

    /// Object table capacity
    #[arg(long = "objects")]
    objects: Option<u32>,

    /// Process table capacity
    #[arg(long = "processes")]
    processes: Option<u32>,

    /// Tracer ring count
    #[arg(long = "tracers")]
    tracers: Option<u32>,

    /// Housekeeping interval in milliseconds
    #[arg(short = 'i', long = "interval-ms")]
    interval_ms: Option<u64>,

    /// Minimum purge grace in milliseconds
    #[arg(long = "min-grace-ms")]
    min_grace_ms: Option<u64>,

    /// Lock mode: native, emulated or auto
    #[arg(long = "lock-mode")]
    lock_mode: Option<String>,

    /// Allocator: freelist or bump
    #[arg(long = "allocator")]
    allocator: Option<String>,

    /// Directory holding the segment file
    #[arg(long = "base-dir")]
    base_dir: Option<PathBuf>,

    /// Leave the segment file behind on shutdown
    #[arg(long = "keep-segment")]
    keep_segment: bool,
}

struct Settings {
    name: String,
    seg: SegmentConfig,
    interval: Duration,
    base_dir: Option<PathBuf>,
    keep_segment: bool,
}

fn parse_lock_mode(s: &str) -> anyhow::Result<LockMode> {
    Ok(match s {
        "native" => LockMode::Native,
        "emulated" => LockMode::Emulated,
        "auto" => {
            if has_native_shm() {
                LockMode::Native
            } else {
                LockMode::Emulated
            }
        }
        other => bail!("unknown lock mode {other:?} (native, emulated, auto)"),
    })
}

fn parse_allocator(s: &str) -> anyhow::Result<AllocKind> {
    Ok(match s {
        "freelist" => AllocKind::FreeList,
        "bump" => AllocKind::Bump,
        other => bail!("unknown allocator {other:?} (freelist, bump)"),
    })
}

fn resolve_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let file = match &cli.config {
        Some(path) => config::load(path)?,
        None => config::FileConfig::default(),
    };

    let mut seg = SegmentConfig::default();
    if let Some(mib) = cli.heap_mib.or(file.heap_mib) {
        seg.heap_size = mib * 1024 * 1024;
    }
    if let Some(n) = cli.objects.or(file.objects) {
        seg.object_capacity = n;
    }
    if let Some(n) = cli.processes.or(file.processes) {
        seg.process_capacity = n;
    }
    if let Some(n) = cli.tracers.or(file.tracers) {
        seg.tracer_capacity = n;
    }
    if let Some(ms) = cli.min_grace_ms.or(file.min_grace_ms) {
        seg.min_grace = Duration::from_millis(ms);
    }
    let mode = cli
        .lock_mode
        .clone()
        .or(file.lock_mode)
        .unwrap_or_else(|| "auto".to_string());
    seg.lock_mode = parse_lock_mode(&mode)?;
    if let Some(a) = cli.allocator.clone().or(file.allocator) {
        seg.alloc_kind = parse_allocator(&a)?;
    }

    Ok(Settings {
        name: cli
            .name
            .clone()
            .or(file.name)
            .unwrap_or_else(|| "local".to_string()),
        seg,
        interval: Duration::from_millis(cli.interval_ms.or(file.interval_ms).unwrap_or(250)),
        base_dir: cli.base_dir.clone().or(file.base_dir),
        keep_segment: cli.keep_segment || file.keep_segment.unwrap_or(false),
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    let path = segment_path(settings.base_dir.as_deref(), &settings.name);
    let view = Arc::new(
        SegmentView::create(&path, &settings.seg)
            .with_context(|| format!("creating segment {}", path.display()))?,
    );

    let conn = Connection::register_on(
        view.clone(),
        &ConnectOptions::new(&settings.name, "rtdb_daemon")
            .cycle(settings.interval)
            .admin(),
    )
    .context("registering the manager process")?;

    let db_info_oid = conn
        .insert(&wellknown::db_info_spec())
        .context("inserting the rtdb info object")?;
    conn.insert(&wellknown::process_list_spec())
        .context("inserting the process list object")?;
    view.mark_ready();
    log::info!(
        "database {:?} ready at {} (info object {db_info_oid})",
        settings.name,
        path.display()
    );

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })
        .context("installing the shutdown handler")?;
    }

    let mut keeper = conn
        .housekeeper()
        .context("creating the housekeeper")?;
    while running.load(Ordering::SeqCst) {
        if let Err(e) = keeper.run_once(&view) {
            log::error!("housekeeping pass failed: {e}");
        }
        std::thread::sleep(settings.interval);
    }

    log::info!("shutting down");
    drop(conn);
    drop(view);
    if !settings.keep_segment {
        if let Err(e) = std::fs::remove_file(&path) {
            log::warn!("could not remove segment {}: {e}", path.display());
        }
    }
    Ok(())
}
