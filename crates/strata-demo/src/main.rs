//! Strata demo: procedural terrain streamed through a paged voxel volume.
//!
//! Configuration is loaded from `config.ron` in the platform config directory
//! and can be overridden via CLI flags (see `--help`).

mod mirror;
mod terrain;
mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use strata_config::{CliArgs, Config, ConfigError, default_config_dir};
use strata_volume::{PagedVolume, VoxelId};
use tracing::{error, info, warn};

use crate::mirror::RenderMirror;
use crate::terrain::{HeightmapParams, TerrainPager};

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory
    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    // Load or create config, then apply CLI overrides
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    strata_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = run(&config) {
        error!("Demo failed: {e}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<(), ConfigError> {
    let settings = config.volume_settings()?;
    let seed = settings.seed;
    let params = HeightmapParams::default();
    let max_height = params.max_height();
    let pager = Arc::new(TerrainPager::new(seed, params));

    let volume: PagedVolume<VoxelId> = PagedVolume::new(settings, pager.clone())?;
    info!(
        "Volume ready: chunk size {}, budget {} chunks, region {}",
        volume.chunk_size(),
        volume.max_chunks(),
        volume.max_region()
    );

    let start = Instant::now();
    let mut mirror = RenderMirror::new(&volume);
    let report = workload::run(&volume, &mut mirror, &config.demo, seed, max_height);
    info!(
        passes = report.passes,
        jobs = report.totals.jobs,
        changed = report.totals.changed,
        cells = report.totals.cells_meshed,
        faces = report.totals.faces,
        mirror_nodes = report.mirror_nodes,
        mesh_rebuilds = report.mesh_rebuilds,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Workload finished"
    );
    if report.totals.failed > 0 {
        warn!("{} jobs failed", report.totals.failed);
    }

    let flush = volume.flush_all();
    let stats = volume.stats();
    info!(
        written = flush.written,
        failed = flush.failed,
        evicted = flush.evicted,
        page_ins = stats.page_ins,
        evictions = stats.evictions,
        generated = pager.generated_chunks(),
        stored = pager.stored_chunks(),
        "Volume flushed"
    );
    Ok(())
}
