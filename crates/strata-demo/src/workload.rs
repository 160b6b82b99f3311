//! Multi-threaded terrain workload driving a [`PagedVolume`].
//!
//! Each pass fans a batch of jobs out to named worker threads over a bounded
//! channel while a streamer thread walks a viewer around the area, prefetching
//! ahead of it and refreshing octree visibility. Once the workers drain the
//! channel the main thread meshes a slice of the extraction queue and syncs
//! the render mirror.

use std::thread;

use crossbeam_channel::{bounded, unbounded};
use glam::{IVec3, Vec3};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rustc_hash::FxHashSet;
use strata_config::DemoConfig;
use strata_volume::{PagedVolume, Region, Sampler, Voxel, VolumeError, VoxelId};
use tracing::{debug, info, warn};

use crate::mirror::RenderMirror;
use crate::terrain::{DIRT, STONE};

/// Edge length of the columns of chunks prefetched by the first pass.
const PREFETCH_TILE: i32 = 64;
/// Edit jobs queued by every pass after the first.
const EDITS_PER_PASS: usize = 48;
/// Viewer positions visited by the streamer per pass.
const STREAM_STEPS: usize = 16;
/// Half-width of the box prefetched around the viewer.
const STREAM_RADIUS: i32 = 32;
/// Extraction cells meshed per pass.
const CELLS_PER_PASS: usize = 16;

/// Unit of work for a worker thread.
#[derive(Clone, Debug, PartialEq)]
pub enum Job {
    /// Page in every chunk overlapping the region.
    Prefetch(Region),
    /// Clear a sphere of voxels as one batch.
    Carve { center: IVec3, radius: i32 },
    /// Write a solid column from `y = 0`.
    Pillar { x: i32, z: i32, height: usize },
    /// Walk a row along +x and drop solid voxels with air above and below.
    Settle { start: IVec3, length: i32 },
}

/// What one job did to the volume.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub paged: usize,
    pub changed: usize,
}

/// Totals for one pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct PassReport {
    pub jobs: usize,
    pub failed: usize,
    pub paged: usize,
    pub changed: usize,
    pub streamed: usize,
    pub visibility_flips: usize,
    pub cells_meshed: usize,
    pub faces: usize,
}

impl PassReport {
    fn absorb(&mut self, other: &PassReport) {
        self.jobs += other.jobs;
        self.failed += other.failed;
        self.paged += other.paged;
        self.changed += other.changed;
        self.streamed += other.streamed;
        self.visibility_flips += other.visibility_flips;
        self.cells_meshed += other.cells_meshed;
        self.faces += other.faces;
    }
}

/// Totals for the whole run.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkloadReport {
    pub passes: u32,
    pub totals: PassReport,
    pub mirror_nodes: usize,
    pub mesh_rebuilds: usize,
}

/// Worker count for `configured` threads, `0` meaning one per CPU.
pub fn worker_count(configured: usize) -> usize {
    if configured == 0 {
        num_cpus::get().max(2)
    } else {
        configured
    }
}

/// Box the workload operates in: the configured square, from the ground up
/// to `max_height`, clipped to the volume.
pub fn work_area(volume: &PagedVolume<VoxelId>, radius: i32, max_height: i32) -> Option<Region> {
    let radius = radius.max(1);
    let area = Region::new(
        IVec3::new(-radius, 0, -radius),
        IVec3::new(radius - 1, max_height.max(0), radius - 1),
    )
    .ok()?;
    area.intersection(&volume.max_region())
}

/// Jobs for pass `pass`. The first pass prefetches the area; later passes edit it.
pub fn plan_pass(pass: u32, area: &Region, rng: &mut impl Rng) -> Vec<Job> {
    let lower = area.lower_corner();
    let upper = area.upper_corner();

    if pass == 0 {
        let mut jobs = Vec::new();
        for z in (lower.z..=upper.z).step_by(PREFETCH_TILE as usize) {
            for x in (lower.x..=upper.x).step_by(PREFETCH_TILE as usize) {
                let tile_upper = IVec3::new(
                    (x + PREFETCH_TILE - 1).min(upper.x),
                    upper.y,
                    (z + PREFETCH_TILE - 1).min(upper.z),
                );
                if let Ok(tile) = Region::new(IVec3::new(x, lower.y, z), tile_upper) {
                    jobs.push(Job::Prefetch(tile));
                }
            }
        }
        return jobs;
    }

    (0..EDITS_PER_PASS)
        .map(|i| match i % 3 {
            0 => Job::Carve {
                center: random_point(rng, area),
                radius: rng.gen_range(2..=6),
            },
            1 => {
                let p = random_point(rng, area);
                Job::Pillar {
                    x: p.x,
                    z: p.z,
                    height: rng.gen_range(1..=(upper.y + 1).max(1)) as usize,
                }
            }
            _ => Job::Settle {
                start: random_point(rng, area),
                length: rng.gen_range(8..=48),
            },
        })
        .collect()
}

fn random_point(rng: &mut impl Rng, area: &Region) -> IVec3 {
    let lower = area.lower_corner();
    let upper = area.upper_corner();
    IVec3::new(
        rng.gen_range(lower.x..=upper.x),
        rng.gen_range(lower.y..=upper.y),
        rng.gen_range(lower.z..=upper.z),
    )
}

/// Applies one job to the volume.
///
/// # Errors
///
/// Propagates [`VolumeError`] from the volume; carve spheres are clipped so
/// only malformed jobs fail.
pub fn execute(volume: &PagedVolume<VoxelId>, job: &Job) -> Result<JobOutcome, VolumeError> {
    let bounds = volume.max_region();
    match *job {
        Job::Prefetch(region) => Ok(JobOutcome {
            paged: volume.prefetch(&region)?,
            changed: 0,
        }),
        Job::Carve { center, radius } => {
            let r2 = radius * radius;
            let mut edits = Vec::new();
            for dz in -radius..=radius {
                for dy in -radius..=radius {
                    for dx in -radius..=radius {
                        let offset = IVec3::new(dx, dy, dz);
                        let pos = center + offset;
                        if offset.length_squared() <= r2 && bounds.contains_point(pos) {
                            edits.push((pos, VoxelId::EMPTY));
                        }
                    }
                }
            }
            Ok(JobOutcome {
                paged: 0,
                changed: volume.set_voxels_batch(&edits)?,
            })
        }
        Job::Pillar { x, z, height } => {
            let mut column = vec![STONE; height];
            if let Some(top) = column.last_mut() {
                *top = DIRT;
            }
            Ok(JobOutcome {
                paged: 0,
                changed: volume.set_voxels(x, z, &column)?,
            })
        }
        Job::Settle { start, length } => {
            let mut sampler = Sampler::new(volume);
            sampler.set_position(start.x, start.y, start.z)?;
            let mut changed = 0;
            for step in 0..length {
                if step > 0 && sampler.move_positive_x().is_err() {
                    break;
                }
                if sampler.voxel().is_empty() {
                    continue;
                }
                let above = sampler.peek(0, 1, 0).unwrap_or_default();
                let below = sampler.peek(0, -1, 0).unwrap_or_default();
                if above.is_empty() && below.is_empty() && sampler.set_voxel(VoxelId::EMPTY)? {
                    changed += 1;
                }
            }
            Ok(JobOutcome { paged: 0, changed })
        }
    }
}

/// Runs `jobs` on `threads` workers alongside one streamer thread.
pub fn run_pass(
    volume: &PagedVolume<VoxelId>,
    jobs: Vec<Job>,
    threads: usize,
    area: &Region,
    pass: u32,
    lod_threshold: f32,
) -> PassReport {
    let mut report = PassReport {
        jobs: jobs.len(),
        ..Default::default()
    };
    let (job_tx, job_rx) = bounded::<Job>(threads.max(1) * 4);
    let (result_tx, result_rx) = unbounded::<Result<JobOutcome, VolumeError>>();

    thread::scope(|s| {
        for i in 0..threads.max(1) {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("strata-worker-{i}"))
                .spawn_scoped(s, move || {
                    for job in rx {
                        if tx.send(execute(volume, &job)).is_err() {
                            break;
                        }
                    }
                });
            if let Err(e) = spawned {
                warn!("Failed to spawn worker {i}: {e}");
            }
        }
        drop(job_rx);
        drop(result_tx);

        let streamer = thread::Builder::new()
            .name("strata-streamer".to_string())
            .spawn_scoped(s, move || stream(volume, area, pass, lod_threshold));

        for job in jobs {
            if job_tx.send(job).is_err() {
                warn!("All workers exited; dropping remaining jobs");
                break;
            }
        }
        drop(job_tx);

        match streamer.map(|handle| handle.join()) {
            Ok(Ok((streamed, flips))) => {
                report.streamed = streamed;
                report.visibility_flips = flips;
            }
            Ok(Err(_)) => warn!("Streamer thread panicked"),
            Err(e) => warn!("Failed to spawn streamer: {e}"),
        }
    });

    let mut finished = 0;
    for result in result_rx {
        finished += 1;
        match result {
            Ok(outcome) => {
                report.paged += outcome.paged;
                report.changed += outcome.changed;
            }
            Err(e) => {
                debug!("Job failed: {e}");
                report.failed += 1;
            }
        }
    }
    // Jobs never picked up count as failed.
    report.failed += report.jobs - finished;
    report
}

/// Moves a viewer around the area's rim, prefetching ahead of it.
/// Returns `(chunks paged in, visibility flips)`.
fn stream(
    volume: &PagedVolume<VoxelId>,
    area: &Region,
    pass: u32,
    lod_threshold: f32,
) -> (usize, usize) {
    let center = area.center();
    let reach = (area.width_in_voxels().min(area.depth_in_voxels()) / 2).max(1) as f32;
    let mut streamed = 0;
    let mut flips = 0;
    for step in 0..STREAM_STEPS {
        let angle = (pass as usize * STREAM_STEPS + step) as f32 / STREAM_STEPS as f32
            * std::f32::consts::TAU;
        let viewer = Vec3::new(
            center.x as f32 + angle.cos() * reach,
            area.upper_corner().y as f32,
            center.z as f32 + angle.sin() * reach,
        );
        let eye = viewer.as_ivec3();
        let around =
            Region::new(eye - IVec3::splat(STREAM_RADIUS), eye + IVec3::splat(STREAM_RADIUS));
        match around.map(|r| volume.prefetch(&r)) {
            Ok(Ok(paged)) => streamed += paged,
            Ok(Err(e)) | Err(e) => debug!("Streamer prefetch failed: {e}"),
        }
        flips += volume.update_visibility(viewer, lod_threshold);
    }
    (streamed, flips)
}

/// Meshes up to `limit` pending extraction cells, counting exposed top faces.
/// A cell queued more than once is meshed once per call. Returns
/// `(cells taken, faces)`.
pub fn mesh_pending(volume: &PagedVolume<VoxelId>, limit: usize) -> (usize, usize) {
    let bounds = volume.max_region();
    let mut sampler = Sampler::new(volume);
    let mut meshed = FxHashSet::default();
    let mut cells = 0;
    let mut faces = 0;
    while cells < limit {
        let Some(cell) = volume.pop_extraction() else {
            break;
        };
        cells += 1;
        if !meshed.insert(cell.lower_corner()) {
            continue;
        }
        let Some(cell) = cell.intersection(&bounds) else {
            continue;
        };
        let lower = cell.lower_corner();
        let upper = cell.upper_corner();
        for z in lower.z..=upper.z {
            for y in lower.y..=upper.y {
                for x in lower.x..=upper.x {
                    if sampler.set_position(x, y, z).is_err() || sampler.voxel().is_empty() {
                        continue;
                    }
                    if sampler.peek(0, 1, 0).map_or(true, |above| above.is_empty()) {
                        faces += 1;
                    }
                }
            }
        }
    }
    (cells, faces)
}

/// Runs every configured pass and syncs `mirror` at the end of each.
pub fn run(
    volume: &PagedVolume<VoxelId>,
    mirror: &mut RenderMirror,
    demo: &DemoConfig,
    seed: u64,
    max_height: i32,
) -> WorkloadReport {
    let mut report = WorkloadReport::default();
    let Some(area) = work_area(volume, demo.radius, max_height) else {
        warn!("Work area lies outside the volume; nothing to do");
        return report;
    };
    let threads = worker_count(demo.threads);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    info!("Running {} passes over {} with {} workers", demo.passes, area, threads);

    for pass in 0..demo.passes {
        let jobs = plan_pass(pass, &area, &mut rng);
        let mut pass_report = run_pass(volume, jobs, threads, &area, pass, demo.lod_threshold);

        // Meshing pages chunks in, so it runs before the mirror catches up.
        let (cells, faces) = mesh_pending(volume, CELLS_PER_PASS);
        pass_report.cells_meshed = cells;
        pass_report.faces = faces;
        let sync = mirror.sync(volume);

        let stats = volume.stats();
        info!(
            pass,
            jobs = pass_report.jobs,
            failed = pass_report.failed,
            paged = pass_report.paged + pass_report.streamed,
            changed = pass_report.changed,
            flips = pass_report.visibility_flips,
            meshes = sync.meshes_fetched,
            created = sync.created,
            destroyed = sync.destroyed,
            skipped = sync.skipped,
            resident = volume.resident_chunks(),
            evictions = stats.evictions,
            pending = volume.pending_extractions(),
            "Pass complete"
        );

        report.totals.absorb(&pass_report);
        report.passes += 1;
    }

    report.mirror_nodes = mirror.node_count();
    report.mesh_rebuilds = mirror.counter().mesh_rebuilds;
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
