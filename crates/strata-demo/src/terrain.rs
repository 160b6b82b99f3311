//! Procedural terrain pager.
//!
//! Chunks that were never edited are generated from a multi-octave simplex
//! heightmap. Once a dirty chunk is paged out its contents are kept in memory
//! and restored on the next page-in, so edits survive eviction.

use std::sync::atomic::{AtomicUsize, Ordering};

use glam::IVec3;
use noise::{NoiseFn, Simplex};
use strata_volume::{Chunk, MemoryPager, Pager, PagerContext, PagerError, VoxelId};

pub const STONE: VoxelId = VoxelId(1);
pub const DIRT: VoxelId = VoxelId(2);
pub const GRASS: VoxelId = VoxelId(3);

/// Depth of the dirt layer below the grass surface.
const DIRT_DEPTH: i32 = 3;

/// Fractal Brownian motion parameters for the terrain heightmap.
#[derive(Clone, Debug)]
pub struct HeightmapParams {
    /// Number of noise octaves to composite.
    pub octaves: u32,
    /// Frequency multiplier between successive octaves.
    pub lacunarity: f64,
    /// Amplitude multiplier between successive octaves.
    pub persistence: f64,
    /// Frequency of the lowest octave.
    pub base_frequency: f64,
    /// Amplitude of the lowest octave, in voxels.
    pub amplitude: f64,
    /// Surface height where the noise sums to zero.
    pub base_height: i32,
}

impl Default for HeightmapParams {
    fn default() -> Self {
        Self {
            octaves: 4,
            lacunarity: 2.0,
            persistence: 0.5,
            base_frequency: 0.008,
            amplitude: 24.0,
            base_height: 64,
        }
    }
}

impl HeightmapParams {
    /// Upper bound on any generated surface height.
    pub fn max_height(&self) -> i32 {
        let mut total = 0.0;
        let mut amplitude = self.amplitude;
        for _ in 0..self.octaves {
            total += amplitude;
            amplitude *= self.persistence;
        }
        self.base_height + total.ceil() as i32
    }
}

/// Pager producing heightmap terrain and remembering edited chunks.
pub struct TerrainPager {
    noise: Simplex,
    params: HeightmapParams,
    edits: MemoryPager<VoxelId>,
    generated: AtomicUsize,
}

impl TerrainPager {
    pub fn new(seed: u64, params: HeightmapParams) -> Self {
        Self {
            noise: Simplex::new(seed as u32),
            params,
            edits: MemoryPager::new(),
            generated: AtomicUsize::new(0),
        }
    }

    pub fn params(&self) -> &HeightmapParams {
        &self.params
    }

    /// Surface height of the column at `(x, z)`.
    pub fn height_at(&self, x: i32, z: i32) -> i32 {
        let mut total = 0.0;
        let mut frequency = self.params.base_frequency;
        let mut amplitude = self.params.amplitude;

        for _ in 0..self.params.octaves {
            let sample = self.noise.get([x as f64 * frequency, z as f64 * frequency]);
            total += sample * amplitude;

            frequency *= self.params.lacunarity;
            amplitude *= self.params.persistence;
        }

        self.params.base_height + total.round() as i32
    }

    /// Chunks generated from noise so far.
    pub fn generated_chunks(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    /// Chunks currently held as edited copies.
    pub fn stored_chunks(&self) -> usize {
        self.edits.stored_chunks()
    }

    fn generate(&self, ctx: &mut PagerContext<'_, VoxelId>) {
        let region = ctx.region();
        let lower = region.lower_corner();
        let upper = region.upper_corner();

        for z in lower.z..=upper.z {
            for x in lower.x..=upper.x {
                let height = self.height_at(x, z);
                let top = height.min(upper.y);
                if top < lower.y {
                    continue;
                }
                if lower.y >= 0 {
                    let column: Vec<VoxelId> = (0..=top).map(|y| material(y, height)).collect();
                    ctx.set_voxels(x, z, &column);
                } else {
                    for y in lower.y..=top {
                        ctx.set_voxel(IVec3::new(x, y, z), material(y, height));
                    }
                }
            }
        }
        self.generated.fetch_add(1, Ordering::Relaxed);
    }
}

/// Material of the voxel at height `y` in a column whose surface is `height`.
pub fn material(y: i32, height: i32) -> VoxelId {
    if y == height {
        GRASS
    } else if y >= height - DIRT_DEPTH {
        DIRT
    } else {
        STONE
    }
}

impl Pager<VoxelId> for TerrainPager {
    fn page_in(&self, ctx: &mut PagerContext<'_, VoxelId>) -> Result<(), PagerError> {
        if self.edits.contains(ctx.pos()) {
            return self.edits.page_in(ctx);
        }
        self.generate(ctx);
        Ok(())
    }

    fn page_out(&self, chunk: &Chunk<VoxelId>) -> Result<(), PagerError> {
        self.edits.page_out(chunk)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
