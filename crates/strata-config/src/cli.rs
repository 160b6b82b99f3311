//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "strata", about = "Paged voxel volume demo")]
pub struct CliArgs {
    /// Chunk edge length in voxels (power of two).
    #[arg(long)]
    pub chunk_size: Option<u32>,

    /// Maximum number of resident chunks.
    #[arg(long)]
    pub max_chunks: Option<usize>,

    /// Terrain seed.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Worker threads for the demo workload (0 = CPU count).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Half-width of the generated area in voxels.
    #[arg(long)]
    pub radius: Option<i32>,

    /// Number of edit/sync passes.
    #[arg(long)]
    pub passes: Option<u32>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(size) = args.chunk_size {
            self.volume.chunk_size = size;
        }
        if let Some(max) = args.max_chunks {
            self.volume.max_chunks = max;
        }
        if let Some(seed) = args.seed {
            self.volume.seed = seed;
        }
        if let Some(threads) = args.threads {
            self.demo.threads = threads;
        }
        if let Some(radius) = args.radius {
            self.demo.radius = radius;
        }
        if let Some(passes) = args.passes {
            self.demo.passes = passes;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            chunk_size: Some(16),
            seed: Some(99),
            log_level: Some("trace".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.volume.chunk_size, 16);
        assert_eq!(config.volume.seed, 99);
        assert_eq!(config.debug.log_level, "trace");
        // Non-overridden fields retain defaults
        assert_eq!(config.volume.max_chunks, 512);
        assert_eq!(config.demo.passes, 4);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_parse_flags() {
        let args = CliArgs::parse_from(["strata", "--max-chunks", "64", "--radius", "32"]);
        assert_eq!(args.max_chunks, Some(64));
        assert_eq!(args.radius, Some(32));
        assert_eq!(args.threads, None);
    }
}
