//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use glam::IVec3;
use serde::{Deserialize, Serialize};
use strata_volume::{Region, VolumeSettings};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Paged volume settings.
    pub volume: VolumeConfig,
    /// Demo workload settings.
    pub demo: DemoConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Inclusive voxel box as written in the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionConfig {
    pub lower: [i32; 3],
    pub upper: [i32; 3],
}

impl RegionConfig {
    /// Converts to a [`Region`], rejecting inverted boxes.
    pub fn to_region(&self) -> Result<Region, ConfigError> {
        Ok(Region::new(IVec3::from_array(self.lower), IVec3::from_array(self.upper))?)
    }
}

impl From<Region> for RegionConfig {
    fn from(region: Region) -> Self {
        Self {
            lower: region.lower_corner().to_array(),
            upper: region.upper_corner().to_array(),
        }
    }
}

/// Paged volume configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VolumeConfig {
    /// Chunk edge length in voxels (power of two, 2..=256).
    pub chunk_size: u32,
    /// Maximum number of chunks kept in memory.
    pub max_chunks: usize,
    /// Addressable world region.
    pub max_region: RegionConfig,
    /// Seed passed to procedural pagers.
    pub seed: u64,
    /// Region tracked by the change octree. `None` uses `max_region`.
    pub octree_region: Option<RegionConfig>,
    /// Mesh extraction cell size. `None` uses `chunk_size`.
    pub extraction_cell_size: Option<u32>,
}

/// Demo workload configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DemoConfig {
    /// Worker threads generating and editing terrain. `0` picks the CPU count.
    pub threads: usize,
    /// Half-width of the generated square, in voxels.
    pub radius: i32,
    /// Number of edit/sync passes to run.
    pub passes: u32,
    /// Distance-to-size ratio above which an octree node renders as one mesh.
    pub lod_threshold: f32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32,
            max_chunks: 512,
            max_region: RegionConfig {
                lower: [-4096, -256, -4096],
                upper: [4095, 255, 4095],
            },
            seed: 0,
            octree_region: None,
            extraction_cell_size: None,
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            radius: 256,
            passes: 4,
            lod_threshold: 4.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for strata (e.g. `~/.config/strata`).
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("strata"))
}

/// File name of the persisted config inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

fn pretty() -> ron::ser::PrettyConfig {
    ron::ser::PrettyConfig::new()
        .depth_limit(3)
        .separate_tuple_members(true)
        .enumerate_arrays(false)
}

// --- Persistence ---

impl Config {
    /// Path of the config file inside `config_dir`.
    pub fn file_path(config_dir: &Path) -> PathBuf {
        config_dir.join(CONFIG_FILE)
    }

    /// Parses the config file at `path`.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&text).map_err(ConfigError::ParseError)
    }

    /// Loads `config.ron` from `config_dir`, writing the defaults there first
    /// if the file does not exist yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = Self::file_path(config_dir);
        if !path.exists() {
            let config = Self::default();
            config.save(config_dir)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }
        let config = Self::read(&path)?;
        log::info!("Using config {}", path.display());
        Ok(config)
    }

    /// Writes this config to `config_dir/config.ron`, creating the directory.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;
        let text =
            ron::ser::to_string_pretty(self, pretty()).map_err(ConfigError::SerializeError)?;
        std::fs::write(Self::file_path(config_dir), text).map_err(ConfigError::WriteError)
    }

    /// Re-reads the file; `Some` only if its contents differ from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&Self::file_path(config_dir))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config file changed on disk");
        Ok(Some(fresh))
    }

    /// Validated volume construction parameters.
    pub fn volume_settings(&self) -> Result<VolumeSettings, ConfigError> {
        let volume = &self.volume;
        let settings = VolumeSettings {
            chunk_size: volume.chunk_size,
            max_chunks: volume.max_chunks,
            max_region: volume.max_region.to_region()?,
            seed: volume.seed,
            octree_region: volume.octree_region.map(|r| r.to_region()).transpose()?,
            extraction_cell_size: volume.extraction_cell_size,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_volume::VolumeError;

    #[test]
    fn test_pretty_output_lists_every_section() {
        let text = ron::ser::to_string_pretty(&Config::default(), pretty()).unwrap();
        for needle in ["volume:", "demo:", "debug:", "chunk_size: 32", "lod_threshold: 4.0"] {
            assert!(text.contains(needle), "missing {needle} in {text}");
        }
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.volume.octree_region = Some(RegionConfig {
            lower: [-64, -64, -64],
            upper: [63, 63, 63],
        });
        let ron_str = ron::to_string(&config).unwrap();
        let deserialized: Config = ron::from_str(&ron_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_missing_field_uses_default() {
        // Config missing the `demo` section entirely
        let ron_str = "(volume: (chunk_size: 16), debug: ())";
        let config: Config = ron::from_str(ron_str).unwrap();
        assert_eq!(config.demo, DemoConfig::default());
        assert_eq!(config.volume.chunk_size, 16);
        assert_eq!(config.volume.max_chunks, VolumeConfig::default().max_chunks);
    }


    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.volume.chunk_size = 64;
        config.volume.seed = 1234;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_or_create_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join("config.ron").exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let mut modified = config.clone();
        modified.volume.max_chunks = 64;
        modified.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_some());
        assert_eq!(result.unwrap().volume.max_chunks, 64);
    }

    #[test]
    fn test_reload_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();

        let result = config.reload(dir.path()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(Config::file_path(dir.path()), "(volume: (chunk_size: \"big\"))").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_default_volume_settings_are_valid() {
        let settings = Config::default().volume_settings().unwrap();
        assert_eq!(settings.chunk_size, 32);
        assert_eq!(settings.max_region.lower_corner(), IVec3::new(-4096, -256, -4096));
        assert_eq!(settings.octree_region, None);
    }

    #[test]
    fn test_bad_chunk_size_rejected() {
        let mut config = Config::default();
        config.volume.chunk_size = 48;
        let err = config.volume_settings().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(VolumeError::InvalidChunkSize(48))));
    }

    #[test]
    fn test_inverted_region_rejected() {
        let mut config = Config::default();
        config.volume.max_region = RegionConfig {
            lower: [10, 0, 0],
            upper: [0, 10, 10],
        };
        assert!(matches!(
            config.volume_settings(),
            Err(ConfigError::Invalid(VolumeError::InvalidRegion { .. }))
        ));
    }
}
