//! Configuration loading helpers.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::device::FileSystemFile;
use crate::format::FormatOptions;
use crate::gc::{GcConfig, WorkerConfig};

const ENV_PREFIX: &str = "NVMTIER__";

/// Errors returned by configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error while reading config files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error.
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// Invalid value for a key.
    #[error("invalid value for {key}: {value}")]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Raw value string.
        value: String,
    },
    /// Unknown configuration key.
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    /// Missing required configuration field.
    #[error("missing required field: {0}")]
    MissingField(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NvmConfig {
    /// Format geometry.
    pub geometry: Option<GeometrySpec>,
    /// Reclamation tunables.
    pub gc: Option<GcSpec>,
    /// Background worker sleep policy.
    pub worker: Option<WorkerSpec>,
    /// Backing files of both tiers.
    pub device: Option<DeviceSpec>,
}

impl NvmConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load configuration from the `NVMTIER_CONFIG` env var (if set),
    /// then apply `NVMTIER__section__field` overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("NVMTIER_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply environment overrides in-place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = rest.to_ascii_lowercase();
            let parts: Vec<&str> = path.split("__").collect();
            let value = value.trim();

            match parts.as_slice() {
                ["geometry", "block_size"] => {
                    self.geometry_mut().block_size = Some(parse_value(&key, value)?);
                }
                ["geometry", "blocks_per_segment"] => {
                    self.geometry_mut().blocks_per_segment = Some(parse_value(&key, value)?);
                }
                ["geometry", "fast_segments"] => {
                    self.geometry_mut().fast_segments = Some(parse_value(&key, value)?);
                }
                ["geometry", "slow_segments"] => {
                    self.geometry_mut().slow_segments = Some(parse_value(&key, value)?);
                }
                ["geometry", "slow_main_blkaddr"] => {
                    self.geometry_mut().slow_main_blkaddr = Some(parse_value(&key, value)?);
                }
                ["geometry", "meta_start"] => {
                    self.geometry_mut().meta_start = Some(parse_value(&key, value)?);
                }
                ["geometry", "meta_end"] => {
                    self.geometry_mut().meta_end = Some(parse_value(&key, value)?);
                }
                ["gc", "victim_batch"] => {
                    self.gc_mut().victim_batch = Some(parse_value(&key, value)?);
                }
                ["gc", "valid_threshold_percent"] => {
                    self.gc_mut().valid_threshold_percent = Some(parse_value(&key, value)?);
                }
                ["gc", "free_limit_percent"] => {
                    self.gc_mut().free_limit_percent = Some(parse_value(&key, value)?);
                }
                ["gc", "segments_per_section"] => {
                    self.gc_mut().segments_per_section = Some(parse_value(&key, value)?);
                }
                ["worker", "min_sleep_ms"] => {
                    self.worker_mut().min_sleep_ms = Some(parse_value(&key, value)?);
                }
                ["worker", "max_sleep_ms"] => {
                    self.worker_mut().max_sleep_ms = Some(parse_value(&key, value)?);
                }
                ["worker", "no_gc_sleep_ms"] => {
                    self.worker_mut().no_gc_sleep_ms = Some(parse_value(&key, value)?);
                }
                ["device", "fast_path"] => {
                    self.device_mut().fast_path = Some(PathBuf::from(value));
                }
                ["device", "slow_path"] => {
                    self.device_mut().slow_path = Some(PathBuf::from(value));
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }

        Ok(())
    }

    /// Build `FormatOptions` from the geometry section.
    ///
    /// The segment counts have no default and must be present.
    pub fn to_format_options(&self) -> Result<FormatOptions, ConfigError> {
        let geometry = self
            .geometry
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("geometry".into()))?;
        geometry.resolve()
    }

    /// Build a `GcConfig` using defaults plus overrides.
    pub fn to_gc_config(&self) -> GcConfig {
        let mut config = GcConfig::default();
        if let Some(gc) = &self.gc {
            gc.apply_to(&mut config);
        }
        config
    }

    /// Build a `WorkerConfig` using defaults plus overrides.
    pub fn to_worker_config(&self) -> WorkerConfig {
        let mut config = WorkerConfig::default();
        if let Some(worker) = &self.worker {
            worker.apply_to(&mut config);
        }
        config
    }

    /// Open the fast and slow backing files, creating them if missing.
    pub fn open_devices(&self) -> Result<(FileSystemFile, FileSystemFile), ConfigError> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("device".into()))?;
        let fast = device
            .fast_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("device.fast_path".into()))?;
        let slow = device
            .slow_path
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField("device.slow_path".into()))?;
        Ok((
            FileSystemFile::open(fast, true)?,
            FileSystemFile::open(slow, true)?,
        ))
    }

    fn geometry_mut(&mut self) -> &mut GeometrySpec {
        self.geometry.get_or_insert_with(GeometrySpec::default)
    }

    fn gc_mut(&mut self) -> &mut GcSpec {
        self.gc.get_or_insert_with(GcSpec::default)
    }

    fn worker_mut(&mut self) -> &mut WorkerSpec {
        self.worker.get_or_insert_with(WorkerSpec::default)
    }

    fn device_mut(&mut self) -> &mut DeviceSpec {
        self.device.get_or_insert_with(DeviceSpec::default)
    }
}

/// Geometry overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeometrySpec {
    /// Block size in bytes.
    pub block_size: Option<u32>,
    /// Blocks per segment.
    pub blocks_per_segment: Option<u32>,
    /// Fast-tier data segments.
    pub fast_segments: Option<u32>,
    /// Slow-tier main-area segments.
    pub slow_segments: Option<u32>,
    /// First block of the slow main area.
    pub slow_main_blkaddr: Option<u64>,
    /// First mirrored metadata block.
    pub meta_start: Option<u64>,
    /// One past the last mirrored metadata block.
    pub meta_end: Option<u64>,
}

impl GeometrySpec {
    fn resolve(&self) -> Result<FormatOptions, ConfigError> {
        let fast = self
            .fast_segments
            .ok_or_else(|| ConfigError::MissingField("geometry.fast_segments".into()))?;
        let slow = self
            .slow_segments
            .ok_or_else(|| ConfigError::MissingField("geometry.slow_segments".into()))?;

        let mut options = FormatOptions::new(fast, slow);
        if let Some(value) = self.block_size {
            options = options.with_block_size(value);
        }
        if let Some(value) = self.blocks_per_segment {
            options = options.with_blocks_per_segment(value);
        }
        if let Some(value) = self.slow_main_blkaddr {
            options = options.with_slow_main_blkaddr(value);
        }
        match (self.meta_start, self.meta_end) {
            (Some(start), Some(end)) => options = options.with_meta_range(start, end),
            (None, None) => {}
            (None, Some(_)) => return Err(ConfigError::MissingField("geometry.meta_start".into())),
            (Some(_), None) => return Err(ConfigError::MissingField("geometry.meta_end".into())),
        }
        Ok(options)
    }
}

/// Reclamation overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcSpec {
    /// Victims per round.
    pub victim_batch: Option<usize>,
    /// Delegation threshold in percent of a segment.
    pub valid_threshold_percent: Option<u32>,
    /// Free-space pressure limit in percent.
    pub free_limit_percent: Option<u32>,
    /// Segments per section.
    pub segments_per_section: Option<u32>,
}

impl GcSpec {
    fn apply_to(&self, config: &mut GcConfig) {
        if let Some(value) = self.victim_batch {
            config.victim_batch = value;
        }
        if let Some(value) = self.valid_threshold_percent {
            config.valid_threshold_percent = value.min(100);
        }
        if let Some(value) = self.free_limit_percent {
            config.free_limit_percent = value.min(100);
        }
        if let Some(value) = self.segments_per_section {
            config.segments_per_section = value.max(1);
        }
    }
}

/// Worker overrides, in milliseconds.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSpec {
    /// Minimum sleep.
    pub min_sleep_ms: Option<u64>,
    /// Maximum sleep.
    pub max_sleep_ms: Option<u64>,
    /// Sleep after an unproductive pass.
    pub no_gc_sleep_ms: Option<u64>,
}

impl WorkerSpec {
    fn apply_to(&self, config: &mut WorkerConfig) {
        if let Some(value) = self.min_sleep_ms {
            config.min_sleep = Duration::from_millis(value);
        }
        if let Some(value) = self.max_sleep_ms {
            config.max_sleep = Duration::from_millis(value);
        }
        if let Some(value) = self.no_gc_sleep_ms {
            config.no_gc_sleep = Duration::from_millis(value);
        }
    }
}

/// Backing file paths.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSpec {
    /// Fast-tier file.
    pub fast_path: Option<PathBuf>,
    /// Slow-tier file.
    pub slow_path: Option<PathBuf>,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
