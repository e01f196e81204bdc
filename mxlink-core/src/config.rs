// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict validation.
//!
//! Ring geometries, the shared region size and worker timeouts are checked
//! once at load time. Any invalid field results in a ConfigError that
//! prevents the device from being brought up.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, MxError, MxResult};
use crate::shm::{BlockAllocator, RingGeometry, SharedMemoryRegion};
use crate::types::NUM_TARGETS;

/// Longest accepted worker timeout.
const MAX_TIMEOUT_MS: u64 = 60_000;

/// Raw shared region section.
#[derive(Debug, Deserialize)]
struct RawRegionConfig {
    #[serde(default = "default_region_size")]
    size: usize,
    #[serde(default)]
    name: Option<String>,
}

fn default_region_size() -> usize {
    256 * 1024
}

impl Default for RawRegionConfig {
    fn default() -> Self {
        Self {
            size: default_region_size(),
            name: None,
        }
    }
}

/// Raw ring section, shared by every transport.
#[derive(Debug, Deserialize)]
struct RawRingConfig {
    mem_length: Option<u32>,
    packet_size: Option<u32>,
}

impl RawRingConfig {
    const fn unset() -> Self {
        Self {
            mem_length: None,
            packet_size: None,
        }
    }
}

/// Raw log section.
#[derive(Debug, Deserialize)]
struct RawLogConfig {
    mem_length: Option<u32>,
    packet_size: Option<u32>,
    #[serde(default = "default_max_bad_headers")]
    max_bad_headers: u32,
}

fn default_max_bad_headers() -> u32 {
    250
}

impl Default for RawLogConfig {
    fn default() -> Self {
        Self {
            mem_length: None,
            packet_size: None,
            max_bad_headers: default_max_bad_headers(),
        }
    }
}

/// Raw worker section.
#[derive(Debug, Deserialize)]
struct RawWorkerConfig {
    #[serde(default = "default_timeout_ms")]
    start_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    stop_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for RawWorkerConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: default_timeout_ms(),
            stop_timeout_ms: default_timeout_ms(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    region: RawRegionConfig,
    #[serde(default)]
    management: Option<RawRingConfig>,
    #[serde(default)]
    monitor: Option<RawRingConfig>,
    #[serde(default)]
    log: RawLogConfig,
    #[serde(default)]
    worker: RawWorkerConfig,
}

/// Validated shared region configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RegionConfig {
    pub size: usize,
    /// POSIX shared memory name; anonymous mapping when unset.
    pub name: Option<String>,
}

impl RegionConfig {
    /// Map the region this section describes.
    pub fn map(&self) -> MxResult<SharedMemoryRegion> {
        let region = match &self.name {
            Some(name) => SharedMemoryRegion::create(name, self.size)?,
            None => SharedMemoryRegion::anonymous(self.size)?,
        };
        Ok(region)
    }
}

/// Validated ring configuration for one direction of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingConfig {
    pub mem_length: u32,
    pub packet_size: u32,
}

impl RingConfig {
    pub const MANAGEMENT: Self = Self {
        mem_length: 512,
        packet_size: 8,
    };

    pub const MONITOR: Self = Self {
        mem_length: 2048,
        packet_size: 4,
    };

    pub const LOG: Self = Self {
        mem_length: 16 * 1024,
        packet_size: 4,
    };

    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            num_packets: self.mem_length / self.packet_size,
            packet_size: self.packet_size,
        }
    }

    /// Region bytes one ring of this shape consumes, cursors included.
    pub fn footprint(&self) -> usize {
        BlockAllocator::footprint(self.geometry().byte_len(), 4)
            + 2 * BlockAllocator::footprint(4, 4)
    }
}

/// Validated log transport configuration.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LogConfig {
    pub ring: RingConfig,
    /// Consecutive undecodable headers tolerated before the worker gives up.
    pub max_bad_headers: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::LOG,
            max_bad_headers: default_max_bad_headers(),
        }
    }
}

/// Validated worker timeouts.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WorkerConfig {
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_millis(default_timeout_ms()),
            stop_timeout: Duration::from_millis(default_timeout_ms()),
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub region: RegionConfig,
    pub management: RingConfig,
    pub monitor: RingConfig,
    pub log: LogConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Region bytes needed to bring up every transport at once.
    ///
    /// Management and monitor use two rings each, with one monitor pair per
    /// target; the log transport is inbound only.
    pub fn required_region_size(&self) -> usize {
        2 * self.management.footprint()
            + 2 * NUM_TARGETS * self.monitor.footprint()
            + self.log.ring.footprint()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: RegionConfig {
                size: default_region_size(),
                name: None,
            },
            management: RingConfig::MANAGEMENT,
            monitor: RingConfig::MONITOR,
            log: LogConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> MxResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(MxError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| MxError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> MxResult<Config> {
        // An empty document means "all defaults".
        if content.trim().is_empty() {
            return Self::validate(RawConfig::default());
        }

        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| MxError::ConfigParse {
            message: format!("YAML parse error: {}", e),
        })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> MxResult<Config> {
        let management = Self::validate_ring(
            "management",
            raw.management.unwrap_or(RawRingConfig::unset()),
            RingConfig::MANAGEMENT,
            2,
        )?;
        let monitor = Self::validate_ring(
            "monitor",
            raw.monitor.unwrap_or(RawRingConfig::unset()),
            RingConfig::MONITOR,
            4,
        )?;
        let log_ring = Self::validate_ring(
            "log",
            RawRingConfig {
                mem_length: raw.log.mem_length,
                packet_size: raw.log.packet_size,
            },
            RingConfig::LOG,
            4,
        )?;

        if raw.log.max_bad_headers == 0 {
            return Err(ConfigError::InvalidFieldValue {
                section: "log",
                field: "max_bad_headers",
                value: "0".to_string(),
                reason: "Must be at least 1".to_string(),
            }
            .into());
        }

        let worker = WorkerConfig {
            start_timeout: Self::validate_timeout("start_timeout_ms", raw.worker.start_timeout_ms)?,
            stop_timeout: Self::validate_timeout("stop_timeout_ms", raw.worker.stop_timeout_ms)?,
        };

        if let Some(name) = &raw.region.name {
            if name.is_empty() || name.contains('/') {
                return Err(ConfigError::InvalidFieldValue {
                    section: "region",
                    field: "name",
                    value: name.clone(),
                    reason: "Must be non-empty and contain no '/'".to_string(),
                }
                .into());
            }
        }

        if raw.region.size < SharedMemoryRegion::MIN_SIZE
            || raw.region.size > SharedMemoryRegion::MAX_SIZE
        {
            return Err(ConfigError::InvalidFieldValue {
                section: "region",
                field: "size",
                value: raw.region.size.to_string(),
                reason: format!(
                    "Must be between {} and {} bytes",
                    SharedMemoryRegion::MIN_SIZE,
                    SharedMemoryRegion::MAX_SIZE
                ),
            }
            .into());
        }

        let config = Config {
            region: RegionConfig {
                size: raw.region.size,
                name: raw.region.name,
            },
            management,
            monitor,
            log: LogConfig {
                ring: log_ring,
                max_bad_headers: raw.log.max_bad_headers,
            },
            worker,
        };

        let required = config.required_region_size();
        if required > config.region.size {
            return Err(ConfigError::RegionTooSmall {
                required,
                available: config.region.size,
            }
            .into());
        }

        Ok(config)
    }

    fn validate_ring(
        section: &'static str,
        raw: RawRingConfig,
        defaults: RingConfig,
        min_packet_size: u32,
    ) -> MxResult<RingConfig> {
        let mem_length = raw.mem_length.unwrap_or(defaults.mem_length);
        let packet_size = raw.packet_size.unwrap_or(defaults.packet_size);

        let invalid = |field: &'static str, value: u32, reason: String| -> MxError {
            ConfigError::InvalidFieldValue {
                section,
                field,
                value: value.to_string(),
                reason,
            }
            .into()
        };

        if packet_size < min_packet_size {
            return Err(invalid(
                "packet_size",
                packet_size,
                format!("Must be at least {} bytes", min_packet_size),
            ));
        }

        if mem_length % packet_size != 0 {
            return Err(invalid(
                "mem_length",
                mem_length,
                format!("Must be a multiple of packet_size ({})", packet_size),
            ));
        }

        if mem_length / packet_size < 2 {
            return Err(invalid(
                "mem_length",
                mem_length,
                "Must hold at least two packets".to_string(),
            ));
        }

        Ok(RingConfig {
            mem_length,
            packet_size,
        })
    }

    fn validate_timeout(field: &'static str, value_ms: u64) -> MxResult<Duration> {
        if value_ms == 0 || value_ms > MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidFieldValue {
                section: "worker",
                field,
                value: value_ms.to_string(),
                reason: format!("Must be between 1 and {}ms", MAX_TIMEOUT_MS),
            }
            .into());
        }
        Ok(Duration::from_millis(value_ms))
    }
}
