use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::native::ContextFlags;

/// Top-level configuration, loaded from rocdrv.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSection,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSection {
    /// Which native backend to bind: "auto", "hip" or "sim"
    #[serde(default)]
    pub backend: BackendKind,
    /// Explicit path to the HIP runtime library (skips platform discovery)
    pub library_path: Option<String>,
    /// Flags passed to the native init call
    #[serde(default)]
    pub init_flags: u32,
    /// Synchronize the context whenever an activation guard is entered or left
    #[serde(default)]
    pub sync_around_driver_calls: bool,
}

/// Native backend selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Use the HIP runtime if it can be loaded, otherwise the simulated device
    #[default]
    Auto,
    Hip,
    Sim,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSection {
    /// Default scheduling policy for new contexts
    #[serde(default)]
    pub schedule: SchedulePolicy,
    /// Allow mapping pinned host memory into the device address space
    #[serde(default)]
    pub map_host: bool,
    /// Keep local memory allocated after launches that resize it
    #[serde(default)]
    pub keep_local_memory: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchedulePolicy {
    #[default]
    Auto,
    Spin,
    Yield,
    BlockingSync,
}

impl ContextSection {
    /// The context creation flags this section describes.
    pub fn flags(&self) -> ContextFlags {
        let mut flags = match self.schedule {
            SchedulePolicy::Auto => ContextFlags::SCHEDULE_AUTO,
            SchedulePolicy::Spin => ContextFlags::SCHEDULE_SPIN,
            SchedulePolicy::Yield => ContextFlags::SCHEDULE_YIELD,
            SchedulePolicy::BlockingSync => ContextFlags::SCHEDULE_BLOCKING_SYNC,
        };
        if self.map_host {
            flags |= ContextFlags::MAP_HOST;
        }
        if self.keep_local_memory {
            flags |= ContextFlags::LMEM_RESIZE_TO_MAX;
        }
        flags
    }
}

/// Topology of the simulated backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Version reported by the simulated driver
    #[serde(default = "default_driver_version")]
    pub driver_version: i32,
    #[serde(default = "default_sim_devices")]
    pub devices: Vec<SimDeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimDeviceConfig {
    pub name: String,
    /// Device memory budget in bytes
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default = "default_compute_capability")]
    pub compute_capability: [i32; 2],
    #[serde(default = "default_multiprocessors")]
    pub multiprocessors: i32,
    #[serde(default = "default_max_threads_per_multiprocessor")]
    pub max_threads_per_multiprocessor: i32,
    #[serde(default = "default_max_threads_per_block")]
    pub max_threads_per_block: i32,
    #[serde(default = "default_shared_memory")]
    pub max_shared_memory_per_block: i32,
    #[serde(default = "default_shared_memory")]
    pub max_shared_memory_per_multiprocessor: i32,
    #[serde(default = "default_registers")]
    pub max_registers_per_block: i32,
    #[serde(default = "default_warp_size")]
    pub warp_size: i32,
    #[serde(default = "default_max_blocks_per_multiprocessor")]
    pub max_blocks_per_multiprocessor: i32,
    #[serde(default = "default_max_grid_dims")]
    pub max_grid_dims: [i32; 3],
    #[serde(default)]
    pub ecc_enabled: bool,
    /// Devices sharing a peer group can enable peer access to each other
    pub peer_group: Option<u32>,
    /// PCI bus id string; generated from the ordinal when absent
    pub pci_bus_id: Option<String>,
}

impl SimDeviceConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            memory_bytes: default_memory_bytes(),
            compute_capability: default_compute_capability(),
            multiprocessors: default_multiprocessors(),
            max_threads_per_multiprocessor: default_max_threads_per_multiprocessor(),
            max_threads_per_block: default_max_threads_per_block(),
            max_shared_memory_per_block: default_shared_memory(),
            max_shared_memory_per_multiprocessor: default_shared_memory(),
            max_registers_per_block: default_registers(),
            warp_size: default_warp_size(),
            max_blocks_per_multiprocessor: default_max_blocks_per_multiprocessor(),
            max_grid_dims: default_max_grid_dims(),
            ecc_enabled: false,
            peer_group: Some(0),
            pci_bus_id: None,
        }
    }
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            library_path: None,
            init_flags: 0,
            sync_around_driver_calls: false,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            driver_version: default_driver_version(),
            devices: default_sim_devices(),
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, CoreError> {
        let config: DriverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(CoreError::Io(_)) => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring invalid config {}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Configuration for a process that must not touch real hardware.
    pub fn simulated() -> Self {
        let mut config = Self::default();
        config.driver.backend = BackendKind::Sim;
        config
    }

    fn validate(&self) -> Result<(), CoreError> {
        for (ordinal, dev) in self.sim.devices.iter().enumerate() {
            if dev.multiprocessors <= 0 || dev.warp_size <= 0 || dev.max_threads_per_block <= 0 {
                return Err(CoreError::ConfigError(format!(
                    "sim device {} ({}): multiprocessors, warp_size and max_threads_per_block must be positive",
                    ordinal, dev.name
                )));
            }
        }
        Ok(())
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/rocdrv/rocdrv.toml`
/// 2. Local fallback: `./rocdrv.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/rocdrv/rocdrv.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "rocdrv.toml".to_string()
}

fn default_driver_version() -> i32 {
    60_000_000
}

fn default_sim_devices() -> Vec<SimDeviceConfig> {
    vec![
        SimDeviceConfig::named("Simulated gfx90a"),
        SimDeviceConfig::named("Simulated gfx90a"),
    ]
}

fn default_memory_bytes() -> u64 {
    1 << 30
}

fn default_compute_capability() -> [i32; 2] {
    [9, 0]
}

fn default_multiprocessors() -> i32 {
    104
}

fn default_max_threads_per_multiprocessor() -> i32 {
    2048
}

fn default_max_threads_per_block() -> i32 {
    1024
}

fn default_shared_memory() -> i32 {
    65536
}

fn default_registers() -> i32 {
    65536
}

fn default_warp_size() -> i32 {
    64
}

fn default_max_blocks_per_multiprocessor() -> i32 {
    32
}

fn default_max_grid_dims() -> [i32; 3] {
    [i32::MAX, 65536, 65536]
}
