/*!
 * Configuration management for Starflow.
 *
 * Configuration is layered: built-in defaults, then an optional TOML file,
 * then environment variables (`STARFLOW__SECTION__KEY`).
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable prefix used by [`ConfigBuilder::with_default_environment`]
pub const ENV_PREFIX: &str = "starflow";

/// Top-level configuration for an observatory deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Status synchronization defaults
    #[serde(default)]
    pub sync: SyncConfig,

    /// Command queue defaults
    #[serde(default)]
    pub queue: QueueConfig,

    /// Actuator tick loop defaults
    #[serde(default)]
    pub actuator: ActuatorConfig,

    /// Remote Alpaca devices to attach
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    /// Locally driven domes (relays and limit switches)
    #[serde(default)]
    pub domes: Vec<DomeConfig>,

    /// Mounts driven over a TCP socket or serial line
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Observatory name, used in logs
    #[serde(default = "default_site_name")]
    pub site_name: String,

    /// Alpaca `ClientID` sent with every request
    #[serde(default = "default_client_id")]
    pub client_id: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// How background components are driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionModel {
    /// One task per engine and queue, one thread per actuator
    #[default]
    Threaded,
    /// A single loop polls every component in turn
    Cooperative,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Execution model
    #[serde(default)]
    pub execution_model: ExecutionModel,

    /// Number of worker threads (0 lets tokio decide)
    #[serde(default)]
    pub worker_threads: usize,

    /// Period of the cooperative loop in milliseconds
    #[serde(default = "default_cooperative_period_ms")]
    pub cooperative_period_ms: u64,
}

/// Status synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Cadence at which the engine is ticked
    #[serde(default = "default_sync_tick_ms")]
    pub tick_period_ms: u64,

    /// Minimum time between two synchronization passes
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Age after which a cached property is no longer valid
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// Timeout of a single HTTP request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retries per property in one-at-a-time mode
    #[serde(default = "default_property_retries")]
    pub property_retries: usize,
}

/// What happens to queued commands when the transport drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Fail every queued command, then reconnect
    #[default]
    Drain,
    /// Keep queued commands and dispatch them after reconnecting
    Preserve,
}

/// Command queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending commands per device
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Timeout for stop commands
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Timeout for queries and simple setters
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Timeout for short motions (focuser moves, shutter commands)
    #[serde(default = "default_motion_timeout_ms")]
    pub motion_timeout_ms: u64,

    /// Timeout for slews
    #[serde(default = "default_slew_timeout_ms")]
    pub slew_timeout_ms: u64,

    /// How long completed commands stay observable
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Behavior on transport failure
    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,

    /// Delay between reconnection attempts
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Actuator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    /// Tick period of the actuator loop
    #[serde(default = "default_actuator_tick_ms")]
    pub tick_period_ms: u64,

    /// Default open timeout
    #[serde(default = "default_travel_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Default close timeout
    #[serde(default = "default_travel_timeout_ms")]
    pub close_timeout_ms: u64,
}

/// A remote Alpaca device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name
    pub name: String,

    /// Host name or IP address
    pub address: String,

    /// Alpaca port
    pub port: u16,

    /// Device type tag (`dome`, `focuser`, `telescope`, ...)
    pub device_type: String,

    /// Device number on the server
    #[serde(default)]
    pub device_number: u32,

    /// Skip the capability probe and use this read-all support flag
    #[serde(default)]
    pub supports_read_all: Option<bool>,

    /// Skip the capability probe and use this device-state support flag
    #[serde(default)]
    pub supports_device_state: Option<bool>,
}

/// A dome driven directly through digital I/O
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomeConfig {
    /// Display name
    pub name: String,

    /// Actuator kind (`rolloffroof` or `clamshell`)
    #[serde(default = "default_dome_kind")]
    pub kind: String,

    /// I/O backend (`simulated` or `gpio`)
    #[serde(default = "default_io_backend")]
    pub io: String,

    /// Output line that drives the roof open
    pub open_line: u8,

    /// Output line that drives the roof closed
    pub close_line: u8,

    /// Optional motor power relay
    #[serde(default)]
    pub power_line: Option<u8>,

    /// Input line of the open limit switch
    pub open_limit_line: u8,

    /// Input line of the closed limit switch
    pub close_limit_line: u8,

    /// Overrides `actuator.open_timeout_ms`
    #[serde(default)]
    pub open_timeout_ms: Option<u64>,

    /// Overrides `actuator.close_timeout_ms`
    #[serde(default)]
    pub close_timeout_ms: Option<u64>,
}

/// A periodic status query sent when a mount's queue is idle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicCommandConfig {
    /// Raw command, e.g. `:GR#`
    pub command: String,

    /// Interval between two sends
    pub interval_ms: u64,
}

/// A mount driven over a byte stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Display name
    pub name: String,

    /// `tcp://host:port` or `serial:///dev/ttyUSB0?baud=9600`
    pub connection: String,

    /// Response framing (`hash`, `line`, `none`)
    #[serde(default = "default_framing")]
    pub framing: String,

    /// Status queries issued while idle
    #[serde(default)]
    pub periodic: Vec<PeriodicCommandConfig>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            site_name: default_site_name(),
            client_id: default_client_id(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            execution_model: ExecutionModel::default(),
            worker_threads: 0,
            cooperative_period_ms: default_cooperative_period_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: default_sync_tick_ms(),
            update_interval_ms: default_update_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            property_retries: default_property_retries(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            stop_timeout_ms: default_stop_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            motion_timeout_ms: default_motion_timeout_ms(),
            slew_timeout_ms: default_slew_timeout_ms(),
            retention_ms: default_retention_ms(),
            reconnect_policy: ReconnectPolicy::default(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: default_actuator_tick_ms(),
            open_timeout_ms: default_travel_timeout_ms(),
            close_timeout_ms: default_travel_timeout_ms(),
        }
    }
}

fn default_site_name() -> String {
    "observatory".to_string()
}

fn default_client_id() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cooperative_period_ms() -> u64 {
    20
}

fn default_sync_tick_ms() -> u64 {
    1_000
}

fn default_update_interval_ms() -> u64 {
    5_000
}

fn default_stale_after_ms() -> u64 {
    15_000
}

fn default_request_timeout_ms() -> u64 {
    3_000
}

fn default_property_retries() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    32
}

fn default_stop_timeout_ms() -> u64 {
    2_000
}

fn default_query_timeout_ms() -> u64 {
    5_000
}

fn default_motion_timeout_ms() -> u64 {
    10_000
}

fn default_slew_timeout_ms() -> u64 {
    120_000
}

fn default_retention_ms() -> u64 {
    60_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_actuator_tick_ms() -> u64 {
    100
}

fn default_travel_timeout_ms() -> u64 {
    60_000
}

fn default_dome_kind() -> String {
    "rolloffroof".to_string()
}

fn default_io_backend() -> String {
    "simulated".to_string()
}

fn default_framing() -> String {
    "hash".to_string()
}

impl SyncConfig {
    /// Tick cadence as a duration
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// Update interval as a duration
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Staleness threshold as a duration
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl QueueConfig {
    /// Retention window as a duration
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Reconnect delay as a duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl ActuatorConfig {
    /// Tick period as a duration
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }
}

impl Config {
    /// Check values that would make a loop spin or never time out
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sync.tick_period_ms", self.sync.tick_period_ms),
            ("sync.update_interval_ms", self.sync.update_interval_ms),
            ("sync.stale_after_ms", self.sync.stale_after_ms),
            ("sync.request_timeout_ms", self.sync.request_timeout_ms),
            ("queue.stop_timeout_ms", self.queue.stop_timeout_ms),
            ("queue.query_timeout_ms", self.queue.query_timeout_ms),
            ("queue.motion_timeout_ms", self.queue.motion_timeout_ms),
            ("queue.slew_timeout_ms", self.queue.slew_timeout_ms),
            ("actuator.tick_period_ms", self.actuator.tick_period_ms),
            ("actuator.open_timeout_ms", self.actuator.open_timeout_ms),
            ("actuator.close_timeout_ms", self.actuator.close_timeout_ms),
            ("runtime.cooperative_period_ms", self.runtime.cooperative_period_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::config(format!("{} must be greater than zero", key)));
            }
        }

        if self.queue.capacity == 0 {
            return Err(Error::config("queue.capacity must be greater than zero"));
        }

        for dome in &self.domes {
            if dome.open_line == dome.close_line {
                return Err(Error::config(format!(
                    "dome {}: open_line and close_line must differ",
                    dome.name
                )));
            }
            if dome.open_timeout_ms == Some(0) || dome.close_timeout_ms == Some(0) {
                return Err(Error::config(format!(
                    "dome {}: travel timeouts must be greater than zero",
                    dome.name
                )));
            }
        }

        for mount in &self.mounts {
            if mount.periodic.iter().any(|p| p.interval_ms == 0) {
                return Err(Error::config(format!(
                    "mount {}: periodic interval_ms must be greater than zero",
                    mount.name
                )));
            }
        }

        Ok(())
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Read overrides from `STARFLOW__*` variables
    pub fn with_default_environment(self) -> Self {
        self.with_environment_prefix(ENV_PREFIX)
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::from(path));
            } else {
                return Err(Error::config(format!(
                    "Configuration file {} does not exist",
                    config_file
                )));
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!(
            site = %config.general.site_name,
            devices = config.devices.len(),
            domes = config.domes.len(),
            mounts = config.mounts.len(),
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
