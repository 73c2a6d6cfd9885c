//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the battery aggregation runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Highest system id addressable by the 0x500 arbitration-ID block.
pub const MAX_ADDRESSABLE_SYSTEMS: u8 = 16;

fn default_interface() -> String {
    "can0".to_owned()
}

fn default_bitrate() -> u32 {
    500_000
}

fn default_max_systems() -> u8 {
    8
}

fn default_capacity_ah() -> f64 {
    94.0
}

fn default_stale_after() -> Duration {
    Duration::from_secs(5)
}

fn default_lost_after() -> Duration {
    Duration::from_secs(30)
}

fn default_evict_after() -> Duration {
    Duration::from_secs(300)
}

fn default_charge_ceiling() -> Option<f64> {
    Some(50.0)
}

fn default_discharge_ceiling() -> Option<f64> {
    Some(150.0)
}

fn default_soc_taper_pct() -> f64 {
    5.0
}

fn default_ramp_duration() -> Duration {
    Duration::from_secs(15)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_no_live_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_malformed_budget() -> u32 {
    20
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_heartbeat_period() -> Duration {
    Duration::from_millis(1000)
}

fn default_cold_threshold() -> f64 {
    0.0
}

fn default_cold_floor() -> f64 {
    -10.0
}

fn default_hot_threshold() -> f64 {
    45.0
}

fn default_hot_ceiling() -> f64 {
    55.0
}

fn default_derating_hysteresis() -> f64 {
    2.0
}

fn default_band() -> f64 {
    1.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9899"
        .parse()
        .expect("valid default metrics address")
}

fn default_simulation_seed() -> u64 {
    0x5D1u64
}

fn default_simulated_systems() -> u8 {
    2
}

/// Primary configuration object for the battery aggregation runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub can: CanConfig,
    #[serde(default)]
    pub systems: Vec<SystemConfig>,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub derating: DeratingConfig,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "SDI_BMS_CONFIG";

    /// Load configuration from disk, respecting the `SDI_BMS_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Configured capacity for a system, falling back to the tracker default.
    pub fn capacity_for(&self, system_id: u8) -> f64 {
        self.systems
            .iter()
            .find(|system| system.id == system_id)
            .map(|system| system.capacity_ah)
            .unwrap_or(self.tracker.default_capacity_ah)
    }

    /// Display name for a system, `system-<id>` when none is configured.
    pub fn system_name(&self, system_id: u8) -> String {
        self.systems
            .iter()
            .find(|system| system.id == system_id)
            .and_then(|system| system.name.clone())
            .unwrap_or_else(|| format!("system-{}", system_id))
    }

    /// System ids the installation expects to see on the bus.
    pub fn expected_systems(&self) -> Vec<u8> {
        self.systems.iter().map(|system| system.id).collect()
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.can.validate()?;
        let mut seen = HashSet::new();
        for system in &self.systems {
            ensure!(
                system.id >= 1 && system.id <= self.can.max_systems,
                "system id {} outside configured range 1..={}",
                system.id,
                self.can.max_systems
            );
            ensure!(seen.insert(system.id), "system id {} declared twice", system.id);
            ensure!(
                system.capacity_ah.is_finite() && system.capacity_ah > 0.0,
                "system {} capacity must be positive, got {}",
                system.id,
                system.capacity_ah
            );
        }
        self.tracker.validate()?;
        self.limits.validate()?;
        self.controller.validate()?;
        self.derating.validate()?;
        self.hysteresis.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Bus-level settings. The transport itself lives outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanConfig {
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_max_systems")]
    pub max_systems: u8,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            bitrate: default_bitrate(),
            max_systems: default_max_systems(),
        }
    }
}

impl CanConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_systems >= 1 && self.max_systems <= MAX_ADDRESSABLE_SYSTEMS,
            "can.max_systems must be within 1..={}, got {}",
            MAX_ADDRESSABLE_SYSTEMS,
            self.max_systems
        );
        ensure!(
            !self.interface.trim().is_empty(),
            "can.interface must not be empty"
        );
        ensure!(self.bitrate > 0, "can.bitrate must be positive");
        Ok(())
    }
}

/// One physical battery system the installation expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub id: u8,
    #[serde(default = "default_capacity_ah")]
    pub capacity_ah: f64,
    #[serde(default)]
    pub name: Option<String>,
}

impl SystemConfig {
    pub fn new(id: u8, capacity_ah: f64) -> Self {
        Self {
            id,
            capacity_ah,
            name: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_stale_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stale_after: Duration,
    #[serde(default = "default_lost_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub lost_after: Duration,
    #[serde(default = "default_evict_after")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub evict_after: Duration,
    /// Capacity assumed for systems that appear on the bus without a `[[systems]]` entry.
    #[serde(default = "default_capacity_ah")]
    pub default_capacity_ah: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            lost_after: default_lost_after(),
            evict_after: default_evict_after(),
            default_capacity_ah: default_capacity_ah(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.stale_after < self.lost_after && self.lost_after <= self.evict_after,
            "tracker thresholds must satisfy stale_after < lost_after <= evict_after"
        );
        ensure!(
            self.default_capacity_ah.is_finite() && self.default_capacity_ah > 0.0,
            "tracker.default_capacity_ah must be positive"
        );
        Ok(())
    }
}

/// Closed set of strategies for combining per-system current limits.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LimitPolicy {
    /// Sum of every live system's advertised limit.
    #[default]
    Sum,
    /// Live system count multiplied by the weakest advertised limit.
    Min,
    /// Sum of limits, each tapered as its system nears full (charge) or empty (discharge).
    ProportionalToSoc,
    /// Charge at the charge ceiling until any system nears full, then fall
    /// back to the sum of the BMS requests.
    BulkUntilNearFull,
}

impl std::str::FromStr for LimitPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sum" => Ok(LimitPolicy::Sum),
            "min" => Ok(LimitPolicy::Min),
            "proportional_to_soc" | "soc" => Ok(LimitPolicy::ProportionalToSoc),
            "bulk_until_near_full" | "bulk" => Ok(LimitPolicy::BulkUntilNearFull),
            other => Err(format!("unknown limit policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub policy: LimitPolicy,
    /// System-wide charge ceiling in amps, typically the inverter/charger rating.
    #[serde(default = "default_charge_ceiling")]
    pub charge_ceiling_a: Option<f64>,
    #[serde(default = "default_discharge_ceiling")]
    pub discharge_ceiling_a: Option<f64>,
    #[serde(default = "default_soc_taper_pct")]
    pub soc_taper_pct: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            policy: LimitPolicy::default(),
            charge_ceiling_a: default_charge_ceiling(),
            discharge_ceiling_a: default_discharge_ceiling(),
            soc_taper_pct: default_soc_taper_pct(),
        }
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, ceiling) in [
            ("charge_ceiling_a", self.charge_ceiling_a),
            ("discharge_ceiling_a", self.discharge_ceiling_a),
        ] {
            if let Some(value) = ceiling {
                ensure!(
                    value.is_finite() && value >= 0.0,
                    "limits.{} must be non-negative, got {}",
                    name,
                    value
                );
            }
        }
        ensure!(
            self.soc_taper_pct > 0.0 && self.soc_taper_pct <= 100.0,
            "limits.soc_taper_pct must be within (0, 100]"
        );
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_ramp_duration")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub ramp_duration: Duration,
    #[serde(default = "default_watchdog_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub watchdog_timeout: Duration,
    #[serde(default = "default_no_live_grace")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub no_live_grace: Duration,
    #[serde(default = "default_malformed_budget")]
    pub malformed_budget: u32,
    #[serde(default = "default_tick_interval", rename = "tick_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick_interval: Duration,
    #[serde(default = "default_heartbeat_period", rename = "heartbeat_period_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ramp_duration: default_ramp_duration(),
            watchdog_timeout: default_watchdog_timeout(),
            no_live_grace: default_no_live_grace(),
            malformed_budget: default_malformed_budget(),
            tick_interval: default_tick_interval(),
            heartbeat_period: default_heartbeat_period(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.ramp_duration.is_zero(),
            "controller.ramp_duration must be non-zero"
        );
        ensure!(
            !self.watchdog_timeout.is_zero(),
            "controller.watchdog_timeout must be non-zero"
        );
        ensure!(
            !self.tick_interval.is_zero() && !self.heartbeat_period.is_zero(),
            "controller tick and heartbeat periods must be non-zero"
        );
        ensure!(
            self.malformed_budget > 0,
            "controller.malformed_budget must be at least 1"
        );
        Ok(())
    }
}

/// Temperature derating curve. Temperatures in degrees Celsius.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeratingConfig {
    /// Below this minimum cell temperature the charge limit starts to taper.
    #[serde(default = "default_cold_threshold")]
    pub cold_threshold_c: f64,
    /// At or below this temperature the charge limit is zero.
    #[serde(default = "default_cold_floor")]
    pub cold_floor_c: f64,
    /// Above this maximum cell temperature both limits start to taper.
    #[serde(default = "default_hot_threshold")]
    pub hot_threshold_c: f64,
    /// At or above this temperature both limits are zero.
    #[serde(default = "default_hot_ceiling")]
    pub hot_ceiling_c: f64,
    /// Dead-band applied when leaving the derated state.
    #[serde(default = "default_derating_hysteresis")]
    pub hysteresis_c: f64,
}

impl Default for DeratingConfig {
    fn default() -> Self {
        Self {
            cold_threshold_c: default_cold_threshold(),
            cold_floor_c: default_cold_floor(),
            hot_threshold_c: default_hot_threshold(),
            hot_ceiling_c: default_hot_ceiling(),
            hysteresis_c: default_derating_hysteresis(),
        }
    }
}

impl DeratingConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cold_floor_c < self.cold_threshold_c,
            "derating.cold_floor_c must be below cold_threshold_c"
        );
        ensure!(
            self.cold_threshold_c < self.hot_threshold_c,
            "derating.cold_threshold_c must be below hot_threshold_c"
        );
        ensure!(
            self.hot_threshold_c < self.hot_ceiling_c,
            "derating.hot_threshold_c must be below hot_ceiling_c"
        );
        ensure!(
            self.hysteresis_c >= 0.0,
            "derating.hysteresis_c must be non-negative"
        );
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    #[serde(default = "default_band")]
    pub band_a: f64,
    #[serde(default = "default_max_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_interval: Duration,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            band_a: default_band(),
            max_interval: default_max_interval(),
        }
    }
}

impl HysteresisConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.band_a.is_finite() && self.band_a >= 0.0,
            "hysteresis.band_a must be non-negative"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_seed")]
    pub random_seed: u64,
    #[serde(default = "default_simulated_systems")]
    pub systems: u8,
    #[serde(default)]
    pub start_temperature_c: Option<f64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            random_seed: default_simulation_seed(),
            systems: default_simulated_systems(),
            start_temperature_c: None,
        }
    }
}
