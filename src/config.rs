use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use std::time::Duration;

/// Core configuration, supplied at construction. Not hot-reloaded.
///
/// Every numeric threshold here is an illustrative placeholder to be
/// calibrated against real hardware characteristics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub aggregation: AggregationConfig,
    pub ingest: IngestConfig,
    pub faults: FaultChannelConfig,
    pub pv: PvConfig,
    pub battery: BatteryConfig,
    pub genset: GensetConfig,
    pub charger: ChargerConfig,
    pub pcs: PcsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Fixed aggregation tick period.
    pub tick_ms: u64,
    /// |power balance residual| above this marks the system degraded.
    pub balance_tolerance_kw: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Most-recent readings retained per subsystem field.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaultChannelConfig {
    /// Broadcast capacity of the fault side-channel.
    pub capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PvConfig {
    pub staleness_timeout_ms: u64,
    pub max_voltage_v: f64,
    pub max_current_a: f64,
    pub max_power_kw: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub staleness_timeout_ms: u64,
    pub min_voltage_v: f64,
    pub max_voltage_v: f64,
    pub max_current_a: f64,
    pub max_power_kw: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GensetConfig {
    pub staleness_timeout_ms: u64,
    pub max_power_kw: f64,
    /// Power above this while not running is implausible.
    pub idle_power_threshold_kw: f64,
    /// Frequency band the engine must hold while running.
    pub min_frequency_hz: f64,
    pub max_frequency_hz: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChargerConfig {
    pub staleness_timeout_ms: u64,
    pub max_power_kw: f64,
    /// Power above this while not charging is implausible.
    pub idle_power_threshold_kw: f64,
    pub max_voltage_v: f64,
    pub max_current_a: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PcsConfig {
    pub staleness_timeout_ms: u64,
    pub max_power_kw: f64,
    /// Power above this while in standby mode is implausible.
    pub idle_power_threshold_kw: f64,
    pub max_frequency_hz: f64,
}

impl Config {
    /// Merge `config/default.toml` with `EMS__`-prefixed environment
    /// overrides (e.g. `EMS__AGGREGATION__TICK_MS=500`).
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("EMS__").split("__"));
        Ok(figment.extract()?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            ingest: IngestConfig::default(),
            faults: FaultChannelConfig::default(),
            pv: PvConfig::default(),
            battery: BatteryConfig::default(),
            genset: GensetConfig::default(),
            charger: ChargerConfig::default(),
            pcs: PcsConfig::default(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000, // 1 Hz
            balance_tolerance_kw: 0.5,
        }
    }
}

impl AggregationConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

impl Default for FaultChannelConfig {
    fn default() -> Self {
        Self { capacity: 32 }
    }
}

impl Default for PvConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 5000,
            max_voltage_v: 1000.0,
            max_current_a: 200.0,
            max_power_kw: 150.0,
        }
    }
}

impl PvConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms.max(1))
    }
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 2000,
            min_voltage_v: 40.0,
            max_voltage_v: 900.0,
            max_current_a: 300.0,
            max_power_kw: 250.0,
            min_temperature_c: -20.0,
            max_temperature_c: 60.0,
        }
    }
}

impl BatteryConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms.max(1))
    }
}

impl Default for GensetConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 10_000,
            max_power_kw: 500.0,
            idle_power_threshold_kw: 0.5,
            min_frequency_hz: 45.0,
            max_frequency_hz: 65.0,
        }
    }
}

impl GensetConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms.max(1))
    }
}

impl Default for ChargerConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 3000,
            max_power_kw: 350.0, // 15 stations x 22 kW, rounded up
            idle_power_threshold_kw: 0.2,
            max_voltage_v: 1000.0,
            max_current_a: 400.0,
        }
    }
}

impl ChargerConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms.max(1))
    }
}

impl Default for PcsConfig {
    fn default() -> Self {
        Self {
            staleness_timeout_ms: 2000,
            max_power_kw: 500.0,
            idle_power_threshold_kw: 0.5,
            max_frequency_hz: 65.0,
        }
    }
}

impl PcsConfig {
    pub fn staleness_timeout(&self) -> Duration {
        Duration::from_millis(self.staleness_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.aggregation.tick(), Duration::from_millis(1000));
        assert_eq!(cfg.pv.staleness_timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.battery.staleness_timeout(), Duration::from_millis(2000));
        assert!(cfg.aggregation.balance_tolerance_kw > 0.0);
        assert!(cfg.ingest.queue_capacity > 0);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let cfg: Config = Figment::new()
            .merge(figment::providers::Toml::string(
                r#"
                [aggregation]
                tick_ms = 250

                [battery]
                staleness_timeout_ms = 500
                "#,
            ))
            .extract()
            .unwrap();
        assert_eq!(cfg.aggregation.tick_ms, 250);
        assert_eq!(cfg.battery.staleness_timeout_ms, 500);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.pv.staleness_timeout_ms, 5000);
        assert_eq!(cfg.battery.max_power_kw, 250.0);
    }
}
