use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{OverallHealth, PcsMode, Staleness};

/// Validated PV array snapshot (DC side of the PV DC/DC converter).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PvStatus {
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_kw: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub staleness: Staleness,
}

/// Validated battery pack snapshot.
///
/// Power convention: positive = discharging into the bus, negative = charging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub soc_percent: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_kw: f64,
    pub temperature_c: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub staleness: Staleness,
}

/// Validated generator-set snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GensetStatus {
    pub running: bool,
    pub power_kw: f64,
    pub fuel_level_percent: f64,
    pub frequency_hz: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub staleness: Staleness,
}

/// Validated EV-charger snapshot (power is consumption from the bus).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChargerStatus {
    pub charging: bool,
    pub power_kw: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub staleness: Staleness,
}

/// Validated power-conversion-system snapshot (power is consumption from the bus).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PcsStatus {
    pub mode: PcsMode,
    pub power_kw: f64,
    pub frequency_hz: f64,
    pub last_updated: Option<DateTime<Utc>>,
    pub staleness: Staleness,
}

/// Any subsystem snapshot, tagged by subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subsystem", rename_all = "snake_case")]
pub enum SubsystemStatus {
    Pv(PvStatus),
    Battery(BatteryStatus),
    Genset(GensetStatus),
    Charger(ChargerStatus),
    Pcs(PcsStatus),
}

impl SubsystemStatus {
    pub fn staleness(&self) -> Staleness {
        match self {
            SubsystemStatus::Pv(s) => s.staleness,
            SubsystemStatus::Battery(s) => s.staleness,
            SubsystemStatus::Genset(s) => s.staleness,
            SubsystemStatus::Charger(s) => s.staleness,
            SubsystemStatus::Pcs(s) => s.staleness,
        }
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        match self {
            SubsystemStatus::Pv(s) => s.last_updated,
            SubsystemStatus::Battery(s) => s.last_updated,
            SubsystemStatus::Genset(s) => s.last_updated,
            SubsystemStatus::Charger(s) => s.last_updated,
            SubsystemStatus::Pcs(s) => s.last_updated,
        }
    }
}

/// One internally consistent aggregate of the whole system, produced once per
/// aggregation tick. Never mutated after creation; consumers receive it behind
/// an `Arc` and re-aggregation replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmsStatus {
    /// Monotonically increasing aggregation tick counter.
    pub tick: u64,
    pub generated_at: DateTime<Utc>,
    pub pv: PvStatus,
    pub battery: BatteryStatus,
    pub genset: GensetStatus,
    pub charger: ChargerStatus,
    pub pcs: PcsStatus,
    /// pv + genset + battery - charger - pcs, in kW (generation positive).
    pub power_balance_residual_kw: f64,
    pub overall_health: OverallHealth,
}

impl EmsStatus {
    /// Placeholder aggregate used before the first tick has run.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            tick: 0,
            generated_at: now,
            pv: PvStatus::default(),
            battery: BatteryStatus::default(),
            genset: GensetStatus::default(),
            charger: ChargerStatus::default(),
            pcs: PcsStatus::default(),
            power_balance_residual_kw: 0.0,
            overall_health: OverallHealth::Unknown,
        }
    }

    /// Total generation feeding the bus, in kW.
    pub fn total_generation_kw(&self) -> f64 {
        self.pv.power_kw + self.genset.power_kw + self.battery.power_kw.max(0.0)
    }

    /// Total consumption drawn from the bus, in kW.
    pub fn total_consumption_kw(&self) -> f64 {
        self.charger.power_kw + self.pcs.power_kw + (-self.battery.power_kw).max(0.0)
    }
}

impl fmt::Display for EmsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick {} [{:?}] pv={:.2}kW batt={:.2}kW ({:.0}%) genset={:.2}kW chg={:.2}kW pcs={:.2}kW residual={:.3}kW",
            self.tick,
            self.overall_health,
            self.pv.power_kw,
            self.battery.power_kw,
            self.battery.soc_percent,
            self.genset.power_kw,
            self.charger.power_kw,
            self.pcs.power_kw,
            self.power_balance_residual_kw,
        )
    }
}
