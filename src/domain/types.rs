use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// The five coordinated power subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Pv,
    Battery,
    Genset,
    Charger,
    Pcs,
}

impl Subsystem {
    pub const ALL: [Subsystem; 5] = [
        Subsystem::Pv,
        Subsystem::Battery,
        Subsystem::Genset,
        Subsystem::Charger,
        Subsystem::Pcs,
    ];

    /// Stable index used for per-subsystem lane storage.
    pub fn index(self) -> usize {
        match self {
            Subsystem::Pv => 0,
            Subsystem::Battery => 1,
            Subsystem::Genset => 2,
            Subsystem::Charger => 3,
            Subsystem::Pcs => 4,
        }
    }
}

/// Measurement channels an adapter can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Voltage,
    Current,
    Power,
    Soc,
    Temperature,
    FuelLevel,
    Frequency,
    Running,
    Charging,
    Mode,
}

impl Field {
    /// Unit every value of this field is normalized to at ingest.
    pub fn canonical_unit(self) -> Unit {
        match self {
            Field::Voltage => Unit::Volt,
            Field::Current => Unit::Ampere,
            Field::Power => Unit::Kilowatt,
            Field::Soc | Field::FuelLevel => Unit::Percent,
            Field::Temperature => Unit::Celsius,
            Field::Frequency => Unit::Hertz,
            Field::Running | Field::Charging => Unit::Flag,
            Field::Mode => Unit::ModeCode,
        }
    }
}

/// Units accepted on the ingestion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Volt,
    Ampere,
    Watt,
    Kilowatt,
    Percent,
    Celsius,
    Hertz,
    /// Boolean flags travel as 0.0 / 1.0.
    Flag,
    /// Numeric operating-mode register value.
    ModeCode,
}

impl Unit {
    /// Convert `value` into the canonical unit of `field`, or `None` when the
    /// units are incompatible.
    pub fn normalize(self, field: Field, value: f64) -> Option<f64> {
        let canonical = field.canonical_unit();
        if self == canonical {
            return Some(value);
        }
        match (canonical, self) {
            (Unit::Kilowatt, Unit::Watt) => Some(value / 1000.0),
            _ => None,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::Kilowatt => "kW",
            Unit::Percent => "%",
            Unit::Celsius => "°C",
            Unit::Hertz => "Hz",
            Unit::Flag => "flag",
            Unit::ModeCode => "mode",
        };
        write!(f, "{s}")
    }
}

/// One raw timestamped measurement pushed by a subsystem adapter.
///
/// Immutable once created; owned by the ingestion buffer until the owning
/// reducer consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub subsystem: Subsystem,
    pub field: Field,
    pub value: f64,
    pub unit: Unit,
    pub timestamp: DateTime<Utc>,
    pub sequence_no: u64,
}

impl Reading {
    pub fn new(
        subsystem: Subsystem,
        field: Field,
        value: f64,
        unit: Unit,
        timestamp: DateTime<Utc>,
        sequence_no: u64,
    ) -> Self {
        Self {
            subsystem,
            field,
            value,
            unit,
            timestamp,
            sequence_no,
        }
    }

    /// Interpret the value as a boolean flag (0.0 = false, anything else = true).
    pub fn flag(&self) -> bool {
        self.value != 0.0
    }
}

/// Data freshness of a subsystem snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Staleness {
    Fresh,
    Stale,
    #[default]
    Unknown,
}

/// Aggregated system health derived each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    #[default]
    Unknown,
    Nominal,
    Degraded,
    Fault,
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverallHealth::Unknown => "unknown",
            OverallHealth::Nominal => "nominal",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Fault => "fault",
        };
        write!(f, "{s}")
    }
}

/// Operating modes of the power-conversion system, matching the numeric mode
/// register the PCS firmware reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PcsMode {
    #[default]
    Standby,
    Charging,
    Discharging,
    GridTie,
    OffGrid,
}

impl PcsMode {
    /// Decode a mode register value. Codes follow the firmware register map.
    pub fn from_code(code: f64) -> Option<Self> {
        if code.fract() != 0.0 || !(0.0..=4.0).contains(&code) {
            return None;
        }
        match code as u16 {
            0 => Some(PcsMode::Standby),
            1 => Some(PcsMode::Charging),
            2 => Some(PcsMode::Discharging),
            3 => Some(PcsMode::GridTie),
            4 => Some(PcsMode::OffGrid),
            _ => None,
        }
    }

    pub fn code(self) -> u16 {
        match self {
            PcsMode::Standby => 0,
            PcsMode::Charging => 1,
            PcsMode::Discharging => 2,
            PcsMode::GridTie => 3,
            PcsMode::OffGrid => 4,
        }
    }
}
