//! Core data model: readings on the way in, validated snapshots on the way out.

pub mod status;
pub mod types;

pub use status::{
    BatteryStatus, ChargerStatus, EmsStatus, GensetStatus, PcsStatus, PvStatus, SubsystemStatus,
};
pub use types::{Field, OverallHealth, PcsMode, Reading, Staleness, Subsystem, Unit};
