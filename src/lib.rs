//! EMS state-aggregation core.
//!
//! Normalizes raw subsystem readings (PV, battery, genset, EV charger, PCS),
//! folds them into per-subsystem validated snapshots, and publishes a single
//! consistent plant-wide status at a fixed tick.
//!
//! Data flows in one direction:
//!
//! `adapters → IngestBuffer → reducers → Aggregator → Publisher → subscribers`
//!
//! Build a running core with [`pipeline::EmsCore::start`] and drive it
//! through the returned [`pipeline::EmsHandle`].

pub mod aggregator;
pub mod config;
pub mod domain;
pub mod ingest;
pub mod pipeline;
pub mod publisher;
pub mod reducer;
#[cfg(feature = "sim")]
pub mod sim;
pub mod telemetry;

pub use config::Config;
pub use domain::{EmsStatus, Field, OverallHealth, Reading, Subsystem, Unit};
pub use pipeline::{EmsCore, EmsHandle};
