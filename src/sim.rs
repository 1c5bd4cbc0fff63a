//! Simulated subsystem adapters, enabled by the `sim` feature (on by
//! default). Each source emits a plausible reading batch per poll so the core
//! can run end-to-end without hardware.
//!
//! The nominal operating point roughly balances: PV around 5 kW, genset off,
//! battery absorbing about 1 kW, charger drawing 2 kW, PCS exporting 2 kW.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::domain::{Field, PcsMode, Reading, Subsystem, Unit};
use crate::ingest::{IngestError, Ingestor};

/// A producer of raw subsystem readings, polled on a fixed period.
#[async_trait]
pub trait ReadingSource: Send + 'static {
    fn subsystem(&self) -> Subsystem;

    /// Produce the next reading batch. `seq` is the batch counter; sources
    /// derive monotonic per-field sequence numbers from it.
    async fn sample(&mut self, seq: u64) -> Vec<Reading>;
}

fn jitter(base: f64, spread: f64) -> f64 {
    base + rand::thread_rng().gen_range(-spread..=spread)
}

pub struct SimulatedPv {
    pub nominal_power_kw: f64,
}

#[async_trait]
impl ReadingSource for SimulatedPv {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Pv
    }

    async fn sample(&mut self, seq: u64) -> Vec<Reading> {
        let now = Utc::now();
        let power = jitter(self.nominal_power_kw, 0.3).max(0.0);
        let voltage = jitter(620.0, 5.0);
        vec![
            Reading::new(Subsystem::Pv, Field::Power, power, Unit::Kilowatt, now, seq),
            Reading::new(Subsystem::Pv, Field::Voltage, voltage, Unit::Volt, now, seq),
            Reading::new(
                Subsystem::Pv,
                Field::Current,
                power * 1000.0 / voltage,
                Unit::Ampere,
                now,
                seq,
            ),
        ]
    }
}

pub struct SimulatedBattery {
    pub soc_percent: f64,
    /// Positive = discharging into the bus.
    pub power_kw: f64,
}

#[async_trait]
impl ReadingSource for SimulatedBattery {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Battery
    }

    async fn sample(&mut self, seq: u64) -> Vec<Reading> {
        let now = Utc::now();
        // Crude coulomb counting against a notional 100 kWh pack, drifting a
        // fraction of a percent per batch.
        self.soc_percent = (self.soc_percent - self.power_kw * 0.001).clamp(0.0, 100.0);
        let power = jitter(self.power_kw, 0.1);
        vec![
            Reading::new(
                Subsystem::Battery,
                Field::Soc,
                self.soc_percent,
                Unit::Percent,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Battery,
                Field::Power,
                power,
                Unit::Kilowatt,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Battery,
                Field::Voltage,
                jitter(710.0, 2.0),
                Unit::Volt,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Battery,
                Field::Temperature,
                jitter(28.0, 0.5),
                Unit::Celsius,
                now,
                seq,
            ),
        ]
    }
}

pub struct SimulatedGenset {
    pub running: bool,
    pub fuel_level_percent: f64,
}

#[async_trait]
impl ReadingSource for SimulatedGenset {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Genset
    }

    async fn sample(&mut self, seq: u64) -> Vec<Reading> {
        let now = Utc::now();
        let power = if self.running { jitter(40.0, 1.0) } else { 0.0 };
        if self.running {
            self.fuel_level_percent = (self.fuel_level_percent - 0.002).max(0.0);
        }
        vec![
            Reading::new(
                Subsystem::Genset,
                Field::Running,
                if self.running { 1.0 } else { 0.0 },
                Unit::Flag,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Genset,
                Field::Power,
                power,
                Unit::Kilowatt,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Genset,
                Field::FuelLevel,
                self.fuel_level_percent,
                Unit::Percent,
                now,
                seq,
            ),
        ]
    }
}

pub struct SimulatedCharger {
    pub session_power_kw: f64,
}

#[async_trait]
impl ReadingSource for SimulatedCharger {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Charger
    }

    async fn sample(&mut self, seq: u64) -> Vec<Reading> {
        let now = Utc::now();
        let charging = self.session_power_kw > 0.0;
        let power = if charging {
            jitter(self.session_power_kw, 0.1).max(0.0)
        } else {
            0.0
        };
        vec![
            Reading::new(
                Subsystem::Charger,
                Field::Charging,
                if charging { 1.0 } else { 0.0 },
                Unit::Flag,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Charger,
                Field::Power,
                power,
                Unit::Kilowatt,
                now,
                seq,
            ),
        ]
    }
}

pub struct SimulatedPcs {
    pub mode: PcsMode,
    pub power_kw: f64,
}

#[async_trait]
impl ReadingSource for SimulatedPcs {
    fn subsystem(&self) -> Subsystem {
        Subsystem::Pcs
    }

    async fn sample(&mut self, seq: u64) -> Vec<Reading> {
        let now = Utc::now();
        let power = if self.mode == PcsMode::Standby {
            0.0
        } else {
            jitter(self.power_kw, 0.1)
        };
        vec![
            Reading::new(
                Subsystem::Pcs,
                Field::Mode,
                self.mode.code() as f64,
                Unit::ModeCode,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Pcs,
                Field::Power,
                power,
                Unit::Kilowatt,
                now,
                seq,
            ),
            Reading::new(
                Subsystem::Pcs,
                Field::Frequency,
                jitter(50.0, 0.02),
                Unit::Hertz,
                now,
                seq,
            ),
        ]
    }
}

/// The default simulated plant: roughly power-balanced, genset off.
pub fn default_sources() -> Vec<Box<dyn ReadingSource>> {
    vec![
        Box::new(SimulatedPv {
            nominal_power_kw: 5.0,
        }),
        Box::new(SimulatedBattery {
            soc_percent: 60.0,
            power_kw: -1.0,
        }),
        Box::new(SimulatedGenset {
            running: false,
            fuel_level_percent: 80.0,
        }),
        Box::new(SimulatedCharger {
            session_power_kw: 2.0,
        }),
        Box::new(SimulatedPcs {
            mode: PcsMode::GridTie,
            power_kw: 2.0,
        }),
    ]
}

/// Spawn one polling task per source, feeding the ingestor until cancelled.
pub fn spawn_sources(
    tracker: &TaskTracker,
    sources: Vec<Box<dyn ReadingSource>>,
    ingestor: Ingestor,
    period: Duration,
    cancel: CancellationToken,
) {
    for mut source in sources {
        let ingestor = ingestor.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let subsystem = source.subsystem();
            let mut ticker = tokio::time::interval(period);
            let mut seq = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        seq += 1;
                        for reading in source.sample(seq).await {
                            match ingestor.ingest(reading) {
                                Ok(()) | Err(IngestError::Shutdown) => {}
                                Err(err) => {
                                    warn!(subsystem = %subsystem, %err, "simulated reading rejected");
                                }
                            }
                        }
                    }
                }
            }
            debug!(subsystem = %subsystem, "simulated source stopped");
        });
    }
}
