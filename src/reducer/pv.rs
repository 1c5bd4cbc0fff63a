use chrono::{DateTime, Utc};
use tracing::debug;

use super::{FaultLog, Reduce, ReducerCore, ReducerFault, ReducerState, StatusDelta};
use crate::config::PvConfig;
use crate::domain::{Field, PvStatus, Reading, Subsystem};

/// Folds PV DC/DC readings into a validated `PvStatus`.
pub struct PvReducer {
    core: ReducerCore,
    status: PvStatus,
    bounds: PvConfig,
}

impl PvReducer {
    pub fn new(cfg: &PvConfig, faults: FaultLog) -> Self {
        Self {
            core: ReducerCore::new(Subsystem::Pv, cfg.staleness_timeout(), faults),
            status: PvStatus::default(),
            bounds: cfg.clone(),
        }
    }

    fn check_range(&self, field: Field, value: f64, min: f64, max: f64) -> Result<(), ReducerFault> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(ReducerFault::OutOfRange {
                subsystem: Subsystem::Pv,
                field,
                value,
                min,
                max,
            })
        }
    }
}

impl Reduce for PvReducer {
    type Status = PvStatus;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Pv
    }

    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault> {
        if self.core.is_faulted() {
            return Ok(self.core.discarded(reading));
        }

        let v = reading.value;
        let check = match reading.field {
            Field::Voltage => self.check_range(Field::Voltage, v, 0.0, self.bounds.max_voltage_v),
            Field::Current => self.check_range(Field::Current, v, 0.0, self.bounds.max_current_a),
            Field::Power => self.check_range(Field::Power, v, 0.0, self.bounds.max_power_kw),
            other => {
                debug!(subsystem = "pv", field = %other, "ignoring unexpected field");
                return Ok(self.core.discarded(reading));
            }
        };
        if let Err(fault) = check {
            self.core.fault(fault.clone());
            self.status.staleness = self.core.state().staleness();
            return Err(fault);
        }

        match reading.field {
            Field::Voltage => self.status.voltage_v = v,
            Field::Current => self.status.current_a = v,
            Field::Power => self.status.power_kw = v,
            _ => unreachable!(),
        }
        self.status.last_updated = Some(reading.timestamp);
        let transition = self.core.accept(reading.timestamp);
        self.status.staleness = self.core.state().staleness();
        Ok(self.core.applied(reading, transition))
    }

    fn current(&self) -> PvStatus {
        self.status.clone()
    }

    fn state(&self) -> ReducerState {
        self.core.state()
    }

    fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.core.last_accepted()
    }

    fn on_tick(&mut self, now: DateTime<Utc>) -> Option<(ReducerState, ReducerState)> {
        let transition = self.core.on_tick(now);
        if transition.is_some() {
            self.status.staleness = self.core.state().staleness();
        }
        transition
    }

    fn reset(&mut self) {
        self.core.reset();
        self.status = PvStatus::default();
    }
}
