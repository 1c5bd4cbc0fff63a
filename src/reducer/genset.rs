use chrono::{DateTime, Utc};
use tracing::debug;

use super::{FaultLog, Reduce, ReducerCore, ReducerFault, ReducerState, StatusDelta};
use crate::config::GensetConfig;
use crate::domain::{Field, GensetStatus, Reading, Subsystem};

/// Folds generator-set readings into a validated `GensetStatus`.
pub struct GensetReducer {
    core: ReducerCore,
    status: GensetStatus,
    bounds: GensetConfig,
}

impl GensetReducer {
    pub fn new(cfg: &GensetConfig, faults: FaultLog) -> Self {
        Self {
            core: ReducerCore::new(Subsystem::Genset, cfg.staleness_timeout(), faults),
            status: GensetStatus::default(),
            bounds: cfg.clone(),
        }
    }

    fn validate(&self, reading: &Reading) -> Result<(), ReducerFault> {
        let v = reading.value;
        let out_of_range = |min: f64, max: f64| ReducerFault::OutOfRange {
            subsystem: Subsystem::Genset,
            field: reading.field,
            value: v,
            min,
            max,
        };
        match reading.field {
            Field::Power => {
                if !(0.0..=self.bounds.max_power_kw).contains(&v) {
                    return Err(out_of_range(0.0, self.bounds.max_power_kw));
                }
                // Meaningful output from a stopped engine means a stuck flag
                // or a wiring/topology error.
                if !self.status.running && v > self.bounds.idle_power_threshold_kw {
                    return Err(ReducerFault::FlagPowerMismatch {
                        subsystem: Subsystem::Genset,
                        flag: Field::Running,
                        power_kw: v,
                    });
                }
                Ok(())
            }
            Field::FuelLevel => (0.0..=100.0)
                .contains(&v)
                .then_some(())
                .ok_or(out_of_range(0.0, 100.0)),
            Field::Frequency => {
                // A running engine must hold the nominal band; stopped it may
                // legitimately read zero.
                let min = if self.status.running {
                    self.bounds.min_frequency_hz
                } else {
                    0.0
                };
                (min..=self.bounds.max_frequency_hz)
                    .contains(&v)
                    .then_some(())
                    .ok_or(out_of_range(min, self.bounds.max_frequency_hz))
            }
            Field::Running => Ok(()),
            _ => Ok(()),
        }
    }
}

impl Reduce for GensetReducer {
    type Status = GensetStatus;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Genset
    }

    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault> {
        if self.core.is_faulted() {
            return Ok(self.core.discarded(reading));
        }

        match reading.field {
            Field::Running | Field::Power | Field::FuelLevel | Field::Frequency => {}
            other => {
                debug!(subsystem = "genset", field = %other, "ignoring unexpected field");
                return Ok(self.core.discarded(reading));
            }
        }

        if let Err(fault) = self.validate(reading) {
            self.core.fault(fault.clone());
            self.status.staleness = self.core.state().staleness();
            return Err(fault);
        }

        match reading.field {
            Field::Running => {
                self.status.running = reading.flag();
                if !self.status.running {
                    // A stopped engine produces nothing; clear the output so a
                    // stale power figure does not linger in the aggregate.
                    self.status.power_kw = 0.0;
                }
            }
            Field::Power => self.status.power_kw = reading.value,
            Field::FuelLevel => self.status.fuel_level_percent = reading.value,
            Field::Frequency => self.status.frequency_hz = reading.value,
            _ => unreachable!(),
        }
        self.status.last_updated = Some(reading.timestamp);
        let transition = self.core.accept(reading.timestamp);
        self.status.staleness = self.core.state().staleness();
        Ok(self.core.applied(reading, transition))
    }

    fn current(&self) -> GensetStatus {
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
        self.status = GensetStatus::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reducer() -> GensetReducer {
        GensetReducer::new(&GensetConfig::default(), FaultLog::new(8))
    }

    fn reading(field: Field, value: f64, seq: u64) -> Reading {
        Reading::new(
            Subsystem::Genset,
            field,
            value,
            field.canonical_unit(),
            Utc::now(),
            seq,
        )
    }

    #[test]
    fn test_running_genset_reports_power() {
        let mut r = reducer();
        r.apply(&reading(Field::Running, 1.0, 1)).unwrap();
        r.apply(&reading(Field::Power, 42.0, 2)).unwrap();
        r.apply(&reading(Field::Frequency, 50.0, 3)).unwrap();
        r.apply(&reading(Field::FuelLevel, 76.0, 4)).unwrap();

        let s = r.current();
        assert!(s.running);
        assert_eq!(s.power_kw, 42.0);
        assert_eq!(s.frequency_hz, 50.0);
        assert_eq!(s.fuel_level_percent, 76.0);
    }

    #[test]
    fn test_power_while_stopped_faults() {
        let mut r = reducer();
        r.apply(&reading(Field::Running, 0.0, 1)).unwrap();
        let err = r.apply(&reading(Field::Power, 30.0, 2)).unwrap_err();
        assert!(matches!(err, ReducerFault::FlagPowerMismatch { .. }));
        assert_eq!(r.state(), ReducerState::Faulted);
    }

    #[test]
    fn test_stop_clears_power_output() {
        let mut r = reducer();
        r.apply(&reading(Field::Running, 1.0, 1)).unwrap();
        r.apply(&reading(Field::Power, 42.0, 2)).unwrap();
        r.apply(&reading(Field::Running, 0.0, 3)).unwrap();
        assert_eq!(r.current().power_kw, 0.0);
        assert_eq!(r.state(), ReducerState::Live);
    }

    #[test]
    fn test_off_nominal_frequency_while_running_faults() {
        let mut r = reducer();
        r.apply(&reading(Field::Running, 1.0, 1)).unwrap();
        let err = r.apply(&reading(Field::Frequency, 30.0, 2)).unwrap_err();
        assert!(matches!(
            err,
            ReducerFault::OutOfRange {
                field: Field::Frequency,
                min,
                ..
            } if min == 45.0
        ));
    }

    #[test]
    fn test_fuel_level_bounds() {
        let mut r = reducer();
        let err = r.apply(&reading(Field::FuelLevel, 120.0, 1)).unwrap_err();
        assert!(matches!(
            err,
            ReducerFault::OutOfRange {
                field: Field::FuelLevel,
                ..
            }
        ));
    }
}
