use chrono::{DateTime, Utc};
use tracing::debug;

use super::{FaultLog, Reduce, ReducerCore, ReducerFault, ReducerState, StatusDelta};
use crate::config::ChargerConfig;
use crate::domain::{ChargerStatus, Field, Reading, Subsystem};

/// Folds EV-charger readings into a validated `ChargerStatus`.
pub struct ChargerReducer {
    core: ReducerCore,
    status: ChargerStatus,
    bounds: ChargerConfig,
}

impl ChargerReducer {
    pub fn new(cfg: &ChargerConfig, faults: FaultLog) -> Self {
        Self {
            core: ReducerCore::new(Subsystem::Charger, cfg.staleness_timeout(), faults),
            status: ChargerStatus::default(),
            bounds: cfg.clone(),
        }
    }

    fn validate(&self, reading: &Reading) -> Result<(), ReducerFault> {
        let v = reading.value;
        let out_of_range = |min: f64, max: f64| ReducerFault::OutOfRange {
            subsystem: Subsystem::Charger,
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
                if !self.status.charging && v > self.bounds.idle_power_threshold_kw {
                    return Err(ReducerFault::FlagPowerMismatch {
                        subsystem: Subsystem::Charger,
                        flag: Field::Charging,
                        power_kw: v,
                    });
                }
                Ok(())
            }
            Field::Voltage => (0.0..=self.bounds.max_voltage_v)
                .contains(&v)
                .then_some(())
                .ok_or(out_of_range(0.0, self.bounds.max_voltage_v)),
            Field::Current => (0.0..=self.bounds.max_current_a)
                .contains(&v)
                .then_some(())
                .ok_or(out_of_range(0.0, self.bounds.max_current_a)),
            Field::Charging => Ok(()),
            _ => Ok(()),
        }
    }
}

impl Reduce for ChargerReducer {
    type Status = ChargerStatus;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Charger
    }

    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault> {
        if self.core.is_faulted() {
            return Ok(self.core.discarded(reading));
        }

        match reading.field {
            Field::Charging | Field::Power | Field::Voltage | Field::Current => {}
            other => {
                debug!(subsystem = "charger", field = %other, "ignoring unexpected field");
                return Ok(self.core.discarded(reading));
            }
        }

        if let Err(fault) = self.validate(reading) {
            self.core.fault(fault.clone());
            self.status.staleness = self.core.state().staleness();
            return Err(fault);
        }

        match reading.field {
            Field::Charging => {
                self.status.charging = reading.flag();
                if !self.status.charging {
                    self.status.power_kw = 0.0;
                }
            }
            Field::Power => self.status.power_kw = reading.value,
            Field::Voltage => self.status.voltage_v = reading.value,
            Field::Current => self.status.current_a = reading.value,
            _ => unreachable!(),
        }
        self.status.last_updated = Some(reading.timestamp);
        let transition = self.core.accept(reading.timestamp);
        self.status.staleness = self.core.state().staleness();
        Ok(self.core.applied(reading, transition))
    }

    fn current(&self) -> ChargerStatus {
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
        self.status = ChargerStatus::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reducer() -> ChargerReducer {
        ChargerReducer::new(&ChargerConfig::default(), FaultLog::new(8))
    }

    fn reading(field: Field, value: f64, seq: u64) -> Reading {
        Reading::new(
            Subsystem::Charger,
            field,
            value,
            field.canonical_unit(),
            Utc::now(),
            seq,
        )
    }

    #[test]
    fn test_charging_session_flow() {
        let mut r = reducer();
        r.apply(&reading(Field::Charging, 1.0, 1)).unwrap();
        r.apply(&reading(Field::Power, 22.0, 2)).unwrap();
        r.apply(&reading(Field::Voltage, 400.0, 3)).unwrap();
        r.apply(&reading(Field::Current, 32.0, 4)).unwrap();

        let s = r.current();
        assert!(s.charging);
        assert_eq!(s.power_kw, 22.0);

        // Session ends, draw is cleared with the flag.
        r.apply(&reading(Field::Charging, 0.0, 5)).unwrap();
        assert_eq!(r.current().power_kw, 0.0);
    }

    #[test]
    fn test_power_while_not_charging_faults() {
        let mut r = reducer();
        r.apply(&reading(Field::Charging, 0.0, 1)).unwrap();
        let err = r.apply(&reading(Field::Power, 11.0, 2)).unwrap_err();
        assert!(matches!(
            err,
            ReducerFault::FlagPowerMismatch {
                flag: Field::Charging,
                ..
            }
        ));
        assert_eq!(r.state(), ReducerState::Faulted);
    }

    #[test]
    fn test_negative_power_faults() {
        let mut r = reducer();
        r.apply(&reading(Field::Charging, 1.0, 1)).unwrap();
        let err = r.apply(&reading(Field::Power, -3.0, 2)).unwrap_err();
        assert!(matches!(err, ReducerFault::OutOfRange { .. }));
    }
}
