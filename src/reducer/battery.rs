use chrono::{DateTime, Utc};
use tracing::debug;

use super::{FaultLog, Reduce, ReducerCore, ReducerFault, ReducerState, StatusDelta};
use crate::config::BatteryConfig;
use crate::domain::{BatteryStatus, Field, Reading, Subsystem};

/// Folds BMS readings into a validated `BatteryStatus`.
///
/// Power convention: positive = discharging into the bus, negative = charging.
pub struct BatteryReducer {
    core: ReducerCore,
    status: BatteryStatus,
    bounds: BatteryConfig,
}

impl BatteryReducer {
    pub fn new(cfg: &BatteryConfig, faults: FaultLog) -> Self {
        Self {
            core: ReducerCore::new(Subsystem::Battery, cfg.staleness_timeout(), faults),
            status: BatteryStatus::default(),
            bounds: cfg.clone(),
        }
    }

    fn check_range(&self, field: Field, value: f64, min: f64, max: f64) -> Result<(), ReducerFault> {
        if (min..=max).contains(&value) {
            Ok(())
        } else {
            Err(ReducerFault::OutOfRange {
                subsystem: Subsystem::Battery,
                field,
                value,
                min,
                max,
            })
        }
    }
}

impl Reduce for BatteryReducer {
    type Status = BatteryStatus;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Battery
    }

    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault> {
        if self.core.is_faulted() {
            return Ok(self.core.discarded(reading));
        }

        let v = reading.value;
        let b = &self.bounds;
        let check = match reading.field {
            Field::Soc => self.check_range(Field::Soc, v, 0.0, 100.0),
            Field::Voltage => self.check_range(Field::Voltage, v, b.min_voltage_v, b.max_voltage_v),
            Field::Current => self.check_range(Field::Current, v, -b.max_current_a, b.max_current_a),
            Field::Power => self.check_range(Field::Power, v, -b.max_power_kw, b.max_power_kw),
            Field::Temperature => {
                self.check_range(Field::Temperature, v, b.min_temperature_c, b.max_temperature_c)
            }
            other => {
                debug!(subsystem = "battery", field = %other, "ignoring unexpected field");
                return Ok(self.core.discarded(reading));
            }
        };
        if let Err(fault) = check {
            self.core.fault(fault.clone());
            self.status.staleness = self.core.state().staleness();
            return Err(fault);
        }

        match reading.field {
            Field::Soc => self.status.soc_percent = v,
            Field::Voltage => self.status.voltage_v = v,
            Field::Current => self.status.current_a = v,
            Field::Power => self.status.power_kw = v,
            Field::Temperature => self.status.temperature_c = v,
            _ => unreachable!(),
        }
        self.status.last_updated = Some(reading.timestamp);
        let transition = self.core.accept(reading.timestamp);
        self.status.staleness = self.core.state().staleness();
        Ok(self.core.applied(reading, transition))
    }

    fn current(&self) -> BatteryStatus {
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
        self.status = BatteryStatus::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn reducer() -> BatteryReducer {
        BatteryReducer::new(&BatteryConfig::default(), FaultLog::new(8))
    }

    fn reading(field: Field, value: f64, seq: u64) -> Reading {
        Reading::new(
            Subsystem::Battery,
            field,
            value,
            field.canonical_unit(),
            Utc::now(),
            seq,
        )
    }

    #[test]
    fn test_folds_all_fields() {
        let mut r = reducer();
        r.apply(&reading(Field::Soc, 72.5, 1)).unwrap();
        r.apply(&reading(Field::Voltage, 700.0, 2)).unwrap();
        r.apply(&reading(Field::Current, -12.0, 3)).unwrap();
        r.apply(&reading(Field::Power, -8.4, 4)).unwrap();
        r.apply(&reading(Field::Temperature, 31.0, 5)).unwrap();

        let s = r.current();
        assert_eq!(s.soc_percent, 72.5);
        assert_eq!(s.voltage_v, 700.0);
        assert_eq!(s.current_a, -12.0);
        assert_eq!(s.power_kw, -8.4);
        assert_eq!(s.temperature_c, 31.0);
        assert_eq!(r.state(), ReducerState::Live);
    }

    #[rstest]
    #[case(Field::Soc, 150.0)] // the classic implausible SoC
    #[case(Field::Soc, -1.0)]
    #[case(Field::Voltage, 20.0)]
    #[case(Field::Power, 400.0)]
    #[case(Field::Temperature, 90.0)]
    fn test_implausible_values_fault(#[case] field: Field, #[case] value: f64) {
        let mut r = reducer();
        r.apply(&reading(Field::Soc, 50.0, 1)).unwrap();
        let err = r.apply(&reading(field, value, 2)).unwrap_err();
        assert!(matches!(err, ReducerFault::OutOfRange { .. }));
        assert_eq!(r.state(), ReducerState::Faulted);
    }

    #[test]
    fn test_staleness_round_trip() {
        let mut r = reducer();
        let t0 = Utc::now();
        let first = Reading::new(
            Subsystem::Battery,
            Field::Soc,
            50.0,
            crate::domain::Unit::Percent,
            t0,
            1,
        );
        r.apply(&first).unwrap();
        assert_eq!(r.state(), ReducerState::Live);

        // Default battery timeout is 2 s.
        assert_eq!(r.on_tick(t0 + Duration::milliseconds(1999)), None);
        assert_eq!(
            r.on_tick(t0 + Duration::milliseconds(2001)),
            Some((ReducerState::Live, ReducerState::Stale))
        );
        assert_eq!(r.current().staleness, crate::domain::Staleness::Stale);

        let next = Reading::new(
            Subsystem::Battery,
            Field::Soc,
            49.0,
            crate::domain::Unit::Percent,
            t0 + Duration::milliseconds(3000),
            2,
        );
        let delta = r.apply(&next).unwrap();
        assert_eq!(
            delta.transition,
            Some((ReducerState::Stale, ReducerState::Live))
        );
        assert_eq!(r.current().staleness, crate::domain::Staleness::Fresh);
    }
}
