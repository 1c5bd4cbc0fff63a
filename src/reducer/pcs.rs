use chrono::{DateTime, Utc};
use tracing::debug;

use super::{FaultLog, Reduce, ReducerCore, ReducerFault, ReducerState, StatusDelta};
use crate::config::PcsConfig;
use crate::domain::{Field, PcsMode, PcsStatus, Reading, Subsystem};

/// Folds power-conversion-system readings into a validated `PcsStatus`.
pub struct PcsReducer {
    core: ReducerCore,
    status: PcsStatus,
    bounds: PcsConfig,
}

impl PcsReducer {
    pub fn new(cfg: &PcsConfig, faults: FaultLog) -> Self {
        Self {
            core: ReducerCore::new(Subsystem::Pcs, cfg.staleness_timeout(), faults),
            status: PcsStatus::default(),
            bounds: cfg.clone(),
        }
    }

    fn validate(&self, reading: &Reading) -> Result<Option<PcsMode>, ReducerFault> {
        let v = reading.value;
        match reading.field {
            Field::Mode => PcsMode::from_code(v)
                .map(Some)
                .ok_or(ReducerFault::UnknownMode {
                    subsystem: Subsystem::Pcs,
                    code: v,
                }),
            Field::Power => {
                if v.abs() > self.bounds.max_power_kw {
                    return Err(ReducerFault::OutOfRange {
                        subsystem: Subsystem::Pcs,
                        field: Field::Power,
                        value: v,
                        min: -self.bounds.max_power_kw,
                        max: self.bounds.max_power_kw,
                    });
                }
                if self.status.mode == PcsMode::Standby && v.abs() > self.bounds.idle_power_threshold_kw
                {
                    return Err(ReducerFault::StandbyPowerMismatch {
                        subsystem: Subsystem::Pcs,
                        power_kw: v,
                    });
                }
                Ok(None)
            }
            Field::Frequency => {
                if (0.0..=self.bounds.max_frequency_hz).contains(&v) {
                    Ok(None)
                } else {
                    Err(ReducerFault::OutOfRange {
                        subsystem: Subsystem::Pcs,
                        field: Field::Frequency,
                        value: v,
                        min: 0.0,
                        max: self.bounds.max_frequency_hz,
                    })
                }
            }
            _ => Ok(None),
        }
    }
}

impl Reduce for PcsReducer {
    type Status = PcsStatus;

    fn subsystem(&self) -> Subsystem {
        Subsystem::Pcs
    }

    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault> {
        if self.core.is_faulted() {
            return Ok(self.core.discarded(reading));
        }

        match reading.field {
            Field::Mode | Field::Power | Field::Frequency => {}
            other => {
                debug!(subsystem = "pcs", field = %other, "ignoring unexpected field");
                return Ok(self.core.discarded(reading));
            }
        }

        let mode = match self.validate(reading) {
            Ok(mode) => mode,
            Err(fault) => {
                self.core.fault(fault.clone());
                self.status.staleness = self.core.state().staleness();
                return Err(fault);
            }
        };

        match reading.field {
            Field::Mode => {
                let mode = mode.unwrap_or_default();
                self.status.mode = mode;
                if mode == PcsMode::Standby {
                    self.status.power_kw = 0.0;
                }
            }
            Field::Power => self.status.power_kw = reading.value,
            Field::Frequency => self.status.frequency_hz = reading.value,
            _ => unreachable!(),
        }
        self.status.last_updated = Some(reading.timestamp);
        let transition = self.core.accept(reading.timestamp);
        self.status.staleness = self.core.state().staleness();
        Ok(self.core.applied(reading, transition))
    }

    fn current(&self) -> PcsStatus {
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
        self.status = PcsStatus::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reducer() -> PcsReducer {
        PcsReducer::new(&PcsConfig::default(), FaultLog::new(8))
    }

    fn reading(field: Field, value: f64, seq: u64) -> Reading {
        Reading::new(
            Subsystem::Pcs,
            field,
            value,
            field.canonical_unit(),
            Utc::now(),
            seq,
        )
    }

    #[test]
    fn test_mode_and_power_flow() {
        let mut r = reducer();
        r.apply(&reading(Field::Mode, PcsMode::Discharging.code() as f64, 1))
            .unwrap();
        r.apply(&reading(Field::Power, 35.0, 2)).unwrap();
        r.apply(&reading(Field::Frequency, 50.0, 3)).unwrap();

        let s = r.current();
        assert_eq!(s.mode, PcsMode::Discharging);
        assert_eq!(s.power_kw, 35.0);
        assert_eq!(s.frequency_hz, 50.0);
    }

    #[test]
    fn test_unknown_mode_code_faults() {
        let mut r = reducer();
        let err = r.apply(&reading(Field::Mode, 9.0, 1)).unwrap_err();
        assert!(matches!(err, ReducerFault::UnknownMode { code, .. } if code == 9.0));
        assert_eq!(r.state(), ReducerState::Faulted);
    }

    #[test]
    fn test_power_in_standby_faults() {
        let mut r = reducer();
        r.apply(&reading(Field::Mode, PcsMode::Standby.code() as f64, 1))
            .unwrap();
        let err = r.apply(&reading(Field::Power, 12.0, 2)).unwrap_err();
        assert!(matches!(err, ReducerFault::StandbyPowerMismatch { .. }));
    }

    #[test]
    fn test_entering_standby_clears_power() {
        let mut r = reducer();
        r.apply(&reading(Field::Mode, PcsMode::GridTie.code() as f64, 1))
            .unwrap();
        r.apply(&reading(Field::Power, 20.0, 2)).unwrap();
        r.apply(&reading(Field::Mode, PcsMode::Standby.code() as f64, 3))
            .unwrap();
        assert_eq!(r.current().power_kw, 0.0);
        assert_eq!(r.state(), ReducerState::Live);
    }
}
