//! Per-subsystem state reducers.
//!
//! Each reducer folds the validated reading stream of one subsystem into a
//! current snapshot, running a small lifecycle state machine:
//!
//! `Uninitialized → Live → Stale → Faulted`
//!
//! - first valid reading: `Uninitialized → Live`
//! - configured silence window elapsed: `Live → Stale`
//! - fresh valid reading: `Stale → Live`
//! - plausibility violation: `Live | Stale → Faulted` (terminal until reset)
//!
//! Plausibility failures never crash a reducer and never touch another
//! subsystem; they are reported on a broadcast fault channel handed in at
//! construction, and surface in aggregated health.

pub mod battery;
pub mod charger;
pub mod genset;
pub mod pcs;
pub mod pv;

pub use battery::BatteryReducer;
pub use charger::ChargerReducer;
pub use genset::GensetReducer;
pub use pcs::PcsReducer;
pub use pv::PvReducer;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::{Field, Reading, Staleness, Subsystem};

/// Lifecycle state of one subsystem reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerState {
    Uninitialized,
    Live,
    Stale,
    Faulted,
}

impl ReducerState {
    pub fn staleness(self) -> Staleness {
        match self {
            ReducerState::Live => Staleness::Fresh,
            ReducerState::Stale => Staleness::Stale,
            ReducerState::Uninitialized | ReducerState::Faulted => Staleness::Unknown,
        }
    }
}

/// Subsystem-specific plausibility violation.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
pub enum ReducerFault {
    #[error("{subsystem}/{field}: value {value} outside plausible range [{min}, {max}]")]
    OutOfRange {
        subsystem: Subsystem,
        field: Field,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{subsystem}: power {power_kw} kW inconsistent with {flag}=false")]
    FlagPowerMismatch {
        subsystem: Subsystem,
        flag: Field,
        power_kw: f64,
    },
    #[error("{subsystem}: power {power_kw} kW inconsistent with standby mode")]
    StandbyPowerMismatch { subsystem: Subsystem, power_kw: f64 },
    #[error("{subsystem}: unknown mode code {code}")]
    UnknownMode { subsystem: Subsystem, code: f64 },
}

impl ReducerFault {
    pub fn subsystem(&self) -> Subsystem {
        match self {
            ReducerFault::OutOfRange { subsystem, .. }
            | ReducerFault::FlagPowerMismatch { subsystem, .. }
            | ReducerFault::StandbyPowerMismatch { subsystem, .. }
            | ReducerFault::UnknownMode { subsystem, .. } => *subsystem,
        }
    }
}

/// Fault record carried on the side-channel log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultEvent {
    pub at: DateTime<Utc>,
    pub fault: ReducerFault,
}

/// Side-channel fault log shared by every reducer.
///
/// Faults are reported, never thrown: a violation is broadcast to any
/// listener and logged, and processing of the other subsystems continues.
#[derive(Clone)]
pub struct FaultLog {
    tx: broadcast::Sender<FaultEvent>,
}

impl FaultLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.tx.subscribe()
    }

    pub fn record(&self, fault: ReducerFault) {
        warn!(subsystem = %fault.subsystem(), %fault, "plausibility violation");
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(FaultEvent {
            at: Utc::now(),
            fault,
        });
    }
}

/// Outcome of folding one reading into a reducer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusDelta {
    pub subsystem: Subsystem,
    pub field: Field,
    pub value: f64,
    /// False when the reading was discarded (faulted epoch, unexpected field).
    pub applied: bool,
    pub transition: Option<(ReducerState, ReducerState)>,
}

/// Shared lifecycle bookkeeping composed into every concrete reducer.
pub(crate) struct ReducerCore {
    subsystem: Subsystem,
    state: ReducerState,
    last_accepted: Option<DateTime<Utc>>,
    timeout: Duration,
    faults: FaultLog,
}

impl ReducerCore {
    pub fn new(subsystem: Subsystem, timeout: std::time::Duration, faults: FaultLog) -> Self {
        Self {
            subsystem,
            state: ReducerState::Uninitialized,
            last_accepted: None,
            timeout: Duration::from_std(timeout).unwrap_or(Duration::seconds(5)),
            faults,
        }
    }

    pub fn state(&self) -> ReducerState {
        self.state
    }

    pub fn last_accepted(&self) -> Option<DateTime<Utc>> {
        self.last_accepted
    }

    pub fn is_faulted(&self) -> bool {
        self.state == ReducerState::Faulted
    }

    /// Register an accepted reading timestamp. Returns the state transition,
    /// if one happened.
    pub fn accept(&mut self, at: DateTime<Utc>) -> Option<(ReducerState, ReducerState)> {
        self.last_accepted = Some(at);
        match self.state {
            ReducerState::Uninitialized | ReducerState::Stale => {
                let from = self.state;
                self.state = ReducerState::Live;
                debug!(subsystem = %self.subsystem, ?from, "reducer live");
                Some((from, ReducerState::Live))
            }
            ReducerState::Live => None,
            // Terminal for this epoch; accept() is not reachable while
            // faulted, apply() guards first.
            ReducerState::Faulted => None,
        }
    }

    /// Record a plausibility violation and enter the terminal `Faulted` state.
    pub fn fault(&mut self, fault: ReducerFault) -> Option<(ReducerState, ReducerState)> {
        self.faults.record(fault);
        if self.state == ReducerState::Faulted {
            return None;
        }
        let from = self.state;
        self.state = ReducerState::Faulted;
        Some((from, ReducerState::Faulted))
    }

    /// Staleness check, called from the owning task's timer (or directly in
    /// tests). `Live → Stale` fires at most once per silence window.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Option<(ReducerState, ReducerState)> {
        if self.state != ReducerState::Live {
            return None;
        }
        let expired = self
            .last_accepted
            .map(|last| now - last >= self.timeout)
            .unwrap_or(false);
        if expired {
            self.state = ReducerState::Stale;
            debug!(subsystem = %self.subsystem, "reducer stale");
            Some((ReducerState::Live, ReducerState::Stale))
        } else {
            None
        }
    }

    /// External reset: leave the faulted epoch and start over.
    pub fn reset(&mut self) {
        self.state = ReducerState::Uninitialized;
        self.last_accepted = None;
    }

    /// Delta for a reading discarded without touching status fields.
    pub fn discarded(&self, reading: &Reading) -> StatusDelta {
        StatusDelta {
            subsystem: self.subsystem,
            field: reading.field,
            value: reading.value,
            applied: false,
            transition: None,
        }
    }

    /// Delta for an applied reading.
    pub fn applied(
        &self,
        reading: &Reading,
        transition: Option<(ReducerState, ReducerState)>,
    ) -> StatusDelta {
        StatusDelta {
            subsystem: self.subsystem,
            field: reading.field,
            value: reading.value,
            applied: true,
            transition,
        }
    }
}

/// What a reducer publishes after every accepted reading or lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot<T> {
    pub state: ReducerState,
    pub status: T,
}

/// Shared capability of the five subsystem reducers: fold readings, expose
/// the current validated snapshot, and run the lifecycle state machine.
pub trait Reduce: Send + 'static {
    type Status: Clone + PartialEq + Send + Sync + 'static;

    fn subsystem(&self) -> Subsystem;

    /// Fold one validated reading into the snapshot. A plausibility violation
    /// moves the reducer to `Faulted` and is returned (already reported on the
    /// fault log by then).
    fn apply(&mut self, reading: &Reading) -> Result<StatusDelta, ReducerFault>;

    /// Current validated snapshot for this subsystem.
    fn current(&self) -> Self::Status;

    fn state(&self) -> ReducerState;

    /// Timestamp of the last accepted reading, the anchor of the staleness
    /// window. Discarded readings do not move it.
    fn last_accepted(&self) -> Option<DateTime<Utc>>;

    /// Timer-driven staleness check.
    fn on_tick(&mut self, now: DateTime<Utc>) -> Option<(ReducerState, ReducerState)>;

    /// Clear a faulted epoch back to `Uninitialized`.
    fn reset(&mut self);

    fn snapshot(&self) -> Snapshot<Self::Status> {
        Snapshot {
            state: self.state(),
            status: self.current(),
        }
    }
}

/// Commands routed to a reducer task from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerCommand {
    /// Recover from `Faulted` by starting a new epoch.
    Reset,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration as StdDuration;

    fn core(timeout_ms: u64) -> ReducerCore {
        ReducerCore::new(
            Subsystem::Pv,
            StdDuration::from_millis(timeout_ms),
            FaultLog::new(8),
        )
    }

    #[test]
    fn test_lifecycle_uninitialized_to_live_to_stale_and_back() {
        let mut c = core(1000);
        let t0 = Utc::now();
        assert_eq!(c.state(), ReducerState::Uninitialized);

        assert_eq!(
            c.accept(t0),
            Some((ReducerState::Uninitialized, ReducerState::Live))
        );
        assert_eq!(c.accept(t0 + Duration::milliseconds(100)), None);

        // Not yet expired.
        assert_eq!(c.on_tick(t0 + Duration::milliseconds(900)), None);
        // Expired: transitions exactly once.
        assert_eq!(
            c.on_tick(t0 + Duration::milliseconds(1200)),
            Some((ReducerState::Live, ReducerState::Stale))
        );
        assert_eq!(c.on_tick(t0 + Duration::milliseconds(5000)), None);

        // Fresh reading revives.
        assert_eq!(
            c.accept(t0 + Duration::milliseconds(6000)),
            Some((ReducerState::Stale, ReducerState::Live))
        );
    }

    #[test]
    fn test_fault_is_terminal_until_reset() {
        let mut c = core(1000);
        c.accept(Utc::now());
        let fault = ReducerFault::OutOfRange {
            subsystem: Subsystem::Pv,
            field: Field::Power,
            value: -1.0,
            min: 0.0,
            max: 10.0,
        };
        assert_eq!(
            c.fault(fault.clone()),
            Some((ReducerState::Live, ReducerState::Faulted))
        );
        // Further faults do not transition again.
        assert_eq!(c.fault(fault), None);
        // Staleness timer does not touch a faulted reducer.
        assert_eq!(c.on_tick(Utc::now() + Duration::seconds(60)), None);

        c.reset();
        assert_eq!(c.state(), ReducerState::Uninitialized);
    }

    #[test]
    fn test_fault_log_broadcasts_events() {
        let log = FaultLog::new(8);
        let mut rx = log.subscribe();
        let fault = ReducerFault::UnknownMode {
            subsystem: Subsystem::Pcs,
            code: 9.0,
        };
        log.record(fault.clone());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.fault, fault);
    }

    #[test]
    fn test_state_to_staleness_mapping() {
        assert_eq!(ReducerState::Live.staleness(), Staleness::Fresh);
        assert_eq!(ReducerState::Stale.staleness(), Staleness::Stale);
        assert_eq!(ReducerState::Uninitialized.staleness(), Staleness::Unknown);
        assert_eq!(ReducerState::Faulted.staleness(), Staleness::Unknown);
    }
}
