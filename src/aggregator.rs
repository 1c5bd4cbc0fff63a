//! EMS aggregator: composes the five subsystem snapshots into one consistent
//! `EmsStatus` per tick.
//!
//! Reducers publish immutable snapshots over `tokio::sync::watch`, so one
//! borrow per channel is a consistent read for that subsystem and the
//! aggregator needs no cross-reducer locking.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;

use crate::domain::{
    BatteryStatus, ChargerStatus, EmsStatus, GensetStatus, OverallHealth, PcsStatus, PvStatus,
};
use crate::reducer::{ReducerState, Snapshot};

/// Receiving ends of the five reducer snapshot channels.
#[derive(Clone)]
pub struct StatusChannels {
    pub pv: watch::Receiver<Snapshot<PvStatus>>,
    pub battery: watch::Receiver<Snapshot<BatteryStatus>>,
    pub genset: watch::Receiver<Snapshot<GensetStatus>>,
    pub charger: watch::Receiver<Snapshot<ChargerStatus>>,
    pub pcs: watch::Receiver<Snapshot<PcsStatus>>,
}

pub struct Aggregator {
    channels: StatusChannels,
    balance_tolerance_kw: f64,
    tick: u64,
}

impl Aggregator {
    pub fn new(channels: StatusChannels, balance_tolerance_kw: f64) -> Self {
        Self {
            channels,
            balance_tolerance_kw,
            tick: 0,
        }
    }

    /// Run one aggregation cycle and emit a fresh immutable aggregate.
    pub fn aggregate(&mut self) -> Arc<EmsStatus> {
        let pv = self.channels.pv.borrow().clone();
        let battery = self.channels.battery.borrow().clone();
        let genset = self.channels.genset.borrow().clone();
        let charger = self.channels.charger.borrow().clone();
        let pcs = self.channels.pcs.borrow().clone();

        // Sign convention: generation positive, consumption negative terms.
        let residual_kw = pv.status.power_kw
            + genset.status.power_kw
            + battery.status.power_kw
            - charger.status.power_kw
            - pcs.status.power_kw;

        let states = [
            pv.state,
            battery.state,
            genset.state,
            charger.state,
            pcs.state,
        ];
        let overall_health = derive_health(&states, residual_kw, self.balance_tolerance_kw);

        self.tick += 1;
        Arc::new(EmsStatus {
            tick: self.tick,
            generated_at: Utc::now(),
            pv: pv.status,
            battery: battery.status,
            genset: genset.status,
            charger: charger.status,
            pcs: pcs.status,
            power_balance_residual_kw: residual_kw,
            overall_health,
        })
    }
}

/// Health rollup. A detected fault always wins; a subsystem that has never
/// gone live makes the aggregate `Unknown` rather than a guess.
fn derive_health(states: &[ReducerState; 5], residual_kw: f64, tolerance_kw: f64) -> OverallHealth {
    if states.iter().any(|s| *s == ReducerState::Faulted) {
        return OverallHealth::Fault;
    }
    if states.iter().any(|s| *s == ReducerState::Uninitialized) {
        return OverallHealth::Unknown;
    }
    if states.iter().any(|s| *s == ReducerState::Stale) || residual_kw.abs() > tolerance_kw {
        return OverallHealth::Degraded;
    }
    OverallHealth::Nominal
}
