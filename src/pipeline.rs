//! Runtime wiring: one task per subsystem reducer, one aggregation loop,
//! all joined through the ingestion buffer, watch channels, and the snapshot
//! publisher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace};

use crate::aggregator::{Aggregator, StatusChannels};
use crate::config::Config;
use crate::domain::{EmsStatus, Reading, Subsystem};
use crate::ingest::{IngestBuffer, IngestError, Ingestor};
use crate::publisher::{Publisher, StatusSubscription};
use crate::reducer::{
    BatteryReducer, ChargerReducer, FaultEvent, FaultLog, GensetReducer, PcsReducer, PvReducer,
    Reduce, ReducerCommand, ReducerState, Snapshot,
};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("reducer task for {0} is not running")]
    ReducerUnavailable(Subsystem),
}

/// The assembled EMS state core. `start` spawns the reducer and aggregation
/// tasks and hands back a cloneable [`EmsHandle`].
pub struct EmsCore;

impl EmsCore {
    pub fn start(config: Config) -> EmsHandle {
        let buffer = Arc::new(IngestBuffer::new(config.ingest.queue_capacity));
        let faults = FaultLog::new(config.faults.capacity);
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let mut commands = HashMap::new();

        let pv = spawn_reducer(
            &tracker,
            PvReducer::new(&config.pv, faults.clone()),
            config.pv.staleness_timeout(),
            Arc::clone(&buffer),
            cancel.clone(),
            &mut commands,
        );
        let battery = spawn_reducer(
            &tracker,
            BatteryReducer::new(&config.battery, faults.clone()),
            config.battery.staleness_timeout(),
            Arc::clone(&buffer),
            cancel.clone(),
            &mut commands,
        );
        let genset = spawn_reducer(
            &tracker,
            GensetReducer::new(&config.genset, faults.clone()),
            config.genset.staleness_timeout(),
            Arc::clone(&buffer),
            cancel.clone(),
            &mut commands,
        );
        let charger = spawn_reducer(
            &tracker,
            ChargerReducer::new(&config.charger, faults.clone()),
            config.charger.staleness_timeout(),
            Arc::clone(&buffer),
            cancel.clone(),
            &mut commands,
        );
        let pcs = spawn_reducer(
            &tracker,
            PcsReducer::new(&config.pcs, faults.clone()),
            config.pcs.staleness_timeout(),
            Arc::clone(&buffer),
            cancel.clone(),
            &mut commands,
        );

        let channels = StatusChannels {
            pv,
            battery,
            genset,
            charger,
            pcs,
        };

        let publisher = Publisher::new(Arc::new(EmsStatus::empty(Utc::now())));
        let aggregator = Aggregator::new(channels, config.aggregation.balance_tolerance_kw);
        tracker.spawn(aggregation_task(
            aggregator,
            publisher.clone(),
            config.aggregation.tick(),
            cancel.clone(),
        ));

        tracker.close();
        info!(
            tick_ms = config.aggregation.tick_ms,
            "EMS state core started"
        );

        EmsHandle {
            ingestor: Ingestor::new(Arc::clone(&buffer)),
            buffer,
            publisher,
            faults,
            commands,
            cancel,
            tracker,
        }
    }
}

/// Cloneable control surface over a running core.
#[derive(Clone)]
pub struct EmsHandle {
    ingestor: Ingestor,
    buffer: Arc<IngestBuffer>,
    publisher: Publisher,
    faults: FaultLog,
    commands: HashMap<Subsystem, mpsc::Sender<ReducerCommand>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl EmsHandle {
    /// Submit one raw reading. Non-blocking.
    pub fn ingest(&self, reading: Reading) -> Result<(), IngestError> {
        self.ingestor.ingest(reading)
    }

    /// Ingestion handle for adapters that only produce readings.
    pub fn ingestor(&self) -> Ingestor {
        self.ingestor.clone()
    }

    /// Subscribe to the aggregate snapshot feed.
    pub fn subscribe(&self) -> StatusSubscription {
        self.publisher.subscribe()
    }

    /// The most recently published aggregate.
    pub fn current(&self) -> Arc<EmsStatus> {
        self.publisher.current()
    }

    /// Subscribe to the fault side-channel.
    pub fn faults(&self) -> broadcast::Receiver<FaultEvent> {
        self.faults.subscribe()
    }

    /// Recover a faulted subsystem by starting a fresh reducer epoch.
    pub async fn reset(&self, subsystem: Subsystem) -> Result<(), CoreError> {
        let tx = self
            .commands
            .get(&subsystem)
            .ok_or(CoreError::ReducerUnavailable(subsystem))?;
        tx.send(ReducerCommand::Reset)
            .await
            .map_err(|_| CoreError::ReducerUnavailable(subsystem))
    }

    /// Stop intake, cancel every task, and wait for them to finish.
    pub async fn shutdown(self) {
        info!("EMS state core shutting down");
        self.buffer.close();
        self.cancel.cancel();
        self.tracker.wait().await;
    }
}

fn spawn_reducer<R>(
    tracker: &TaskTracker,
    reducer: R,
    staleness_timeout: Duration,
    buffer: Arc<IngestBuffer>,
    cancel: CancellationToken,
    commands: &mut HashMap<Subsystem, mpsc::Sender<ReducerCommand>>,
) -> watch::Receiver<Snapshot<R::Status>>
where
    R: Reduce,
{
    let (snapshot_tx, snapshot_rx) = watch::channel(reducer.snapshot());
    let (command_tx, command_rx) = mpsc::channel(4);
    commands.insert(reducer.subsystem(), command_tx);
    tracker.spawn(reducer_task(
        reducer,
        staleness_timeout,
        buffer,
        snapshot_tx,
        command_rx,
        cancel,
    ));
    snapshot_rx
}

/// Event loop of one subsystem reducer: drain queued readings on wakeup, run
/// the staleness timer while live, and serve reset commands.
async fn reducer_task<R: Reduce>(
    mut reducer: R,
    staleness_timeout: Duration,
    buffer: Arc<IngestBuffer>,
    snapshot_tx: watch::Sender<Snapshot<R::Status>>,
    mut commands: mpsc::Receiver<ReducerCommand>,
    cancel: CancellationToken,
) {
    let subsystem = reducer.subsystem();
    let wakeup = buffer.wakeup(subsystem);

    loop {
        // The silence deadline only runs while live; faulted and uninitialized
        // reducers have nothing to go stale from. It is anchored to the last
        // accepted reading, so wakeups that accept nothing (discarded
        // readings, commands) do not push it out.
        let deadline = match (reducer.state(), reducer.last_accepted()) {
            (ReducerState::Live, Some(last)) => {
                let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
                Some(tokio::time::Instant::now() + staleness_timeout.saturating_sub(elapsed))
            }
            _ => None,
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = wakeup.notified() => {
                for reading in buffer.drain(subsystem) {
                    match reducer.apply(&reading) {
                        Ok(delta) if delta.applied => {
                            trace!(subsystem = %subsystem, field = %delta.field, value = delta.value, "reading applied");
                        }
                        // Discarded (faulted epoch or unexpected field) or a
                        // plausibility violation; both already logged.
                        Ok(_) | Err(_) => {}
                    }
                }
                snapshot_tx.send_replace(reducer.snapshot());
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(ReducerCommand::Reset) => {
                        debug!(subsystem = %subsystem, "reducer reset");
                        reducer.reset();
                        snapshot_tx.send_replace(reducer.snapshot());
                    }
                    None => break,
                }
            }
            _ = sleep_until_deadline(deadline) => {
                if reducer.on_tick(Utc::now()).is_some() {
                    snapshot_tx.send_replace(reducer.snapshot());
                }
            }
        }
    }
    debug!(subsystem = %subsystem, "reducer task stopped");
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Fixed-period aggregation loop. Reads whatever snapshots the reducers have
/// most recently published; never waits on them.
async fn aggregation_task(
    mut aggregator: Aggregator,
    publisher: Publisher,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                publisher.publish(aggregator.aggregate());
            }
        }
    }
    debug!("aggregation task stopped");
}
