//! Reading ingestion buffer.
//!
//! Sits between the subsystem adapters and the reducers: validates units,
//! rejects out-of-order frames, keeps a bounded queue of the most recent
//! readings per subsystem field, and wakes the owning reducer task.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::debug;

use crate::domain::{Field, Reading, Subsystem, Unit};

/// Ingestion rejections. Recoverable: the reading is dropped, no state changes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("unit {unit} incompatible with field {field} (expected {expected})")]
    UnitMismatch {
        field: Field,
        unit: Unit,
        expected: Unit,
    },
    #[error("out-of-order reading for {subsystem}/{field}: sequence {sequence_no} <= {last_accepted}")]
    OutOfOrder {
        subsystem: Subsystem,
        field: Field,
        sequence_no: u64,
        last_accepted: u64,
    },
    #[error("ingestion stopped: core is shutting down")]
    Shutdown,
}

#[derive(Default)]
struct Lane {
    /// Bounded queue per field; oldest entries evicted on overflow. Entries
    /// are tagged with their lane-wide arrival order so a drain can restore
    /// the cross-field order the adapter sent them in.
    queues: HashMap<Field, VecDeque<(u64, Reading)>>,
    /// Highest accepted sequence number per field.
    last_seq: HashMap<Field, u64>,
    /// Arrival counter across all fields of this lane.
    arrivals: u64,
    /// Readings evicted before a reducer consumed them.
    dropped: u64,
}

struct LaneSlot {
    lane: Mutex<Lane>,
    wakeup: Arc<Notify>,
}

/// Bounded per-subsystem intake for raw readings.
pub struct IngestBuffer {
    lanes: [LaneSlot; 5],
    capacity_per_field: usize,
    closed: AtomicBool,
}

impl IngestBuffer {
    pub fn new(capacity_per_field: usize) -> Self {
        let mk = || LaneSlot {
            lane: Mutex::new(Lane::default()),
            wakeup: Arc::new(Notify::new()),
        };
        Self {
            lanes: [mk(), mk(), mk(), mk(), mk()],
            capacity_per_field: capacity_per_field.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, subsystem: Subsystem) -> &LaneSlot {
        &self.lanes[subsystem.index()]
    }

    /// Validate, normalize, and queue one reading, then wake the owning
    /// reducer. Non-blocking; on a full queue the oldest entry is evicted.
    pub fn ingest(&self, reading: Reading) -> Result<(), IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Shutdown);
        }

        let normalized = reading
            .unit
            .normalize(reading.field, reading.value)
            .ok_or(IngestError::UnitMismatch {
                field: reading.field,
                unit: reading.unit,
                expected: reading.field.canonical_unit(),
            })?;

        let slot = self.slot(reading.subsystem);
        {
            let mut lane = slot.lane.lock();
            if let Some(&last) = lane.last_seq.get(&reading.field) {
                if reading.sequence_no <= last {
                    return Err(IngestError::OutOfOrder {
                        subsystem: reading.subsystem,
                        field: reading.field,
                        sequence_no: reading.sequence_no,
                        last_accepted: last,
                    });
                }
            }
            lane.last_seq.insert(reading.field, reading.sequence_no);

            let accepted = Reading {
                value: normalized,
                unit: reading.field.canonical_unit(),
                ..reading
            };
            let arrival = lane.arrivals;
            lane.arrivals += 1;
            let queue = lane.queues.entry(accepted.field).or_default();
            queue.push_back((arrival, accepted));
            if queue.len() > self.capacity_per_field {
                queue.pop_front();
                lane.dropped += 1;
                debug!(
                    subsystem = %reading.subsystem,
                    field = %reading.field,
                    "ingest queue full, evicted oldest reading"
                );
            }
        }
        slot.wakeup.notify_one();
        Ok(())
    }

    /// Take every queued reading for one subsystem, in arrival order. Arrival
    /// order rather than sequence order matters: a batch sharing one sequence
    /// number still folds its flag/mode readings before the power figure that
    /// depends on them.
    pub fn drain(&self, subsystem: Subsystem) -> Vec<Reading> {
        let mut lane = self.slot(subsystem).lane.lock();
        let mut tagged: Vec<(u64, Reading)> = lane
            .queues
            .values_mut()
            .flat_map(|q| q.drain(..))
            .collect();
        tagged.sort_by_key(|(arrival, _)| *arrival);
        tagged.into_iter().map(|(_, reading)| reading).collect()
    }

    /// Wakeup handle the owning reducer task waits on.
    pub fn wakeup(&self, subsystem: Subsystem) -> Arc<Notify> {
        Arc::clone(&self.slot(subsystem).wakeup)
    }

    /// Readings evicted unconsumed for one subsystem.
    pub fn dropped(&self, subsystem: Subsystem) -> u64 {
        self.slot(subsystem).lane.lock().dropped
    }

    /// Stop accepting readings and wake every reducer so it can observe
    /// cancellation.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in &self.lanes {
            slot.wakeup.notify_one();
        }
    }
}

/// Cloneable ingestion handle given to adapters.
#[derive(Clone)]
pub struct Ingestor(Arc<IngestBuffer>);

impl Ingestor {
    pub(crate) fn new(buffer: Arc<IngestBuffer>) -> Self {
        Self(buffer)
    }

    pub fn ingest(&self, reading: Reading) -> Result<(), IngestError> {
        self.0.ingest(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn reading(subsystem: Subsystem, field: Field, value: f64, unit: Unit, seq: u64) -> Reading {
        Reading::new(subsystem, field, value, unit, Utc::now(), seq)
    }

    #[test]
    fn test_drains_in_arrival_order() {
        let buf = IngestBuffer::new(16);
        buf.ingest(reading(Subsystem::Pv, Field::Power, 4.0, Unit::Kilowatt, 2))
            .unwrap();
        buf.ingest(reading(Subsystem::Pv, Field::Voltage, 380.0, Unit::Volt, 1))
            .unwrap();
        buf.ingest(reading(Subsystem::Pv, Field::Power, 4.2, Unit::Kilowatt, 3))
            .unwrap();

        let drained = buf.drain(Subsystem::Pv);
        let fields: Vec<Field> = drained.iter().map(|r| r.field).collect();
        assert_eq!(fields, vec![Field::Power, Field::Voltage, Field::Power]);
        assert!(buf.drain(Subsystem::Pv).is_empty());
    }

    #[test]
    fn test_equal_sequence_batch_keeps_arrival_order() {
        // Adapters commonly stamp a whole batch with one sequence number and
        // one timestamp; the flag must still come out ahead of the power
        // figure folded against it. Repeated to flush out any map-iteration
        // ordering effects.
        for _ in 0..50 {
            let buf = IngestBuffer::new(16);
            let now = Utc::now();
            buf.ingest(Reading::new(
                Subsystem::Charger,
                Field::Charging,
                1.0,
                Unit::Flag,
                now,
                1,
            ))
            .unwrap();
            buf.ingest(Reading::new(
                Subsystem::Charger,
                Field::Power,
                2.0,
                Unit::Kilowatt,
                now,
                1,
            ))
            .unwrap();

            let fields: Vec<Field> = buf
                .drain(Subsystem::Charger)
                .iter()
                .map(|r| r.field)
                .collect();
            assert_eq!(fields, vec![Field::Charging, Field::Power]);
        }
    }

    #[test]
    fn test_normalizes_watts_to_kilowatts() {
        let buf = IngestBuffer::new(16);
        buf.ingest(reading(Subsystem::Pv, Field::Power, 4200.0, Unit::Watt, 1))
            .unwrap();
        let drained = buf.drain(Subsystem::Pv);
        assert_eq!(drained[0].value, 4.2);
        assert_eq!(drained[0].unit, Unit::Kilowatt);
    }

    #[test]
    fn test_rejects_unit_mismatch() {
        let buf = IngestBuffer::new(16);
        let err = buf
            .ingest(reading(Subsystem::Battery, Field::Soc, 50.0, Unit::Volt, 1))
            .unwrap_err();
        assert_eq!(
            err,
            IngestError::UnitMismatch {
                field: Field::Soc,
                unit: Unit::Volt,
                expected: Unit::Percent,
            }
        );
        assert!(buf.drain(Subsystem::Battery).is_empty());
    }

    #[test]
    fn test_rejects_out_of_order_and_duplicates() {
        let buf = IngestBuffer::new(16);
        buf.ingest(reading(Subsystem::Genset, Field::Power, 10.0, Unit::Kilowatt, 5))
            .unwrap();
        for seq in [5, 4] {
            let err = buf
                .ingest(reading(Subsystem::Genset, Field::Power, 10.0, Unit::Kilowatt, seq))
                .unwrap_err();
            assert!(matches!(err, IngestError::OutOfOrder { last_accepted: 5, .. }));
        }
        // Sequences are tracked per field: another field is unaffected.
        buf.ingest(reading(Subsystem::Genset, Field::FuelLevel, 80.0, Unit::Percent, 1))
            .unwrap();
    }

    #[test]
    fn test_evicts_oldest_on_overflow() {
        let buf = IngestBuffer::new(2);
        for seq in 1..=5 {
            buf.ingest(reading(Subsystem::Charger, Field::Power, seq as f64, Unit::Kilowatt, seq))
                .unwrap();
        }
        let drained = buf.drain(Subsystem::Charger);
        let seqs: Vec<u64> = drained.iter().map(|r| r.sequence_no).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(buf.dropped(Subsystem::Charger), 3);
    }

    #[test]
    fn test_close_stops_intake() {
        let buf = IngestBuffer::new(16);
        buf.close();
        let err = buf
            .ingest(reading(Subsystem::Pv, Field::Power, 1.0, Unit::Kilowatt, 1))
            .unwrap_err();
        assert_eq!(err, IngestError::Shutdown);
    }

    #[tokio::test]
    async fn test_ingest_wakes_reducer() {
        let buf = IngestBuffer::new(16);
        let wakeup = buf.wakeup(Subsystem::Battery);
        let notified = wakeup.notified();
        buf.ingest(reading(Subsystem::Battery, Field::Soc, 50.0, Unit::Percent, 1))
            .unwrap();
        notified.await;
    }
}
