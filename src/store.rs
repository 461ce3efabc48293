//! In-memory historian: one bounded, independently locked timeline per signal.

use crate::clock::Clock;
use crate::signal::{Sample, SignalKey, SignalSpec, StatusCode, Value};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

pub const DEFAULT_RETENTION: usize = 1000;

const_assert!(DEFAULT_RETENTION > 0);

/// Result of a history read. `samples` is empty whenever `status` is not `Good`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    pub status: StatusCode,
    pub samples: Vec<Sample>,
}

impl HistoryResult {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            samples: Vec::new(),
        }
    }
}

/// Ring buffer with an explicit capacity; the oldest sample goes first.
#[derive(Debug)]
struct Timeline {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl Timeline {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn append(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        debug_assert!(
            self.samples.len() <= self.capacity,
            "Timeline length {} exceeds retention {}",
            self.samples.len(),
            self.capacity
        );
    }
}

#[derive(Debug)]
struct SignalSlot {
    spec: SignalSpec,
    timeline: RwLock<Timeline>,
}

/// Registered signals are fixed once the store is shared; each timeline has
/// its own lock so unrelated signals never serialize against each other.
pub struct TimeSeriesStore {
    slots: HashMap<SignalKey, SignalSlot>,
    order: Vec<SignalKey>,
    clock: Arc<dyn Clock>,
}

impl TimeSeriesStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: HashMap::new(),
            order: Vec::new(),
            clock,
        }
    }

    /// Registers a signal. Re-registering an existing key keeps the first spec.
    pub fn register(&mut self, spec: SignalSpec) -> bool {
        if self.slots.contains_key(&spec.key) {
            return false;
        }
        let key = spec.key;
        let timeline = RwLock::new(Timeline::new(spec.retention));
        self.slots.insert(key, SignalSlot { spec, timeline });
        self.order.push(key);
        true
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn spec(&self, key: &str) -> Option<&SignalSpec> {
        self.slots.get(key).map(|slot| &slot.spec)
    }

    /// Specs in registration order.
    pub fn specs(&self) -> impl Iterator<Item = &SignalSpec> {
        self.order.iter().filter_map(|key| self.spec(key))
    }

    /// Appends a `Good` sample stamped with `source_timestamp`.
    ///
    /// Returns `None` only for keys that were never registered.
    pub fn write(&self, key: &str, value: Value, source_timestamp: u64) -> Option<Sample> {
        self.write_with_status(key, value, source_timestamp, StatusCode::Good)
    }

    /// Appends a sample carrying an explicit status. A failing server clock
    /// degrades the sample to `BadInternalError` rather than dropping it.
    pub fn write_with_status(
        &self,
        key: &str,
        value: Value,
        source_timestamp: u64,
        status: StatusCode,
    ) -> Option<Sample> {
        let slot = self.slots.get(key)?;
        let (server_timestamp, status) = match self.clock.now_ms() {
            Ok(now) => (now, status),
            Err(e) => {
                warn!("Clock failure while writing {}: {}", key, e);
                (source_timestamp, StatusCode::BadInternalError)
            }
        };
        let sample = Sample {
            value: Some(value),
            status,
            source_timestamp,
            server_timestamp,
        };
        slot.timeline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .append(sample);
        Some(sample)
    }

    /// Latest sample, or a `BadNoData` placeholder for unknown or empty signals.
    pub fn read_latest(&self, key: &str) -> Sample {
        let Some(slot) = self.slots.get(key) else {
            return Sample::no_data(StatusCode::BadNoData);
        };
        let timeline = slot.timeline.read().unwrap_or_else(PoisonError::into_inner);
        timeline
            .samples
            .back()
            .copied()
            .unwrap_or_else(|| Sample::no_data(StatusCode::BadNoData))
    }

    /// Samples with source timestamp in `[start, end]` (open bounds default to
    /// the timeline's span), keeping the most recent `max_count` in ascending
    /// order. `max_count == 0` means no limit.
    pub fn read_range(
        &self,
        key: &str,
        start: Option<u64>,
        end: Option<u64>,
        max_count: usize,
    ) -> HistoryResult {
        let Some(slot) = self.slots.get(key) else {
            return HistoryResult::empty(StatusCode::BadNoData);
        };
        let start = start.unwrap_or(u64::MIN);
        let end = end.unwrap_or(u64::MAX);
        if start > end {
            return HistoryResult::empty(StatusCode::BadNoData);
        }

        let mut samples: Vec<Sample> = {
            let timeline = slot.timeline.read().unwrap_or_else(PoisonError::into_inner);
            timeline
                .samples
                .iter()
                .filter(|s| s.source_timestamp >= start && s.source_timestamp <= end)
                .copied()
                .collect()
        };

        if max_count > 0 && samples.len() > max_count {
            samples.drain(..samples.len() - max_count);
        }

        if samples.is_empty() {
            HistoryResult::empty(StatusCode::BadNoData)
        } else {
            HistoryResult {
                status: StatusCode::Good,
                samples,
            }
        }
    }

    pub fn len(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map(|slot| {
                slot.timeline
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .samples
                    .len()
            })
            .unwrap_or(0)
    }

    /// Drops every stored sample; registrations are kept.
    pub fn clear(&self) {
        for slot in self.slots.values() {
            slot.timeline
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .samples
                .clear();
        }
    }
}
