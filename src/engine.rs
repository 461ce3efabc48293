use crate::device::DeviceBank;
use crate::hub::SubscriptionHub;
use crate::signal::StatusCode;
use crate::store::TimeSeriesStore;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

// Demonstrated rate: 1 Hz
pub const DEFAULT_TICK_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub tick: u64,
    pub timestamp: u64,
    pub status: StatusCode,
    pub samples_written: usize,
    pub notifications: usize,
}

/// Single writer for simulated signals: advances every device and stores one
/// sample per signal with a shared timestamp.
pub struct SimulationEngine {
    store: Arc<TimeSeriesStore>,
    devices: Arc<DeviceBank>,
    hub: Arc<SubscriptionHub>,
    rng: StdRng,
    last_timestamp: u64,
    ticks: u64,
}

impl SimulationEngine {
    /// A fixed `seed` makes the jitter sequence reproducible.
    pub fn new(
        store: Arc<TimeSeriesStore>,
        devices: Arc<DeviceBank>,
        hub: Arc<SubscriptionHub>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            devices,
            hub,
            rng,
            last_timestamp: 0,
            ticks: 0,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn tick(&mut self) -> TickReport {
        let (timestamp, status) = match self.store.clock().now_ms() {
            Ok(now) => {
                self.last_timestamp = now;
                (now, StatusCode::Good)
            }
            Err(e) => {
                warn!("Clock failure on tick {}: {}", self.ticks + 1, e);
                (self.last_timestamp, StatusCode::BadInternalError)
            }
        };

        let mut samples_written = 0;
        let mut notifications = 0;

        for slot in 0..self.devices.len() {
            // Device lock spans the writes so a concurrent power write cannot
            // interleave with this device's samples.
            let Some(mut device) = self.devices.lock(slot) else {
                continue;
            };
            let readings = device.step(&mut self.rng);

            for (key, value) in device.report(&readings) {
                let previous = self.store.read_latest(&key).value;
                let Some(sample) = self.store.write_with_status(&key, value, timestamp, status) else {
                    continue;
                };
                samples_written += 1;
                if previous != Some(value) {
                    notifications += self.hub.publish(&key, sample);
                }
            }
        }

        self.ticks += 1;
        debug!(
            "Tick {} at {}: {} samples, {} notifications",
            self.ticks, timestamp, samples_written, notifications
        );

        TickReport {
            tick: self.ticks,
            timestamp,
            status,
            samples_written,
            notifications,
        }
    }

    /// Ticks every `period` until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(mut self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Simulation started: {} devices, tick {} ms", self.devices.len(), period.as_millis());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick();
                    if report.status != StatusCode::Good {
                        warn!("Tick {} stored samples with status {}", report.tick, report.status);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Simulation stopped after {} ticks", self.ticks);
    }
}
