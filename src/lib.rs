//! # Plant Bus
//!
//! A simulated industrial plant exposed through a small data-access server:
//! virtual devices produce temperature, voltage, current and power readings,
//! every value lands in a bounded per-signal history, and clients read, write,
//! query history or subscribe to change notifications.
//!
//! ## Features
//!
//! - **Device simulation**: fixed-tick engine with thermal drift, electrical jitter and power switching
//! - **Time-series store**: per-signal bounded timelines with oldest-first eviction
//! - **Subscriptions**: bounded per-subscriber queues with discard-oldest or reject overflow policy
//! - **Access gateway**: status-coded reads, writes, history queries and browse
//! - **Pub/sub bridge**: periodic JSON network messages for one designated signal
//!
//! ## Quick Start
//!
//! ```rust
//! use plantbus::{DeviceProfile, ManualClock, Plant, Value};
//! use std::sync::Arc;
//!
//! let clock = Arc::new(ManualClock::new(1_000));
//! let plant = Plant::build(&DeviceProfile::defaults(), 1000, 100, 100_000, clock).unwrap();
//! let mut engine = plant.engine(Some(7));
//!
//! engine.tick();
//! let sample = plant.gateway.read("Device1_Temperature");
//! assert!(sample.status.is_good());
//!
//! let outcome = plant.gateway.write("Device2_Power", Value::Boolean(true));
//! assert!(outcome.success);
//! ```
//!
//! ## Architecture
//!
//! - [`signal`] - Signal identities, values, samples and status codes
//! - [`store`] - Bounded time-series history per signal
//! - [`device`] - Virtual devices and their physics
//! - [`engine`] - Periodic simulation tick
//! - [`hub`] - Change subscriptions and notification queues
//! - [`gateway`] - Client-facing read/write/history/browse surface
//! - [`bridge`] - Pub/sub publisher
//! - [`protocol`] / [`server`] - JSON-lines TCP transport

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bridge;
pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod gateway;
pub mod hub;
pub mod logging;
pub mod plant;
pub mod protocol;
pub mod server;
pub mod signal;
pub mod store;

// Re-export main public types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PlantConfig;
pub use device::{DeviceBank, DeviceProfile};
pub use engine::SimulationEngine;
pub use gateway::AccessGateway;
pub use hub::{SubscriptionHandle, SubscriptionHub, SubscriptionParams};
pub use plant::Plant;
pub use signal::{Sample, SignalKey, StatusCode, Value};
pub use store::TimeSeriesStore;
