//! Wires store, devices, hub and gateway together from a configuration.

use crate::clock::Clock;
use crate::config::PlantConfig;
use crate::device::{DeviceBank, DeviceBankError, DeviceProfile};
use crate::engine::SimulationEngine;
use crate::gateway::AccessGateway;
use crate::hub::SubscriptionHub;
use crate::signal::{Quantity, SignalSpec};
use crate::store::TimeSeriesStore;
use std::sync::Arc;

pub struct Plant {
    pub store: Arc<TimeSeriesStore>,
    pub devices: Arc<DeviceBank>,
    pub hub: Arc<SubscriptionHub>,
    pub gateway: AccessGateway,
}

impl Plant {
    pub fn from_config(config: &PlantConfig, clock: Arc<dyn Clock>) -> Result<Self, DeviceBankError> {
        Self::build(
            &config.devices,
            config.store.retention,
            config.subscription.min_sampling_interval_ms,
            config.subscription.idle_timeout_ms,
            clock,
        )
    }

    pub fn build(
        profiles: &[DeviceProfile],
        retention: usize,
        min_sampling_interval_ms: u64,
        idle_timeout_ms: u64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeviceBankError> {
        let devices = Arc::new(DeviceBank::new(profiles)?);

        let mut store = TimeSeriesStore::new(clock);
        for profile in profiles {
            for quantity in Quantity::ALL {
                let spec = SignalSpec::for_quantity(&profile.name, quantity, min_sampling_interval_ms, retention)
                    .ok_or_else(|| DeviceBankError::InvalidName(profile.name.clone()))?;
                store.register(spec);
            }
        }
        let store = Arc::new(store);

        let hub = Arc::new(SubscriptionHub::with_idle_timeout(Arc::clone(&store), idle_timeout_ms));
        let gateway = AccessGateway::new(Arc::clone(&store), Arc::clone(&devices), Arc::clone(&hub));

        Ok(Self {
            store,
            devices,
            hub,
            gateway,
        })
    }

    pub fn engine(&self, seed: Option<u64>) -> SimulationEngine {
        SimulationEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.devices),
            Arc::clone(&self.hub),
            seed,
        )
    }
}
