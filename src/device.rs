//! Simulated field devices: four signals each, driven once per tick.

use crate::signal::{Quantity, SignalKey, Value};
use heapless::Vec as BoundedVec;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub const MAX_DEVICES: usize = 16;
pub const SIGNALS_PER_DEVICE: usize = 4;

pub const AMBIENT_TEMP_C: f64 = 25.0;
pub const MIN_OPERATING_TEMP_C: f64 = 20.0;
pub const MAX_OPERATING_TEMP_C: f64 = 80.0;
const COOLING_RATE: f64 = 0.02;
const HEATING_JITTER_C: (f64, f64) = (-0.8, 1.2);
const VOLTAGE_JITTER_V: f64 = 5.0;
const CURRENT_JITTER_A: f64 = 0.25;

/// Static description of a device, usually loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub display_name: String,
    pub base_voltage: f64,
    pub base_current: f64,
    pub temperature: f64,
    pub power: bool,
}

impl DeviceProfile {
    pub fn new(name: &str, base_voltage: f64, base_current: f64, temperature: f64, power: bool) -> Self {
        Self {
            name: name.to_string(),
            display_name: name.to_string(),
            base_voltage,
            base_current,
            temperature,
            power,
        }
    }

    /// The four demonstration devices.
    pub fn defaults() -> Vec<Self> {
        let mut profiles = Vec::with_capacity(4);
        profiles.push(Self::new("Device1", 220.0, 2.5, 25.0, true));
        profiles.push(Self::new("Device2", 220.0, 3.2, 30.0, false));
        profiles.push(Self::new("Device3", 380.0, 5.0, 28.0, true));
        profiles.push(Self::new("Device4", 110.0, 1.8, 22.0, false));
        for (index, profile) in profiles.iter_mut().enumerate() {
            profile.display_name = format!("Virtual device {}", index + 1);
        }
        profiles
    }
}

/// Unrounded live state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub temperature: f64,
    pub power: bool,
    pub voltage: f64,
    pub current: f64,
}

/// Rounded values as reported to the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Readings {
    pub temperature: f64,
    pub power: bool,
    pub voltage: f64,
    pub current: f64,
}

impl Readings {
    pub fn value(&self, quantity: Quantity) -> Value {
        match quantity {
            Quantity::Temperature => Value::Double(self.temperature),
            Quantity::Power => Value::Boolean(self.power),
            Quantity::Voltage => Value::Double(self.voltage),
            Quantity::Current => Value::Double(self.current),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DeviceCommand {
    SetPower(bool),
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug)]
pub struct Device {
    profile: DeviceProfile,
    state: DeviceState,
    keys: [SignalKey; SIGNALS_PER_DEVICE],
    ticks: u64,
}

impl Device {
    /// `None` when the device name does not fit a signal key.
    pub fn new(profile: DeviceProfile) -> Option<Self> {
        let keys = [
            Quantity::Temperature.key_for(&profile.name)?,
            Quantity::Power.key_for(&profile.name)?,
            Quantity::Voltage.key_for(&profile.name)?,
            Quantity::Current.key_for(&profile.name)?,
        ];
        let state = DeviceState {
            temperature: profile.temperature,
            power: profile.power,
            voltage: profile.base_voltage,
            current: if profile.power { profile.base_current } else { 0.0 },
        };
        Some(Self {
            profile,
            state,
            keys,
            ticks: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn key(&self, quantity: Quantity) -> SignalKey {
        match quantity {
            Quantity::Temperature => self.keys[0],
            Quantity::Power => self.keys[1],
            Quantity::Voltage => self.keys[2],
            Quantity::Current => self.keys[3],
        }
    }

    pub fn execute_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::SetPower(on) => self.state.power = on,
        }
    }

    /// Advances the physical model by one tick and returns the new readings.
    pub fn step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Readings {
        let state = &mut self.state;

        if state.power {
            state.temperature += rng.gen_range(HEATING_JITTER_C.0..HEATING_JITTER_C.1);
            state.temperature = state.temperature.clamp(MIN_OPERATING_TEMP_C, MAX_OPERATING_TEMP_C);
        } else {
            state.temperature += (AMBIENT_TEMP_C - state.temperature) * COOLING_RATE;
        }

        state.voltage = self.profile.base_voltage + rng.gen_range(-VOLTAGE_JITTER_V..VOLTAGE_JITTER_V);

        state.current = if state.power {
            self.profile.base_current + rng.gen_range(-CURRENT_JITTER_A..CURRENT_JITTER_A)
        } else {
            0.0
        };

        debug_assert!(
            !state.power || (MIN_OPERATING_TEMP_C..=MAX_OPERATING_TEMP_C).contains(&state.temperature),
            "Powered temperature {} outside operating range",
            state.temperature
        );

        self.ticks += 1;
        self.readings()
    }

    pub fn readings(&self) -> Readings {
        Readings {
            temperature: round_to(self.state.temperature, 1),
            power: self.state.power,
            voltage: round_to(self.state.voltage, 1),
            current: round_to(self.state.current, 2),
        }
    }

    /// (key, value) pairs for every signal, in `Quantity::ALL` order.
    pub fn report(&self, readings: &Readings) -> BoundedVec<(SignalKey, Value), SIGNALS_PER_DEVICE> {
        let mut out = BoundedVec::new();
        for quantity in Quantity::ALL {
            let _ = out.push((self.key(quantity), readings.value(quantity)));
        }
        out
    }
}

/// The fixed set of devices, each behind its own lock.
#[derive(Debug)]
pub struct DeviceBank {
    devices: BoundedVec<Mutex<Device>, MAX_DEVICES>,
    index: HashMap<SignalKey, (usize, Quantity)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceBankError {
    #[error("At most {} devices are supported", MAX_DEVICES)]
    TooManyDevices,
    #[error("Device name '{0}' does not fit a signal key")]
    InvalidName(String),
    #[error("Device name '{0}' is used twice")]
    DuplicateName(String),
}

impl DeviceBank {
    pub fn new(profiles: &[DeviceProfile]) -> Result<Self, DeviceBankError> {
        let mut devices = BoundedVec::new();
        let mut index = HashMap::new();

        for profile in profiles {
            let device = Device::new(profile.clone())
                .ok_or_else(|| DeviceBankError::InvalidName(profile.name.clone()))?;
            let slot = devices.len();
            for quantity in Quantity::ALL {
                if index.insert(device.key(quantity), (slot, quantity)).is_some() {
                    return Err(DeviceBankError::DuplicateName(profile.name.clone()));
                }
            }
            devices
                .push(Mutex::new(device))
                .map_err(|_| DeviceBankError::TooManyDevices)?;
        }

        Ok(Self { devices, index })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Lock device `slot`. A poisoned lock is recovered; device state is plain data.
    pub fn lock(&self, slot: usize) -> Option<MutexGuard<'_, Device>> {
        self.devices
            .get(slot)
            .map(|device| device.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Which device and quantity a signal key belongs to.
    pub fn locate(&self, key: &str) -> Option<(usize, Quantity)> {
        self.index.get(key).copied()
    }
}
