// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Vendor sensor drivers and the factory registry that matches discovered
//! peripherals to them.
//!
//! A driver owns the device-specific packet processing of one peripheral:
//! it negotiates which streams the device can produce, writes the control
//! frames that start and stop each stream, and decodes the vendor binary
//! notifications into normalized [`SensorPacket`]s delivered to its
//! listener on the transport notification thread.

pub mod adafruit;
pub mod polar;

use log::debug;
use std::sync::Arc;
use uuid::Uuid;

use crate::api::bleuuid::uuid_from_u16;
use crate::api::{
    DeviceInformation, SensorCapability, SensorCaps, SensorListener,
};
use crate::config::ConfigStore;
use crate::transport::{BleTransport, DeviceSession, GattService, PeripheralEntry};
use crate::Result;

// Standard Bluetooth SIG services and characteristics.
pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180d);
pub const HEART_RATE_MEASUREMENT: Uuid = uuid_from_u16(0x2a37);
pub const BODY_SENSOR_LOCATION: Uuid = uuid_from_u16(0x2a38);
pub const HEART_RATE_CONTROL_POINT: Uuid = uuid_from_u16(0x2a39);
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid_from_u16(0x180a);
pub const SYSTEM_ID: Uuid = uuid_from_u16(0x2a23);
pub const MODEL_NUMBER_STRING: Uuid = uuid_from_u16(0x2a24);
pub const SERIAL_NUMBER_STRING: Uuid = uuid_from_u16(0x2a25);
pub const FIRMWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a26);
pub const HARDWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a27);
pub const SOFTWARE_REVISION_STRING: Uuid = uuid_from_u16(0x2a28);
pub const MANUFACTURER_NAME_STRING: Uuid = uuid_from_u16(0x2a29);
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180f);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2a19);
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

/// A vendor packet processor bound to one peripheral.
///
/// Driver methods run on the service tick thread. The listener installed
/// with [`set_listener`](SensorDriver::set_listener) is the only part
/// touched from the transport notification thread.
pub trait SensorDriver: Send {
    /// Open the transport session, probe capabilities and install the
    /// notification plumbing. Loads the per-sensor config document.
    fn open(
        &mut self,
        transport: &dyn BleTransport,
        config: &ConfigStore,
        entry: &PeripheralEntry,
    ) -> Result<()>;

    /// Stop all streams and release the session. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Whether this driver is bound to the peripheral the entry describes.
    fn matches_entry(&self, entry: &PeripheralEntry) -> bool;

    fn friendly_name(&self) -> &str;

    fn device_path(&self) -> &str;

    fn bluetooth_address(&self) -> String;

    fn device_information(&self) -> &DeviceInformation;

    /// The streams this peripheral can produce.
    fn capabilities(&self) -> SensorCaps;

    /// Request the set of active streams. Flags outside
    /// [`capabilities`](SensorDriver::capabilities) are ignored; streams
    /// that fail to start are left out of
    /// [`active_streams`](SensorDriver::active_streams).
    fn set_active_streams(&mut self, streams: SensorCaps) -> Result<()>;

    fn active_streams(&self) -> SensorCaps;

    /// Sampling rate of the capability in samples per second.
    fn capability_sample_rate(&self, capability: SensorCapability) -> u32;

    /// Sampling resolution of the capability in bits.
    fn capability_bit_resolution(&self, capability: SensorCapability) -> u32;

    /// Every sample rate the capability supports on this device.
    fn available_sample_rates(&self, capability: SensorCapability) -> &[u32];

    /// Select a sample rate for the capability; out-of-range values snap to
    /// a supported rate. Persists the config on change.
    fn set_capability_sample_rate(&mut self, capability: SensorCapability, rate: u32);

    /// Length of sample history the owning slot should retain, in seconds.
    fn sample_history_duration(&self) -> f32;

    fn set_sample_history_duration(&mut self, seconds: f32);

    /// Number of RR intervals the HRV filters are computed over.
    fn hrv_history_size(&self) -> usize;

    fn set_hrv_history_size(&mut self, samples: usize);

    fn set_listener(&mut self, listener: Arc<dyn SensorListener>);
}

/// Constructs a blank driver.
pub type SensorFactory = fn() -> Box<dyn SensorDriver>;

/// Maps friendly-name prefixes to driver factories. Populated once at
/// service startup, before hot-plug begins.
#[derive(Default)]
pub struct SensorFactoryRegistry {
    entries: Vec<(String, SensorFactory)>,
}

impl SensorFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in driver set.
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        registry.register("Polar H10", polar::PolarSensor::factory);
        registry.register("Polar OH1", polar::PolarSensor::factory);
        registry.register("Bluefruit52", adafruit::AdafruitSensor::factory);
        registry
    }

    pub fn register(&mut self, prefix: &str, factory: SensorFactory) {
        if self.entries.iter().any(|(p, _)| p == prefix) {
            return;
        }
        self.entries.push((prefix.to_string(), factory));
    }

    /// Find the factory whose prefix matches the friendly name. The longest
    /// matching prefix wins; `None` means the peripheral is ignored.
    pub fn factory_for(&self, friendly_name: &str) -> Option<SensorFactory> {
        self.entries
            .iter()
            .filter(|(prefix, _)| friendly_name.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, factory)| *factory)
    }
}

/// Snap a requested sample rate to one the device supports. Unsupported
/// values fall back to the first available rate.
pub(crate) fn sanitize_sample_rate(rate: u32, available: &[u32]) -> u32 {
    if available.contains(&rate) {
        rate
    } else {
        available[0]
    }
}

fn read_string(session: &dyn DeviceSession, service: &GattService, characteristic: Uuid) -> String {
    let Some(ch) = service.find_characteristic(characteristic) else {
        return String::new();
    };
    match session.read(ch) {
        Ok(bytes) => String::from_utf8_lossy(&bytes)
            .trim_end_matches('\0')
            .to_string(),
        Err(_) => String::new(),
    }
}

/// Read the standard Device Information strings and battery level. Missing
/// services or characteristics leave the fields empty.
pub(crate) fn fetch_device_information(session: &dyn DeviceSession) -> DeviceInformation {
    let mut info = DeviceInformation::default();

    if let Some(service) = session.profile().find_service(DEVICE_INFORMATION_SERVICE) {
        info.system_id = read_string(session, service, SYSTEM_ID);
        info.model_number = read_string(session, service, MODEL_NUMBER_STRING);
        info.serial_number = read_string(session, service, SERIAL_NUMBER_STRING);
        info.firmware_revision = read_string(session, service, FIRMWARE_REVISION_STRING);
        info.hardware_revision = read_string(session, service, HARDWARE_REVISION_STRING);
        info.software_revision = read_string(session, service, SOFTWARE_REVISION_STRING);
        info.manufacturer_name = read_string(session, service, MANUFACTURER_NAME_STRING);
    } else {
        debug!("No device information service on this peripheral");
    }

    if let Some(service) = session.profile().find_service(BATTERY_SERVICE) {
        if let Some(ch) = service.find_characteristic(BATTERY_LEVEL) {
            if let Ok(bytes) = session.read(ch) {
                info.battery_level = bytes.first().copied();
            }
        }
    }

    info
}

/// Read the Body Sensor Location characteristic and map it to its standard
/// name. Absence is not an error; the location reads "Unknown".
pub(crate) fn fetch_body_sensor_location(session: &dyn DeviceSession) -> String {
    let location = session
        .profile()
        .find_service(HEART_RATE_SERVICE)
        .and_then(|service| service.find_characteristic(BODY_SENSOR_LOCATION))
        .and_then(|ch| session.read(ch).ok())
        .and_then(|bytes| bytes.first().copied());

    match location {
        Some(0) => "Other",
        Some(1) => "Chest",
        Some(2) => "Wrist",
        Some(3) => "Finger",
        Some(4) => "Hand",
        Some(5) => "Ear Lobe",
        Some(6) => "Foot",
        _ => "Unknown",
    }
    .to_string()
}

/// The config document name for a sensor, keyed by its Bluetooth address so
/// per-device settings survive reconnects.
pub(crate) fn sensor_config_name(address: &crate::api::BDAddr) -> String {
    format!("sensor_{}", address.to_string_no_delim())
}
