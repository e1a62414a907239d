// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Driver for the Adafruit Feather nRF52 galvanic skin response board
//! ("Bluefruit52"). The board exposes a single electrodermal-activity
//! stream: a measurement characteristic that notifies one little-endian
//! `u16` reading per period, and a period characteristic written as
//! little-endian milliseconds (-1 disables sampling).

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use uuid::Uuid;

use crate::api::{
    DeviceInformation, EdaFrame, SensorCapability, SensorCaps, SensorListener, SensorPacket,
};
use crate::config::ConfigStore;
use crate::sensors::{
    fetch_device_information, sanitize_sample_rate, sensor_config_name, SensorDriver,
};
use crate::transport::{
    BleTransport, DeviceSession, GattCharacteristic, NotificationHandler, PeripheralEntry,
    SubscriptionKind, SubscriptionToken, WriteType,
};
use crate::{Error, Result};

/// Galvanic skin response service.
pub const GSR_SERVICE: Uuid = Uuid::from_u128(0xb9c80e00_5875_4884_a84b_e3edf3598bf3);
/// GSR measurement characteristic (read + notify).
pub const GSR_MEASUREMENT: Uuid = Uuid::from_u128(0xb9c80e01_5875_4884_a84b_e3edf3598bf3);
/// Sampling period characteristic, little-endian i32 milliseconds.
pub const GSR_PERIOD: Uuid = Uuid::from_u128(0xadaf0001_c332_42a8_93bd_25e905756cb8);

pub const AVAILABLE_GSR_SAMPLE_RATES: [u32; 1] = [10];

/// Persistent settings of one Adafruit sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdafruitSensorConfig {
    pub version: u32,
    pub is_valid: bool,
    pub device_name: String,
    /// Length of sample history the service retains, in seconds.
    pub sample_history_duration: f32,
    /// Number of RR intervals HRV statistics are computed over; the board
    /// produces no beat intervals but the slot sizing is uniform.
    pub hrv_history_size: usize,
    pub gsr_sample_rate: u32,
}

impl AdafruitSensorConfig {
    pub const CONFIG_VERSION: u32 = 1;

    fn load(store: &ConfigStore, name: &str) -> Self {
        let mut config: AdafruitSensorConfig = store
            .load(name, Self::CONFIG_VERSION)
            .unwrap_or_default();
        config.gsr_sample_rate =
            sanitize_sample_rate(config.gsr_sample_rate, &AVAILABLE_GSR_SAMPLE_RATES);
        config
    }
}

impl Default for AdafruitSensorConfig {
    fn default() -> Self {
        AdafruitSensorConfig {
            version: Self::CONFIG_VERSION,
            is_valid: false,
            device_name: "unknown".to_string(),
            sample_history_duration: 1.0,
            hrv_history_size: 100,
            gsr_sample_rate: AVAILABLE_GSR_SAMPLE_RATES[0],
        }
    }
}

/// Decode one GSR notification relative to the stream-start instant. A
/// notification may batch several readings.
fn decode_gsr(data: &[u8], time_in_seconds: f64, emit: &mut dyn FnMut(SensorPacket)) {
    for chunk in data.chunks_exact(2) {
        emit(SensorPacket::Eda(EdaFrame {
            eda_value: u16::from_le_bytes([chunk[0], chunk[1]]),
            time_in_seconds,
        }));
    }
}

/// Driver for the Adafruit GSR feather.
pub struct AdafruitSensor {
    session: Option<Box<dyn DeviceSession>>,
    measurement: Option<GattCharacteristic>,
    period: Option<GattCharacteristic>,
    device_path: String,
    friendly_name: String,
    address: crate::api::BDAddr,
    device_information: DeviceInformation,
    config: AdafruitSensorConfig,
    config_store: Option<ConfigStore>,
    config_name: String,
    capabilities: SensorCaps,
    active: SensorCaps,
    listener: Option<Arc<dyn SensorListener>>,
    stream_start: Arc<Mutex<Option<Instant>>>,
    measurement_token: Option<SubscriptionToken>,
}

impl Default for AdafruitSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl AdafruitSensor {
    pub fn new() -> Self {
        AdafruitSensor {
            session: None,
            measurement: None,
            period: None,
            device_path: String::new(),
            friendly_name: String::new(),
            address: crate::api::BDAddr::default(),
            device_information: DeviceInformation::default(),
            config: AdafruitSensorConfig::default(),
            config_store: None,
            config_name: String::new(),
            capabilities: SensorCaps::empty(),
            active: SensorCaps::empty(),
            listener: None,
            stream_start: Arc::new(Mutex::new(None)),
            measurement_token: None,
        }
    }

    /// Factory registered for the "Bluefruit52" name prefix.
    pub fn factory() -> Box<dyn SensorDriver> {
        Box::new(AdafruitSensor::new())
    }

    fn save_config(&self) {
        if let Some(store) = &self.config_store {
            if let Err(err) = store.save(&self.config_name, &self.config) {
                warn!("Failed to save {}: {}", self.config_name, err);
            }
        }
    }

    fn gsr_handler(&self) -> NotificationHandler {
        let origin = Arc::clone(&self.stream_start);
        let listener = self.listener.clone();
        Box::new(move |data| {
            if let Some(listener) = listener.as_ref() {
                let seconds = origin
                    .lock()
                    .unwrap()
                    .map(|start| start.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                decode_gsr(data, seconds, &mut |packet| listener.on_sensor_packet(packet));
            }
        })
    }

    fn start_gsr_stream(&mut self) -> Result<()> {
        let handler = self.gsr_handler();
        let token = {
            let session = self.session.as_deref().ok_or(Error::NotConnected)?;
            let measurement = self.measurement.as_ref().ok_or(Error::NotConnected)?;
            let period = self.period.as_ref().ok_or(Error::NotConnected)?;

            if !measurement.is_readable() || !measurement.is_notifiable() || !period.is_writable() {
                return Err(Error::Protocol(
                    "GSR characteristics lack the required properties".into(),
                ));
            }

            let period_ms = 1000 / self.config.gsr_sample_rate.max(1) as i32;
            session.write(period, &period_ms.to_le_bytes(), WriteType::WithResponse)?;

            session.subscribe(measurement, SubscriptionKind::Notify, handler)?
        };

        self.measurement_token = Some(token);
        *self.stream_start.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    fn stop_gsr_stream(&mut self) -> Result<()> {
        let token = self.measurement_token.take();
        let session = self.session.as_deref().ok_or(Error::NotConnected)?;

        if let Some(token) = token {
            session.unsubscribe(token)?;
        }

        // -1 disables sampling on the board.
        if let Some(period) = self.period.as_ref() {
            if let Err(err) = session.write(period, &(-1i32).to_le_bytes(), WriteType::WithResponse)
            {
                debug!("Disabling GSR period failed: {}", err);
            }
        }

        *self.stream_start.lock().unwrap() = None;
        Ok(())
    }
}

impl SensorDriver for AdafruitSensor {
    fn open(
        &mut self,
        transport: &dyn BleTransport,
        config: &ConfigStore,
        entry: &PeripheralEntry,
    ) -> Result<()> {
        if self.is_open() {
            warn!("AdafruitSensor({}) already open, ignoring request", entry.path);
            return Ok(());
        }

        info!("Opening AdafruitSensor({})", entry.path);
        self.device_path = entry.path.clone();
        self.friendly_name = entry.friendly_name.clone();
        self.address = entry.address;

        self.config_name = sensor_config_name(&entry.address);
        self.config = AdafruitSensorConfig::load(config, &self.config_name);
        self.config.device_name = entry.friendly_name.clone();
        self.config_store = Some(config.clone());

        let session = transport.open(entry)?;

        let gsr_service = match session.profile().find_service(GSR_SERVICE) {
            Some(service) => service,
            None => {
                session.close();
                return Err(Error::Protocol("missing GSR service".into()));
            }
        };
        let measurement = gsr_service.find_characteristic(GSR_MEASUREMENT).cloned();
        let period = gsr_service.find_characteristic(GSR_PERIOD).cloned();
        let (Some(measurement), Some(period)) = (measurement, period) else {
            session.close();
            return Err(Error::NoSuchCharacteristic);
        };

        self.device_information = fetch_device_information(&*session);

        self.capabilities = if entry.friendly_name.starts_with("Bluefruit52") {
            SensorCaps::EDA
        } else {
            SensorCaps::empty()
        };

        self.measurement = Some(measurement);
        self.period = Some(period);
        self.session = Some(session);

        self.config.is_valid = true;
        self.save_config();

        Ok(())
    }

    fn close(&mut self) {
        if !self.is_open() {
            debug!(
                "AdafruitSensor({}) already closed, ignoring request",
                self.device_path
            );
            return;
        }

        info!("Closing AdafruitSensor({})", self.device_path);

        if self.active.contains(SensorCaps::EDA) {
            if let Err(err) = self.stop_gsr_stream() {
                debug!("Stopping GSR during close failed: {}", err);
            }
        }
        self.active = SensorCaps::empty();

        if let Some(session) = self.session.take() {
            if let Some(token) = self.measurement_token.take() {
                let _ = session.unsubscribe(token);
            }
            session.close();
        }
        self.measurement = None;
        self.period = None;
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn matches_entry(&self, entry: &PeripheralEntry) -> bool {
        entry.path == self.device_path
    }

    fn friendly_name(&self) -> &str {
        &self.friendly_name
    }

    fn device_path(&self) -> &str {
        &self.device_path
    }

    fn bluetooth_address(&self) -> String {
        self.address.to_string()
    }

    fn device_information(&self) -> &DeviceInformation {
        &self.device_information
    }

    fn capabilities(&self) -> SensorCaps {
        self.capabilities
    }

    fn set_active_streams(&mut self, streams: SensorCaps) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotConnected);
        }

        let requested = streams & self.capabilities;
        let wants_active = requested.contains(SensorCaps::EDA);
        let is_active = self.active.contains(SensorCaps::EDA);

        if wants_active && !is_active {
            match self.start_gsr_stream() {
                Ok(()) => self.active |= SensorCaps::EDA,
                Err(err) => warn!("Starting GSR stream failed: {}", err),
            }
        } else if !wants_active && is_active {
            if let Err(err) = self.stop_gsr_stream() {
                warn!("Stopping GSR stream failed: {}", err);
            }
            self.active -= SensorCaps::EDA;
        }

        Ok(())
    }

    fn active_streams(&self) -> SensorCaps {
        self.active
    }

    fn capability_sample_rate(&self, capability: SensorCapability) -> u32 {
        match capability {
            SensorCapability::Eda => self.config.gsr_sample_rate,
            _ => 0,
        }
    }

    fn capability_bit_resolution(&self, capability: SensorCapability) -> u32 {
        match capability {
            SensorCapability::Eda => 16,
            _ => 0,
        }
    }

    fn available_sample_rates(&self, capability: SensorCapability) -> &[u32] {
        match capability {
            SensorCapability::Eda => &AVAILABLE_GSR_SAMPLE_RATES,
            _ => &[],
        }
    }

    fn set_capability_sample_rate(&mut self, capability: SensorCapability, rate: u32) {
        if capability != SensorCapability::Eda {
            return;
        }
        let rate = sanitize_sample_rate(rate, &AVAILABLE_GSR_SAMPLE_RATES);
        if self.config.gsr_sample_rate != rate {
            self.config.gsr_sample_rate = rate;
            self.save_config();
        }
    }

    fn sample_history_duration(&self) -> f32 {
        self.config.sample_history_duration
    }

    fn set_sample_history_duration(&mut self, seconds: f32) {
        if self.config.sample_history_duration != seconds {
            self.config.sample_history_duration = seconds;
            self.save_config();
        }
    }

    fn hrv_history_size(&self) -> usize {
        self.config.hrv_history_size
    }

    fn set_hrv_history_size(&mut self, samples: usize) {
        if self.config.hrv_history_size != samples {
            self.config.hrv_history_size = samples;
            self.save_config();
        }
    }

    fn set_listener(&mut self, listener: Arc<dyn SensorListener>) {
        self.listener = Some(listener);
    }
}

impl Drop for AdafruitSensor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transport::mock::{characteristic, service, MockPeripheral, MockTransport};
    use crate::transport::{CharPropFlags, GattProfile};

    pub fn gsr_profile() -> GattProfile {
        GattProfile {
            services: vec![service(
                GSR_SERVICE,
                vec![
                    characteristic(
                        GSR_SERVICE,
                        GSR_MEASUREMENT,
                        CharPropFlags::READ | CharPropFlags::NOTIFY,
                    ),
                    characteristic(GSR_SERVICE, GSR_PERIOD, CharPropFlags::WRITE),
                ],
            )],
        }
    }

    pub fn gsr_entry(path: &str) -> PeripheralEntry {
        PeripheralEntry {
            path: path.to_string(),
            unique_id: format!("uid-{}", path),
            friendly_name: "Bluefruit52 GSR".to_string(),
            address: crate::api::BDAddr::from([0xc0, 0xff, 0xee, 0x00, 0x00, 0x02]),
            services: vec![GSR_SERVICE],
        }
    }

    pub fn add_gsr_feather(transport: &MockTransport, path: &str) -> MockPeripheral {
        transport.add_peripheral(gsr_entry(path), gsr_profile())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::transport::mock::MockTransport;
    use std::sync::Mutex as StdMutex;
    use tempdir::TempDir;

    struct Collector(StdMutex<Vec<SensorPacket>>);

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Collector(StdMutex::new(Vec::new())))
        }

        fn take(&self) -> Vec<SensorPacket> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    impl SensorListener for Collector {
        fn on_sensor_packet(&self, packet: SensorPacket) {
            self.0.lock().unwrap().push(packet);
        }
    }

    #[test]
    fn decode_emits_one_frame_per_reading() {
        let mut packets = Vec::new();
        decode_gsr(&[0x34, 0x12, 0xff, 0x00], 2.5, &mut |p| packets.push(p));

        assert_eq!(packets.len(), 2);
        let SensorPacket::Eda(first) = packets[0] else {
            panic!("expected EDA frame");
        };
        let SensorPacket::Eda(second) = packets[1] else {
            panic!()
        };
        assert_eq!(first.eda_value, 0x1234);
        assert_eq!(second.eda_value, 0x00ff);
        assert_eq!(first.time_in_seconds, 2.5);

        // A trailing odd byte is ignored.
        packets.clear();
        decode_gsr(&[0x01], 0.0, &mut |p| packets.push(p));
        assert!(packets.is_empty());
    }

    #[test]
    fn open_probes_capabilities_from_name() {
        let transport = MockTransport::new();
        let peripheral = add_gsr_feather(&transport, "dev/gsr0");
        let dir = TempDir::new("pulseplug-adafruit").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = AdafruitSensor::new();
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        assert!(driver.is_open());
        assert_eq!(driver.capabilities(), SensorCaps::EDA);
        assert_eq!(driver.capability_sample_rate(SensorCapability::Eda), 10);
    }

    #[test]
    fn starting_gsr_writes_the_period_and_subscribes() {
        let transport = MockTransport::new();
        let peripheral = add_gsr_feather(&transport, "dev/gsr0");
        let dir = TempDir::new("pulseplug-adafruit").unwrap();
        let store = ConfigStore::new(dir.path());

        let collector = Collector::new();
        let mut driver = AdafruitSensor::new();
        driver.set_listener(collector.clone());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_active_streams(SensorCaps::EDA).unwrap();

        assert_eq!(driver.active_streams(), SensorCaps::EDA);
        let writes = peripheral.writes_to(GSR_PERIOD);
        // 10 Hz -> 100 ms period, little endian.
        assert_eq!(writes.last().unwrap().data, vec![0x64, 0x00, 0x00, 0x00]);
        assert_eq!(peripheral.subscriber_count(GSR_MEASUREMENT), 1);

        peripheral.notify(GSR_MEASUREMENT, &[0x2a, 0x00]);
        let packets = collector.take();
        assert_eq!(packets.len(), 1);
        let SensorPacket::Eda(frame) = packets[0] else {
            panic!()
        };
        assert_eq!(frame.eda_value, 42);

        driver.set_active_streams(SensorCaps::empty()).unwrap();
        assert_eq!(peripheral.subscriber_count(GSR_MEASUREMENT), 0);
        let writes = peripheral.writes_to(GSR_PERIOD);
        assert_eq!(writes.last().unwrap().data, (-1i32).to_le_bytes().to_vec());
    }

    #[test]
    fn requested_streams_are_masked_by_capabilities() {
        let transport = MockTransport::new();
        let peripheral = add_gsr_feather(&transport, "dev/gsr0");
        let dir = TempDir::new("pulseplug-adafruit").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = AdafruitSensor::new();
        driver.set_listener(Collector::new());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();

        driver
            .set_active_streams(SensorCaps::ECG | SensorCaps::HEART_RATE)
            .unwrap();
        assert_eq!(driver.active_streams(), SensorCaps::empty());

        driver
            .set_active_streams(SensorCaps::EDA | SensorCaps::ECG)
            .unwrap();
        assert_eq!(driver.active_streams(), SensorCaps::EDA);
    }

    #[test]
    fn open_fails_without_gsr_service() {
        use crate::transport::mock::{characteristic, service};
        use crate::transport::{CharPropFlags, GattProfile};

        let transport = MockTransport::new();
        let profile = GattProfile {
            services: vec![service(
                crate::sensors::HEART_RATE_SERVICE,
                vec![characteristic(
                    crate::sensors::HEART_RATE_SERVICE,
                    crate::sensors::HEART_RATE_MEASUREMENT,
                    CharPropFlags::NOTIFY,
                )],
            )],
        };
        let peripheral = transport.add_peripheral(gsr_entry("dev/gsr9"), profile);
        let dir = TempDir::new("pulseplug-adafruit").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = AdafruitSensor::new();
        assert!(driver.open(&transport, &store, &peripheral.entry()).is_err());
        assert!(!driver.is_open());
        assert!(!peripheral.is_session_open());
    }

    #[test]
    fn config_round_trips() {
        let dir = TempDir::new("pulseplug-adafruit").unwrap();
        let store = ConfigStore::new(dir.path());
        let transport = MockTransport::new();
        let peripheral = add_gsr_feather(&transport, "dev/gsr0");

        let mut driver = AdafruitSensor::new();
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        let name = driver.config_name.clone();
        driver.close();

        let reloaded = AdafruitSensorConfig::load(&store, &name);
        assert!(reloaded.is_valid);
        assert_eq!(reloaded.device_name, "Bluefruit52 GSR");
        assert_eq!(reloaded.gsr_sample_rate, 10);
    }
}
