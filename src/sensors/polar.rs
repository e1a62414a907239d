// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Driver for Polar heart sensors (H10 chest strap, OH1 optical arm band).
//!
//! Beyond the standard Heart Rate service, Polar devices expose the vendor
//! PMD (Polar Measurement Data) service: a control point characteristic
//! that takes start/stop measurement requests and a data characteristic
//! that streams the framed ECG/PPG/ACC/PPI telemetry.

use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use uuid::Uuid;

use crate::api::{
    AccFrame, DeviceInformation, EcgFrame, HeartRateFrame, PpgFrame, PpgSample, PpiFrame,
    PpiSample, SensorCapability, SensorCaps, SensorListener, SensorPacket, ContactStatus,
    MAX_ACC_SAMPLES_PER_FRAME, MAX_ECG_VALUES_PER_FRAME, MAX_PPG_SAMPLES_PER_FRAME,
    MAX_PPI_SAMPLES_PER_FRAME, MAX_RR_INTERVALS_PER_FRAME,
};
use crate::config::ConfigStore;
use crate::sensors::{
    fetch_body_sensor_location, fetch_device_information, sanitize_sample_rate,
    sensor_config_name, SensorDriver, HEART_RATE_CONTROL_POINT, HEART_RATE_MEASUREMENT,
    HEART_RATE_SERVICE,
};
use crate::transport::{
    BleTransport, DeviceSession, GattCharacteristic, NotificationHandler, PeripheralEntry,
    SubscriptionKind, SubscriptionToken, WriteType,
};
use crate::{Error, Result};

/// Polar Measurement Data service.
pub const PMD_SERVICE: Uuid = Uuid::from_u128(0xfb005c80_02e7_f387_1cad_8acd2d8df0c8);
/// PMD control point characteristic (write-with-response + indicate).
pub const PMD_CONTROL_POINT: Uuid = Uuid::from_u128(0xfb005c81_02e7_f387_1cad_8acd2d8df0c8);
/// PMD data characteristic (notify).
pub const PMD_DATA: Uuid = Uuid::from_u128(0xfb005c82_02e7_f387_1cad_8acd2d8df0c8);

// Control point op codes.
const PMD_OP_START_MEASUREMENT: u8 = 0x02;
const PMD_OP_STOP_MEASUREMENT: u8 = 0x03;
const PMD_CONTROL_POINT_RESPONSE: u8 = 0xf0;
const PMD_FEATURE_READ_RESPONSE: u8 = 0x0f;

// Measurement types, which double as the frame tag of data notifications.
const PMD_MEASUREMENT_ECG: u8 = 0x00;
const PMD_MEASUREMENT_PPG: u8 = 0x01;
const PMD_MEASUREMENT_ACC: u8 = 0x02;
const PMD_MEASUREMENT_PPI: u8 = 0x03;

// Stream setting TLV types.
const PMD_SETTING_SAMPLE_RATE: u8 = 0x00;
const PMD_SETTING_RESOLUTION: u8 = 0x01;
const PMD_SETTING_RANGE: u8 = 0x02;

const ECG_RESOLUTION_BITS: u16 = 0x000e;
const PPG_RESOLUTION_BITS: u16 = 0x0016;
const ACC_RESOLUTION_16BIT: u16 = 0x0001;
const ACC_RANGE_8G: u16 = 0x0008;

pub const AVAILABLE_ACC_SAMPLE_RATES: [u32; 4] = [25, 50, 100, 200];
pub const AVAILABLE_ECG_SAMPLE_RATES: [u32; 1] = [130];
pub const AVAILABLE_PPG_SAMPLE_RATES: [u32; 1] = [130];

/// Monotonic host clock in nanoseconds, shared by every decoder that needs
/// a substitute for a missing device timestamp.
fn host_clock_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Persistent settings of one Polar sensor, keyed by its Bluetooth address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolarSensorConfig {
    pub version: u32,
    pub is_valid: bool,
    pub device_name: String,
    /// Length of sample history the service retains, in seconds.
    pub sample_history_duration: f32,
    /// Number of RR intervals HRV statistics are computed over.
    pub hrv_history_size: usize,
    pub acc_sample_rate: u32,
    pub ecg_sample_rate: u32,
    pub ppg_sample_rate: u32,
}

impl PolarSensorConfig {
    pub const CONFIG_VERSION: u32 = 1;

    fn sanitize(&mut self) {
        self.acc_sample_rate = sanitize_sample_rate(self.acc_sample_rate, &AVAILABLE_ACC_SAMPLE_RATES);
        self.ecg_sample_rate = sanitize_sample_rate(self.ecg_sample_rate, &AVAILABLE_ECG_SAMPLE_RATES);
        self.ppg_sample_rate = sanitize_sample_rate(self.ppg_sample_rate, &AVAILABLE_PPG_SAMPLE_RATES);
    }

    fn load(store: &ConfigStore, name: &str) -> Self {
        let mut config: PolarSensorConfig = store
            .load(name, Self::CONFIG_VERSION)
            .unwrap_or_default();
        config.sanitize();
        config
    }
}

impl Default for PolarSensorConfig {
    fn default() -> Self {
        PolarSensorConfig {
            version: Self::CONFIG_VERSION,
            is_valid: false,
            device_name: "unknown".to_string(),
            sample_history_duration: 1.0,
            hrv_history_size: 100,
            acc_sample_rate: AVAILABLE_ACC_SAMPLE_RATES[0],
            ecg_sample_rate: AVAILABLE_ECG_SAMPLE_RATES[0],
            ppg_sample_rate: AVAILABLE_PPG_SAMPLE_RATES[0],
        }
    }
}

fn sign_extend_24(bytes: &[u8]) -> i32 {
    let raw = (bytes[0] as u32) | ((bytes[1] as u32) << 8) | ((bytes[2] as u32) << 16);
    ((raw << 8) as i32) >> 8
}

/// Decoder state of the PMD data stream. Each capability latches the device
/// timestamp of the first packet after stream start as its time origin;
/// subsequent packets report seconds relative to it.
#[derive(Debug, Default)]
struct PmdDecoder {
    ecg_origin: Option<u64>,
    ppg_origin: Option<u64>,
    acc_origin: Option<u64>,
    ppi_origin: Option<u64>,
}

impl PmdDecoder {
    fn reset_origin(&mut self, measurement_type: u8) {
        match measurement_type {
            PMD_MEASUREMENT_ECG => self.ecg_origin = None,
            PMD_MEASUREMENT_PPG => self.ppg_origin = None,
            PMD_MEASUREMENT_ACC => self.acc_origin = None,
            PMD_MEASUREMENT_PPI => self.ppi_origin = None,
            _ => {}
        }
    }

    fn relative_seconds(origin: &mut Option<u64>, timestamp: u64) -> f64 {
        let origin = *origin.get_or_insert(timestamp);
        timestamp.saturating_sub(origin) as f64 / 1e9
    }

    /// Decode one PMD data notification. Malformed packets are dropped.
    fn decode(&mut self, data: &[u8], host_nanos: u64, emit: &mut dyn FnMut(SensorPacket)) {
        if data.len() < 10 {
            trace!("PMD packet too short ({} bytes), dropping", data.len());
            return;
        }

        let tag = data[0];
        let timestamp = u64::from_le_bytes(data[1..9].try_into().expect("8 byte slice"));
        let subtype = data[9];
        let payload = &data[10..];

        match tag {
            PMD_MEASUREMENT_ECG => {
                if subtype != 0x00 {
                    return;
                }
                let seconds = Self::relative_seconds(&mut self.ecg_origin, timestamp);

                let mut frame = EcgFrame {
                    time_in_seconds: seconds,
                    ..EcgFrame::default()
                };
                for chunk in payload.chunks_exact(3) {
                    frame.ecg_values[frame.ecg_value_count as usize] = sign_extend_24(chunk);
                    frame.ecg_value_count += 1;

                    if frame.ecg_value_count as usize >= MAX_ECG_VALUES_PER_FRAME {
                        emit(SensorPacket::Ecg(frame));
                        frame.ecg_value_count = 0;
                    }
                }
                if frame.ecg_value_count > 0 {
                    emit(SensorPacket::Ecg(frame));
                }
            }
            PMD_MEASUREMENT_PPG => {
                if subtype != 0x00 {
                    return;
                }
                let seconds = Self::relative_seconds(&mut self.ppg_origin, timestamp);

                let mut frame = PpgFrame {
                    time_in_seconds: seconds,
                    ..PpgFrame::default()
                };
                for chunk in payload.chunks_exact(12) {
                    frame.ppg_samples[frame.ppg_sample_count as usize] = PpgSample {
                        ppg_value0: sign_extend_24(&chunk[0..3]),
                        ppg_value1: sign_extend_24(&chunk[3..6]),
                        ppg_value2: sign_extend_24(&chunk[6..9]),
                        ambient: sign_extend_24(&chunk[9..12]),
                    };
                    frame.ppg_sample_count += 1;

                    if frame.ppg_sample_count as usize >= MAX_PPG_SAMPLES_PER_FRAME {
                        emit(SensorPacket::Ppg(frame));
                        frame.ppg_sample_count = 0;
                    }
                }
                if frame.ppg_sample_count > 0 {
                    emit(SensorPacket::Ppg(frame));
                }
            }
            PMD_MEASUREMENT_ACC => {
                if subtype != 0x01 {
                    return;
                }
                let seconds = Self::relative_seconds(&mut self.acc_origin, timestamp);

                let mut frame = AccFrame {
                    time_in_seconds: seconds,
                    ..AccFrame::default()
                };
                for chunk in payload.chunks_exact(6) {
                    let x = i16::from_le_bytes([chunk[0], chunk[1]]);
                    let y = i16::from_le_bytes([chunk[2], chunk[3]]);
                    let z = i16::from_le_bytes([chunk[4], chunk[5]]);
                    frame.acc_samples[frame.acc_sample_count as usize] = nalgebra::Vector3::new(
                        x as f32 / 1000.0,
                        y as f32 / 1000.0,
                        z as f32 / 1000.0,
                    );
                    frame.acc_sample_count += 1;

                    if frame.acc_sample_count as usize >= MAX_ACC_SAMPLES_PER_FRAME {
                        emit(SensorPacket::Acc(frame));
                        frame.acc_sample_count = 0;
                    }
                }
                if frame.acc_sample_count > 0 {
                    emit(SensorPacket::Acc(frame));
                }
            }
            PMD_MEASUREMENT_PPI => {
                if subtype != 0x00 {
                    return;
                }
                // PPI notifications carry a zero timestamp in practice; fall
                // back to the host clock.
                let timestamp = if timestamp == 0 { host_nanos } else { timestamp };
                let seconds = Self::relative_seconds(&mut self.ppi_origin, timestamp);

                let mut frame = PpiFrame {
                    time_in_seconds: seconds,
                    ..PpiFrame::default()
                };
                for chunk in payload.chunks_exact(6) {
                    let flags = chunk[5];
                    frame.ppi_samples[frame.ppi_sample_count as usize] = PpiSample {
                        beats_per_minute: chunk[0],
                        pulse_duration: u16::from_le_bytes([chunk[1], chunk[2]]),
                        pulse_duration_error: u16::from_le_bytes([chunk[3], chunk[4]]),
                        blocker: flags & 0x01 != 0,
                        skin_contact: flags & 0x02 != 0,
                        skin_contact_supported: flags & 0x04 != 0,
                    };
                    frame.ppi_sample_count += 1;

                    if frame.ppi_sample_count as usize >= MAX_PPI_SAMPLES_PER_FRAME {
                        emit(SensorPacket::Ppi(frame));
                        frame.ppi_sample_count = 0;
                    }
                }
                if frame.ppi_sample_count > 0 {
                    emit(SensorPacket::Ppi(frame));
                }
            }
            _ => {
                trace!("Unknown PMD frame tag {:#04x}, dropping", tag);
            }
        }
    }
}

/// Decode one Heart Rate Measurement notification. RR intervals beyond the
/// frame capacity roll into additional frames carrying the same heart rate
/// and timestamp.
fn decode_heart_rate(data: &[u8], time_in_seconds: f64, emit: &mut dyn FnMut(SensorPacket)) {
    if data.len() < 2 {
        trace!("Heart rate packet too short ({} bytes), dropping", data.len());
        return;
    }

    let flags = data[0];
    let format_16bit = flags & 0x01 != 0;
    let contact_detected = flags & 0x02 != 0;
    let contact_supported = flags & 0x04 != 0;
    let has_energy = flags & 0x08 != 0;
    let has_rr = flags & 0x10 != 0;

    let mut offset = 1;
    let beats_per_minute = if format_16bit {
        if data.len() < offset + 2 {
            return;
        }
        let bpm = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;
        bpm
    } else {
        let bpm = data[offset] as u16;
        offset += 1;
        bpm
    };

    let contact_status = if contact_supported {
        if contact_detected {
            ContactStatus::Contact
        } else {
            ContactStatus::NoContact
        }
    } else {
        ContactStatus::Invalid
    };

    let mut energy_expended = 0;
    if has_energy && data.len() >= offset + 2 {
        energy_expended = u16::from_le_bytes([data[offset], data[offset + 1]]);
        offset += 2;
    }

    let mut frame = HeartRateFrame {
        contact_status,
        beats_per_minute,
        energy_expended,
        time_in_seconds,
        ..HeartRateFrame::default()
    };

    if has_rr {
        for chunk in data[offset..].chunks_exact(2) {
            frame.rr_intervals[frame.rr_interval_count as usize] =
                u16::from_le_bytes([chunk[0], chunk[1]]);
            frame.rr_interval_count += 1;

            if frame.rr_interval_count as usize >= MAX_RR_INTERVALS_PER_FRAME {
                emit(SensorPacket::HeartRate(frame));
                frame.rr_interval_count = 0;
            }
        }
    }

    emit(SensorPacket::HeartRate(frame));
}

struct PolarCharacteristics {
    control_point: GattCharacteristic,
    data: GattCharacteristic,
    hr_measurement: GattCharacteristic,
    hr_control_point: Option<GattCharacteristic>,
}

/// Driver for the Polar sensor family.
pub struct PolarSensor {
    session: Option<Box<dyn DeviceSession>>,
    characteristics: Option<PolarCharacteristics>,
    device_path: String,
    friendly_name: String,
    address: crate::api::BDAddr,
    device_information: DeviceInformation,
    config: PolarSensorConfig,
    config_store: Option<ConfigStore>,
    config_name: String,
    capabilities: SensorCaps,
    active: SensorCaps,
    listener: Option<Arc<dyn SensorListener>>,
    pmd_decoder: Arc<Mutex<PmdDecoder>>,
    hr_origin: Arc<Mutex<Option<Instant>>>,
    control_point_token: Option<SubscriptionToken>,
    data_token: Option<SubscriptionToken>,
    hr_token: Option<SubscriptionToken>,
}

impl Default for PolarSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl PolarSensor {
    pub fn new() -> Self {
        PolarSensor {
            session: None,
            characteristics: None,
            device_path: String::new(),
            friendly_name: String::new(),
            address: crate::api::BDAddr::default(),
            device_information: DeviceInformation::default(),
            config: PolarSensorConfig::default(),
            config_store: None,
            config_name: String::new(),
            capabilities: SensorCaps::empty(),
            active: SensorCaps::empty(),
            listener: None,
            pmd_decoder: Arc::new(Mutex::new(PmdDecoder::default())),
            hr_origin: Arc::new(Mutex::new(None)),
            control_point_token: None,
            data_token: None,
            hr_token: None,
        }
    }

    /// Factory registered for the "Polar H10" and "Polar OH1" name prefixes.
    pub fn factory() -> Box<dyn SensorDriver> {
        Box::new(PolarSensor::new())
    }

    fn save_config(&self) {
        if let Some(store) = &self.config_store {
            if let Err(err) = store.save(&self.config_name, &self.config) {
                warn!("Failed to save {}: {}", self.config_name, err);
            }
        }
    }

    fn session(&self) -> Result<&dyn DeviceSession> {
        self.session.as_deref().ok_or(Error::NotConnected)
    }

    fn characteristics(&self) -> Result<&PolarCharacteristics> {
        self.characteristics.as_ref().ok_or(Error::NotConnected)
    }

    fn pmd_data_handler(&self) -> NotificationHandler {
        let decoder = Arc::clone(&self.pmd_decoder);
        let listener = self.listener.clone();
        Box::new(move |data| {
            if let Some(listener) = listener.as_ref() {
                decoder
                    .lock()
                    .unwrap()
                    .decode(data, host_clock_nanos(), &mut |packet| {
                        listener.on_sensor_packet(packet)
                    });
            }
        })
    }

    fn hr_handler(&self) -> NotificationHandler {
        let origin = Arc::clone(&self.hr_origin);
        let listener = self.listener.clone();
        Box::new(move |data| {
            if let Some(listener) = listener.as_ref() {
                let seconds = origin
                    .lock()
                    .unwrap()
                    .map(|start| start.elapsed().as_secs_f64())
                    .unwrap_or(0.0);
                decode_heart_rate(data, seconds, &mut |packet| {
                    listener.on_sensor_packet(packet)
                });
            }
        })
    }

    /// Probe which streams the device supports. The control point exposes a
    /// feature-read response; when that read fails or looks wrong, fall back
    /// to the capabilities implied by the advertised model name.
    fn probe_capabilities(&mut self) -> Result<()> {
        let session = self.session()?;
        let chars = self.characteristics()?;

        let mut capabilities = SensorCaps::HEART_RATE;
        let feature = session.read(&chars.control_point).unwrap_or_default();

        if feature.len() >= 2 && feature[0] == PMD_FEATURE_READ_RESPONSE {
            let bits = feature[1];
            if bits & 0x01 != 0 {
                capabilities |= SensorCaps::ECG;
            }
            if bits & 0x02 != 0 {
                capabilities |= SensorCaps::PPG;
            }
            if bits & 0x04 != 0 {
                capabilities |= SensorCaps::ACC;
            }
            if bits & 0x08 != 0 {
                capabilities |= SensorCaps::PPI;
            }
        } else if self.friendly_name.starts_with("Polar H10") {
            debug!("PMD feature read unavailable, using Polar H10 capability fallback");
            capabilities |= SensorCaps::ECG | SensorCaps::ACC;
        } else if self.friendly_name.starts_with("Polar OH1") {
            debug!("PMD feature read unavailable, using Polar OH1 capability fallback");
            capabilities |= SensorCaps::PPG | SensorCaps::ACC | SensorCaps::PPI;
        } else {
            debug!("PMD feature read unavailable and no model fallback, heart rate only");
        }

        self.capabilities = capabilities;
        Ok(())
    }

    /// Issue a PMD control request and verify the response prefix
    /// `[0xF0, op, measurement_type, 0x00]`.
    fn pmd_request(&self, op: u8, measurement_type: u8, settings: &[(u8, u16)]) -> Result<()> {
        let session = self.session()?;
        let chars = self.characteristics()?;

        let mut request = vec![op, measurement_type];
        for (setting_type, value) in settings {
            request.push(*setting_type);
            request.push(0x01);
            request.extend_from_slice(&value.to_le_bytes());
        }

        session.write(&chars.control_point, &request, WriteType::WithResponse)?;

        let response = session.read(&chars.control_point)?;
        let expected = [PMD_CONTROL_POINT_RESPONSE, op, measurement_type, 0x00];
        if response.len() < 4 || response[..4] != expected {
            return Err(Error::Protocol(format!(
                "control point replied {:02x?} to op {:#04x} type {:#04x}",
                response, op, measurement_type
            )));
        }

        Ok(())
    }

    fn start_stream(&mut self, capability: SensorCapability) -> Result<()> {
        match capability {
            SensorCapability::Ecg => {
                self.pmd_request(
                    PMD_OP_START_MEASUREMENT,
                    PMD_MEASUREMENT_ECG,
                    &[
                        (PMD_SETTING_SAMPLE_RATE, self.config.ecg_sample_rate as u16),
                        (PMD_SETTING_RESOLUTION, ECG_RESOLUTION_BITS),
                    ],
                )?;
                self.pmd_decoder.lock().unwrap().reset_origin(PMD_MEASUREMENT_ECG);
            }
            SensorCapability::Ppg => {
                self.pmd_request(
                    PMD_OP_START_MEASUREMENT,
                    PMD_MEASUREMENT_PPG,
                    &[
                        (PMD_SETTING_SAMPLE_RATE, self.config.ppg_sample_rate as u16),
                        (PMD_SETTING_RESOLUTION, PPG_RESOLUTION_BITS),
                    ],
                )?;
                self.pmd_decoder.lock().unwrap().reset_origin(PMD_MEASUREMENT_PPG);
            }
            SensorCapability::Acc => {
                self.pmd_request(
                    PMD_OP_START_MEASUREMENT,
                    PMD_MEASUREMENT_ACC,
                    &[
                        (PMD_SETTING_SAMPLE_RATE, self.config.acc_sample_rate as u16),
                        (PMD_SETTING_RESOLUTION, ACC_RESOLUTION_16BIT),
                        (PMD_SETTING_RANGE, ACC_RANGE_8G),
                    ],
                )?;
                self.pmd_decoder.lock().unwrap().reset_origin(PMD_MEASUREMENT_ACC);
            }
            SensorCapability::Ppi => {
                self.pmd_request(PMD_OP_START_MEASUREMENT, PMD_MEASUREMENT_PPI, &[])?;
                self.pmd_decoder.lock().unwrap().reset_origin(PMD_MEASUREMENT_PPI);
            }
            SensorCapability::HeartRate => {
                let handler = self.hr_handler();
                let token = {
                    let session = self.session()?;
                    let chars = self.characteristics()?;

                    let token = session.subscribe(
                        &chars.hr_measurement,
                        SubscriptionKind::Notify,
                        handler,
                    )?;

                    // Writing 0x01 to the Heart Rate Control Point resets the
                    // accumulated Energy Expended field.
                    if let Some(hr_control) = &chars.hr_control_point {
                        if let Err(err) =
                            session.write(hr_control, &[0x01], WriteType::WithResponse)
                        {
                            debug!("Energy expended reset failed: {}", err);
                        }
                    }
                    token
                };
                self.hr_token = Some(token);
                *self.hr_origin.lock().unwrap() = Some(Instant::now());
            }
            SensorCapability::Eda => return Err(Error::Protocol("EDA not supported".into())),
        }
        Ok(())
    }

    fn stop_stream(&mut self, capability: SensorCapability) -> Result<()> {
        match capability {
            SensorCapability::Ecg => {
                self.pmd_request(PMD_OP_STOP_MEASUREMENT, PMD_MEASUREMENT_ECG, &[])?
            }
            SensorCapability::Ppg => {
                self.pmd_request(PMD_OP_STOP_MEASUREMENT, PMD_MEASUREMENT_PPG, &[])?
            }
            SensorCapability::Acc => {
                self.pmd_request(PMD_OP_STOP_MEASUREMENT, PMD_MEASUREMENT_ACC, &[])?
            }
            SensorCapability::Ppi => {
                self.pmd_request(PMD_OP_STOP_MEASUREMENT, PMD_MEASUREMENT_PPI, &[])?
            }
            SensorCapability::HeartRate => {
                if let Some(token) = self.hr_token.take() {
                    self.session()?.unsubscribe(token)?;
                }
                *self.hr_origin.lock().unwrap() = None;
            }
            SensorCapability::Eda => {}
        }
        Ok(())
    }

    fn setup(&mut self, session: &dyn DeviceSession) -> Result<()> {
        let profile = session.profile();

        let pmd_service = profile
            .find_service(PMD_SERVICE)
            .ok_or_else(|| Error::Protocol("missing PMD service".into()))?;
        let control_point = pmd_service
            .find_characteristic(PMD_CONTROL_POINT)
            .ok_or(Error::NoSuchCharacteristic)?
            .clone();
        let data = pmd_service
            .find_characteristic(PMD_DATA)
            .ok_or(Error::NoSuchCharacteristic)?
            .clone();

        let hr_service = profile
            .find_service(HEART_RATE_SERVICE)
            .ok_or_else(|| Error::Protocol("missing Heart Rate service".into()))?;
        let hr_measurement = hr_service
            .find_characteristic(HEART_RATE_MEASUREMENT)
            .ok_or(Error::NoSuchCharacteristic)?
            .clone();
        let hr_control_point = hr_service
            .find_characteristic(HEART_RATE_CONTROL_POINT)
            .cloned();

        self.device_information = fetch_device_information(session);
        self.device_information.body_location = fetch_body_sensor_location(session);

        // Control point responses arrive as indications; log them for
        // protocol debugging.
        let control_token = session.subscribe(
            &control_point,
            SubscriptionKind::Indicate,
            Box::new(|data| trace!("PMD control point indication: {:02x?}", data)),
        )?;
        self.control_point_token = Some(control_token);

        let data_token = session.subscribe(&data, SubscriptionKind::Notify, self.pmd_data_handler())?;
        self.data_token = Some(data_token);

        self.characteristics = Some(PolarCharacteristics {
            control_point,
            data,
            hr_measurement,
            hr_control_point,
        });

        Ok(())
    }
}

impl SensorDriver for PolarSensor {
    fn open(
        &mut self,
        transport: &dyn BleTransport,
        config: &ConfigStore,
        entry: &PeripheralEntry,
    ) -> Result<()> {
        if self.is_open() {
            warn!("PolarSensor({}) already open, ignoring request", entry.path);
            return Ok(());
        }

        info!("Opening PolarSensor({})", entry.path);
        self.device_path = entry.path.clone();
        self.friendly_name = entry.friendly_name.clone();
        self.address = entry.address;

        self.config_name = sensor_config_name(&entry.address);
        self.config = PolarSensorConfig::load(config, &self.config_name);
        self.config.device_name = entry.friendly_name.clone();
        self.config_store = Some(config.clone());

        let session = transport.open(entry)?;
        if let Err(err) = self.setup(&*session) {
            warn!("Failed to open PolarSensor({}): {}", entry.path, err);
            session.close();
            self.characteristics = None;
            self.control_point_token = None;
            self.data_token = None;
            return Err(err);
        }
        self.session = Some(session);

        if let Err(err) = self.probe_capabilities() {
            self.close();
            return Err(err);
        }

        self.config.is_valid = true;
        self.save_config();

        Ok(())
    }

    fn close(&mut self) {
        if !self.is_open() {
            debug!("PolarSensor({}) already closed, ignoring request", self.device_path);
            return;
        }

        info!("Closing PolarSensor({})", self.device_path);

        let active = self.active;
        for capability in SensorCapability::ALL {
            if active.contains(capability.flag()) {
                if let Err(err) = self.stop_stream(capability) {
                    debug!("Stopping {:?} during close failed: {}", capability, err);
                }
            }
        }
        self.active = SensorCaps::empty();

        if let Some(session) = self.session.take() {
            for token in [
                self.control_point_token.take(),
                self.data_token.take(),
                self.hr_token.take(),
            ]
            .into_iter()
            .flatten()
            {
                let _ = session.unsubscribe(token);
            }
            session.close();
        }
        self.characteristics = None;
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
        for capability in SensorCapability::ALL {
            let flag = capability.flag();
            if !self.capabilities.contains(flag) {
                continue;
            }

            let wants_active = requested.contains(flag);
            let is_active = self.active.contains(flag);

            if wants_active && !is_active {
                match self.start_stream(capability) {
                    Ok(()) => self.active |= flag,
                    Err(err) => warn!("Starting {:?} stream failed: {}", capability, err),
                }
            } else if !wants_active && is_active {
                if let Err(err) = self.stop_stream(capability) {
                    warn!("Stopping {:?} stream failed: {}", capability, err);
                }
                self.active -= flag;
            }
        }

        Ok(())
    }

    fn active_streams(&self) -> SensorCaps {
        self.active
    }

    fn capability_sample_rate(&self, capability: SensorCapability) -> u32 {
        match capability {
            // Average delivery rate of the notification streams.
            SensorCapability::HeartRate | SensorCapability::Ppi => 10,
            SensorCapability::Ecg => self.config.ecg_sample_rate,
            SensorCapability::Ppg => self.config.ppg_sample_rate,
            SensorCapability::Acc => self.config.acc_sample_rate,
            SensorCapability::Eda => 0,
        }
    }

    fn capability_bit_resolution(&self, capability: SensorCapability) -> u32 {
        match capability {
            SensorCapability::Ecg => ECG_RESOLUTION_BITS as u32,
            SensorCapability::Ppg => PPG_RESOLUTION_BITS as u32,
            SensorCapability::HeartRate
            | SensorCapability::Ppi
            | SensorCapability::Acc => 16,
            SensorCapability::Eda => 0,
        }
    }

    fn available_sample_rates(&self, capability: SensorCapability) -> &[u32] {
        match capability {
            SensorCapability::Ecg => &AVAILABLE_ECG_SAMPLE_RATES,
            SensorCapability::Ppg => &AVAILABLE_PPG_SAMPLE_RATES,
            SensorCapability::Acc => &AVAILABLE_ACC_SAMPLE_RATES,
            _ => &[],
        }
    }

    fn set_capability_sample_rate(&mut self, capability: SensorCapability, rate: u32) {
        let available = self.available_sample_rates(capability);
        if available.is_empty() {
            return;
        }
        let rate = sanitize_sample_rate(rate, available);

        let slot = match capability {
            SensorCapability::Ecg => &mut self.config.ecg_sample_rate,
            SensorCapability::Ppg => &mut self.config.ppg_sample_rate,
            SensorCapability::Acc => &mut self.config.acc_sample_rate,
            _ => return,
        };
        if *slot != rate {
            // Applies at the next stream start.
            *slot = rate;
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

impl Drop for PolarSensor {
    fn drop(&mut self) {
        self.close();
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

    fn decode_pmd(decoder: &mut PmdDecoder, data: &[u8], host_nanos: u64) -> Vec<SensorPacket> {
        let mut packets = Vec::new();
        decoder.decode(data, host_nanos, &mut |packet| packets.push(packet));
        packets
    }

    fn pmd_header(tag: u8, timestamp: u64, subtype: u8) -> Vec<u8> {
        let mut data = vec![tag];
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.push(subtype);
        data
    }

    #[test]
    fn ecg_decode_latches_origin_and_sign_extends() {
        let mut decoder = PmdDecoder::default();

        let mut data = pmd_header(PMD_MEASUREMENT_ECG, 10_000_000_000, 0x00);
        data.extend_from_slice(&[0x01, 0x00, 0x00]); // 1 uV
        data.extend_from_slice(&[0x00, 0x80, 0xff]); // -32768 uV

        let packets = decode_pmd(&mut decoder, &data, 0);
        assert_eq!(packets.len(), 1);
        let SensorPacket::Ecg(frame) = packets[0] else {
            panic!("expected ECG frame");
        };
        assert_eq!(frame.time_in_seconds, 0.0);
        assert_eq!(frame.values(), &[1, -32768]);

        // One second later on the device clock.
        let mut data = pmd_header(PMD_MEASUREMENT_ECG, 11_000_000_000, 0x00);
        data.extend_from_slice(&[0xff, 0xff, 0xff]); // -1 uV

        let packets = decode_pmd(&mut decoder, &data, 0);
        let SensorPacket::Ecg(frame) = packets[0] else {
            panic!("expected ECG frame");
        };
        assert!((frame.time_in_seconds - 1.0).abs() < 1e-9);
        assert_eq!(frame.values(), &[-1]);
    }

    #[test]
    fn ecg_decode_flushes_full_frames_without_losing_samples() {
        let mut decoder = PmdDecoder::default();
        let mut data = pmd_header(PMD_MEASUREMENT_ECG, 5, 0x00);
        for value in 0..12u8 {
            data.extend_from_slice(&[value, 0x00, 0x00]);
        }

        let packets = decode_pmd(&mut decoder, &data, 0);
        assert_eq!(packets.len(), 2);
        let SensorPacket::Ecg(first) = packets[0] else {
            panic!()
        };
        let SensorPacket::Ecg(second) = packets[1] else {
            panic!()
        };
        assert_eq!(first.values().len(), 10);
        assert_eq!(second.values(), &[10, 11]);
        assert_eq!(first.time_in_seconds, second.time_in_seconds);
    }

    #[test]
    fn ecg_decode_rejects_unknown_subtype() {
        let mut decoder = PmdDecoder::default();
        let mut data = pmd_header(PMD_MEASUREMENT_ECG, 5, 0x01);
        data.extend_from_slice(&[0x01, 0x00, 0x00]);
        assert!(decode_pmd(&mut decoder, &data, 0).is_empty());
    }

    #[test]
    fn acc_decode_converts_milli_g() {
        let mut decoder = PmdDecoder::default();
        let mut data = pmd_header(PMD_MEASUREMENT_ACC, 7, 0x01);
        for (x, y, z) in [(1000i16, -500i16, 250i16), (0, 0, -1000)] {
            data.extend_from_slice(&x.to_le_bytes());
            data.extend_from_slice(&y.to_le_bytes());
            data.extend_from_slice(&z.to_le_bytes());
        }

        let packets = decode_pmd(&mut decoder, &data, 0);
        let SensorPacket::Acc(frame) = packets[0] else {
            panic!("expected ACC frame");
        };
        let samples = frame.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], nalgebra::Vector3::new(1.0, -0.5, 0.25));
        assert_eq!(samples[1], nalgebra::Vector3::new(0.0, 0.0, -1.0));
    }

    #[test]
    fn ppg_decode_reads_four_channels() {
        let mut decoder = PmdDecoder::default();
        let mut data = pmd_header(PMD_MEASUREMENT_PPG, 7, 0x00);
        data.extend_from_slice(&[
            0x01, 0x00, 0x00, // v0 = 1
            0x02, 0x00, 0x00, // v1 = 2
            0x03, 0x00, 0x00, // v2 = 3
            0xff, 0xff, 0xff, // ambient = -1
        ]);

        let packets = decode_pmd(&mut decoder, &data, 0);
        let SensorPacket::Ppg(frame) = packets[0] else {
            panic!("expected PPG frame");
        };
        assert_eq!(
            frame.samples(),
            &[PpgSample {
                ppg_value0: 1,
                ppg_value1: 2,
                ppg_value2: 3,
                ambient: -1,
            }]
        );
    }

    #[test]
    fn ppi_decode_uses_host_clock_when_device_timestamp_is_zero() {
        let mut decoder = PmdDecoder::default();

        let mut data = pmd_header(PMD_MEASUREMENT_PPI, 0, 0x00);
        data.extend_from_slice(&[72, 0xb4, 0x02, 0x0a, 0x00, 0b0000_0110]);

        let packets = decode_pmd(&mut decoder, &data, 4_000_000_000);
        let SensorPacket::Ppi(frame) = packets[0] else {
            panic!("expected PPI frame");
        };
        assert_eq!(frame.time_in_seconds, 0.0);
        let sample = frame.samples()[0];
        assert_eq!(sample.beats_per_minute, 72);
        assert_eq!(sample.pulse_duration, 692);
        assert_eq!(sample.pulse_duration_error, 10);
        assert!(!sample.blocker);
        assert!(sample.skin_contact);
        assert!(sample.skin_contact_supported);

        // Two host-clock seconds later.
        let mut data = pmd_header(PMD_MEASUREMENT_PPI, 0, 0x00);
        data.extend_from_slice(&[70, 0x20, 0x03, 0x05, 0x00, 0b0000_0001]);
        let packets = decode_pmd(&mut decoder, &data, 6_000_000_000);
        let SensorPacket::Ppi(frame) = packets[0] else {
            panic!()
        };
        assert!((frame.time_in_seconds - 2.0).abs() < 1e-9);
        assert!(frame.samples()[0].blocker);
    }

    #[test]
    fn malformed_pmd_packets_are_dropped() {
        let mut decoder = PmdDecoder::default();
        assert!(decode_pmd(&mut decoder, &[], 0).is_empty());
        assert!(decode_pmd(&mut decoder, &[0x00, 0x01], 0).is_empty());
        // Unknown tag.
        let data = pmd_header(0x7e, 1, 0x00);
        assert!(decode_pmd(&mut decoder, &data, 0).is_empty());
    }

    fn decode_hr(data: &[u8], seconds: f64) -> Vec<SensorPacket> {
        let mut packets = Vec::new();
        decode_heart_rate(data, seconds, &mut |packet| packets.push(packet));
        packets
    }

    #[test]
    fn heart_rate_with_energy_and_rr() {
        // Flags: contact detected + supported, energy present, RR present.
        let packets = decode_hr(&[0x1e, 72, 0xe8, 0x03, 0xb4, 0x02], 1.5);
        assert_eq!(packets.len(), 1);
        let SensorPacket::HeartRate(frame) = packets[0] else {
            panic!("expected HR frame");
        };
        assert_eq!(frame.beats_per_minute, 72);
        assert_eq!(frame.contact_status, ContactStatus::Contact);
        assert_eq!(frame.energy_expended, 1000);
        assert_eq!(frame.intervals(), &[692]);
        assert_eq!(frame.time_in_seconds, 1.5);
    }

    #[test]
    fn heart_rate_sixteen_bit_format() {
        let packets = decode_hr(&[0x01, 0x40, 0x01], 0.0);
        let SensorPacket::HeartRate(frame) = packets[0] else {
            panic!()
        };
        assert_eq!(frame.beats_per_minute, 320);
        assert_eq!(frame.contact_status, ContactStatus::Invalid);
        assert_eq!(frame.energy_expended, 0);
        assert!(frame.intervals().is_empty());
    }

    #[test]
    fn heart_rate_contact_lost() {
        let packets = decode_hr(&[0x04, 60], 0.0);
        let SensorPacket::HeartRate(frame) = packets[0] else {
            panic!()
        };
        assert_eq!(frame.contact_status, ContactStatus::NoContact);
    }

    #[test]
    fn heart_rate_rr_overflow_rolls_into_next_frame() {
        let mut data = vec![0x10, 65];
        for rr in 0..11u16 {
            data.extend_from_slice(&(800 + rr).to_le_bytes());
        }

        let packets = decode_hr(&data, 0.0);
        assert_eq!(packets.len(), 2);
        let SensorPacket::HeartRate(first) = packets[0] else {
            panic!()
        };
        let SensorPacket::HeartRate(second) = packets[1] else {
            panic!()
        };
        assert_eq!(first.intervals().len(), 9);
        assert_eq!(second.intervals(), &[809, 810]);
        assert_eq!(first.beats_per_minute, second.beats_per_minute);
    }

    #[test]
    fn driver_probes_capabilities_from_feature_read() {
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = PolarSensor::new();
        driver.set_listener(Collector::new());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();

        assert!(driver.is_open());
        assert_eq!(
            driver.capabilities(),
            SensorCaps::HEART_RATE
                | SensorCaps::ECG
                | SensorCaps::PPG
                | SensorCaps::ACC
                | SensorCaps::PPI
        );
        assert_eq!(driver.device_information().model_number, "H10");
        assert_eq!(driver.device_information().body_location, "Chest");
        assert_eq!(driver.device_information().battery_level, Some(87));
    }

    #[test]
    fn driver_falls_back_to_name_based_capabilities() {
        let transport = MockTransport::new();
        let peripheral = transport.add_peripheral(
            polar_entry("dev/polar1", "Polar H10 AB"),
            polar_profile(),
        );
        // Feature read yields garbage.
        peripheral.set_read_value(PMD_CONTROL_POINT, vec![0x42]);
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = PolarSensor::new();
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        assert_eq!(
            driver.capabilities(),
            SensorCaps::HEART_RATE | SensorCaps::ECG | SensorCaps::ACC
        );
    }

    #[test]
    fn starting_ecg_writes_the_expected_control_frame() {
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = PolarSensor::new();
        driver.set_listener(Collector::new());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_active_streams(SensorCaps::ECG).unwrap();

        assert_eq!(driver.active_streams(), SensorCaps::ECG);
        let writes = peripheral.writes_to(PMD_CONTROL_POINT);
        assert_eq!(
            writes.last().unwrap().data,
            vec![0x02, 0x00, 0x00, 0x01, 0x82, 0x00, 0x01, 0x01, 0x0e, 0x00]
        );

        driver.set_active_streams(SensorCaps::empty()).unwrap();
        assert_eq!(driver.active_streams(), SensorCaps::empty());
        let writes = peripheral.writes_to(PMD_CONTROL_POINT);
        assert_eq!(writes.last().unwrap().data, vec![0x03, 0x00]);
    }

    #[test]
    fn failed_control_response_leaves_stream_inactive() {
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");
        // Error code 0x05 instead of success.
        peripheral.set_write_responder(PMD_CONTROL_POINT, |request| {
            vec![
                PMD_CONTROL_POINT_RESPONSE,
                request.first().copied().unwrap_or(0),
                request.get(1).copied().unwrap_or(0),
                0x05,
            ]
        });
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = PolarSensor::new();
        driver.set_listener(Collector::new());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_active_streams(SensorCaps::ECG).unwrap();
        assert_eq!(driver.active_streams(), SensorCaps::empty());
    }

    #[test]
    fn heart_rate_stream_subscribes_and_resets_energy() {
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let collector = Collector::new();
        let mut driver = PolarSensor::new();
        driver.set_listener(collector.clone());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_active_streams(SensorCaps::HEART_RATE).unwrap();

        assert_eq!(peripheral.subscriber_count(HEART_RATE_MEASUREMENT), 1);
        let resets = peripheral.writes_to(HEART_RATE_CONTROL_POINT);
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].data, vec![0x01]);

        peripheral.notify(HEART_RATE_MEASUREMENT, &[0x06, 72]);
        let packets = collector.take();
        assert_eq!(packets.len(), 1);
        assert!(matches!(packets[0], SensorPacket::HeartRate(_)));

        driver.set_active_streams(SensorCaps::empty()).unwrap();
        assert_eq!(peripheral.subscriber_count(HEART_RATE_MEASUREMENT), 0);
    }

    #[test]
    fn pmd_notifications_flow_to_the_listener() {
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let collector = Collector::new();
        let mut driver = PolarSensor::new();
        driver.set_listener(collector.clone());
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_active_streams(SensorCaps::ECG).unwrap();

        let mut data = vec![PMD_MEASUREMENT_ECG];
        data.extend_from_slice(&10u64.to_le_bytes());
        data.push(0x00);
        data.extend_from_slice(&[0x2a, 0x00, 0x00]);
        peripheral.notify(PMD_DATA, &data);

        let packets = collector.take();
        assert_eq!(packets.len(), 1);
        let SensorPacket::Ecg(frame) = packets[0] else {
            panic!()
        };
        assert_eq!(frame.values(), &[42]);
    }

    #[test]
    fn config_round_trips_and_persists_rate_changes() {
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());
        let transport = MockTransport::new();
        let peripheral = add_cooperative_h10(&transport, "dev/polar0");

        let mut driver = PolarSensor::new();
        driver.open(&transport, &store, &peripheral.entry()).unwrap();
        driver.set_capability_sample_rate(SensorCapability::Acc, 100);
        // Unsupported rates snap to the first available one.
        driver.set_capability_sample_rate(SensorCapability::Ecg, 999);
        let name = driver.config_name.clone();
        driver.close();

        let reloaded = PolarSensorConfig::load(&store, &name);
        assert!(reloaded.is_valid);
        assert_eq!(reloaded.acc_sample_rate, 100);
        assert_eq!(reloaded.ecg_sample_rate, 130);
        assert_eq!(reloaded.device_name, "Polar H10 12345678");
    }

    #[test]
    fn open_fails_without_pmd_service() {
        use crate::transport::mock::{characteristic, service};
        use crate::transport::{CharPropFlags, GattProfile};

        let transport = MockTransport::new();
        let profile = GattProfile {
            services: vec![service(
                HEART_RATE_SERVICE,
                vec![characteristic(
                    HEART_RATE_SERVICE,
                    HEART_RATE_MEASUREMENT,
                    CharPropFlags::NOTIFY,
                )],
            )],
        };
        let peripheral = transport.add_peripheral(polar_entry("dev/polar9", "Polar H10 X"), profile);
        let dir = TempDir::new("pulseplug-polar").unwrap();
        let store = ConfigStore::new(dir.path());

        let mut driver = PolarSensor::new();
        let result = driver.open(&transport, &store, &peripheral.entry());
        assert!(result.is_err());
        assert!(!driver.is_open());
        // The session was released, so a retry can open it again.
        assert!(!peripheral.is_session_open());
    }
}
