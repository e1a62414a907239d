// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `api` module contains the types which make up pulseplug's client-facing
//! data model: capability and filter masks, the normalized telemetry frames
//! decoded from sensor notifications, the sensor pool entries returned by
//! [`Service::sensor_list`](crate::service::Service::sensor_list) and the
//! snapshot [`BufferIterator`] handed out by the buffer accessors.

pub(crate) mod bdaddr;
pub mod bleuuid;

pub use self::bdaddr::{BDAddr, ParseBDAddrError};

use bitflags::bitflags;
use nalgebra::Vector3;
use std::fmt::{self, Display, Formatter};

/// The id of a sensor in the sensor pool, in `0..MAX_SENSOR_COUNT`.
pub type SensorId = usize;

/// Maximum RR intervals a single heart-rate frame can carry.
pub const MAX_RR_INTERVALS_PER_FRAME: usize = 9;
/// Maximum ECG samples a single frame can carry.
pub const MAX_ECG_VALUES_PER_FRAME: usize = 10;
/// Maximum PPG samples a single frame can carry.
pub const MAX_PPG_SAMPLES_PER_FRAME: usize = 10;
/// Maximum pulse-to-pulse interval samples a single frame can carry.
pub const MAX_PPI_SAMPLES_PER_FRAME: usize = 5;
/// Maximum accelerometer samples a single frame can carry.
pub const MAX_ACC_SAMPLES_PER_FRAME: usize = 5;

bitflags! {
    /// A set of data streams a sensor can produce.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SensorCaps: u32 {
        const HEART_RATE = 1 << 0;
        const ECG = 1 << 1;
        const PPG = 1 << 2;
        const PPI = 1 << 3;
        const ACC = 1 << 4;
        const EDA = 1 << 5;
    }
}

/// One capability stream, used to address buffers and sample-rate queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorCapability {
    HeartRate,
    Ecg,
    Ppg,
    Ppi,
    Acc,
    Eda,
}

impl SensorCapability {
    /// Every capability, in stream-flag order.
    pub const ALL: [SensorCapability; 6] = [
        SensorCapability::HeartRate,
        SensorCapability::Ecg,
        SensorCapability::Ppg,
        SensorCapability::Ppi,
        SensorCapability::Acc,
        SensorCapability::Eda,
    ];

    /// The mask flag for this capability.
    pub fn flag(self) -> SensorCaps {
        match self {
            SensorCapability::HeartRate => SensorCaps::HEART_RATE,
            SensorCapability::Ecg => SensorCaps::ECG,
            SensorCapability::Ppg => SensorCaps::PPG,
            SensorCapability::Ppi => SensorCaps::PPI,
            SensorCapability::Acc => SensorCaps::ACC,
            SensorCapability::Eda => SensorCaps::EDA,
        }
    }
}

bitflags! {
    /// A set of heart-rate-variability filters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HrvFilters: u32 {
        const SDNN = 1 << 0;
        const RMSSD = 1 << 1;
        const SDSD = 1 << 2;
        const NN50 = 1 << 3;
        const PNN50 = 1 << 4;
        const NN20 = 1 << 5;
        const PNN20 = 1 << 6;
    }
}

/// One heart-rate-variability statistic derived from the beat-interval
/// stream. Each filter feeds its own derived-frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HrvFilter {
    /// Standard deviation of the RR intervals.
    Sdnn,
    /// Root mean square of successive RR differences.
    Rmssd,
    /// Standard deviation of successive RR differences.
    Sdsd,
    /// Count of successive RR differences above 50 ms.
    Nn50,
    /// `NN50` over the number of differences.
    PNn50,
    /// Count of successive RR differences above 20 ms.
    Nn20,
    /// `NN20` over the number of differences.
    PNn20,
}

impl HrvFilter {
    /// Every filter, in flag order.
    pub const ALL: [HrvFilter; 7] = [
        HrvFilter::Sdnn,
        HrvFilter::Rmssd,
        HrvFilter::Sdsd,
        HrvFilter::Nn50,
        HrvFilter::PNn50,
        HrvFilter::Nn20,
        HrvFilter::PNn20,
    ];

    /// The mask flag for this filter.
    pub fn flag(self) -> HrvFilters {
        match self {
            HrvFilter::Sdnn => HrvFilters::SDNN,
            HrvFilter::Rmssd => HrvFilters::RMSSD,
            HrvFilter::Sdsd => HrvFilters::SDSD,
            HrvFilter::Nn50 => HrvFilters::NN50,
            HrvFilter::PNn50 => HrvFilters::PNN50,
            HrvFilter::Nn20 => HrvFilters::NN20,
            HrvFilter::PNn20 => HrvFilters::PNN20,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Skin contact state reported by the heart-rate measurement.
///
/// `Invalid` means the sensor does not support contact detection at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactStatus {
    #[default]
    Invalid,
    NoContact,
    Contact,
}

/// Heart rate data decoded from the standard Heart Rate Measurement
/// characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeartRateFrame {
    pub contact_status: ContactStatus,
    pub beats_per_minute: u16,
    /// Accumulated energy expended in kilojoules, if the device reports it.
    pub energy_expended: u16,
    /// RR intervals in milliseconds.
    pub rr_intervals: [u16; MAX_RR_INTERVALS_PER_FRAME],
    pub rr_interval_count: u16,
    pub time_in_seconds: f64,
}

impl HeartRateFrame {
    /// The valid RR intervals of this frame.
    pub fn intervals(&self) -> &[u16] {
        &self.rr_intervals[..self.rr_interval_count as usize]
    }
}

/// A batch of electrocardiogram samples in microvolts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EcgFrame {
    /// Samples in microvolts. Transmitted as 24-bit signed integers and
    /// sign-extended into 32 bits.
    pub ecg_values: [i32; MAX_ECG_VALUES_PER_FRAME],
    pub ecg_value_count: u16,
    pub time_in_seconds: f64,
}

impl EcgFrame {
    /// The valid samples of this frame.
    pub fn values(&self) -> &[i32] {
        &self.ecg_values[..self.ecg_value_count as usize]
    }
}

/// One photoplethysmography sample: three LED channels plus ambient light,
/// each a 24-bit reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpgSample {
    pub ppg_value0: i32,
    pub ppg_value1: i32,
    pub ppg_value2: i32,
    pub ambient: i32,
}

/// A batch of photoplethysmography samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PpgFrame {
    pub ppg_samples: [PpgSample; MAX_PPG_SAMPLES_PER_FRAME],
    pub ppg_sample_count: u16,
    pub time_in_seconds: f64,
}

impl PpgFrame {
    /// The valid samples of this frame.
    pub fn samples(&self) -> &[PpgSample] {
        &self.ppg_samples[..self.ppg_sample_count as usize]
    }
}

/// One pulse-to-pulse interval sample derived by the sensor from its optical
/// stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PpiSample {
    pub beats_per_minute: u8,
    /// Interval between pulses in milliseconds.
    pub pulse_duration: u16,
    /// Estimated error of the interval in milliseconds.
    pub pulse_duration_error: u16,
    /// The sensor was blocked or the signal quality too poor to measure.
    pub blocker: bool,
    pub skin_contact: bool,
    pub skin_contact_supported: bool,
}

/// A batch of pulse-to-pulse interval samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PpiFrame {
    pub ppi_samples: [PpiSample; MAX_PPI_SAMPLES_PER_FRAME],
    pub ppi_sample_count: u16,
    pub time_in_seconds: f64,
}

impl PpiFrame {
    /// The valid samples of this frame.
    pub fn samples(&self) -> &[PpiSample] {
        &self.ppi_samples[..self.ppi_sample_count as usize]
    }
}

/// A batch of accelerometer samples, normalized to g-units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccFrame {
    pub acc_samples: [Vector3<f32>; MAX_ACC_SAMPLES_PER_FRAME],
    pub acc_sample_count: u16,
    pub time_in_seconds: f64,
}

impl AccFrame {
    /// The valid samples of this frame.
    pub fn samples(&self) -> &[Vector3<f32>] {
        &self.acc_samples[..self.acc_sample_count as usize]
    }
}

impl Default for AccFrame {
    fn default() -> Self {
        AccFrame {
            acc_samples: [Vector3::zeros(); MAX_ACC_SAMPLES_PER_FRAME],
            acc_sample_count: 0,
            time_in_seconds: 0.0,
        }
    }
}

/// One electrodermal-activity (galvanic skin response) reading. The value is
/// the raw unitless ADC reading from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EdaFrame {
    pub eda_value: u16,
    pub time_in_seconds: f64,
}

/// One derived heart-rate-variability value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HrvFrame {
    pub hrv_value: f32,
    pub time_in_seconds: f64,
}

/// A decoded telemetry frame, tagged by stream. This is what sensor drivers
/// hand to their listener from the notification thread, and what travels
/// through the per-sensor packet queue to the service tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorPacket {
    HeartRate(HeartRateFrame),
    Ecg(EcgFrame),
    Ppg(PpgFrame),
    Ppi(PpiFrame),
    Acc(AccFrame),
    Eda(EdaFrame),
}

impl SensorPacket {
    /// The capability stream this packet belongs to.
    pub fn capability(&self) -> SensorCapability {
        match self {
            SensorPacket::HeartRate(_) => SensorCapability::HeartRate,
            SensorPacket::Ecg(_) => SensorCapability::Ecg,
            SensorPacket::Ppg(_) => SensorCapability::Ppg,
            SensorPacket::Ppi(_) => SensorCapability::Ppi,
            SensorPacket::Acc(_) => SensorCapability::Acc,
            SensorPacket::Eda(_) => SensorCapability::Eda,
        }
    }

    /// The decode timestamp of the packet, seconds since stream start.
    pub fn time_in_seconds(&self) -> f64 {
        match self {
            SensorPacket::HeartRate(f) => f.time_in_seconds,
            SensorPacket::Ecg(f) => f.time_in_seconds,
            SensorPacket::Ppg(f) => f.time_in_seconds,
            SensorPacket::Ppi(f) => f.time_in_seconds,
            SensorPacket::Acc(f) => f.time_in_seconds,
            SensorPacket::Eda(f) => f.time_in_seconds,
        }
    }
}

/// Receives decoded packets from a sensor driver. Implementations must be
/// callable from the transport's notification threads.
pub trait SensorListener: Send + Sync {
    fn on_sensor_packet(&self, packet: SensorPacket);
}

/// Device strings read from the standard Device Information service, plus
/// the body sensor location advertised by heart-rate devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub system_id: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    pub manufacturer_name: String,
    pub body_location: String,
    pub battery_level: Option<u8>,
}

/// One entry of the sensor pool as reported by the service facade.
#[derive(Debug, Clone, Default)]
pub struct SensorInfo {
    pub sensor_id: SensorId,
    pub capabilities: SensorCaps,
    pub friendly_name: String,
    pub device_path: String,
    pub device_information: DeviceInformation,
    pub active_streams: SensorCaps,
    pub active_filters: HrvFilters,
    /// Most recent valid heart rate, 0 when stale or unknown.
    pub beats_per_minute: u16,
}

impl Display for SensorInfo {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "sensor {} ({}) caps: {:?}",
            self.sensor_id, self.friendly_name, self.capabilities
        )
    }
}

/// Snapshot of all running sensors.
#[derive(Debug, Clone, Default)]
pub struct SensorList {
    /// Address of the host Bluetooth adapter.
    pub host_serial: String,
    pub sensors: Vec<SensorInfo>,
}

/// Which buffer a [`BufferIterator`] walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    HeartRate,
    Ecg,
    Ppg,
    Ppi,
    Acc,
    Eda,
    Hrv,
}

#[derive(Debug, Clone)]
enum BufferData {
    HeartRate(Vec<HeartRateFrame>),
    Ecg(Vec<EcgFrame>),
    Ppg(Vec<PpgFrame>),
    Ppi(Vec<PpiFrame>),
    Acc(Vec<AccFrame>),
    Eda(Vec<EdaFrame>),
    Hrv(Vec<HrvFrame>),
}

impl BufferData {
    fn len(&self) -> usize {
        match self {
            BufferData::HeartRate(v) => v.len(),
            BufferData::Ecg(v) => v.len(),
            BufferData::Ppg(v) => v.len(),
            BufferData::Ppi(v) => v.len(),
            BufferData::Acc(v) => v.len(),
            BufferData::Eda(v) => v.len(),
            BufferData::Hrv(v) => v.len(),
        }
    }
}

/// A point-in-time snapshot over one sensor buffer, oldest sample first.
///
/// The iterator owns the values it was created over; later service ticks do
/// not affect it, but a new snapshot taken afterwards may disagree with it.
/// The typed accessors return the current sample only when the iterator's
/// kind matches.
#[derive(Debug, Clone)]
pub struct BufferIterator {
    data: BufferData,
    index: usize,
}

macro_rules! typed_accessor {
    ($name:ident, $variant:ident, $frame:ty) => {
        /// Current sample, when this iterator walks the matching buffer.
        pub fn $name(&self) -> Option<&$frame> {
            match &self.data {
                BufferData::$variant(values) => values.get(self.index),
                _ => None,
            }
        }
    };
}

impl BufferIterator {
    pub(crate) fn heart_rate(values: Vec<HeartRateFrame>) -> Self {
        Self::new(BufferData::HeartRate(values))
    }

    pub(crate) fn ecg(values: Vec<EcgFrame>) -> Self {
        Self::new(BufferData::Ecg(values))
    }

    pub(crate) fn ppg(values: Vec<PpgFrame>) -> Self {
        Self::new(BufferData::Ppg(values))
    }

    pub(crate) fn ppi(values: Vec<PpiFrame>) -> Self {
        Self::new(BufferData::Ppi(values))
    }

    pub(crate) fn acc(values: Vec<AccFrame>) -> Self {
        Self::new(BufferData::Acc(values))
    }

    pub(crate) fn eda(values: Vec<EdaFrame>) -> Self {
        Self::new(BufferData::Eda(values))
    }

    pub(crate) fn hrv(values: Vec<HrvFrame>) -> Self {
        Self::new(BufferData::Hrv(values))
    }

    fn new(data: BufferData) -> Self {
        BufferIterator { data, index: 0 }
    }

    /// The kind of buffer this iterator walks.
    pub fn kind(&self) -> BufferKind {
        match &self.data {
            BufferData::HeartRate(_) => BufferKind::HeartRate,
            BufferData::Ecg(_) => BufferKind::Ecg,
            BufferData::Ppg(_) => BufferKind::Ppg,
            BufferData::Ppi(_) => BufferKind::Ppi,
            BufferData::Acc(_) => BufferKind::Acc,
            BufferData::Eda(_) => BufferKind::Eda,
            BufferData::Hrv(_) => BufferKind::Hrv,
        }
    }

    /// True while the iterator points at a sample.
    pub fn is_valid(&self) -> bool {
        self.index < self.data.len()
    }

    /// Advance to the next sample. Returns whether the iterator is still
    /// valid afterwards.
    pub fn next(&mut self) -> bool {
        if self.index < self.data.len() {
            self.index += 1;
        }
        self.is_valid()
    }

    /// Number of samples in the snapshot.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Samples not yet visited, including the current one.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.index)
    }

    typed_accessor!(hr_data, HeartRate, HeartRateFrame);
    typed_accessor!(ecg_data, Ecg, EcgFrame);
    typed_accessor!(ppg_data, Ppg, PpgFrame);
    typed_accessor!(ppi_data, Ppi, PpiFrame);
    typed_accessor!(acc_data, Acc, AccFrame);
    typed_accessor!(eda_data, Eda, EdaFrame);
    typed_accessor!(hrv_data, Hrv, HrvFrame);
}
