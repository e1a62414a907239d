// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Per-slot sensor aggregation.
//!
//! A `ServerSensorView` owns one sensor slot: the driver bound to the
//! peripheral, the ring history of every capability stream, the derived HRV
//! buffers and the packet queue the driver's notification thread feeds.
//! Everything except the queue is touched only from the service tick.

use log::warn;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{
    AccFrame, BufferIterator, EcgFrame, EdaFrame, HeartRateFrame, HrvFilter, HrvFilters, HrvFrame,
    PpgFrame, PpiFrame, SensorCapability, SensorCaps, SensorId, SensorInfo, SensorListener,
    SensorPacket,
};
use crate::buffer::{PacketQueue, RingBuffer};
use crate::config::ConfigStore;
use crate::hrv;
use crate::sensors::SensorDriver;
use crate::transport::{BleTransport, PeripheralEntry};
use crate::{Error, Result};

/// Packets buffered between two service ticks. The tick drains well within
/// one queue length at every realistic sampling rate.
const SENSOR_PACKET_QUEUE_CAPACITY: usize = 1000;

impl SensorListener for PacketQueue<SensorPacket> {
    fn on_sensor_packet(&self, packet: SensorPacket) {
        self.push(packet);
    }
}

fn samples_needed(sample_rate: u32, history_duration_seconds: f32) -> usize {
    ((sample_rate as f32 * history_duration_seconds).ceil() as usize).max(1)
}

/// One fixed slot of the sensor pool.
pub struct ServerSensorView {
    sensor_id: SensorId,
    driver: Option<Box<dyn SensorDriver>>,
    packet_queue: Arc<PacketQueue<SensorPacket>>,

    hr_buffer: Option<RingBuffer<HeartRateFrame>>,
    ecg_buffer: Option<RingBuffer<EcgFrame>>,
    ppg_buffer: Option<RingBuffer<PpgFrame>>,
    ppi_buffer: Option<RingBuffer<PpiFrame>>,
    acc_buffer: Option<RingBuffer<AccFrame>>,
    eda_buffer: Option<RingBuffer<EdaFrame>>,
    hrv_buffers: [Option<RingBuffer<HrvFrame>>; HrvFilter::ALL.len()],

    rr_history: RingBuffer<f64>,
    active_filters: HrvFilters,

    last_valid_hr: u16,
    last_valid_hr_at: Option<Instant>,
    heart_rate_timeout: Duration,
}

impl ServerSensorView {
    pub fn new(sensor_id: SensorId, heart_rate_timeout: Duration) -> Self {
        ServerSensorView {
            sensor_id,
            driver: None,
            packet_queue: Arc::new(PacketQueue::new(SENSOR_PACKET_QUEUE_CAPACITY)),
            hr_buffer: None,
            ecg_buffer: None,
            ppg_buffer: None,
            ppi_buffer: None,
            acc_buffer: None,
            eda_buffer: None,
            hrv_buffers: Default::default(),
            rr_history: RingBuffer::new(1),
            active_filters: HrvFilters::empty(),
            last_valid_hr: 0,
            last_valid_hr_at: None,
            heart_rate_timeout,
        }
    }

    pub fn sensor_id(&self) -> SensorId {
        self.sensor_id
    }

    pub fn is_open(&self) -> bool {
        self.driver.as_ref().is_some_and(|driver| driver.is_open())
    }

    pub fn matches_entry(&self, entry: &PeripheralEntry) -> bool {
        self.driver
            .as_ref()
            .is_some_and(|driver| driver.matches_entry(entry))
    }

    pub fn set_heart_rate_timeout(&mut self, timeout: Duration) {
        self.heart_rate_timeout = timeout;
    }

    /// The queue the driver's notification thread feeds. Exposed for the
    /// benefit of tests that inject packets without a transport.
    #[cfg(test)]
    pub(crate) fn packet_queue(&self) -> Arc<PacketQueue<SensorPacket>> {
        Arc::clone(&self.packet_queue)
    }

    /// Bind a freshly constructed driver to this slot and open it. Ring
    /// buffers are sized from the driver's sample rates and history
    /// duration; HRV buffers are allocated when the device produces beat
    /// intervals.
    pub fn open(
        &mut self,
        mut driver: Box<dyn SensorDriver>,
        transport: &dyn BleTransport,
        config: &ConfigStore,
        entry: &PeripheralEntry,
    ) -> Result<()> {
        let listener = Arc::clone(&self.packet_queue) as Arc<dyn SensorListener>;
        driver.set_listener(listener);
        driver.open(transport, config, entry)?;

        let capabilities = driver.capabilities();
        let history_duration = driver.sample_history_duration();

        for capability in SensorCapability::ALL {
            if !capabilities.contains(capability.flag()) {
                continue;
            }
            let rate = driver.capability_sample_rate(capability);
            let capacity = samples_needed(rate, history_duration);
            match capability {
                SensorCapability::HeartRate => self.hr_buffer = Some(RingBuffer::new(capacity)),
                SensorCapability::Ecg => self.ecg_buffer = Some(RingBuffer::new(capacity)),
                SensorCapability::Ppg => self.ppg_buffer = Some(RingBuffer::new(capacity)),
                SensorCapability::Ppi => self.ppi_buffer = Some(RingBuffer::new(capacity)),
                SensorCapability::Acc => self.acc_buffer = Some(RingBuffer::new(capacity)),
                SensorCapability::Eda => self.eda_buffer = Some(RingBuffer::new(capacity)),
            }
        }

        // HRV statistics need a beat-interval source.
        if capabilities.intersects(SensorCaps::HEART_RATE | SensorCaps::PPI) {
            let hrv_capacity = driver.hrv_history_size().max(1);
            for slot in self.hrv_buffers.iter_mut() {
                *slot = Some(RingBuffer::new(hrv_capacity));
            }
            self.rr_history = RingBuffer::new(hrv_capacity);
        }

        self.driver = Some(driver);
        self.packet_queue.set_open(true);
        Ok(())
    }

    /// Close the slot: stop the driver, release the session and free every
    /// sample buffer. The packet queue persists (gated closed) so the slot
    /// can be reopened.
    pub fn close(&mut self) {
        self.packet_queue.set_open(false);

        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }

        self.hr_buffer = None;
        self.ecg_buffer = None;
        self.ppg_buffer = None;
        self.ppi_buffer = None;
        self.acc_buffer = None;
        self.eda_buffer = None;
        self.hrv_buffers = Default::default();
        self.rr_history.reset();
        self.active_filters = HrvFilters::empty();
        self.last_valid_hr = 0;
        self.last_valid_hr_at = None;
    }

    /// Select the active capability streams and HRV filters. The capability
    /// mask is forwarded to the driver; the filter mask only affects the
    /// per-packet derivation work on this slot.
    pub fn set_active_streams(&mut self, streams: SensorCaps, filters: HrvFilters) -> Result<()> {
        let driver = self.driver.as_mut().ok_or(Error::NotConnected)?;
        driver.set_active_streams(streams)?;
        self.active_filters = filters;
        Ok(())
    }

    pub fn active_streams(&self) -> SensorCaps {
        self.driver
            .as_ref()
            .map(|driver| driver.active_streams())
            .unwrap_or_default()
    }

    pub fn active_filters(&self) -> HrvFilters {
        self.active_filters
    }

    pub fn capabilities(&self) -> SensorCaps {
        self.driver
            .as_ref()
            .map(|driver| driver.capabilities())
            .unwrap_or_default()
    }

    pub fn capability_sample_rate(&self, capability: SensorCapability) -> Result<u32> {
        let driver = self.driver.as_ref().ok_or(Error::NotConnected)?;
        Ok(driver.capability_sample_rate(capability))
    }

    pub fn capability_bit_resolution(&self, capability: SensorCapability) -> Result<u32> {
        let driver = self.driver.as_ref().ok_or(Error::NotConnected)?;
        Ok(driver.capability_bit_resolution(capability))
    }

    /// Drain the packet queue in arrival order, route every packet to its
    /// ring history and update the enabled HRV filters for each new beat
    /// interval.
    pub fn process_packet_queue(&mut self) {
        while let Some(packet) = self.packet_queue.pop() {
            match packet {
                SensorPacket::HeartRate(frame) => {
                    if let Some(buffer) = &mut self.hr_buffer {
                        buffer.push(frame);
                    }
                    self.last_valid_hr = frame.beats_per_minute;
                    self.last_valid_hr_at = Some(Instant::now());
                    for rr in frame.intervals() {
                        self.push_beat_interval(*rr as f64, frame.time_in_seconds);
                    }
                }
                SensorPacket::Ecg(frame) => {
                    if let Some(buffer) = &mut self.ecg_buffer {
                        buffer.push(frame);
                    }
                }
                SensorPacket::Ppg(frame) => {
                    if let Some(buffer) = &mut self.ppg_buffer {
                        buffer.push(frame);
                    }
                }
                SensorPacket::Ppi(frame) => {
                    if let Some(buffer) = &mut self.ppi_buffer {
                        buffer.push(frame);
                    }
                    for sample in frame.samples() {
                        self.push_beat_interval(sample.pulse_duration as f64, frame.time_in_seconds);
                    }
                }
                SensorPacket::Acc(frame) => {
                    if let Some(buffer) = &mut self.acc_buffer {
                        buffer.push(frame);
                    }
                }
                SensorPacket::Eda(frame) => {
                    if let Some(buffer) = &mut self.eda_buffer {
                        buffer.push(frame);
                    }
                }
            }
        }
    }

    fn push_beat_interval(&mut self, rr_ms: f64, time_in_seconds: f64) {
        self.rr_history.push(rr_ms);

        if self.active_filters.is_empty() {
            return;
        }
        let window: Vec<f64> = self.rr_history.iter().copied().collect();

        for filter in HrvFilter::ALL {
            if !self.active_filters.contains(filter.flag()) {
                continue;
            }
            if let Some(buffer) = &mut self.hrv_buffers[filter.index()] {
                buffer.push(HrvFrame {
                    hrv_value: hrv::evaluate(filter, &window) as f32,
                    time_in_seconds,
                });
            }
        }
    }

    /// Most recent heart rate, or 0 when the last reading is older than the
    /// configured timeout.
    pub fn heart_rate_bpm(&self) -> u16 {
        match self.last_valid_hr_at {
            Some(at) if at.elapsed() <= self.heart_rate_timeout => self.last_valid_hr,
            _ => 0,
        }
    }

    /// Snapshot the ring history of a capability. `None` when the
    /// capability has no buffer on this slot.
    pub fn capability_buffer(&self, capability: SensorCapability) -> Option<BufferIterator> {
        match capability {
            SensorCapability::HeartRate => self
                .hr_buffer
                .as_ref()
                .map(|b| BufferIterator::heart_rate(b.iter().copied().collect())),
            SensorCapability::Ecg => self
                .ecg_buffer
                .as_ref()
                .map(|b| BufferIterator::ecg(b.iter().copied().collect())),
            SensorCapability::Ppg => self
                .ppg_buffer
                .as_ref()
                .map(|b| BufferIterator::ppg(b.iter().copied().collect())),
            SensorCapability::Ppi => self
                .ppi_buffer
                .as_ref()
                .map(|b| BufferIterator::ppi(b.iter().copied().collect())),
            SensorCapability::Acc => self
                .acc_buffer
                .as_ref()
                .map(|b| BufferIterator::acc(b.iter().copied().collect())),
            SensorCapability::Eda => self
                .eda_buffer
                .as_ref()
                .map(|b| BufferIterator::eda(b.iter().copied().collect())),
        }
    }

    /// Capacity of the capability's ring history, when allocated.
    pub fn capability_buffer_capacity(&self, capability: SensorCapability) -> Option<usize> {
        match capability {
            SensorCapability::HeartRate => self.hr_buffer.as_ref().map(|b| b.capacity()),
            SensorCapability::Ecg => self.ecg_buffer.as_ref().map(|b| b.capacity()),
            SensorCapability::Ppg => self.ppg_buffer.as_ref().map(|b| b.capacity()),
            SensorCapability::Ppi => self.ppi_buffer.as_ref().map(|b| b.capacity()),
            SensorCapability::Acc => self.acc_buffer.as_ref().map(|b| b.capacity()),
            SensorCapability::Eda => self.eda_buffer.as_ref().map(|b| b.capacity()),
        }
    }

    /// Snapshot the derived buffer of one HRV filter.
    pub fn hrv_buffer(&self, filter: HrvFilter) -> Option<BufferIterator> {
        self.hrv_buffers[filter.index()]
            .as_ref()
            .map(|b| BufferIterator::hrv(b.iter().copied().collect()))
    }

    /// Fill a sensor pool entry for the client list.
    pub fn sensor_info(&self) -> SensorInfo {
        let mut info = SensorInfo {
            sensor_id: self.sensor_id,
            ..SensorInfo::default()
        };

        if let Some(driver) = self.driver.as_ref() {
            info.capabilities = driver.capabilities();
            info.friendly_name = driver.friendly_name().to_string();
            info.device_path = driver.device_path().to_string();
            info.device_information = driver.device_information().clone();
            info.active_streams = driver.active_streams();
            info.active_filters = self.active_filters;
            info.beats_per_minute = self.heart_rate_bpm();
        } else {
            warn!("sensor_info on disconnected slot {}", self.sensor_id);
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ContactStatus, PpiSample};
    use crate::transport::mock::MockTransport;
    use tempdir::TempDir;

    /// Driver stub with fixed capabilities and rates, no transport I/O.
    struct StubDriver {
        open: bool,
        capabilities: SensorCaps,
        active: SensorCaps,
        sample_rate: u32,
        history_duration: f32,
        hrv_history: usize,
        info: crate::api::DeviceInformation,
    }

    impl StubDriver {
        fn boxed(capabilities: SensorCaps, sample_rate: u32, hrv_history: usize) -> Box<Self> {
            Box::new(StubDriver {
                open: false,
                capabilities,
                active: SensorCaps::empty(),
                sample_rate,
                history_duration: 1.0,
                hrv_history,
                info: Default::default(),
            })
        }
    }

    impl SensorDriver for StubDriver {
        fn open(
            &mut self,
            _transport: &dyn BleTransport,
            _config: &ConfigStore,
            _entry: &PeripheralEntry,
        ) -> Result<()> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }

        fn matches_entry(&self, entry: &PeripheralEntry) -> bool {
            entry.path == "stub"
        }

        fn friendly_name(&self) -> &str {
            "Stub Sensor"
        }

        fn device_path(&self) -> &str {
            "stub"
        }

        fn bluetooth_address(&self) -> String {
            "00:00:00:00:00:00".into()
        }

        fn device_information(&self) -> &crate::api::DeviceInformation {
            &self.info
        }

        fn capabilities(&self) -> SensorCaps {
            self.capabilities
        }

        fn set_active_streams(&mut self, streams: SensorCaps) -> Result<()> {
            self.active = streams & self.capabilities;
            Ok(())
        }

        fn active_streams(&self) -> SensorCaps {
            self.active
        }

        fn capability_sample_rate(&self, _capability: SensorCapability) -> u32 {
            self.sample_rate
        }

        fn capability_bit_resolution(&self, _capability: SensorCapability) -> u32 {
            16
        }

        fn available_sample_rates(&self, _capability: SensorCapability) -> &[u32] {
            &[]
        }

        fn set_capability_sample_rate(&mut self, _capability: SensorCapability, _rate: u32) {}

        fn sample_history_duration(&self) -> f32 {
            self.history_duration
        }

        fn set_sample_history_duration(&mut self, seconds: f32) {
            self.history_duration = seconds;
        }

        fn hrv_history_size(&self) -> usize {
            self.hrv_history
        }

        fn set_hrv_history_size(&mut self, samples: usize) {
            self.hrv_history = samples;
        }

        fn set_listener(&mut self, _listener: Arc<dyn SensorListener>) {}
    }

    fn open_stub_view(capabilities: SensorCaps, sample_rate: u32, hrv_history: usize) -> ServerSensorView {
        let mut view = ServerSensorView::new(0, Duration::from_millis(3000));
        let transport = MockTransport::new();
        let dir = TempDir::new("pulseplug-view").unwrap();
        let store = ConfigStore::new(dir.path());
        let entry = PeripheralEntry {
            path: "stub".into(),
            ..Default::default()
        };
        view.open(
            StubDriver::boxed(capabilities, sample_rate, hrv_history),
            &transport,
            &store,
            &entry,
        )
        .unwrap();
        view
    }

    fn hr_frame(bpm: u16, rr: &[u16], t: f64) -> SensorPacket {
        let mut frame = HeartRateFrame {
            contact_status: ContactStatus::Contact,
            beats_per_minute: bpm,
            time_in_seconds: t,
            ..Default::default()
        };
        for (i, value) in rr.iter().enumerate() {
            frame.rr_intervals[i] = *value;
        }
        frame.rr_interval_count = rr.len() as u16;
        SensorPacket::HeartRate(frame)
    }

    #[test]
    fn buffers_are_sized_from_rate_and_duration() {
        let view = open_stub_view(SensorCaps::HEART_RATE | SensorCaps::ECG, 130, 10);
        assert_eq!(
            view.capability_buffer_capacity(SensorCapability::Ecg),
            Some(130)
        );
        assert_eq!(
            view.capability_buffer_capacity(SensorCapability::HeartRate),
            Some(130)
        );
        // No buffer for capabilities the device lacks.
        assert_eq!(view.capability_buffer_capacity(SensorCapability::Eda), None);
        assert!(view.capability_buffer(SensorCapability::Eda).is_none());
    }

    #[test]
    fn zero_rate_still_allocates_one_slot() {
        let view = open_stub_view(SensorCaps::EDA, 0, 10);
        assert_eq!(view.capability_buffer_capacity(SensorCapability::Eda), Some(1));
    }

    #[test]
    fn packets_route_to_their_ring_buffers() {
        let mut view = open_stub_view(SensorCaps::HEART_RATE | SensorCaps::ECG, 10, 10);
        let queue = view.packet_queue();

        queue.push(hr_frame(72, &[], 0.1));
        queue.push(SensorPacket::Ecg(EcgFrame {
            ecg_value_count: 1,
            time_in_seconds: 0.2,
            ..Default::default()
        }));
        view.process_packet_queue();

        let hr = view.capability_buffer(SensorCapability::HeartRate).unwrap();
        assert_eq!(hr.len(), 1);
        assert_eq!(hr.hr_data().unwrap().beats_per_minute, 72);
        let ecg = view.capability_buffer(SensorCapability::Ecg).unwrap();
        assert_eq!(ecg.len(), 1);

        assert_eq!(view.heart_rate_bpm(), 72);
    }

    #[test]
    fn hrv_filters_update_per_beat_interval() {
        let mut view = open_stub_view(SensorCaps::HEART_RATE, 10, 5);
        view.set_active_streams(SensorCaps::HEART_RATE, HrvFilters::SDNN | HrvFilters::NN20)
            .unwrap();

        let queue = view.packet_queue();
        queue.push(hr_frame(75, &[800, 810, 790, 820, 780], 1.0));
        view.process_packet_queue();

        let sdnn = view.hrv_buffer(HrvFilter::Sdnn).unwrap();
        assert_eq!(sdnn.len(), 5);
        let mut iter = sdnn;
        let mut last = 0.0f32;
        while iter.is_valid() {
            last = iter.hrv_data().unwrap().hrv_value;
            iter.next();
        }
        assert!((last - 14.142).abs() < 0.01);

        let nn20 = view.hrv_buffer(HrvFilter::Nn20).unwrap();
        assert_eq!(nn20.len(), 5);

        // Filters that were not enabled stay empty.
        assert_eq!(view.hrv_buffer(HrvFilter::Rmssd).unwrap().len(), 0);
    }

    #[test]
    fn hrv_history_is_bounded() {
        let mut view = open_stub_view(SensorCaps::HEART_RATE, 10, 4);
        view.set_active_streams(SensorCaps::HEART_RATE, HrvFilters::SDNN)
            .unwrap();

        let queue = view.packet_queue();
        for i in 0..10u16 {
            queue.push(hr_frame(70, &[800 + i], i as f64));
        }
        view.process_packet_queue();

        let sdnn = view.hrv_buffer(HrvFilter::Sdnn).unwrap();
        assert_eq!(sdnn.len(), 4);
    }

    #[test]
    fn ppi_pulse_durations_feed_hrv() {
        let mut view = open_stub_view(SensorCaps::PPI, 10, 5);
        view.set_active_streams(SensorCaps::PPI, HrvFilters::RMSSD)
            .unwrap();

        let mut frame = PpiFrame {
            time_in_seconds: 0.5,
            ..Default::default()
        };
        frame.ppi_samples[0] = PpiSample {
            pulse_duration: 800,
            ..Default::default()
        };
        frame.ppi_samples[1] = PpiSample {
            pulse_duration: 830,
            ..Default::default()
        };
        frame.ppi_sample_count = 2;

        let queue = view.packet_queue();
        queue.push(SensorPacket::Ppi(frame));
        view.process_packet_queue();

        let rmssd = view.hrv_buffer(HrvFilter::Rmssd).unwrap();
        assert_eq!(rmssd.len(), 2);
        let mut iter = rmssd;
        iter.next();
        assert!((iter.hrv_data().unwrap().hrv_value - 30.0).abs() < 1e-3);
    }

    #[test]
    fn heart_rate_times_out_to_zero() {
        let mut view = open_stub_view(SensorCaps::HEART_RATE, 10, 5);
        view.set_heart_rate_timeout(Duration::ZERO);

        let queue = view.packet_queue();
        queue.push(hr_frame(64, &[], 0.0));
        view.process_packet_queue();

        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(view.heart_rate_bpm(), 0);
    }

    #[test]
    fn close_frees_buffers_and_gates_the_queue() {
        let mut view = open_stub_view(SensorCaps::HEART_RATE, 10, 5);
        let queue = view.packet_queue();
        assert!(queue.is_open());

        view.close();
        assert!(!view.is_open());
        assert!(!queue.is_open());
        assert!(view.capability_buffer(SensorCapability::HeartRate).is_none());
        assert!(view.hrv_buffer(HrvFilter::Sdnn).is_none());

        // Packets arriving while closed are discarded.
        assert!(!queue.push(hr_frame(70, &[], 0.0)));
    }
}
