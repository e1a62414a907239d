// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! pulseplug is a host-side service library for wearable biometric sensors
//! that speak Bluetooth Low Energy. It discovers peripherals through a
//! pluggable transport adapter, drives the vendor stream protocols (Polar
//! PMD, Adafruit GSR), decodes the framed telemetry into normalized frames
//! (heart rate, ECG, PPG, pulse-to-pulse intervals, accelerometer,
//! electrodermal activity) and buffers them in bounded ring histories that
//! in-process clients read through snapshot iterators. Heart-rate
//! variability statistics are derived on top of the beat-interval streams.
//!
//! The service runs as a cooperative tick: the host calls
//! [`Service::update`](service::Service::update) once per frame, and all
//! buffer and slot state is owned by that thread. Transport notification
//! threads only enqueue into per-sensor lock-free packet queues.
//!
//! ```no_run
//! use pulseplug::service::{Service, ServiceSettings};
//! use pulseplug::transport::mock::MockTransport;
//! use std::sync::Arc;
//!
//! # fn main() -> pulseplug::Result<()> {
//! let settings = ServiceSettings::new(Arc::new(MockTransport::new()), "/tmp/pulseplug");
//! let mut service = Service::initialize(settings)?;
//! service.update();
//! for sensor in service.sensor_list().sensors {
//!     println!("{}: {:?}", sensor.sensor_id, sensor.capabilities);
//! }
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod api;
pub mod buffer;
pub mod config;
pub mod hotplug;
pub mod hrv;
pub mod sensors;
pub mod service;
pub mod transport;

use api::{ParseBDAddrError, SensorId};
use static_assertions::const_assert;

/// Width of the sensor slot pool. Sensor ids handed out by the service are
/// always in `0..MAX_SENSOR_COUNT` and identify a slot, not a peripheral.
pub const MAX_SENSOR_COUNT: usize = 5;
const_assert!(MAX_SENSOR_COUNT >= 1);

/// The main error type returned by most operations in this library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device not found")]
    DeviceNotFound,

    #[error("Device is already open")]
    AlreadyOpen,

    #[error("Not connected")]
    NotConnected,

    #[error("No such characteristic")]
    NoSuchCharacteristic,

    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Invalid sensor id {0}")]
    InvalidSensorId(SensorId),

    #[error("No data available")]
    NoData,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Error parsing UUID: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Invalid Bluetooth address: {0}")]
    InvalidBDAddr(#[from] ParseBDAddrError),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Convenience type for functions returning [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The version string reported by the service facade.
pub fn service_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
