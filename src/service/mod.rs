// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The service facade.
//!
//! A [`Service`] owns the whole sensor stack: the transport, the device
//! manager with its slot pool, and the event queue to the single in-process
//! listener. The host drives it cooperatively — one call to
//! [`Service::update`] per frame performs hot-plug reconciliation, drains
//! every packet queue and dispatches pending events on the calling thread.

pub mod manager;
pub mod view;

use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api::{
    BufferIterator, HrvFilter, HrvFilters, SensorCapability, SensorCaps, SensorId, SensorList,
};
use crate::config::ConfigStore;
use crate::hotplug::HotplugHub;
use crate::service::manager::SensorManager;
use crate::transport::BleTransport;
use crate::{Error, Result};

/// Events delivered to the service listener from within [`Service::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    /// The set of running sensors changed: a sensor appeared, disappeared
    /// or was reopened. Re-query [`Service::sensor_list`].
    SensorListUpdated,
}

/// The single in-process consumer of service events.
pub trait ServiceListener: Send {
    fn handle_event(&mut self, event: &ServiceEvent);
}

/// Construction parameters for [`Service::initialize`].
pub struct ServiceSettings {
    pub transport: Arc<dyn BleTransport>,
    /// Directory holding the configuration documents.
    pub config_root: PathBuf,
    /// Optional cap applied to the global log level.
    pub log_level: Option<log::LevelFilter>,
}

impl ServiceSettings {
    pub fn new(transport: Arc<dyn BleTransport>, config_root: impl Into<PathBuf>) -> Self {
        ServiceSettings {
            transport,
            config_root: config_root.into(),
            log_level: None,
        }
    }

    pub fn with_log_level(mut self, level: log::LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }
}

/// Process-wide sensor service. Construct one with
/// [`initialize`](Service::initialize); dropping it shuts everything down.
pub struct Service {
    manager: SensorManager,
    #[allow(dead_code)]
    hotplug: Arc<HotplugHub>,
    listener: Option<Box<dyn ServiceListener>>,
    initialized: bool,
}

impl Service {
    /// Start the transport plumbing, the device manager and the request
    /// surface. Fails only when the configuration store or the transport is
    /// unusable; sensors come and go later via [`update`](Service::update).
    pub fn initialize(settings: ServiceSettings) -> Result<Service> {
        if let Some(level) = settings.log_level {
            log::set_max_level(level);
        }
        info!("Starting pulseplug service v{}", crate::service_version());

        let config_store = ConfigStore::new(settings.config_root);
        let hotplug = Arc::new(HotplugHub::new());
        let manager = SensorManager::startup(settings.transport, config_store, &hotplug)?;

        Ok(Service {
            manager,
            hotplug,
            listener: None,
            initialized: true,
        })
    }

    /// Register the in-process event listener. Events are delivered from
    /// within [`update`](Service::update) on the calling thread.
    pub fn set_listener(&mut self, listener: Box<dyn ServiceListener>) {
        self.listener = Some(listener);
    }

    /// One service tick: reconcile the sensor pool against the current
    /// enumeration, drain every packet queue, then dispatch events.
    pub fn update(&mut self) {
        if !self.initialized {
            return;
        }

        let list_changed = self.manager.poll_connected_devices();
        self.manager.process_packet_queues();

        if list_changed {
            self.dispatch(ServiceEvent::SensorListUpdated);
        }
    }

    fn dispatch(&mut self, event: ServiceEvent) {
        if let Some(listener) = self.listener.as_mut() {
            listener.handle_event(&event);
        }
    }

    /// Stop the stack in reverse startup order. Idempotent; also runs on
    /// drop.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        info!("Shutting down pulseplug service");
        self.manager.shutdown();
        self.initialized = false;
    }

    /// The crate version, which doubles as the service version string.
    pub fn version(&self) -> &'static str {
        crate::service_version()
    }

    /// Snapshot of all running sensors.
    pub fn sensor_list(&self) -> SensorList {
        self.manager.sensor_list()
    }

    /// Select the active capability streams and HRV filters of a sensor.
    pub fn set_active_sensor_data_streams(
        &mut self,
        sensor_id: SensorId,
        streams: SensorCaps,
        filters: HrvFilters,
    ) -> Result<()> {
        self.manager
            .view_mut(sensor_id)?
            .set_active_streams(streams, filters)
    }

    /// Stop every stream and filter of a sensor.
    pub fn stop_all_sensor_streams(&mut self, sensor_id: SensorId) -> Result<()> {
        self.set_active_sensor_data_streams(sensor_id, SensorCaps::empty(), HrvFilters::empty())
    }

    /// Snapshot iterator over one capability's ring history.
    pub fn capability_buffer(
        &self,
        sensor_id: SensorId,
        capability: SensorCapability,
    ) -> Result<BufferIterator> {
        self.manager
            .view(sensor_id)?
            .capability_buffer(capability)
            .ok_or(Error::NoData)
    }

    /// Snapshot iterator over one HRV filter's derived buffer.
    pub fn heart_hrv_buffer(
        &self,
        sensor_id: SensorId,
        filter: HrvFilter,
    ) -> Result<BufferIterator> {
        self.manager
            .view(sensor_id)?
            .hrv_buffer(filter)
            .ok_or(Error::NoData)
    }

    pub fn capability_sampling_rate(
        &self,
        sensor_id: SensorId,
        capability: SensorCapability,
    ) -> Result<u32> {
        self.manager.view(sensor_id)?.capability_sample_rate(capability)
    }

    pub fn capability_bit_resolution(
        &self,
        sensor_id: SensorId,
        capability: SensorCapability,
    ) -> Result<u32> {
        self.manager
            .view(sensor_id)?
            .capability_bit_resolution(capability)
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}
