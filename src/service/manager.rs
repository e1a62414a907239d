// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The sensor device manager: a fixed-width pool of sensor slots kept
//! coherent with the transport's enumeration over time.
//!
//! Reconciliation runs on the service tick, either on a timer or when a
//! hot-plug edge marks the pool dirty. Slots are matched to peripherals by
//! stable device path; a reconnected peripheral may land in a different
//! slot than it previously occupied, but slot ids themselves never move.

use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::{BDAddr, SensorId, SensorList};
use crate::config::ConfigStore;
use crate::hotplug::{DeviceClass, HotplugHub, HotplugListener};
use crate::sensors::SensorFactoryRegistry;
use crate::service::view::ServerSensorView;
use crate::transport::{BleTransport, PeripheralEntry};
use crate::{Error, Result, MAX_SENSOR_COUNT};

/// Persistent device-manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceManagerConfig {
    pub version: u32,
    /// Rediscovery interval in milliseconds when polling.
    pub sensor_reconnect_interval: u32,
    /// Tick pacing hint for hosts that drive `update` from a timer loop,
    /// in milliseconds.
    pub sensor_poll_interval: u32,
    /// Whether to use the platform hot-plug API instead of interval polling.
    pub platform_api_enabled: bool,
}

impl DeviceManagerConfig {
    pub const CONFIG_VERSION: u32 = 1;
    pub const NAME: &'static str = "device_manager";
}

impl Default for DeviceManagerConfig {
    fn default() -> Self {
        DeviceManagerConfig {
            version: Self::CONFIG_VERSION,
            sensor_reconnect_interval: 1000,
            sensor_poll_interval: 2,
            platform_api_enabled: true,
        }
    }
}

/// Persistent sensor-manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorManagerConfig {
    pub version: u32,
    /// A heart-rate reading older than this reports as 0.
    pub heart_rate_timeout_milliseconds: u32,
}

impl SensorManagerConfig {
    pub const CONFIG_VERSION: u32 = 1;
    pub const NAME: &'static str = "sensor_manager";
}

impl Default for SensorManagerConfig {
    fn default() -> Self {
        SensorManagerConfig {
            version: Self::CONFIG_VERSION,
            heart_rate_timeout_milliseconds: 3000,
        }
    }
}

/// Hot-plug edges only mark the pool dirty; the next tick reconciles.
struct DirtyFlag(Arc<AtomicBool>);

impl HotplugListener for DirtyFlag {
    fn device_connected(&self, _class: DeviceClass, _path: &str) {
        self.0.store(true, Ordering::Release);
    }

    fn device_disconnected(&self, _class: DeviceClass, _path: &str) {
        self.0.store(true, Ordering::Release);
    }
}

/// Owns the slot pool and the reconnection loop.
pub struct SensorManager {
    transport: Arc<dyn BleTransport>,
    config_store: ConfigStore,
    registry: SensorFactoryRegistry,
    views: Vec<ServerSensorView>,
    device_config: DeviceManagerConfig,
    dirty: Arc<AtomicBool>,
    hotplug_driven: bool,
    last_reconcile: Option<Instant>,
    host_address: BDAddr,
}

impl SensorManager {
    /// Load configuration, allocate the slot pool and wire hot-plug
    /// signalling. The first tick after startup always reconciles.
    pub fn startup(
        transport: Arc<dyn BleTransport>,
        config_store: ConfigStore,
        hotplug: &Arc<HotplugHub>,
    ) -> Result<Self> {
        let device_config: DeviceManagerConfig = config_store
            .load(DeviceManagerConfig::NAME, DeviceManagerConfig::CONFIG_VERSION)
            .unwrap_or_default();
        let sensor_config: SensorManagerConfig = config_store
            .load(SensorManagerConfig::NAME, SensorManagerConfig::CONFIG_VERSION)
            .unwrap_or_default();

        // Write the documents back so new defaults land on disk.
        config_store.save(DeviceManagerConfig::NAME, &device_config)?;
        config_store.save(SensorManagerConfig::NAME, &sensor_config)?;

        let heart_rate_timeout =
            Duration::from_millis(sensor_config.heart_rate_timeout_milliseconds as u64);
        let views = (0..MAX_SENSOR_COUNT)
            .map(|sensor_id| ServerSensorView::new(sensor_id, heart_rate_timeout))
            .collect();

        let dirty = Arc::new(AtomicBool::new(true));
        let mut hotplug_driven = false;
        if device_config.platform_api_enabled {
            hotplug.register(DeviceClass::Ble, Arc::new(DirtyFlag(Arc::clone(&dirty))));
            hotplug_driven = transport.set_hotplug_sink(Arc::clone(hotplug));
            if hotplug_driven {
                info!("Platform hotplug API is ENABLED");
            } else {
                info!("Transport has no hotplug source, falling back to interval polling");
            }
        } else {
            info!("Platform hotplug API is DISABLED");
        }

        let host_address = transport.host_address();

        Ok(SensorManager {
            transport,
            config_store,
            registry: SensorFactoryRegistry::with_builtin_drivers(),
            views,
            device_config,
            dirty,
            hotplug_driven,
            last_reconcile: None,
            host_address,
        })
    }

    /// Close every open slot. Called from service shutdown.
    pub fn shutdown(&mut self) {
        for view in self.views.iter_mut() {
            if view.is_open() {
                view.close();
            }
        }
    }

    /// Reconcile the slot pool with a fresh enumeration when the pool is
    /// dirty or the reconnect interval elapsed. Returns whether the set of
    /// running sensors changed.
    pub fn poll_connected_devices(&mut self) -> bool {
        if !self.hotplug_driven {
            let interval =
                Duration::from_millis(self.device_config.sensor_reconnect_interval as u64);
            let due = match self.last_reconcile {
                None => true,
                Some(last) => last.elapsed() >= interval,
            };
            if due {
                self.dirty.store(true, Ordering::Release);
            }
        }

        if !self.dirty.swap(false, Ordering::AcqRel) {
            return false;
        }

        let changed = self.update_connected_devices();
        self.last_reconcile = Some(Instant::now());
        changed
    }

    fn update_connected_devices(&mut self) -> bool {
        let entries: Vec<PeripheralEntry> = match self.transport.enumerate() {
            Ok(enumeration) => enumeration.collect(),
            Err(err) => {
                warn!("Enumeration failed: {}", err);
                return false;
            }
        };

        let mut seen = [false; MAX_SENSOR_COUNT];
        let mut changed = false;

        for entry in entries {
            // Existing device case (most common).
            if let Some(slot) = self
                .views
                .iter()
                .position(|view| view.is_open() && view.matches_entry(&entry))
            {
                seen[slot] = true;
                continue;
            }

            let Some(slot) = self.views.iter().position(|view| !view.is_open()) else {
                error!("Can't connect any more new devices. Too many open devices.");
                break;
            };

            let Some(factory) = self.registry.factory_for(&entry.friendly_name) else {
                trace!("No driver for {}, ignoring", entry);
                continue;
            };

            if let Err(err) = self.transport.query_can_open(&entry) {
                debug!("Skipping {}: {}", entry, err);
                continue;
            }

            match self.views[slot].open(factory(), &*self.transport, &self.config_store, &entry) {
                Ok(()) => {
                    info!("Device slot {} ({}) opened", slot, entry.friendly_name);
                    seen[slot] = true;
                    changed = true;
                }
                Err(err) => {
                    error!("Device slot {} ({}) failed to open: {}", slot, entry.path, err);
                }
            }
        }

        // Close any open slot that no longer shows up in the enumerator.
        for (slot, view) in self.views.iter_mut().enumerate() {
            if view.is_open() && !seen[slot] {
                warn!("Closing device {} since it's no longer in the device list", slot);
                view.close();
                changed = true;
            }
        }

        changed
    }

    /// Drain every open slot's packet queue.
    pub fn process_packet_queues(&mut self) {
        for view in self.views.iter_mut() {
            if view.is_open() {
                view.process_packet_queue();
            }
        }
    }

    pub fn view(&self, sensor_id: SensorId) -> Result<&ServerSensorView> {
        self.views
            .get(sensor_id)
            .ok_or(Error::InvalidSensorId(sensor_id))
    }

    pub fn view_mut(&mut self, sensor_id: SensorId) -> Result<&mut ServerSensorView> {
        self.views
            .get_mut(sensor_id)
            .ok_or(Error::InvalidSensorId(sensor_id))
    }

    /// Snapshot of the running slots.
    pub fn sensor_list(&self) -> SensorList {
        SensorList {
            host_serial: self.host_address.to_string(),
            sensors: self
                .views
                .iter()
                .filter(|view| view.is_open())
                .map(|view| view.sensor_info())
                .collect(),
        }
    }
}
