// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Device arrival/removal signalling.
//!
//! Transports that can observe hot-plug events feed them into a
//! [`HotplugHub`]; listeners register per device class. Listeners only flag
//! state (the device manager marks itself dirty and reconciles on the next
//! tick) — nothing is opened or closed from the hot-plug path itself. When a
//! transport has no hot-plug source the manager falls back to interval
//! polling.

use log::trace;
use std::sync::Mutex;
use std::sync::Arc;

/// Hardware class of a hot-plugged device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Ble,
}

/// Receives hot-plug edges for a registered device class.
pub trait HotplugListener: Send + Sync {
    fn device_connected(&self, class: DeviceClass, path: &str);
    fn device_disconnected(&self, class: DeviceClass, path: &str);
}

/// Dispatches hot-plug events to listeners by device class.
#[derive(Default)]
pub struct HotplugHub {
    listeners: Mutex<Vec<(DeviceClass, Arc<dyn HotplugListener>)>>,
}

impl HotplugHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, class: DeviceClass, listener: Arc<dyn HotplugListener>) {
        self.listeners.lock().unwrap().push((class, listener));
    }

    pub fn device_connected(&self, class: DeviceClass, path: &str) {
        trace!("hotplug: {:?} connected at {}", class, path);
        for (listener_class, listener) in self.listeners.lock().unwrap().iter() {
            if *listener_class == class {
                listener.device_connected(class, path);
            }
        }
    }

    pub fn device_disconnected(&self, class: DeviceClass, path: &str) {
        trace!("hotplug: {:?} disconnected at {}", class, path);
        for (listener_class, listener) in self.listeners.lock().unwrap().iter() {
            if *listener_class == class {
                listener.device_disconnected(class, path);
            }
        }
    }
}
