// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! In-memory transport backend.
//!
//! `MockTransport` implements [`BleTransport`] over a table of programmable
//! peripherals: tests and the demo client build GATT trees, script
//! characteristic values and write responders, and inject notifications from
//! any thread. Exclusive-open, hot-plug signalling and the
//! subscribe/unsubscribe contract behave like a real backend so the service
//! stack above cannot tell the difference.

use dashmap::DashMap;
use log::trace;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::api::bleuuid::uuid_from_u16;
use crate::api::BDAddr;
use crate::hotplug::{DeviceClass, HotplugHub};
use crate::transport::{
    BleTransport, CharPropFlags, DeviceSession, GattCharacteristic, GattDescriptor, GattProfile,
    GattService, NotificationHandler, PeripheralEntry, SubscriptionKind, SubscriptionToken,
    WriteType,
};
use crate::{Error, Result};

/// Client Characteristic Configuration descriptor.
const CCC_DESCRIPTOR: Uuid = uuid_from_u16(0x2902);

type WriteResponder = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// One recorded characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub characteristic: Uuid,
    pub data: Vec<u8>,
    pub write_type: WriteType,
}

struct Subscription {
    characteristic: Uuid,
    #[allow(dead_code)]
    kind: SubscriptionKind,
    handler: NotificationHandler,
}

struct PeripheralState {
    entry: PeripheralEntry,
    profile: GattProfile,
    values: DashMap<Uuid, Vec<u8>>,
    descriptor_values: DashMap<(Uuid, Uuid), Vec<u8>>,
    responders: Mutex<HashMap<Uuid, WriteResponder>>,
    writes: Mutex<Vec<WriteRecord>>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_token: AtomicU64,
    session_open: AtomicBool,
    connected: AtomicBool,
    open_error: Mutex<Option<String>>,
}

impl PeripheralState {
    fn require_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn require_characteristic(&self, characteristic: &GattCharacteristic) -> Result<()> {
        self.profile
            .find_characteristic(characteristic.service_uuid, characteristic.uuid)
            .map(|_| ())
            .ok_or(Error::NoSuchCharacteristic)
    }
}

/// Handle to one programmable peripheral of a [`MockTransport`].
#[derive(Clone)]
pub struct MockPeripheral {
    state: Arc<PeripheralState>,
}

impl MockPeripheral {
    pub fn entry(&self) -> PeripheralEntry {
        self.state.entry.clone()
    }

    /// Set the value returned by reads of the characteristic.
    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.state.values.insert(characteristic, value);
    }

    /// Script a responder: every write to the characteristic computes a new
    /// value that subsequent reads observe, the way a control point exposes
    /// its response.
    pub fn set_write_responder(
        &self,
        characteristic: Uuid,
        responder: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    ) {
        self.state
            .responders
            .lock()
            .unwrap()
            .insert(characteristic, Box::new(responder));
    }

    /// All writes recorded against the characteristic, in order.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<WriteRecord> {
        self.state
            .writes
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.characteristic == characteristic)
            .cloned()
            .collect()
    }

    /// Push a notification payload to every subscriber of the
    /// characteristic, on the calling thread.
    pub fn notify(&self, characteristic: Uuid, data: &[u8]) {
        let subscriptions = self.state.subscriptions.lock().unwrap();
        for subscription in subscriptions.values() {
            if subscription.characteristic == characteristic {
                (subscription.handler)(data);
            }
        }
    }

    pub fn subscriber_count(&self, characteristic: Uuid) -> usize {
        self.state
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.characteristic == characteristic)
            .count()
    }

    pub fn is_session_open(&self) -> bool {
        self.state.session_open.load(Ordering::Acquire)
    }

    /// Make the next `open` fail with a transport error.
    pub fn fail_next_open(&self, reason: &str) {
        *self.state.open_error.lock().unwrap() = Some(reason.to_string());
    }
}

struct Shared {
    peripherals: DashMap<String, Arc<PeripheralState>>,
    hotplug: Mutex<Option<Arc<HotplugHub>>>,
    host_address: BDAddr,
}

/// In-memory [`BleTransport`] implementation.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            shared: Arc::new(Shared {
                peripherals: DashMap::new(),
                hotplug: Mutex::new(None),
                host_address: BDAddr::from([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]),
            }),
        }
    }

    /// Register a peripheral and signal its arrival to the hot-plug sink.
    pub fn add_peripheral(&self, entry: PeripheralEntry, profile: GattProfile) -> MockPeripheral {
        let state = Arc::new(PeripheralState {
            entry: entry.clone(),
            profile,
            values: DashMap::new(),
            descriptor_values: DashMap::new(),
            responders: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            session_open: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            open_error: Mutex::new(None),
        });
        self.shared
            .peripherals
            .insert(entry.path.clone(), Arc::clone(&state));

        if let Some(hub) = self.shared.hotplug.lock().unwrap().as_ref() {
            hub.device_connected(DeviceClass::Ble, &entry.path);
        }

        MockPeripheral { state }
    }

    /// Drop a peripheral from the enumeration and signal its removal. Any
    /// open session on it starts failing with `NotConnected`.
    pub fn remove_peripheral(&self, path: &str) {
        if let Some((_, state)) = self.shared.peripherals.remove(path) {
            state.connected.store(false, Ordering::Release);
            state.session_open.store(false, Ordering::Release);
            state.subscriptions.lock().unwrap().clear();

            if let Some(hub) = self.shared.hotplug.lock().unwrap().as_ref() {
                hub.device_disconnected(DeviceClass::Ble, path);
            }
        }
    }

    fn peripheral(&self, path: &str) -> Result<Arc<PeripheralState>> {
        self.shared
            .peripherals
            .get(path)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(Error::DeviceNotFound)
    }
}

impl BleTransport for MockTransport {
    fn enumerate(&self) -> Result<Box<dyn Iterator<Item = PeripheralEntry> + Send + '_>> {
        let mut entries: Vec<PeripheralEntry> = self
            .shared
            .peripherals
            .iter()
            .map(|state| state.value().entry.clone())
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Box::new(entries.into_iter()))
    }

    fn query_can_open(&self, entry: &PeripheralEntry) -> Result<()> {
        let state = self.peripheral(&entry.path)?;
        if state.session_open.load(Ordering::Acquire) {
            return Err(Error::AlreadyOpen);
        }
        Ok(())
    }

    fn open(&self, entry: &PeripheralEntry) -> Result<Box<dyn DeviceSession>> {
        let state = self.peripheral(&entry.path)?;

        if let Some(reason) = state.open_error.lock().unwrap().take() {
            return Err(Error::Transport(reason));
        }

        if state
            .session_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyOpen);
        }

        trace!("mock: opened session on {}", entry.path);
        Ok(Box::new(MockSession { state }))
    }

    fn set_hotplug_sink(&self, sink: Arc<HotplugHub>) -> bool {
        *self.shared.hotplug.lock().unwrap() = Some(sink);
        true
    }

    fn host_address(&self) -> BDAddr {
        self.shared.host_address
    }
}

struct MockSession {
    state: Arc<PeripheralState>,
}

impl DeviceSession for MockSession {
    fn profile(&self) -> &GattProfile {
        &self.state.profile
    }

    fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>> {
        self.state.require_connected()?;
        self.state.require_characteristic(characteristic)?;
        Ok(self
            .state
            .values
            .get(&characteristic.uuid)
            .map(|value| value.clone())
            .unwrap_or_default())
    }

    fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        self.state.require_connected()?;
        self.state.require_characteristic(characteristic)?;

        self.state.writes.lock().unwrap().push(WriteRecord {
            characteristic: characteristic.uuid,
            data: data.to_vec(),
            write_type,
        });

        if let Some(responder) = self
            .state
            .responders
            .lock()
            .unwrap()
            .get(&characteristic.uuid)
        {
            let response = responder(data);
            self.state.values.insert(characteristic.uuid, response);
        }

        Ok(())
    }

    fn read_descriptor(&self, descriptor: &GattDescriptor) -> Result<Vec<u8>> {
        self.state.require_connected()?;
        Ok(self
            .state
            .descriptor_values
            .get(&(descriptor.characteristic_uuid, descriptor.uuid))
            .map(|value| value.clone())
            .unwrap_or_default())
    }

    fn write_descriptor(&self, descriptor: &GattDescriptor, data: &[u8]) -> Result<()> {
        self.state.require_connected()?;
        self.state
            .descriptor_values
            .insert((descriptor.characteristic_uuid, descriptor.uuid), data.to_vec());
        Ok(())
    }

    fn subscribe(
        &self,
        characteristic: &GattCharacteristic,
        kind: SubscriptionKind,
        handler: NotificationHandler,
    ) -> Result<SubscriptionToken> {
        self.state.require_connected()?;
        self.state.require_characteristic(characteristic)?;

        let token = self.state.next_token.fetch_add(1, Ordering::Relaxed);
        self.state.subscriptions.lock().unwrap().insert(
            token,
            Subscription {
                characteristic: characteristic.uuid,
                kind,
                handler,
            },
        );
        Ok(SubscriptionToken(token))
    }

    fn unsubscribe(&self, token: SubscriptionToken) -> Result<()> {
        // Taking the subscription lock serializes against any in-flight
        // notification dispatch.
        self.state.subscriptions.lock().unwrap().remove(&token.0);
        Ok(())
    }

    fn close(&self) {
        if self.state.session_open.swap(false, Ordering::AcqRel) {
            self.state.subscriptions.lock().unwrap().clear();
            trace!("mock: closed session on {}", self.state.entry.path);
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build a characteristic for a mock profile. Notifiable and indicatable
/// characteristics get a Client Characteristic Configuration descriptor.
pub fn characteristic(
    service_uuid: Uuid,
    uuid: Uuid,
    properties: CharPropFlags,
) -> GattCharacteristic {
    let mut descriptors = Vec::new();
    if properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE) {
        descriptors.push(GattDescriptor {
            uuid: CCC_DESCRIPTOR,
            service_uuid,
            characteristic_uuid: uuid,
        });
    }
    GattCharacteristic {
        uuid,
        service_uuid,
        properties,
        descriptors,
    }
}

/// Build a primary service for a mock profile.
pub fn service(uuid: Uuid, characteristics: Vec<GattCharacteristic>) -> GattService {
    GattService {
        uuid,
        primary: true,
        characteristics,
    }
}
