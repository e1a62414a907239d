// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! The `transport` module abstracts the host Bluetooth LE stack behind the
//! [`BleTransport`] and [`DeviceSession`] traits. The core never talks to an
//! OS API directly: sensor drivers enumerate peripherals, open sessions,
//! read and write GATT attributes and subscribe to notifications purely
//! through these traits. An in-memory [`mock`] backend ships with the crate
//! and backs the test suite and the demo client.

pub mod mock;

use bitflags::bitflags;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

use crate::api::BDAddr;
use crate::hotplug::HotplugHub;
use crate::Result;

bitflags! {
    /// A set of properties that indicate what operations are supported by a Characteristic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
    pub struct CharPropFlags: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

/// The type of write operation to use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// A write operation where the device is expected to respond with a confirmation or error.
    WithResponse,
    /// A write-without-response, also known as a command.
    WithoutResponse,
}

/// Push mechanism to subscribe a characteristic with. Indications are
/// acknowledged by the host, notifications are not.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscriptionKind {
    Notify,
    Indicate,
}

/// One peripheral visible to the host, as yielded by
/// [`BleTransport::enumerate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeripheralEntry {
    /// Stable device path; a peripheral keeps its path across sessions.
    pub path: String,
    /// Stable unique identifier assigned by the host stack.
    pub unique_id: String,
    /// Human-readable advertised name.
    pub friendly_name: String,
    pub address: BDAddr,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl PeripheralEntry {
    /// Whether the peripheral advertises the given service.
    pub fn advertises_service(&self, uuid: Uuid) -> bool {
        self.services.contains(&uuid)
    }
}

impl Display for PeripheralEntry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.path)
    }
}

/// A GATT descriptor attached to a characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    /// The UUID of the service this descriptor belongs to.
    pub service_uuid: Uuid,
    /// The UUID of the characteristic this descriptor belongs to.
    pub characteristic_uuid: Uuid,
}

/// A GATT characteristic: one value handle plus its descriptors. The value
/// is read and written through the owning [`DeviceSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    /// The UUID of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// The set of properties for this characteristic, which indicate what
    /// operations it supports.
    pub properties: CharPropFlags,
    pub descriptors: Vec<GattDescriptor>,
}

impl GattCharacteristic {
    pub fn find_descriptor(&self, uuid: Uuid) -> Option<&GattDescriptor> {
        self.descriptors.iter().find(|d| d.uuid == uuid)
    }

    pub fn is_readable(&self) -> bool {
        self.properties.contains(CharPropFlags::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.properties.contains(CharPropFlags::WRITE)
    }

    pub fn is_notifiable(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }

    pub fn is_indicatable(&self) -> bool {
        self.properties.contains(CharPropFlags::INDICATE)
    }
}

impl Display for GattCharacteristic {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "uuid: {:?}, char properties: {:?}",
            self.uuid, self.properties
        )
    }
}

/// A GATT service: a group of characteristics, standard or device-specific.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    pub fn find_characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// The full service tree of an open peripheral. Populated once when the
/// session opens; mid-session changes are not modeled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattProfile {
    pub services: Vec<GattService>,
}

impl GattProfile {
    pub fn find_service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// Look up a characteristic anywhere in the tree.
    pub fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Option<&GattCharacteristic> {
        self.find_service(service)
            .and_then(|s| s.find_characteristic(characteristic))
    }
}

/// Callback invoked with the payload of every notification or indication of
/// a subscribed characteristic. Runs on a transport-owned thread.
pub type NotificationHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Identifies one active subscription of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// An open, exclusive session with one peripheral.
///
/// Dropping or closing the session implicitly unsubscribes everything.
/// `close` is idempotent.
pub trait DeviceSession: Send + Sync {
    /// The GATT tree discovered at open time.
    fn profile(&self) -> &GattProfile;

    /// Read the characteristic's current value.
    fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>>;

    /// Write to the characteristic's value handle.
    fn write(
        &self,
        characteristic: &GattCharacteristic,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()>;

    fn read_descriptor(&self, descriptor: &GattDescriptor) -> Result<Vec<u8>>;

    fn write_descriptor(&self, descriptor: &GattDescriptor, data: &[u8]) -> Result<()>;

    /// Enable notify or indicate for the characteristic and attach a
    /// handler. The handler is invoked on a transport-owned thread for every
    /// value push until the subscription is dropped.
    fn subscribe(
        &self,
        characteristic: &GattCharacteristic,
        kind: SubscriptionKind,
        handler: NotificationHandler,
    ) -> Result<SubscriptionToken>;

    /// Detach a subscription. Blocks until no handler invocation is in
    /// flight.
    fn unsubscribe(&self, token: SubscriptionToken) -> Result<()>;

    /// Release the session. Idempotent.
    fn close(&self);
}

/// A host BLE stack. Implementations own the notification threads; the core
/// treats every subscription callback as potentially concurrent with the
/// service tick and serializes through the per-sensor packet queues.
pub trait BleTransport: Send + Sync {
    /// Snapshot the peripherals currently visible to the host. The iterator
    /// is forward-only; re-call `enumerate` to restart.
    fn enumerate(&self) -> Result<Box<dyn Iterator<Item = PeripheralEntry> + Send + '_>>;

    /// Non-invasive check whether `open` could succeed right now.
    fn query_can_open(&self, entry: &PeripheralEntry) -> Result<()>;

    /// Connect a session and populate its GATT profile. At most one session
    /// per path; a second open fails with [`Error::AlreadyOpen`](crate::Error::AlreadyOpen).
    fn open(&self, entry: &PeripheralEntry) -> Result<Box<dyn DeviceSession>>;

    /// Attach a hot-plug sink. Returns false when this transport cannot
    /// observe arrival/removal events, in which case the device manager
    /// falls back to interval polling.
    fn set_hotplug_sink(&self, sink: Arc<HotplugHub>) -> bool {
        let _ = sink;
        false
    }

    /// Address of the host adapter.
    fn host_address(&self) -> BDAddr {
        BDAddr::default()
    }
}
