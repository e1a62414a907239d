//! Utilities for dealing with BLE UUIDs, converting to and from their short formats.

use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth Base
/// UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth Base
/// UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Parse a UUID from the string forms that appear in GATT documentation and
/// vendor datasheets: 4 hex digits (16-bit short form), 8 hex digits (32-bit
/// short form) or the full 36-character hyphenated form. A leading `0x` is
/// accepted on the short forms. Short forms are expanded with the Bluetooth
/// Base UUID; anything else is rejected.
pub fn parse_ble_uuid(s: &str) -> Result<Uuid> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    match stripped.len() {
        4 => {
            let short = u16::from_str_radix(stripped, 16)
                .map_err(|_| Error::Protocol(format!("invalid short UUID {:?}", s)))?;
            Ok(uuid_from_u16(short))
        }
        8 => {
            let short = u32::from_str_radix(stripped, 16)
                .map_err(|_| Error::Protocol(format!("invalid short UUID {:?}", s)))?;
            Ok(uuid_from_u32(short))
        }
        36 => Ok(Uuid::parse_str(stripped)?),
        _ => Err(Error::Protocol(format!("invalid UUID length {:?}", s))),
    }
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid BLE short UUID then return its short form, otherwise return `None`.
    fn to_ble_u32(&self) -> Option<u32>;

    /// If the UUID is a valid 16-bit BLE short UUID then return its short form, otherwise return
    /// `None`.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using short format if applicable.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        if let Some(uuid16) = self.to_ble_u16() {
            format!("{:#04x}", uuid16)
        } else if let Some(uuid32) = self.to_ble_u32() {
            format!("{:#06x}", uuid32)
        } else {
            self.to_string()
        }
    }
}
