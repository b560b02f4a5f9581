//! Holding register image of the emulated meter.
//!
//! The map follows the SunSpec layout a Fronius inverter expects from its
//! smart meter: the "SunS" marker, the common model (block 1), the float
//! three-phase meter model (block 213) and the end-of-map marker. Register
//! numbers are 1-based, starting at 40001.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{ConfigError, RegisterError};

pub const BASE_REGISTER: u16 = 40001;
pub const METER_BLOCK_START: u16 = 40072;
pub const METER_BLOCK_LEN: usize = 124;
pub const END_MARKER_START: u16 = 40196;
pub const LAST_REGISTER: u16 = 40197;

const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6E53]; // "SunS"
const COMMON_MODEL_ID: u16 = 1;
const COMMON_MODEL_LEN: u16 = 65;
const METER_MODEL_ID: u16 = 213;
const END_MARKER: [u16; 2] = [0xFFFF, 0];

const MANUFACTURER_WIDTH: usize = 16;
const MODEL_WIDTH: usize = 16;
const OPTIONS_WIDTH: usize = 8;
const VERSION_WIDTH: usize = 8;
const SERIAL_WIDTH: usize = 16;

const DEVICE_ADDRESS_BASE: u16 = 239;
const MAX_UNIT_ID: u16 = 247;

/// Registers 40001..=40071: marker, common model and meter model header.
const HEAD_LEN: usize = (METER_BLOCK_START - BASE_REGISTER) as usize;

/// Strings reported in the SunSpec common model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub options: String,
    pub version: String,
    pub serial: String,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            manufacturer: "Fronius".to_string(),
            model: "Smart Meter 63A".to_string(),
            options: String::new(),
            version: String::new(),
            serial: "00000001".to_string(),
        }
    }
}

pub struct RegisterTable {
    head: [u16; HEAD_LEN],
    meter: Mutex<[u16; METER_BLOCK_LEN]>,
}

impl RegisterTable {
    /// Build the identity block and an all-zero meter block.
    pub fn new(identity: &DeviceIdentity, device_offset: u16) -> Result<Self, ConfigError> {
        let device_address = DEVICE_ADDRESS_BASE
            .checked_add(device_offset)
            .filter(|address| *address <= MAX_UNIT_ID)
            .ok_or(ConfigError::DeviceOffsetOutOfRange {
                offset: device_offset,
            })?;

        let mut head = Vec::with_capacity(HEAD_LEN);
        head.extend_from_slice(&SUNSPEC_MARKER);
        head.push(COMMON_MODEL_ID);
        head.push(COMMON_MODEL_LEN);
        head.extend(pack_string("manufacturer", &identity.manufacturer, MANUFACTURER_WIDTH)?);
        head.extend(pack_string("model", &identity.model, MODEL_WIDTH)?);
        head.extend(pack_string("options", &identity.options, OPTIONS_WIDTH)?);
        head.extend(pack_string("version", &identity.version, VERSION_WIDTH)?);
        head.extend(pack_string("serial", &identity.serial, SERIAL_WIDTH)?);
        head.push(device_address);
        head.push(METER_MODEL_ID);
        head.push(METER_BLOCK_LEN as u16);

        let mut packed = [0u16; HEAD_LEN];
        packed.copy_from_slice(&head);

        Ok(Self {
            head: packed,
            meter: Mutex::new([0; METER_BLOCK_LEN]),
        })
    }

    /// Read `count` registers starting at register number `start`.
    ///
    /// The meter block lock is taken once for the whole batch, so every
    /// 32-bit field in the result comes from the same committed image.
    pub fn read(&self, start: u16, count: u16) -> Result<Vec<u16>, RegisterError> {
        let first = u32::from(start);
        let end = first + u32::from(count);
        if first < u32::from(BASE_REGISTER) || end > u32::from(LAST_REGISTER) + 1 {
            return Err(RegisterError::OutOfRange { start, count });
        }

        let meter = self.lock_meter();
        let values = (first..end)
            .map(|register| self.value_at(&meter, register))
            .collect();
        Ok(values)
    }

    /// Replace the whole meter data block in one critical section.
    pub fn replace_meter_block(&self, values: [u16; METER_BLOCK_LEN]) {
        *self.lock_meter() = values;
    }

    pub fn meter_block(&self) -> [u16; METER_BLOCK_LEN] {
        *self.lock_meter()
    }

    fn value_at(&self, meter: &[u16; METER_BLOCK_LEN], register: u32) -> u16 {
        let meter_start = u32::from(METER_BLOCK_START);
        let end_start = u32::from(END_MARKER_START);
        if register < meter_start {
            self.head[(register - u32::from(BASE_REGISTER)) as usize]
        } else if register < end_start {
            meter[(register - meter_start) as usize]
        } else {
            END_MARKER[(register - end_start) as usize]
        }
    }

    // Readers and the encoder never leave the block half written, so a
    // poisoned lock still guards a well-formed image.
    fn lock_meter(&self) -> MutexGuard<'_, [u16; METER_BLOCK_LEN]> {
        self.meter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pack an ASCII string two bytes per register, big-endian, NUL padded.
fn pack_string(field: &'static str, value: &str, width: usize) -> Result<Vec<u16>, ConfigError> {
    if !value.is_ascii() {
        return Err(ConfigError::NonAsciiField {
            field,
            value: value.to_string(),
        });
    }

    let mut bytes = value.as_bytes().to_vec();
    if bytes.len() > width * 2 {
        warn!(
            "{} {:?} is longer than {} characters, truncating",
            field,
            value,
            width * 2
        );
    }
    bytes.resize(width * 2, 0);

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}
