//! AVL IO element id → named field mapping.
//!
//! Pure translation of the numeric element ids fleet trackers transmit into
//! the named fields the ingestion pipeline persists. Values are carried
//! verbatim (no rescaling); ids the table does not know land in `unknown`
//! so nothing is dropped silently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{IoElement, IoValue};

// AVL ids as documented for the Codec8 tracker family.
pub const IO_DIN1: u16 = 1;
pub const IO_DIN2: u16 = 2;
pub const IO_AIN1: u16 = 9;
pub const IO_ODOMETER: u16 = 16;
pub const IO_AXIS_X: u16 = 17;
pub const IO_AXIS_Y: u16 = 18;
pub const IO_AXIS_Z: u16 = 19;
pub const IO_GSM_SIGNAL: u16 = 21;
pub const IO_EXTERNAL_VOLTAGE: u16 = 66;
pub const IO_BATTERY_VOLTAGE: u16 = 67;
pub const IO_IGNITION: u16 = 239;
pub const IO_MOVEMENT: u16 = 240;

/// Named view of one record's IO elements. Every field is optional — a
/// tracker only transmits the elements its profile enables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappedIo {
    pub din1: Option<bool>,
    pub din2: Option<bool>,
    /// Analog input 1, millivolts
    pub ain1_mv: Option<u16>,
    /// Total odometer, meters
    pub odometer_m: Option<u32>,
    /// Accelerometer axes, milli-g signed
    pub axis_x_mg: Option<i16>,
    pub axis_y_mg: Option<i16>,
    pub axis_z_mg: Option<i16>,
    /// GSM signal strength, 0..5
    pub gsm_signal: Option<u8>,
    /// External (vehicle) supply voltage, millivolts
    pub external_voltage_mv: Option<u16>,
    /// Internal battery voltage, millivolts
    pub battery_voltage_mv: Option<u16>,
    pub ignition: Option<bool>,
    pub movement: Option<bool>,
    /// Elements with ids outside the table, preserved untouched.
    pub unknown: BTreeMap<u16, IoValue>,
}

/// Map a record's IO elements to named fields.
pub fn map_io(elements: &[IoElement]) -> MappedIo {
    let mut out = MappedIo::default();
    for e in elements {
        let scalar = e.value.as_u64();
        match (e.id, scalar) {
            (IO_DIN1, Some(v)) => out.din1 = Some(v != 0),
            (IO_DIN2, Some(v)) => out.din2 = Some(v != 0),
            (IO_AIN1, Some(v)) => out.ain1_mv = Some(v as u16),
            (IO_ODOMETER, Some(v)) => out.odometer_m = Some(v as u32),
            (IO_AXIS_X, Some(v)) => out.axis_x_mg = Some(v as u16 as i16),
            (IO_AXIS_Y, Some(v)) => out.axis_y_mg = Some(v as u16 as i16),
            (IO_AXIS_Z, Some(v)) => out.axis_z_mg = Some(v as u16 as i16),
            (IO_GSM_SIGNAL, Some(v)) => out.gsm_signal = Some(v as u8),
            (IO_EXTERNAL_VOLTAGE, Some(v)) => out.external_voltage_mv = Some(v as u16),
            (IO_BATTERY_VOLTAGE, Some(v)) => out.battery_voltage_mv = Some(v as u16),
            (IO_IGNITION, Some(v)) => out.ignition = Some(v != 0),
            (IO_MOVEMENT, Some(v)) => out.movement = Some(v != 0),
            _ => {
                out.unknown.insert(e.id, e.value.clone());
            }
        }
    }
    out
}
