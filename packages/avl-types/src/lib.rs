//! # avl-types
//!
//! Shared AVL wire-format types for the Roadsense fleet telemetry system.
//!
//! These types are used by:
//! - `backend-rust`: decoding Codec8 / Codec8-Extended packets streamed by
//!   fleet trackers over TCP
//! - `avl-simulator`: producing wire-exact packets for development without
//!   hardware on the road
//!
//! ## Wire format
//!
//! A packet is `preamble(4) | data_length(4) | codec_id(1) | count(1) |
//! records | count(1) | crc(4)`, all multi-byte integers big-endian. The
//! CRC-16 (poly 0xA001, bit-reflected, init 0) covers codec id through the
//! trailing record count. Codec8-Extended widens IO element ids and counts
//! to two bytes and adds a variable-width IO group.
//!
//! ## Invariants
//! - A decoded packet consumed exactly `8 + data_length + 4` bytes
//! - Header and trailer record counts are equal
//! - The decoder is structural only: it never interprets IO element
//!   semantics (that is the field mapper's job)

use serde::{Deserialize, Serialize};

pub mod codec;
pub mod encode;
pub mod error;
pub mod io_map;

pub use codec::{decode_identifier, decode_packet, frame_len, wire_crc16};
pub use encode::{encode_identifier, encode_packet};
pub use error::{DecodeError, EncodeError};
pub use io_map::{map_io, MappedIo};

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Wire codec announced in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    /// Codec8: 1-byte IO ids and counts, four fixed-width IO groups.
    Codec8,
    /// Codec8-Extended: 2-byte IO ids and counts, plus a variable-width group.
    Codec8Ext,
}

impl Codec {
    pub const CODEC8_ID: u8 = 0x08;
    pub const CODEC8_EXT_ID: u8 = 0x8E;

    pub fn from_wire(id: u8) -> Option<Self> {
        match id {
            Self::CODEC8_ID => Some(Self::Codec8),
            Self::CODEC8_EXT_ID => Some(Self::Codec8Ext),
            _ => None,
        }
    }

    pub fn wire_id(self) -> u8 {
        match self {
            Self::Codec8 => Self::CODEC8_ID,
            Self::Codec8Ext => Self::CODEC8_EXT_ID,
        }
    }
}

// ── Record priority ───────────────────────────────────────────────────────────

/// Record priority byte. Trackers send `Panic` records out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    High,
    Panic,
}

impl Priority {
    pub fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::High,
            2 => Self::Panic,
            _ => Self::Low,
        }
    }

    pub fn wire_id(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::High => 1,
            Self::Panic => 2,
        }
    }
}

// ── GPS element ───────────────────────────────────────────────────────────────

/// 15-byte GPS element of an AVL record.
///
/// Coordinates are signed fixed-point with 7 decimal places (1e-7 degrees,
/// ~1 cm at the equator), exactly as transmitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpsElement {
    /// Longitude × 1e7, signed
    pub lon_e7: i32,
    /// Latitude × 1e7, signed
    pub lat_e7: i32,
    /// Altitude above sea level, meters
    pub altitude_m: i16,
    /// Heading, degrees clockwise from north (0..359)
    pub heading_deg: u16,
    /// Number of visible satellites (0 = no fix)
    pub satellites: u8,
    /// Ground speed, km/h
    pub speed_kmh: u16,
}

impl GpsElement {
    /// Longitude in decimal degrees
    pub fn lon_deg(&self) -> f64 {
        self.lon_e7 as f64 / 1e7
    }

    /// Latitude in decimal degrees
    pub fn lat_deg(&self) -> f64 {
        self.lat_e7 as f64 / 1e7
    }
}

// ── IO elements ───────────────────────────────────────────────────────────────

/// One IO element value. The wire groups elements by width (1, 2, 4, 8
/// bytes, plus length-prefixed binary in Codec8-Extended); the variant
/// records which group the element arrived in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Variable(Vec<u8>),
}

impl IoValue {
    /// Scalar value widened to u64; `None` for variable-width elements.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            IoValue::U8(v) => Some(v as u64),
            IoValue::U16(v) => Some(v as u64),
            IoValue::U32(v) => Some(v as u64),
            IoValue::U64(v) => Some(v),
            IoValue::Variable(_) => None,
        }
    }
}

/// An `(id, value)` IO element pair. Ids are 1 byte in Codec8 and 2 bytes
/// in Codec8-Extended; both are widened to u16 here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoElement {
    pub id: u16,
    pub value: IoValue,
}

// ── AVL record ────────────────────────────────────────────────────────────────

/// One timestamped sample: GPS fix plus IO elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlRecord {
    /// Milliseconds since the Unix epoch, UTC
    pub timestamp_ms: u64,
    pub priority: Priority,
    pub gps: GpsElement,
    /// IO id that triggered generation of this record (0 = periodic)
    pub trigger_id: u16,
    pub io: Vec<IoElement>,
}

// ── Decoded packet ────────────────────────────────────────────────────────────

/// A fully decoded Codec8 / Codec8-Extended packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlPacket {
    pub codec: Codec,
    pub records: Vec<AvlRecord>,
    /// Total bytes the packet occupied on the wire: `8 + data_length + 4`.
    pub wire_len: usize,
}
