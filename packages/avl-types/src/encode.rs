//! Codec8 / Codec8-Extended packet encoder.
//!
//! Counterpart to [`crate::codec`]: builds wire-exact packets from records.
//! Used by the fleet simulator and as the test-vector source for the
//! decoder.

use crate::error::EncodeError;
use crate::{AvlRecord, Codec, IoValue};

fn push_io_id(out: &mut Vec<u8>, codec: Codec, id: u16) -> Result<(), EncodeError> {
    match codec {
        Codec::Codec8 => {
            let id = u8::try_from(id).map_err(|_| EncodeError::IdTooWide(id))?;
            out.push(id);
        }
        Codec::Codec8Ext => out.extend_from_slice(&id.to_be_bytes()),
    }
    Ok(())
}

fn push_io_count(out: &mut Vec<u8>, codec: Codec, n: usize) -> Result<(), EncodeError> {
    // A record holds at most 255 (Codec8) / 65535 (Extended) elements per
    // group; counts beyond that cannot be framed.
    push_io_id(out, codec, n as u16)
}

fn encode_record(out: &mut Vec<u8>, codec: Codec, rec: &AvlRecord) -> Result<(), EncodeError> {
    out.extend_from_slice(&rec.timestamp_ms.to_be_bytes());
    out.push(rec.priority.wire_id());

    out.extend_from_slice(&rec.gps.lon_e7.to_be_bytes());
    out.extend_from_slice(&rec.gps.lat_e7.to_be_bytes());
    out.extend_from_slice(&rec.gps.altitude_m.to_be_bytes());
    out.extend_from_slice(&rec.gps.heading_deg.to_be_bytes());
    out.push(rec.gps.satellites);
    out.extend_from_slice(&rec.gps.speed_kmh.to_be_bytes());

    push_io_id(out, codec, rec.trigger_id)?;

    let total = rec.io.len();
    if codec == Codec::Codec8 {
        if rec.io.iter().any(|e| matches!(e.value, IoValue::Variable(_))) {
            return Err(EncodeError::VariableNeedsExtended);
        }
        if total > u8::MAX as usize {
            return Err(EncodeError::TooManyRecords(total));
        }
    }
    push_io_count(out, codec, total)?;

    // Four fixed-width groups in wire order.
    for width in [1usize, 2, 4, 8] {
        let group: Vec<_> = rec
            .io
            .iter()
            .filter(|e| match e.value {
                IoValue::U8(_) => width == 1,
                IoValue::U16(_) => width == 2,
                IoValue::U32(_) => width == 4,
                IoValue::U64(_) => width == 8,
                IoValue::Variable(_) => false,
            })
            .collect();
        push_io_count(out, codec, group.len())?;
        for e in group {
            push_io_id(out, codec, e.id)?;
            match e.value {
                IoValue::U8(v) => out.push(v),
                IoValue::U16(v) => out.extend_from_slice(&v.to_be_bytes()),
                IoValue::U32(v) => out.extend_from_slice(&v.to_be_bytes()),
                IoValue::U64(v) => out.extend_from_slice(&v.to_be_bytes()),
                IoValue::Variable(_) => unreachable!("filtered above"),
            }
        }
    }

    if codec == Codec::Codec8Ext {
        let group: Vec<_> = rec
            .io
            .iter()
            .filter_map(|e| match &e.value {
                IoValue::Variable(v) => Some((e.id, v)),
                _ => None,
            })
            .collect();
        push_io_count(out, codec, group.len())?;
        for (id, v) in group {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(v.len() as u16).to_be_bytes());
            out.extend_from_slice(v);
        }
    }

    Ok(())
}

/// Encode a complete packet: preamble, data length, codec id, records,
/// trailing record count and CRC-16.
pub fn encode_packet(codec: Codec, records: &[AvlRecord]) -> Result<Vec<u8>, EncodeError> {
    let count =
        u8::try_from(records.len()).map_err(|_| EncodeError::TooManyRecords(records.len()))?;

    let mut body = vec![codec.wire_id(), count];
    for rec in records {
        encode_record(&mut body, codec, rec)?;
    }
    body.push(count);

    let mut out = Vec::with_capacity(12 + body.len());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    out.extend_from_slice(&(crate::codec::wire_crc16(&body) as u32).to_be_bytes());
    Ok(out)
}

/// Encode the identification frame: 2-byte big-endian length plus the
/// printable-ASCII identifier bytes.
pub fn encode_identifier(identifier: &str) -> Result<Vec<u8>, EncodeError> {
    let bytes = identifier.as_bytes();
    if bytes.is_empty() || bytes.len() > 64 || !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(EncodeError::BadIdentifier);
    }
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}
