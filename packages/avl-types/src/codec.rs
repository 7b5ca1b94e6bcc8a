//! # codec
//!
//! Codec8 / Codec8-Extended packet decoder.
//!
//! The decoder works on one complete packet slice; stream framing (finding
//! packet boundaries across partial TCP reads) lives in the session server.
//! Offsets follow the wire layout exactly:
//!
//! | offset      | size | field                                   |
//! |-------------|------|-----------------------------------------|
//! | 0           | 4    | preamble, must be zero                  |
//! | 4           | 4    | data length N                           |
//! | 8           | 1    | codec id (0x08 / 0x8E)                  |
//! | 9           | 1    | record count                            |
//! | …           | N-3  | record stream                           |
//! | 8+N-1       | 1    | record count again                      |
//! | 8+N         | 4    | CRC-16 in the low 16 bits               |
//!
//! The CRC (poly 0xA001 bit-reflected, init 0) covers bytes `[8, 8+N)`.

use crc::{Crc, CRC_16_ARC};

use crate::error::DecodeError;
use crate::{AvlPacket, AvlRecord, Codec, GpsElement, IoElement, IoValue, Priority};

/// CRC-16/ARC: polynomial 0x8005 bit-reflected (0xA001), init 0x0000.
const WIRE_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Checksum over an arbitrary byte range, as used by the packet trailer.
pub fn wire_crc16(data: &[u8]) -> u16 {
    WIRE_CRC.checksum(data)
}

/// Peek a buffered packet's total wire length `8 + data_length + 4`, so
/// the session layer knows when a full packet has arrived. `None` while
/// fewer than 8 bytes are buffered.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 8 {
        return None;
    }
    let data_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    Some(8 + data_len + 4)
}

// ── Cursor ────────────────────────────────────────────────────────────────────

/// Bounds-checked big-endian reader over the record stream region.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize, end: usize) -> Self {
        Self { buf, pos, end }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.pos + n > self.end {
            return Err(DecodeError::Truncated {
                offset: self.pos,
                end: self.end,
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    /// IO element id: 1 byte in Codec8, 2 bytes in Codec8-Extended.
    fn io_id(&mut self, codec: Codec) -> Result<u16, DecodeError> {
        match codec {
            Codec::Codec8 => Ok(self.u8()? as u16),
            Codec::Codec8Ext => self.u16(),
        }
    }

    /// IO element count: same widths as ids.
    fn io_count(&mut self, codec: Codec) -> Result<u16, DecodeError> {
        self.io_id(codec)
    }
}

// ── Packet decode ─────────────────────────────────────────────────────────────

/// Decode one complete packet. `buf` must hold at least the whole packet;
/// any trailing bytes are ignored (`wire_len` reports what was consumed).
pub fn decode_packet(buf: &[u8]) -> Result<AvlPacket, DecodeError> {
    if buf.len() < 8 {
        return Err(DecodeError::ShortPacket {
            len: buf.len(),
            need: 8,
        });
    }

    let preamble = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if preamble != 0 {
        return Err(DecodeError::BadPreamble(preamble));
    }

    let data_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = 8 + data_len + 4;
    if buf.len() < total {
        return Err(DecodeError::ShortPacket {
            len: buf.len(),
            need: total,
        });
    }
    // codec id + two record counts is the smallest possible data region
    if data_len < 3 {
        return Err(DecodeError::ShortPacket {
            len: data_len,
            need: 3,
        });
    }

    let data_end = 8 + data_len;
    let crc_field = u32::from_be_bytes([
        buf[data_end],
        buf[data_end + 1],
        buf[data_end + 2],
        buf[data_end + 3],
    ]);
    let computed = wire_crc16(&buf[8..data_end]);
    // High 16 bits of the CRC field must be zero.
    if crc_field != computed as u32 {
        return Err(DecodeError::BadCrc {
            computed,
            received: crc_field,
        });
    }

    let codec =
        Codec::from_wire(buf[8]).ok_or(DecodeError::UnsupportedCodec(buf[8]))?;
    let header_count = buf[9];
    let trailer_count = buf[data_end - 1];
    if header_count != trailer_count {
        return Err(DecodeError::RecordCountMismatch {
            header: header_count,
            trailer: trailer_count,
        });
    }

    // Records occupy [10, data_end - 1); the trailing count byte is excluded.
    let mut cur = Cursor::new(buf, 10, data_end - 1);
    let mut records = Vec::with_capacity(header_count as usize);
    for _ in 0..header_count {
        records.push(decode_record(&mut cur, codec)?);
    }
    if cur.pos != cur.end {
        // Declared record count consumed less than the data region holds.
        return Err(DecodeError::Truncated {
            offset: cur.pos,
            end: cur.end,
        });
    }

    Ok(AvlPacket {
        codec,
        records,
        wire_len: total,
    })
}

fn decode_record(cur: &mut Cursor<'_>, codec: Codec) -> Result<AvlRecord, DecodeError> {
    let timestamp_ms = cur.u64()?;
    let priority = Priority::from_wire(cur.u8()?);

    let gps = GpsElement {
        lon_e7: cur.i32()?,
        lat_e7: cur.i32()?,
        altitude_m: cur.i16()?,
        heading_deg: cur.u16()?,
        satellites: cur.u8()?,
        speed_kmh: cur.u16()?,
    };

    let trigger_id = cur.io_id(codec)?;
    // Total element count; the per-group counts below are authoritative.
    let _total = cur.io_count(codec)?;

    let mut io = Vec::new();
    for width in [1usize, 2, 4, 8] {
        let n = cur.io_count(codec)?;
        for _ in 0..n {
            let id = cur.io_id(codec)?;
            let value = match width {
                1 => IoValue::U8(cur.u8()?),
                2 => IoValue::U16(cur.u16()?),
                4 => IoValue::U32(cur.u32()?),
                _ => IoValue::U64(cur.u64()?),
            };
            io.push(IoElement { id, value });
        }
    }

    // Codec8-Extended carries a fifth, variable-width group.
    if codec == Codec::Codec8Ext {
        let n = cur.io_count(codec)?;
        for _ in 0..n {
            let id = cur.u16()?;
            let len = cur.u16()? as usize;
            let value = cur.take(len)?.to_vec();
            io.push(IoElement {
                id,
                value: IoValue::Variable(value),
            });
        }
    }

    Ok(AvlRecord {
        timestamp_ms,
        priority,
        gps,
        trigger_id,
        io,
    })
}

// ── Identifier frame ──────────────────────────────────────────────────────────

/// Decode the identification frame a device sends on connect: a 2-byte
/// big-endian length (1..=64) followed by that many printable-ASCII bytes.
///
/// Returns `Ok(None)` while the frame is still incomplete, and
/// `Ok(Some((identifier, bytes_consumed)))` once it is whole.
pub fn decode_identifier(buf: &[u8]) -> Result<Option<(String, usize)>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len == 0 || len > 64 {
        return Err(DecodeError::BadIdentifier("length out of range 1..=64"));
    }
    if buf.len() < 2 + len {
        return Ok(None);
    }
    let bytes = &buf[2..2 + len];
    if !bytes.iter().all(|b| (0x20..=0x7e).contains(b)) {
        return Err(DecodeError::BadIdentifier("non-printable byte"));
    }
    // All printable ASCII, so the conversion cannot fail.
    let identifier = String::from_utf8_lossy(bytes).into_owned();
    Ok(Some((identifier, 2 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{encode_identifier, encode_packet};

    fn sample_record(ts: u64, io: Vec<IoElement>) -> AvlRecord {
        AvlRecord {
            timestamp_ms: ts,
            priority: Priority::Low,
            gps: GpsElement {
                lon_e7: 279_465_430,
                lat_e7: -263_102_210,
                altitude_m: 1412,
                heading_deg: 278,
                satellites: 11,
                speed_kmh: 47,
            },
            trigger_id: 0,
            io,
        }
    }

    #[test]
    fn crc16_reference_vector() {
        // CRC-16/ARC check value
        assert_eq!(wire_crc16(b"123456789"), 0xBB3D);
    }

    #[test]
    fn decodes_minimal_codec8_packet() {
        // Hand-built: one record, zeroed GPS, zero IO in all four groups.
        let mut body = vec![Codec::CODEC8_ID, 1];
        body.extend_from_slice(&1_704_067_200_000u64.to_be_bytes()); // 2024-01-01T00:00:00Z
        body.push(0); // priority
        body.extend_from_slice(&[0u8; 15]); // GPS element
        body.extend_from_slice(&[0, 0]); // event id, total count
        body.extend_from_slice(&[0, 0, 0, 0]); // four empty groups
        body.push(1); // trailer count

        let mut packet = vec![0, 0, 0, 0];
        packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
        packet.extend_from_slice(&body);
        packet.extend_from_slice(&(wire_crc16(&body) as u32).to_be_bytes());

        let decoded = decode_packet(&packet).unwrap();
        assert_eq!(decoded.codec, Codec::Codec8);
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.records[0].timestamp_ms, 1_704_067_200_000);
        assert_eq!(decoded.records[0].gps, GpsElement::default());
        assert!(decoded.records[0].io.is_empty());
        // bytesConsumed == 8 + dataLength + 4
        assert_eq!(decoded.wire_len, 8 + body.len() + 4);
        assert_eq!(decoded.wire_len, packet.len());
    }

    #[test]
    fn round_trips_codec8_io_groups() {
        let io = vec![
            IoElement { id: 239, value: IoValue::U8(1) },
            IoElement { id: 17, value: IoValue::U16(0xFC18) }, // -1000 as i16
            IoElement { id: 16, value: IoValue::U32(1_234_567) },
            IoElement { id: 77, value: IoValue::U64(9_000_000_000) },
        ];
        let rec = sample_record(1_700_000_000_123, io.clone());
        let bytes = encode_packet(Codec::Codec8, &[rec.clone()]).unwrap();

        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.wire_len, bytes.len());
        assert_eq!(decoded.records, vec![rec]);
    }

    #[test]
    fn round_trips_codec8ext_with_variable_group() {
        let io = vec![
            IoElement { id: 385, value: IoValue::U8(3) }, // 2-byte id
            IoElement { id: 18, value: IoValue::U16(1002) },
            IoElement {
                id: 10_358,
                value: IoValue::Variable(vec![0xDE, 0xAD, 0xBE, 0xEF]),
            },
        ];
        let rec = sample_record(1_700_000_000_456, io.clone());
        let bytes = encode_packet(Codec::Codec8Ext, &[rec.clone()]).unwrap();

        let decoded = decode_packet(&bytes).unwrap();
        assert_eq!(decoded.codec, Codec::Codec8Ext);
        assert_eq!(decoded.records, vec![rec]);
    }

    #[test]
    fn multiple_records_decode_in_order() {
        let recs: Vec<_> = (0..5)
            .map(|i| sample_record(1_700_000_000_000 + i * 1000, vec![]))
            .collect();
        let bytes = encode_packet(Codec::Codec8, &recs).unwrap();
        let decoded = decode_packet(&bytes).unwrap();
        let ts: Vec<_> = decoded.records.iter().map(|r| r.timestamp_ms).collect();
        assert_eq!(
            ts,
            vec![
                1_700_000_000_000,
                1_700_000_001_000,
                1_700_000_002_000,
                1_700_000_003_000,
                1_700_000_004_000
            ]
        );
    }

    #[test]
    fn rejects_bad_preamble() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::BadPreamble(0xFF00_0000))
        ));
    }

    #[test]
    fn rejects_short_packet() {
        assert!(matches!(
            decode_packet(&[0, 0, 0]),
            Err(DecodeError::ShortPacket { len: 3, need: 8 })
        ));

        let bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        assert!(matches!(
            decode_packet(&bytes[..bytes.len() - 1]),
            Err(DecodeError::ShortPacket { .. })
        ));
    }

    #[test]
    fn rejects_unsupported_codec() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        bytes[8] = 0x0C; // Codec12 (GPRS commands)
        let data_len = bytes.len() - 12;
        let crc = wire_crc16(&bytes[8..8 + data_len]) as u32;
        bytes[8 + data_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::UnsupportedCodec(0x0C))
        ));
    }

    #[test]
    fn rejects_crc_mismatch() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode_packet(&bytes), Err(DecodeError::BadCrc { .. })));
    }

    #[test]
    fn rejects_crc_with_high_bits_set() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        let crc_at = bytes.len() - 4;
        bytes[crc_at] = 0xAB; // corrupt the zero high half
        assert!(matches!(decode_packet(&bytes), Err(DecodeError::BadCrc { .. })));
    }

    #[test]
    fn rejects_record_count_mismatch() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        let data_len = bytes.len() - 12;
        bytes[8 + data_len - 1] = 2; // trailer count
        let crc = wire_crc16(&bytes[8..8 + data_len]) as u32;
        bytes[8 + data_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            decode_packet(&bytes),
            Err(DecodeError::RecordCountMismatch { header: 1, trailer: 2 })
        ));
    }

    #[test]
    fn rejects_truncated_record_stream() {
        let mut bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        // Claim one more 1-byte IO element than the stream holds.
        // Offset: 10 (record start) + 8 (ts) + 1 (prio) + 15 (gps) + 2 (event
        // id + total) puts the first group count at 36.
        bytes[36] = 1;
        let data_len = bytes.len() - 12;
        let crc = wire_crc16(&bytes[8..8 + data_len]) as u32;
        bytes[8 + data_len..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(decode_packet(&bytes), Err(DecodeError::Truncated { .. })));
    }

    #[test]
    fn frame_len_reads_declared_length() {
        let bytes = encode_packet(Codec::Codec8, &[sample_record(1, vec![])]).unwrap();
        assert_eq!(frame_len(&bytes), Some(bytes.len()));
        assert_eq!(frame_len(&bytes[..7]), None);
    }

    #[test]
    fn identifier_frame_round_trip() {
        let frame = encode_identifier("356307042441013").unwrap();
        let (id, consumed) = decode_identifier(&frame).unwrap().unwrap();
        assert_eq!(id, "356307042441013");
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn identifier_incomplete_returns_none() {
        let frame = encode_identifier("356307042441013").unwrap();
        assert_eq!(decode_identifier(&frame[..1]).unwrap(), None);
        assert_eq!(decode_identifier(&frame[..8]).unwrap(), None);
    }

    #[test]
    fn identifier_rejects_bad_frames() {
        // length 0
        assert!(decode_identifier(&[0, 0]).is_err());
        // length > 64
        assert!(decode_identifier(&[0, 65]).is_err());
        // non-printable byte
        let frame = [0u8, 3, b'1', 0x07, b'3'];
        assert!(decode_identifier(&frame).is_err());
    }
}
