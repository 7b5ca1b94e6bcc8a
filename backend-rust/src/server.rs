//! # server
//!
//! TCP session server for fleet trackers.
//!
//! One cooperative task per connection. A session starts with the
//! identification handshake (2-byte length + ASCII identifier, answered
//! with a single accept/reject byte), then becomes a byte stream that is
//! framed into Codec8 packets as reads arrive: partial reads stay
//! buffered, every complete packet is decoded, ingested, and answered
//! with a 4-byte big-endian acknowledgement carrying the packet's record
//! count.
//!
//! No acknowledgement is ever sent for a packet that failed to parse or
//! to persist — the tracker's retransmit plus skip-duplicates insert make
//! redelivery idempotent. A declared frame larger than the buffer cap
//! closes the connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use avl_types::{decode_identifier, decode_packet};
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::counters::Counters;
use crate::ingest::{IngestError, IngestService};

// ── Framing ───────────────────────────────────────────────────────────────────

/// Slice one complete packet off the front of the read buffer.
///
/// `Ok(None)` means more bytes are needed; `Err(total)` means the declared
/// frame would exceed the cap and the connection must close.
fn take_frame(buf: &mut BytesMut, cap: usize) -> Result<Option<BytesMut>, usize> {
    let Some(total) = avl_types::frame_len(buf) else {
        return Ok(None);
    };
    if total > cap {
        return Err(total);
    }
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(buf.split_to(total)))
}

fn hex_dump(frame: &[u8]) -> String {
    let head = &frame[..frame.len().min(64)];
    if frame.len() > 64 {
        format!("{}… ({} bytes)", hex::encode(head), frame.len())
    } else {
        hex::encode(head)
    }
}

// ── Session server ────────────────────────────────────────────────────────────

pub struct SessionServer {
    ingest: Arc<IngestService>,
    counters: Arc<Counters>,
    /// Bounded worker pool: one permit per in-flight ingestion, so a
    /// single slow connection cannot starve the rest.
    workers: Arc<Semaphore>,
    frame_cap: usize,
    idle: Duration,
}

impl SessionServer {
    pub fn new(ingest: Arc<IngestService>, counters: Arc<Counters>, config: &Config) -> Self {
        Self {
            ingest,
            counters,
            workers: Arc::new(Semaphore::new(config.ingest_workers.max(1))),
            frame_cap: config.frame_cap_bytes,
            idle: Duration::from_millis(config.session_idle_ms),
        }
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        Counters::incr(&self.counters.active_sessions);
        if let Err(e) = self.session(&mut stream, peer).await {
            debug!("session {peer}: i/o error: {e}");
        }
        Counters::decr(&self.counters.active_sessions);
    }

    async fn session(&self, stream: &mut TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(8192);

        let Some(identifier) = self.read_identifier(stream, &mut buf, peer).await? else {
            return Ok(());
        };
        // Acceptance is unconditional here; the identifier is resolved
        // against the fleet per packet, so an unknown device just streams
        // into the void until it is registered.
        stream.write_all(&[0x01]).await?;
        info!("session {peer}: device {identifier} connected");

        loop {
            loop {
                match take_frame(&mut buf, self.frame_cap) {
                    Ok(Some(frame)) => {
                        self.process_packet(stream, &identifier, &frame).await?;
                    }
                    Ok(None) => break,
                    Err(total) => {
                        Counters::incr(&self.counters.oversized_frames);
                        warn!(
                            "session {peer}: declared frame of {total} bytes exceeds cap of \
                             {}, closing",
                            self.frame_cap
                        );
                        return Ok(());
                    }
                }
            }

            match timeout(self.idle, stream.read_buf(&mut buf)).await {
                Ok(Ok(0)) => {
                    debug!("session {peer}: device {identifier} disconnected");
                    return Ok(());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    info!("session {peer}: idle for {:?}, closing", self.idle);
                    return Ok(());
                }
            }
        }
    }

    /// Read the identification frame. Rejects (0x00 + close) on a
    /// malformed frame; leaves any bytes past the frame in `buf` — eager
    /// trackers pipeline their first packet behind the identifier.
    async fn read_identifier(
        &self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        peer: SocketAddr,
    ) -> std::io::Result<Option<String>> {
        loop {
            match decode_identifier(buf) {
                Ok(Some((identifier, consumed))) => {
                    buf.advance(consumed);
                    return Ok(Some(identifier));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("session {peer}: {e}, rejecting");
                    let _ = stream.write_all(&[0x00]).await;
                    return Ok(None);
                }
            }
            match timeout(self.idle, stream.read_buf(buf)).await {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!("session {peer}: no identifier within {:?}", self.idle);
                    return Ok(None);
                }
            }
        }
    }

    async fn process_packet(
        &self,
        stream: &mut TcpStream,
        identifier: &str,
        frame: &[u8],
    ) -> std::io::Result<()> {
        let packet = match decode_packet(frame) {
            Ok(p) => p,
            Err(e) => {
                Counters::incr(&self.counters.packets_dropped);
                warn!(
                    "device {identifier}: dropped undecodable packet: {e}; dump: {}",
                    hex_dump(frame)
                );
                // No ACK — the tracker will retransmit.
                return Ok(());
            }
        };
        let record_count = packet.records.len() as u32;

        let outcome = {
            let _permit = match self.workers.acquire().await {
                Ok(p) => p,
                Err(_) => return Ok(()), // pool closed during shutdown
            };
            self.ingest.ingest(&packet, identifier).await
        };

        match outcome {
            Ok(o) => {
                Counters::incr(&self.counters.packets_ingested);
                debug!(
                    "device {identifier}: packet acked ({} records, {} skipped)",
                    o.records_processed, o.records_skipped
                );
                stream.write_all(&record_count.to_be_bytes()).await?;
            }
            Err(IngestError::UnauthorizedDevice(id)) => {
                // Keep the session open; retransmits are harmless and the
                // device may be registered mid-stream.
                debug!("device {id}: unregistered, packet dropped without ack");
            }
            Err(IngestError::Repository(e)) => {
                warn!("device {identifier}: ingest failed, no ack: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use avl_types::{
        encode_identifier, encode_packet, AvlRecord, Codec, GpsElement, IoElement, IoValue,
        Priority,
    };
    use chrono::Utc;

    use super::*;
    use crate::device_cache::DeviceCache;
    use crate::repository::mock::{MockRepo, MockSegments};
    use crate::segments::SegmentResolver;

    const IDENT: &str = "356307042441013";

    fn frame_of(data_len: u32) -> BytesMut {
        let mut b = BytesMut::new();
        b.extend_from_slice(&[0, 0, 0, 0]);
        b.extend_from_slice(&data_len.to_be_bytes());
        b
    }

    #[test]
    fn framing_waits_for_a_complete_packet() {
        let mut buf = frame_of(10);
        assert_eq!(take_frame(&mut buf, 1024).unwrap(), None);

        buf.extend_from_slice(&[0u8; 9]);
        assert_eq!(take_frame(&mut buf, 1024).unwrap(), None); // 17 of 22 bytes

        buf.extend_from_slice(&[0u8; 5]);
        let frame = take_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame.len(), 22);
        assert!(buf.is_empty());
    }

    #[test]
    fn framing_slices_back_to_back_packets() {
        let mut buf = frame_of(3);
        buf.extend_from_slice(&[0u8; 7]); // data + crc
        let second = frame_of(3);
        buf.extend_from_slice(&second);
        buf.extend_from_slice(&[0u8; 7]);
        buf.extend_from_slice(&[0, 0]); // partial third

        assert_eq!(take_frame(&mut buf, 1024).unwrap().unwrap().len(), 15);
        assert_eq!(take_frame(&mut buf, 1024).unwrap().unwrap().len(), 15);
        assert_eq!(take_frame(&mut buf, 1024).unwrap(), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn framing_rejects_oversized_declared_length() {
        let mut buf = frame_of(2_000_000);
        assert_eq!(take_frame(&mut buf, 1_048_576), Err(2_000_012));
    }

    fn test_record() -> AvlRecord {
        AvlRecord {
            timestamp_ms: Utc::now().timestamp_millis() as u64,
            priority: Priority::Low,
            gps: GpsElement {
                lon_e7: 279_465_430,
                lat_e7: -263_102_210,
                altitude_m: 1412,
                heading_deg: 90,
                satellites: 9,
                speed_kmh: 38,
            },
            trigger_id: 0,
            io: vec![IoElement { id: 19, value: IoValue::U16(1000) }],
        }
    }

    async fn spawn_server(repo: Arc<MockRepo>) -> (SocketAddr, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let mut config = Config::from_env();
        config.session_idle_ms = 2_000;
        let ingest = Arc::new(IngestService::new(
            repo.clone(),
            DeviceCache::new(repo, Duration::from_secs(300), 100),
            SegmentResolver::new(Arc::new(MockSegments::returning(None)), 50.0, 100),
            counters.clone(),
            3_600_000,
            true,
        ));
        let server = Arc::new(SessionServer::new(ingest, counters.clone(), &config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.serve(listener));
        (addr, counters)
    }

    async fn handshake(stream: &mut TcpStream, identifier: &str) -> u8 {
        stream
            .write_all(&encode_identifier(identifier).unwrap())
            .await
            .unwrap();
        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await.unwrap();
        ack[0]
    }

    #[tokio::test]
    async fn ingests_a_packet_and_acks_the_record_count() {
        let repo = Arc::new(MockRepo::with_truck(7, IDENT));
        let (addr, _) = spawn_server(repo.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(handshake(&mut stream, IDENT).await, 0x01);

        let packet = encode_packet(Codec::Codec8, &[test_record()]).unwrap();
        stream.write_all(&packet).await.unwrap();

        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0, 0, 0, 1]);
        assert_eq!(repo.telemetry.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn split_delivery_matches_single_delivery() {
        let repo = Arc::new(MockRepo::with_truck(7, IDENT));
        let (addr, _) = spawn_server(repo.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(handshake(&mut stream, IDENT).await, 0x01);

        // First 10 bytes, then the rest after a pause.
        let packet = encode_packet(Codec::Codec8, &[test_record()]).unwrap();
        stream.write_all(&packet[..10]).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(&packet[10..]).await.unwrap();

        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0, 0, 0, 1]);
        assert_eq!(repo.telemetry.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn corrupt_crc_drops_packet_without_ack() {
        let repo = Arc::new(MockRepo::with_truck(7, IDENT));
        let (addr, counters) = spawn_server(repo.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(handshake(&mut stream, IDENT).await, 0x01);

        let mut packet = encode_packet(Codec::Codec8, &[test_record()]).unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        stream.write_all(&packet).await.unwrap();

        let mut ack = [0u8; 4];
        let read = timeout(Duration::from_millis(300), stream.read_exact(&mut ack)).await;
        assert!(read.is_err(), "no ack may be sent for a corrupt packet");
        assert!(repo.telemetry.lock().unwrap().is_empty());
        assert_eq!(counters.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_identifier_is_accepted_but_never_persisted() {
        let repo = Arc::new(MockRepo::default());
        let (addr, counters) = spawn_server(repo.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(handshake(&mut stream, "999999999999999").await, 0x01);

        let packet = encode_packet(Codec::Codec8, &[test_record()]).unwrap();
        stream.write_all(&packet).await.unwrap();

        let mut ack = [0u8; 4];
        let read = timeout(Duration::from_millis(300), stream.read_exact(&mut ack)).await;
        assert!(read.is_err(), "unauthorized packets are not acked");
        assert!(repo.telemetry.lock().unwrap().is_empty());
        assert_eq!(counters.unauthorized_packets.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_identifier_is_rejected() {
        let repo = Arc::new(MockRepo::default());
        let (addr, _) = spawn_server(repo).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0, 3, b'1', 0x07, b'3']).await.unwrap();

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], 0x00);
    }

    #[tokio::test]
    async fn identifier_pipelined_with_first_packet_still_works() {
        let repo = Arc::new(MockRepo::with_truck(7, IDENT));
        let (addr, _) = spawn_server(repo.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut burst = encode_identifier(IDENT).unwrap();
        burst.extend_from_slice(&encode_packet(Codec::Codec8, &[test_record()]).unwrap());
        stream.write_all(&burst).await.unwrap();

        let mut accept = [0u8; 1];
        stream.read_exact(&mut accept).await.unwrap();
        assert_eq!(accept[0], 0x01);
        let mut ack = [0u8; 4];
        stream.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [0, 0, 0, 1]);
        assert_eq!(repo.telemetry.lock().unwrap().len(), 1);
    }
}
