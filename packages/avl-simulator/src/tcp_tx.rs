//! tcp_tx.rs — TCP transmitter for Codec8 packets
//!
//! One connection per simulated device, exactly as a real tracker behaves:
//! identification frame first, then a stream of packets, each of which
//! must be acknowledged with the packet's record count before the next
//! one goes out.

use avl_types::{encode_identifier, encode_packet, AvlRecord, Codec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

pub struct TcpTransmitter {
    stream: TcpStream,
    identifier: String,
}

impl TcpTransmitter {
    /// Connect and perform the identification handshake.
    pub async fn connect(addr: &str, identifier: &str) -> anyhow::Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(&encode_identifier(identifier)?).await?;

        let mut ack = [0u8; 1];
        stream.read_exact(&mut ack).await?;
        anyhow::ensure!(ack[0] == 0x01, "server rejected identifier {identifier}");
        debug!("{identifier}: accepted by {addr}");

        Ok(Self {
            stream,
            identifier: identifier.to_string(),
        })
    }

    /// Send one packet and wait for its 4-byte record-count ACK.
    /// Returns the acknowledged count; a mismatch means the server and
    /// device disagree about the packet and the caller should resend.
    pub async fn send_packet(&mut self, codec: Codec, records: &[AvlRecord]) -> anyhow::Result<u32> {
        let bytes = encode_packet(codec, records)?;
        self.stream.write_all(&bytes).await?;

        let mut ack = [0u8; 4];
        self.stream.read_exact(&mut ack).await?;
        let acked = u32::from_be_bytes(ack);
        debug!(
            "{}: {} record(s) sent, {} acked",
            self.identifier,
            records.len(),
            acked
        );
        Ok(acked)
    }
}
