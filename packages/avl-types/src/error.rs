use thiserror::Error;

/// Decode failures, one variant per rejection cause so the session layer
/// can log and count them distinctly.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("bad preamble {0:#010x} (expected 0x00000000)")]
    BadPreamble(u32),

    #[error("packet too short: {len} bytes, need {need}")]
    ShortPacket { len: usize, need: usize },

    #[error("unsupported codec id {0:#04x}")]
    UnsupportedCodec(u8),

    #[error("record count mismatch: header says {header}, trailer says {trailer}")]
    RecordCountMismatch { header: u8, trailer: u8 },

    #[error("truncated record stream at offset {offset} (data region ends at {end})")]
    Truncated { offset: usize, end: usize },

    #[error("crc mismatch: computed {computed:#06x}, received {received:#010x}")]
    BadCrc { computed: u16, received: u32 },

    #[error("bad device identifier frame: {0}")]
    BadIdentifier(&'static str),
}

/// Encode failures. Codec8 cannot carry everything Codec8-Extended can.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("io element id {0} does not fit in a Codec8 1-byte id")]
    IdTooWide(u16),

    #[error("variable-width io elements require Codec8-Extended")]
    VariableNeedsExtended,

    #[error("too many records for one packet: {0} (max 255)")]
    TooManyRecords(usize),

    #[error("device identifier must be 1..=64 printable ASCII bytes")]
    BadIdentifier,
}
