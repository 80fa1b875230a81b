//! Modbus RTU frame inspection.
//!
//! Frames arrive already delimited by the idle-gap reader; this module
//! validates the CRC trailer and produces the structural summary that
//! drives logging, slave detection and register decoding.

use std::fmt;

/// CRC-16/MODBUS over `data` (polynomial 0xA001, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Structural breakdown of one delimited frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSummary {
    pub length: usize,

    /// First byte; the RTU slave address.
    pub slave_id: Option<u8>,

    pub function_code: Option<u8>,

    /// Payload bytes between the header and the CRC trailer.
    pub data_len: usize,

    /// Third byte, meaningful for read responses carrying a payload.
    pub byte_count: Option<u8>,

    /// CRC received in the trailer (little-endian on the wire).
    pub crc_received: Option<u16>,

    /// None when the frame is too short to carry a trailer.
    pub crc_valid: Option<bool>,
}

impl FrameSummary {
    pub fn is_valid(&self) -> bool {
        self.crc_valid == Some(true)
    }
}

/// Summarize a delimited frame. Never fails; short or garbled input
/// yields a summary with the unknown fields absent.
pub fn summarize(frame: &[u8]) -> FrameSummary {
    let length = frame.len();
    let slave_id = frame.first().copied();
    let function_code = frame.get(1).copied();
    let data_len = length.saturating_sub(4);
    let byte_count = if data_len > 0 { frame.get(2).copied() } else { None };

    let (crc_received, crc_valid) = if length >= 4 {
        let received = u16::from_le_bytes([frame[length - 2], frame[length - 1]]);
        let computed = crc16(&frame[..length - 2]);
        (Some(received), Some(received == computed))
    } else {
        (None, None)
    };

    FrameSummary {
        length,
        slave_id,
        function_code,
        data_len,
        byte_count,
        crc_received,
        crc_valid,
    }
}

impl fmt::Display for FrameSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.length == 0 {
            return write!(f, "empty frame");
        }
        write!(f, "len={}", self.length)?;
        if let Some(addr) = self.slave_id {
            write!(f, " addr={addr}")?;
        }
        if let Some(func) = self.function_code {
            write!(f, " func=0x{func:02X}")?;
        }
        write!(f, " data_len={}", self.data_len)?;
        if let Some(bc) = self.byte_count {
            write!(f, " byte_count={bc}")?;
        }
        match (self.crc_received, self.crc_valid) {
            (Some(crc), Some(true)) => write!(f, " crc=0x{crc:04X} (ok)"),
            (Some(crc), Some(false)) => write!(f, " crc=0x{crc:04X} (bad)"),
            _ => write!(f, " crc=n/a"),
        }
    }
}

/// Uppercase hex dump with space-separated bytes, e.g. `01 03 02 00 2A`.
pub fn to_hex(frame: &[u8]) -> String {
    let mut out = String::with_capacity(frame.len() * 3);
    for (i, byte) in frame.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Space-separated decimal byte values, e.g. `1 3 2 0 42`.
pub fn decimal_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&byte.to_string());
    }
    out
}

/// Both big-endian interpretations of each 16-bit word in the payload.
///
/// Returns one line per word, `u16be=<v>, i16be=<v>`, prefixed with
/// the word index when the payload spans several registers. Used for
/// the diagnostic dump of responses whose register map is unknown.
pub fn register_parser_lines(data: &[u8]) -> Vec<String> {
    if data.len() % 2 != 0 {
        return Vec::new();
    }
    let words: Vec<String> = data
        .chunks_exact(2)
        .map(|pair| {
            let raw = u16::from_be_bytes([pair[0], pair[1]]);
            format!("u16be={}, i16be={}", raw, raw as i16)
        })
        .collect();
    if words.len() == 1 {
        return words;
    }
    words
        .into_iter()
        .enumerate()
        .map(|(i, word)| format!("[{i}] {word}"))
        .collect()
}
