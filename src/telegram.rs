//! Multi-line telegrams assembled from delimited frames.
//!
//! Smart meters (DSMR P1 and similar) push a readout as a block of lines:
//!
//! ```text
//! /ISK5\2M550T-1012
//!
//! 1-0:1.8.1(001234.567*kWh)
//! 1-0:2.8.1(000012.345*kWh)
//! !7B1C
//! ```
//!
//! [`TelegramAssembler`] takes the device's line frames one by one, starts a new
//! telegram at every line beginning with the start marker, and completes it at
//! the line beginning with the end marker. With [`TelegramChecksum::Crc16`] the
//! four hex digits after the end marker must match the CRC-16/ARC of everything
//! from the start marker up to and including the end marker.

use bytes::{Bytes, BytesMut};
use crc::{Crc, CRC_16_ARC};

use crate::codec::Frame;
use crate::config::{TelegramChecksum, TelegramConfig};

/// CRC used by P1 telegrams
const TELEGRAM_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC-16/ARC of `data`
pub fn crc16(data: &[u8]) -> u16 {
    TELEGRAM_CRC.checksum(data)
}

/// Result of adding one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramOutcome {
    /// A verified telegram, all lines included
    Complete(Frame),
    /// More lines are needed
    Incomplete,
    /// The telegram was dropped
    Rejected(String),
}

/// Collects lines into telegrams
#[derive(Debug)]
pub struct TelegramAssembler {
    config: TelegramConfig,
    buf: BytesMut,
    in_telegram: bool,
}

impl TelegramAssembler {
    /// Assembler for telegrams shaped like `config`
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            buf: BytesMut::new(),
            in_telegram: false,
        }
    }

    /// Forget any partial telegram
    pub fn reset(&mut self) {
        self.buf.clear();
        self.in_telegram = false;
    }

    /// Whether a telegram has been started but not finished
    pub fn in_progress(&self) -> bool {
        self.in_telegram
    }

    /// Add the next line frame read from the device
    pub fn push(&mut self, line: &Frame) -> TelegramOutcome {
        let line = &line.payload[..];

        if line.starts_with(self.config.start.as_bytes()) {
            self.buf.clear();
            self.in_telegram = true;
        } else if !self.in_telegram {
            // Tail of a telegram whose start was missed.
            return TelegramOutcome::Incomplete;
        }

        if self.buf.len() + line.len() > self.config.max_bytes {
            self.reset();
            return TelegramOutcome::Rejected(format!(
                "telegram exceeds {} bytes",
                self.config.max_bytes
            ));
        }
        self.buf.extend_from_slice(line);

        if !line.starts_with(self.config.end.as_bytes()) {
            return TelegramOutcome::Incomplete;
        }

        let telegram = self.buf.split().freeze();
        self.in_telegram = false;
        let body_len = telegram.len() - line.len() + self.config.end.len();

        match self.config.checksum {
            TelegramChecksum::None => TelegramOutcome::Complete(Frame::from_device(telegram)),
            TelegramChecksum::Crc16 => match verify_crc16(&telegram, body_len) {
                Ok(()) => TelegramOutcome::Complete(Frame::from_device(telegram)),
                Err(reason) => TelegramOutcome::Rejected(reason),
            },
        }
    }
}

/// Check the hex CRC that follows `telegram[..body_len]`
fn verify_crc16(telegram: &Bytes, body_len: usize) -> Result<(), String> {
    let given = std::str::from_utf8(&telegram[body_len..])
        .ok()
        .map(str::trim)
        .and_then(|digits| u16::from_str_radix(digits, 16).ok())
        .ok_or_else(|| "telegram checksum missing or not hex".to_string())?;

    let computed = crc16(&telegram[..body_len]);
    if given != computed {
        return Err(format!(
            "telegram checksum mismatch: given {:04X}, computed {:04X}",
            given, computed
        ));
    }
    Ok(())
}
