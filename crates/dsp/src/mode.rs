// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::str::FromStr;

/// Delivery cadence of the downstream block API, in blocks per second.
///
/// This constant only sizes the block handed to the consumer callback
/// (`block_samples`); pacing is done per sample period against the
/// monotonic clock, never against this cadence. At the supported rates
/// it yields power-of-two block lengths (512/1024/2048/4096).
pub const BLOCKS_PER_SEC: f64 = 93.75;

/// IQ stream mode offered by the server, one per sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqMode {
    Iq48,
    Iq96,
    Iq192,
    Iq384,
}

impl IqMode {
    /// Sample rate of the stream in Hz.
    pub fn sample_rate(self) -> u32 {
        match self {
            IqMode::Iq48 => 48_000,
            IqMode::Iq96 => 96_000,
            IqMode::Iq192 => 192_000,
            IqMode::Iq384 => 384_000,
        }
    }

    /// Mode tag as it appears in the WebSocket URL and tune messages.
    pub fn as_str(self) -> &'static str {
        match self {
            IqMode::Iq48 => "iq48",
            IqMode::Iq96 => "iq96",
            IqMode::Iq192 => "iq192",
            IqMode::Iq384 => "iq384",
        }
    }
}

impl FromStr for IqMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "iq48" => Ok(IqMode::Iq48),
            "iq96" => Ok(IqMode::Iq96),
            "iq192" => Ok(IqMode::Iq192),
            "iq384" => Ok(IqMode::Iq384),
            other => Err(format!(
                "unknown IQ mode: {} (use iq48, iq96, iq192, or iq384)",
                other
            )),
        }
    }
}

impl fmt::Display for IqMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Number of complex samples in one delivery block at the given rate.
pub fn block_samples(sample_rate: u32) -> usize {
    (sample_rate as f64 / BLOCKS_PER_SEC) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_rates() {
        assert_eq!(IqMode::Iq48.sample_rate(), 48_000);
        assert_eq!(IqMode::Iq96.sample_rate(), 96_000);
        assert_eq!(IqMode::Iq192.sample_rate(), 192_000);
        assert_eq!(IqMode::Iq384.sample_rate(), 384_000);
    }

    #[test]
    fn test_block_sizes_are_power_of_two() {
        for mode in [IqMode::Iq48, IqMode::Iq96, IqMode::Iq192, IqMode::Iq384] {
            let b = block_samples(mode.sample_rate());
            assert!(b.is_power_of_two(), "{}: block {} not 2^n", mode, b);
        }
        assert_eq!(block_samples(96_000), 1024);
    }

    #[test]
    fn test_mode_round_trip() {
        assert_eq!("iq192".parse::<IqMode>().unwrap(), IqMode::Iq192);
        assert!("usb".parse::<IqMode>().is_err());
    }
}
