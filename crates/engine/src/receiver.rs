// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use ul_dsp::{FrequencyShifter, IqMode, RingBuffer};

use crate::wav::DebugWavRecorder;

/// Fixed receiver ceiling; the engine never grows past it.
pub const MAX_RECEIVERS: usize = 8;

/// Connection lifecycle of one receiver's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Admitting,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Admitting => "admitting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable per-receiver state, all behind the one receiver lock.
///
/// `generation` serializes session turnover: every reconnect bumps it, and
/// the read loop drops frames whose captured generation no longer matches.
pub(crate) struct ReceiverShared {
    pub state: ConnectionState,
    pub active: bool,
    pub generation: u64,
    pub needs_reconnect: bool,
    pub session_id: String,
    pub frequency: u64,
    pub mode: Option<IqMode>,
    pub offset_hz: i32,
    pub shifter: FrequencyShifter,
    pub writer: Option<TcpStream>,
    pub reader_stop: Option<Arc<AtomicBool>>,
    pub read_thread: Option<JoinHandle<()>>,
    pub reconnect_thread: Option<JoinHandle<()>>,
}

impl ReceiverShared {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            active: false,
            generation: 0,
            needs_reconnect: false,
            session_id: String::new(),
            frequency: 14_074_000,
            mode: None,
            offset_hz: 0,
            shifter: FrequencyShifter::new(),
            writer: None,
            reader_stop: None,
            read_thread: None,
            reconnect_thread: None,
        }
    }
}

/// Counters the sample producer publishes and telemetry reads, lock-free.
/// The f32 values travel as raw bits in AtomicU32s.
pub(crate) struct ProducerStats {
    pub samples_received: AtomicU64,
    pub compressed_bytes: AtomicU64,
    pub throughput_bits: AtomicU32,
    pub peak_i_bits: AtomicU32,
    pub peak_q_bits: AtomicU32,
}

impl ProducerStats {
    fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
            throughput_bits: AtomicU32::new(0),
            peak_i_bits: AtomicU32::new(0),
            peak_q_bits: AtomicU32::new(0),
        }
    }

    pub fn reset(&self) {
        self.samples_received.store(0, Ordering::Relaxed);
        self.compressed_bytes.store(0, Ordering::Relaxed);
        self.throughput_bits.store(0, Ordering::Relaxed);
        self.peak_i_bits.store(0, Ordering::Relaxed);
        self.peak_q_bits.store(0, Ordering::Relaxed);
    }

    pub fn throughput_kbps(&self) -> f32 {
        f32::from_bits(self.throughput_bits.load(Ordering::Relaxed))
    }

    pub fn peak_i(&self) -> f32 {
        f32::from_bits(self.peak_i_bits.load(Ordering::Relaxed))
    }

    pub fn peak_q(&self) -> f32 {
        f32::from_bits(self.peak_q_bits.load(Ordering::Relaxed))
    }
}

/// One receiver slot. The ring and stats have interior locking of their
/// own; everything else lives under `shared`.
pub(crate) struct Receiver {
    pub id: usize,
    pub shared: Mutex<ReceiverShared>,
    pub ring: RingBuffer,
    pub stats: ProducerStats,
    pub wav: Mutex<Option<DebugWavRecorder>>,
}

impl Receiver {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            shared: Mutex::new(ReceiverShared::new()),
            // Placeholder until a mode pins the rate; reset at start.
            ring: RingBuffer::new(2),
            stats: ProducerStats::new(),
            wav: Mutex::new(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Reconnecting.as_str(), "reconnecting");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_stats_f32_round_trip() {
        let stats = ProducerStats::new();
        stats
            .throughput_bits
            .store(42.5f32.to_bits(), Ordering::Relaxed);
        assert_eq!(stats.throughput_kbps(), 42.5);
        stats.reset();
        assert_eq!(stats.throughput_kbps(), 0.0);
    }
}
