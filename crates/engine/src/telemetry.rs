// Copyright 2025-2026 CEMAXECUTER LLC

use crate::receiver::ConnectionState;
use ul_dsp::IqMode;

/// Read-only snapshot of one receiver.
#[derive(Debug, Clone)]
pub struct ReceiverStatus {
    pub id: usize,
    pub active: bool,
    pub state: ConnectionState,
    pub frequency: u64,
    pub mode: Option<IqMode>,
    pub session_id: String,
    pub samples_received: u64,
    pub compressed_bytes_received: u64,
    /// Network throughput over the last second, compressed bytes, KiB/s.
    pub throughput_kbps: f32,
    pub peak_i: f32,
    pub peak_q: f32,
    pub ring_fill: f32,
    pub ring_overruns: u32,
    pub ring_underruns: u32,
    pub ring_capacity: u32,
}

/// Engine-wide snapshot returned by `Engine::read_status`.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub receivers: Vec<ReceiverStatus>,
    pub total_callbacks: u64,
    pub total_samples: u64,
    pub uptime_ms: u64,
    pub active_count: u8,
    /// Zero until the first receiver pins the rate.
    pub sample_rate: u32,
    pub block_size: u32,
}

impl EngineStatus {
    /// Bitmask of active receivers, bit `i` for receiver `i`.
    pub fn active_mask(&self) -> u32 {
        self.receivers
            .iter()
            .filter(|r| r.active)
            .fold(0, |mask, r| mask | (1 << r.id))
    }
}
