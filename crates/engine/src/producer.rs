// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use num_complex::Complex32;

use ul_wire::PayloadDecoder;

use crate::receiver::Receiver;

/// Peak meters publish on this cadence, decaying between publications.
const PEAK_PUBLISH_MS: u64 = 100;
const PEAK_DECAY: f32 = 0.7;

/// Throughput window over compressed payload bytes.
const THROUGHPUT_WINDOW_MS: u64 = 1000;

/// Per-session ingest stage: decodes payloads, tracks peak levels and
/// network throughput, and writes samples into the receiver's ring.
///
/// Lives on the session's read thread; one producer per connection, so a
/// reconnect replaces it wholesale.
pub(crate) struct SampleProducer {
    receiver: Arc<Receiver>,
    decoder: PayloadDecoder,
    swap_iq: bool,
    scratch: Vec<Complex32>,
    peak_i: f32,
    peak_q: f32,
    last_peak_publish: Instant,
    window_start: Instant,
    window_bytes: u64,
    decode_errors: u32,
}

impl SampleProducer {
    pub fn new(receiver: Arc<Receiver>, decoder: PayloadDecoder, swap_iq: bool) -> Self {
        let now = Instant::now();
        Self {
            receiver,
            decoder,
            swap_iq,
            scratch: Vec::new(),
            peak_i: 0.0,
            peak_q: 0.0,
            last_peak_publish: now,
            window_start: now,
            window_bytes: 0,
            decode_errors: 0,
        }
    }

    /// One binary WebSocket payload in the session's negotiated format.
    /// A codec failure drops this packet only.
    pub fn ingest_binary(&mut self, payload: &[u8]) {
        self.count_bytes(payload.len());
        let mut scratch = std::mem::take(&mut self.scratch);
        match self.decoder.decode(payload, &mut scratch) {
            Ok(()) => self.push_samples(&scratch),
            Err(e) => {
                self.decode_errors += 1;
                log::warn!(
                    "receiver {}: dropping undecodable packet ({}), {} so far",
                    self.receiver.id,
                    e,
                    self.decode_errors
                );
            }
        }
        self.scratch = scratch;
    }

    /// Legacy JSON transport: base64 int16 pairs inside a text message.
    pub fn ingest_legacy(&mut self, data: &str) {
        self.count_bytes(data.len());
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        match PayloadDecoder::decode_legacy_audio(data, &mut scratch) {
            Ok(()) => self.push_samples(&scratch),
            Err(e) => {
                self.decode_errors += 1;
                log::warn!("receiver {}: bad legacy audio message: {}", self.receiver.id, e);
            }
        }
        self.scratch = scratch;
    }

    fn push_samples(&mut self, samples: &[Complex32]) {
        if samples.is_empty() {
            return;
        }
        let mut wav = self.receiver.wav.lock().unwrap();
        for &sample in samples {
            let sample = if self.swap_iq {
                Complex32::new(sample.im, sample.re)
            } else {
                sample
            };
            if sample.re.abs() > self.peak_i {
                self.peak_i = sample.re.abs();
            }
            if sample.im.abs() > self.peak_q {
                self.peak_q = sample.im.abs();
            }
            if let Some(rec) = wav.as_mut() {
                rec.push(sample.re, sample.im);
            }
            // A full ring drops the sample; the overrun counter tracks it.
            self.receiver.ring.write(sample);
        }
        drop(wav);

        self.receiver
            .stats
            .samples_received
            .fetch_add(samples.len() as u64, Ordering::Relaxed);
        self.publish_peaks();
    }

    fn count_bytes(&mut self, compressed_len: usize) {
        self.window_bytes += compressed_len as u64;
        self.receiver
            .stats
            .compressed_bytes
            .fetch_add(compressed_len as u64, Ordering::Relaxed);

        let elapsed = self.window_start.elapsed();
        if elapsed.as_millis() as u64 >= THROUGHPUT_WINDOW_MS {
            let kbps = self.window_bytes as f32 / 1024.0 / elapsed.as_secs_f32();
            self.receiver
                .stats
                .throughput_bits
                .store(kbps.to_bits(), Ordering::Relaxed);
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }

    fn publish_peaks(&mut self) {
        if self.last_peak_publish.elapsed().as_millis() as u64 >= PEAK_PUBLISH_MS {
            self.receiver
                .stats
                .peak_i_bits
                .store(self.peak_i.to_bits(), Ordering::Relaxed);
            self.receiver
                .stats
                .peak_q_bits
                .store(self.peak_q.to_bits(), Ordering::Relaxed);
            self.peak_i *= PEAK_DECAY;
            self.peak_q *= PEAK_DECAY;
            self.last_peak_publish = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ul_wire::StreamFormat;

    fn producer(swap_iq: bool) -> (Arc<Receiver>, SampleProducer) {
        let receiver = Arc::new(Receiver::new(0));
        receiver.ring.reset(1024);
        let decoder = PayloadDecoder::new(StreamFormat::PcmZstd, 48_000).unwrap();
        let producer = SampleProducer::new(receiver.clone(), decoder, swap_iq);
        (receiver, producer)
    }

    #[test]
    fn test_legacy_samples_land_in_ring() {
        use base64::Engine as _;
        let (receiver, mut producer) = producer(false);
        // Two BE pairs: (0x2000, 0xE000) = (8192, -8192), (0, 16384).
        let bytes: [u8; 8] = [0x20, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x40, 0x00];
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        producer.ingest_legacy(&b64);

        assert_eq!(receiver.stats.samples_received.load(Ordering::Relaxed), 2);
        let s0 = receiver.ring.read().unwrap();
        assert!((s0.re - 0.25).abs() < 1e-6);
        assert!((s0.im + 0.25).abs() < 1e-6);
        let s1 = receiver.ring.read().unwrap();
        assert!((s1.im - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_swap_iq() {
        use base64::Engine as _;
        let (receiver, mut producer) = producer(true);
        let bytes: [u8; 4] = [0x20, 0x00, 0x00, 0x00]; // (8192, 0)
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        producer.ingest_legacy(&b64);
        let s = receiver.ring.read().unwrap();
        assert_eq!(s.re, 0.0);
        assert!((s.im - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_bad_packet_dropped_without_samples() {
        let (receiver, mut producer) = producer(false);
        producer.ingest_binary(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(receiver.stats.samples_received.load(Ordering::Relaxed), 0);
        // Compressed bytes are still network traffic and still counted.
        assert_eq!(receiver.stats.compressed_bytes.load(Ordering::Relaxed), 4);
    }
}
