// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use num_complex::Complex32;

use crate::receiver::{Receiver, MAX_RECEIVERS};
use ul_dsp::block_samples;

const EMPTY: &[Complex32] = &[];

/// One callback's worth of time-aligned blocks, one per active receiver.
///
/// Every block covers the same nominal `block_len / sample_rate` interval
/// counted from the moment the assembler first had an active receiver.
/// Inactive slots hold empty slices; consult `is_active` or the mask.
pub struct BlockSet<'a> {
    active_mask: u32,
    sample_rate: u32,
    block_len: usize,
    blocks: [&'a [Complex32]; MAX_RECEIVERS],
}

impl<'a> BlockSet<'a> {
    pub fn active_mask(&self) -> u32 {
        self.active_mask
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn is_active(&self, rx: usize) -> bool {
        rx < MAX_RECEIVERS && self.active_mask & (1 << rx) != 0
    }

    /// Block for receiver `rx`; empty when the receiver is inactive.
    pub fn block(&self, rx: usize) -> &'a [Complex32] {
        if self.is_active(rx) {
            self.blocks[rx]
        } else {
            EMPTY
        }
    }
}

pub type BlockCallback = Box<dyn FnMut(&BlockSet) + Send>;

/// Barrier bookkeeping shared between the pacing thread and the
/// supervisor. Held only for the short critical sections around
/// activation and block completion.
pub(crate) struct BarrierState {
    pub active_mask: u32,
    pub filled_mask: u32,
    /// Receivers whose counter and bucket must be re-zeroed before their
    /// next tick (set on activation).
    pub pending_reset: u32,
    pub sample_rate: u32,
    pub block_len: usize,
    /// Bumped when the rate changes; the pacing thread reallocates its
    /// block buffers when it notices.
    pub epoch: u64,
}

pub(crate) struct AssemblerShared {
    pub barrier: Mutex<BarrierState>,
    pub callback: Mutex<Option<BlockCallback>>,
    pub total_callbacks: AtomicU64,
    pub total_samples: AtomicU64,
    pub stop: AtomicBool,
}

impl AssemblerShared {
    pub fn new() -> Self {
        Self {
            barrier: Mutex::new(BarrierState {
                active_mask: 0,
                filled_mask: 0,
                pending_reset: 0,
                sample_rate: 0,
                block_len: 0,
                epoch: 0,
            }),
            callback: Mutex::new(None),
            total_callbacks: AtomicU64::new(0),
            total_samples: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        }
    }

    /// Pin the stream rate. Only valid while no receiver is enrolled.
    pub fn configure(&self, sample_rate: u32) {
        let block_len = block_samples(sample_rate);
        // A zero-length block would make the barrier meaningless; that is
        // a bug in the caller, not a runtime condition.
        assert!(block_len > 0, "block length must be positive");
        let mut barrier = self.barrier.lock().unwrap();
        assert_eq!(
            barrier.active_mask, 0,
            "rate change with receivers enrolled"
        );
        barrier.sample_rate = sample_rate;
        barrier.block_len = block_len;
        barrier.filled_mask = 0;
        barrier.pending_reset = 0;
        barrier.epoch += 1;
        log::info!(
            "assembler configured: {} Hz, {} samples per block",
            sample_rate,
            block_len
        );
    }

    /// Enroll a receiver in the barrier with a fresh counter and bucket 0.
    pub fn activate(&self, rx: usize) {
        let bit = 1u32 << rx;
        let mut barrier = self.barrier.lock().unwrap();
        barrier.active_mask |= bit;
        barrier.filled_mask &= !bit;
        barrier.pending_reset |= bit;
    }

    /// Withdraw a receiver without disturbing the others' progress.
    pub fn deactivate(&self, rx: usize) {
        let bit = 1u32 << rx;
        let mut barrier = self.barrier.lock().unwrap();
        barrier.active_mask &= !bit;
        barrier.filled_mask &= !bit;
        barrier.pending_reset &= !bit;
    }

    pub fn install_callback(&self, callback: BlockCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }
}

/// The pacing loop. One tick reads one sample per active receiver; ticks
/// are scheduled against the monotonic clock at exactly the sample rate.
pub(crate) fn run(shared: Arc<AssemblerShared>, receivers: Vec<Arc<Receiver>>) {
    let mut bufs: Vec<[Vec<Complex32>; 2]> =
        (0..MAX_RECEIVERS).map(|_| [Vec::new(), Vec::new()]).collect();
    let mut counts = [0usize; MAX_RECEIVERS];
    let mut buckets = [0u8; MAX_RECEIVERS];
    let mut epoch_seen = 0u64;
    let mut t0: Option<Instant> = None;
    let mut samples_done: u64 = 0;
    let mut last_lag_warn: Option<Instant> = None;

    while !shared.stop.load(Ordering::Relaxed) {
        let (active_mask, sample_rate, block_len) = {
            let mut barrier = shared.barrier.lock().unwrap();
            if barrier.epoch != epoch_seen {
                epoch_seen = barrier.epoch;
                for pair in bufs.iter_mut() {
                    pair[0] = vec![Complex32::new(0.0, 0.0); barrier.block_len];
                    pair[1] = vec![Complex32::new(0.0, 0.0); barrier.block_len];
                }
                counts = [0; MAX_RECEIVERS];
                buckets = [0; MAX_RECEIVERS];
            }
            if barrier.pending_reset != 0 {
                for rx in 0..MAX_RECEIVERS {
                    if barrier.pending_reset & (1 << rx) != 0 {
                        counts[rx] = 0;
                        buckets[rx] = 0;
                    }
                }
                barrier.pending_reset = 0;
            }
            (barrier.active_mask, barrier.sample_rate, barrier.block_len)
        };

        if active_mask == 0 {
            // Idle: nothing enrolled, nothing to pace.
            t0 = None;
            samples_done = 0;
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        if t0.is_none() {
            samples_done = 0;
            t0 = Some(Instant::now());
            log::info!("assembler pacing started at {} Hz", sample_rate);
        }
        pace(t0.unwrap(), samples_done, sample_rate, &mut last_lag_warn);

        for rx in 0..MAX_RECEIVERS {
            if active_mask & (1 << rx) == 0 {
                continue;
            }

            // An empty ring yields silence so a stalled receiver cannot
            // hold the others up; the underrun counter keeps score.
            let sample = receivers[rx]
                .ring
                .read()
                .unwrap_or(Complex32::new(0.0, 0.0));
            let sample = {
                let mut shared_rx = receivers[rx].shared.lock().unwrap();
                shared_rx.shifter.execute(sample)
            };

            bufs[rx][buckets[rx] as usize][counts[rx]] = sample;
            counts[rx] += 1;
            if counts[rx] < block_len {
                continue;
            }
            counts[rx] = 0;

            let mut fire_mask = 0u32;
            {
                let mut barrier = shared.barrier.lock().unwrap();
                let bit = 1u32 << rx;
                if barrier.filled_mask & bit == 0 {
                    barrier.filled_mask |= bit;
                    buckets[rx] ^= 1;
                }
                // A receiver that fills again before the barrier releases
                // keeps writing into its current in-buffer; the bit stays.

                if barrier.filled_mask & !barrier.active_mask != 0 {
                    log::error!(
                        "barrier corrupt: filled 0x{:02x} outside active 0x{:02x}",
                        barrier.filled_mask,
                        barrier.active_mask
                    );
                    panic!("assembler barrier invariant violated");
                }
                if barrier.active_mask != 0 && barrier.filled_mask == barrier.active_mask {
                    fire_mask = barrier.active_mask;
                    barrier.filled_mask = 0;
                }
            }

            if fire_mask != 0 {
                shared.total_callbacks.fetch_add(1, Ordering::Relaxed);
                shared
                    .total_samples
                    .fetch_add(block_len as u64, Ordering::Relaxed);

                let mut callback = shared.callback.lock().unwrap();
                if let Some(callback) = callback.as_mut() {
                    let mut blocks: [&[Complex32]; MAX_RECEIVERS] = [EMPTY; MAX_RECEIVERS];
                    for (j, block) in blocks.iter_mut().enumerate() {
                        if fire_mask & (1 << j) != 0 {
                            // The bucket points at the in-buffer; its twin
                            // is the block just completed.
                            *block = &bufs[j][(buckets[j] ^ 1) as usize][..];
                        }
                    }
                    callback(&BlockSet {
                        active_mask: fire_mask,
                        sample_rate,
                        block_len,
                        blocks,
                    });
                }
            }
        }

        samples_done += 1;
    }
    log::debug!("assembler stopped");
}

/// Sleep, then spin, until the wall clock reaches sample `n`'s deadline.
/// Running late is never compensated by reading faster; the loop simply
/// stops waiting, and a rate-limited warning fires past 10 ms of lag.
fn pace(start: Instant, n: u64, sample_rate: u32, last_warn: &mut Option<Instant>) {
    let nanos = n as u128 * 1_000_000_000u128 / sample_rate as u128;
    let target = start + Duration::from_nanos(nanos as u64);

    loop {
        let now = Instant::now();
        if now >= target {
            let behind = now - target;
            if behind > Duration::from_millis(10)
                && last_warn.map_or(true, |w| w.elapsed() >= Duration::from_secs(1))
            {
                log::warn!("assembler falling behind by {} us", behind.as_micros());
                *last_warn = Some(now);
            }
            return;
        }
        if target - now > Duration::from_millis(1) {
            thread::sleep(Duration::from_millis(1));
        } else {
            while Instant::now() < target {
                thread::yield_now();
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use ul_dsp::FrequencyShifter;

    fn setup(rate: u32) -> (Arc<AssemblerShared>, Vec<Arc<Receiver>>) {
        let shared = Arc::new(AssemblerShared::new());
        let receivers: Vec<Arc<Receiver>> =
            (0..MAX_RECEIVERS).map(|id| Arc::new(Receiver::new(id))).collect();
        shared.configure(rate);
        (shared, receivers)
    }

    fn run_for(
        shared: &Arc<AssemblerShared>,
        receivers: &[Arc<Receiver>],
        duration: Duration,
    ) {
        let shared2 = shared.clone();
        let receivers2 = receivers.to_vec();
        let handle = thread::spawn(move || run(shared2, receivers2));
        thread::sleep(duration);
        shared.stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
    }

    #[test]
    fn test_two_receiver_barrier_alignment() {
        let (shared, receivers) = setup(48_000);
        receivers[0].ring.reset(96_000);
        receivers[1].ring.reset(96_000);
        // 4 blocks of real data per receiver, distinct constants.
        for _ in 0..(4 * 512) {
            receivers[0].ring.write(Complex32::new(0.25, 0.0));
            receivers[1].ring.write(Complex32::new(-0.5, 0.5));
        }

        let seen: Arc<Mutex<Vec<(u32, usize, Complex32, Complex32)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        shared.install_callback(Box::new(move |set: &BlockSet| {
            seen2.lock().unwrap().push((
                set.active_mask(),
                set.block(0).len(),
                set.block(0)[0],
                set.block(1)[0],
            ));
        }));
        shared.activate(0);
        shared.activate(1);

        // 4 data blocks span ~42.7 ms; run for 120 ms.
        run_for(&shared, &receivers, Duration::from_millis(120));

        let seen = seen.lock().unwrap();
        assert!(seen.len() >= 4, "only {} callbacks", seen.len());
        for (mask, len, s0, s1) in seen.iter().take(4) {
            assert_eq!(*mask, 0b11);
            assert_eq!(*len, 512);
            assert_eq!(*s0, Complex32::new(0.25, 0.0));
            assert_eq!(*s1, Complex32::new(-0.5, 0.5));
        }
        // Once the rings drain, underruns substitute silence and the
        // cadence continues.
        let last = seen.last().unwrap();
        assert_eq!(last.2, Complex32::new(0.0, 0.0));
        assert!(receivers[0].ring.underruns() > 0);
    }

    #[test]
    fn test_pacing_rate_is_nominal() {
        let (shared, receivers) = setup(48_000);
        receivers[0].ring.reset(96_000);

        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        shared.install_callback(Box::new(move |_set: &BlockSet| {
            count2.fetch_add(1, Ordering::Relaxed);
        }));
        shared.activate(0);

        run_for(&shared, &receivers, Duration::from_millis(500));

        // 93.75 blocks/s over 0.5 s is ~46.9; allow scheduler slack.
        let n = count.load(Ordering::Relaxed);
        assert!(
            (40..=50).contains(&n),
            "expected ~47 callbacks in 0.5 s, got {}",
            n
        );
    }

    #[test]
    fn test_deactivation_releases_barrier() {
        let (shared, receivers) = setup(48_000);
        receivers[0].ring.reset(96_000);
        receivers[2].ring.reset(96_000);

        let masks: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let masks2 = masks.clone();
        shared.install_callback(Box::new(move |set: &BlockSet| {
            masks2.lock().unwrap().push(set.active_mask());
        }));
        shared.activate(0);
        shared.activate(2);

        let shared2 = shared.clone();
        let receivers2 = receivers.clone();
        let handle = thread::spawn(move || run(shared2, receivers2));
        thread::sleep(Duration::from_millis(100));
        shared.deactivate(2);
        thread::sleep(Duration::from_millis(100));
        shared.stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let masks = masks.lock().unwrap();
        assert!(masks.contains(&0b101), "no two-receiver callbacks seen");
        assert!(
            masks.iter().any(|&m| m == 0b001),
            "callbacks did not continue after deactivation"
        );
        // The withdrawn receiver never reappears.
        let after = masks.iter().rposition(|&m| m == 0b101).unwrap();
        assert!(masks[after + 1..].iter().all(|&m| m == 0b001));
    }

    #[test]
    fn test_shifted_tone_lands_in_block() {
        let (shared, receivers) = setup(48_000);
        receivers[0].ring.reset(96_000);
        // 1 kHz tone, one block's worth.
        for k in 0..512u32 {
            let phi = 2.0 * PI * 1000.0 * k as f64 / 48_000.0;
            receivers[0]
                .ring
                .write(Complex32::new(phi.cos() as f32, phi.sin() as f32));
        }
        {
            let mut rx = receivers[0].shared.lock().unwrap();
            rx.shifter
                .set_increment(FrequencyShifter::increment_for(500, 48_000));
        }

        let first: Arc<Mutex<Option<Vec<Complex32>>>> = Arc::new(Mutex::new(None));
        let first2 = first.clone();
        shared.install_callback(Box::new(move |set: &BlockSet| {
            let mut slot = first2.lock().unwrap();
            if slot.is_none() {
                *slot = Some(set.block(0).to_vec());
            }
        }));
        shared.activate(0);

        run_for(&shared, &receivers, Duration::from_millis(50));

        let block = first.lock().unwrap().take().expect("no callback fired");
        // A +500 Hz offset moves the 1 kHz tone down to 500 Hz.
        for (k, sample) in block.iter().enumerate().take(64) {
            let phi = 2.0 * PI * 500.0 * k as f64 / 48_000.0;
            assert!(
                (sample.re - phi.cos() as f32).abs() < 1e-3
                    && (sample.im - phi.sin() as f32).abs() < 1e-3,
                "sample {} off: ({}, {})",
                k,
                sample.re,
                sample.im
            );
        }
    }
}
