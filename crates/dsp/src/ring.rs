// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use num_complex::Complex32;

/// Elastic jitter buffer between network ingest and paced consumption.
///
/// One writer (the session read loop) and one reader (the block assembler).
/// A slot holds one complex I/Q pair; all index arithmetic is in sample
/// pairs, never bytes. One slot is kept empty to distinguish full from
/// empty, so `available() + space() + 1 == capacity()` at all times.
///
/// Neither side ever blocks: a write into a full ring drops the sample and
/// bumps `overruns`; a read from an empty ring returns `None` and bumps
/// `underruns`.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    overruns: AtomicU32,
    underruns: AtomicU32,
}

struct Inner {
    buf: Vec<Complex32>,
    write_pos: usize,
    read_pos: usize,
}

impl Inner {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn available(&self) -> usize {
        (self.write_pos + self.buf.len() - self.read_pos) % self.buf.len()
    }
}

impl RingBuffer {
    /// Create a ring holding up to `capacity - 1` sample pairs.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2 slots");
        Self {
            inner: Mutex::new(Inner {
                buf: vec![Complex32::new(0.0, 0.0); capacity],
                write_pos: 0,
                read_pos: 0,
            }),
            overruns: AtomicU32::new(0),
            underruns: AtomicU32::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().unwrap().capacity()
    }

    /// Append one sample pair. Returns false (and counts an overrun) when
    /// the ring is full; the sample is dropped.
    pub fn write(&self, sample: Complex32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.capacity() - inner.available() - 1 < 1 {
            drop(inner);
            self.overruns.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let pos = inner.write_pos;
        inner.buf[pos] = sample;
        inner.write_pos = (pos + 1) % inner.capacity();
        true
    }

    /// Take one sample pair. Returns `None` (and counts an underrun) when
    /// the ring is empty.
    pub fn read(&self) -> Option<Complex32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.available() < 1 {
            drop(inner);
            self.underruns.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let pos = inner.read_pos;
        let sample = inner.buf[pos];
        inner.read_pos = (pos + 1) % inner.capacity();
        Some(sample)
    }

    /// Sample pairs ready to read.
    pub fn available(&self) -> usize {
        self.inner.lock().unwrap().available()
    }

    /// Sample pairs that can still be written.
    pub fn space(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.capacity() - inner.available() - 1
    }

    /// Fill level in [0, 1].
    pub fn fill_level(&self) -> f32 {
        let inner = self.inner.lock().unwrap();
        inner.available() as f32 / inner.capacity() as f32
    }

    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub fn underruns(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Drop all buffered samples. Counters are preserved; use `reset` when
    /// starting a fresh stream.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.read_pos = inner.write_pos;
    }

    /// Re-initialize for a new stream: new capacity, empty, counters
    /// zeroed. Only called while no reader is attached to this ring.
    pub fn reset(&self, capacity: usize) {
        assert!(capacity >= 2, "ring capacity must be at least 2 slots");
        let mut inner = self.inner.lock().unwrap();
        inner.buf = vec![Complex32::new(0.0, 0.0); capacity];
        inner.write_pos = 0;
        inner.read_pos = 0;
        drop(inner);
        self.overruns.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_order() {
        let ring = RingBuffer::new(8);
        for i in 0..5 {
            assert!(ring.write(Complex32::new(i as f32, -(i as f32))));
        }
        assert_eq!(ring.available(), 5);
        for i in 0..5 {
            let s = ring.read().unwrap();
            assert_eq!(s.re, i as f32);
            assert_eq!(s.im, -(i as f32));
        }
        assert!(ring.read().is_none());
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn test_capacity_accounting() {
        let ring = RingBuffer::new(16);
        for _ in 0..7 {
            ring.write(Complex32::new(1.0, 0.0));
        }
        assert_eq!(ring.available() + ring.space() + 1, ring.capacity());
    }

    #[test]
    fn test_overrun_drops_sample() {
        let ring = RingBuffer::new(4);
        assert!(ring.write(Complex32::new(1.0, 0.0)));
        assert!(ring.write(Complex32::new(2.0, 0.0)));
        assert!(ring.write(Complex32::new(3.0, 0.0)));
        // Full now (capacity - 1 usable slots).
        assert!(!ring.write(Complex32::new(4.0, 0.0)));
        assert_eq!(ring.overruns(), 1);
        assert_eq!(ring.available(), 3);
        // The dropped sample never lands.
        assert_eq!(ring.read().unwrap().re, 1.0);
        assert_eq!(ring.read().unwrap().re, 2.0);
        assert_eq!(ring.read().unwrap().re, 3.0);
        assert!(ring.read().is_none());
    }

    #[test]
    fn test_wraparound() {
        let ring = RingBuffer::new(4);
        for round in 0..10 {
            ring.write(Complex32::new(round as f32, 0.0));
            ring.write(Complex32::new(round as f32 + 0.5, 0.0));
            assert_eq!(ring.read().unwrap().re, round as f32);
            assert_eq!(ring.read().unwrap().re, round as f32 + 0.5);
        }
        assert_eq!(ring.overruns(), 0);
        assert_eq!(ring.underruns(), 0);
    }

    #[test]
    fn test_flush_keeps_counters() {
        let ring = RingBuffer::new(8);
        ring.write(Complex32::new(1.0, 1.0));
        ring.read();
        ring.read(); // underrun
        ring.write(Complex32::new(2.0, 2.0));
        ring.flush();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn test_reset_changes_capacity_and_zeroes_counters() {
        let ring = RingBuffer::new(4);
        ring.write(Complex32::new(1.0, 0.0));
        ring.read();
        ring.read(); // underrun
        ring.reset(1024);
        assert_eq!(ring.capacity(), 1024);
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.underruns(), 0);
        for k in 0..1023 {
            assert!(ring.write(Complex32::new(k as f32, 0.0)), "write {}", k);
        }
        assert!(!ring.write(Complex32::new(0.0, 0.0)));
        assert_eq!(ring.overruns(), 1);
    }
}
