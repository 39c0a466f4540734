// Copyright 2025-2026 CEMAXECUTER LLC

use std::f64::consts::PI;

use num_complex::Complex32;

/// Software frequency shifter: rotates each sample by an accumulating
/// phase to translate the spectrum without retuning the radio.
///
/// The increment is negated relative to the requested offset: a positive
/// offset in Hz moves the spectrum down by that amount. A zero increment
/// is a bypass and leaves samples untouched.
pub struct FrequencyShifter {
    phase: f64,
    increment: f64,
}

impl FrequencyShifter {
    pub fn new() -> Self {
        Self {
            phase: 0.0,
            increment: 0.0,
        }
    }

    /// Phase increment for a given offset at the current stream rate.
    pub fn increment_for(offset_hz: i32, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        -2.0 * PI * offset_hz as f64 / sample_rate as f64
    }

    /// Install a new increment. The accumulator is kept so an offset
    /// change mid-stream does not introduce a phase jump.
    pub fn set_increment(&mut self, increment: f64) {
        self.increment = increment;
    }

    pub fn increment(&self) -> f64 {
        self.increment
    }

    /// Reset the accumulator for a fresh stream.
    pub fn reset(&mut self) {
        self.phase = 0.0;
    }

    /// Rotate one sample and advance the accumulator.
    pub fn execute(&mut self, sample: Complex32) -> Complex32 {
        if self.increment == 0.0 {
            return sample;
        }
        let (sin, cos) = self.phase.sin_cos();
        let out = Complex32::new(
            (sample.re as f64 * cos - sample.im as f64 * sin) as f32,
            (sample.re as f64 * sin + sample.im as f64 * cos) as f32,
        );
        self.phase += self.increment;
        // Wrap to (-2pi, 2pi] so the accumulator never loses precision.
        if self.phase > 2.0 * PI {
            self.phase -= 2.0 * PI;
        } else if self.phase < -2.0 * PI {
            self.phase += 2.0 * PI;
        }
        out
    }
}

impl Default for FrequencyShifter {
    fn default() -> Self {
        Self::new()
    }
}
