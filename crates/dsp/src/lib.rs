// Copyright 2025-2026 CEMAXECUTER LLC

pub mod mode;
pub mod ring;
pub mod shift;

pub use mode::{block_samples, IqMode, BLOCKS_PER_SEC};
pub use ring::RingBuffer;
pub use shift::FrequencyShifter;
