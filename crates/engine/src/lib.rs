// Copyright 2025-2026 CEMAXECUTER LLC

//! Multi-receiver UberSDR ingestion engine.
//!
//! Up to eight receivers, each with its own WebSocket session into the
//! server, feed per-receiver jitter buffers. A single pacing thread drains
//! all buffers in lock-step at the nominal sample rate and hands
//! time-aligned blocks to the installed callback, one block per active
//! receiver per invocation.

mod assembler;
pub mod config;
pub mod error;
mod producer;
mod receiver;
mod session;
mod supervisor;
pub mod telemetry;
mod wav;

pub use assembler::{BlockCallback, BlockSet};
pub use config::EngineConfig;
pub use error::EngineError;
pub use receiver::{ConnectionState, MAX_RECEIVERS};
pub use supervisor::Engine;
pub use telemetry::{EngineStatus, ReceiverStatus};

pub use ul_dsp::{block_samples, IqMode, BLOCKS_PER_SEC};
pub use ul_wire::StreamFormat;
