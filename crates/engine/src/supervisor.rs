// Copyright 2025-2026 CEMAXECUTER LLC

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, tick, Receiver as ChannelReceiver, Sender};
use crossbeam::select;

use ul_dsp::{FrequencyShifter, IqMode};

use crate::assembler::{self, AssemblerShared, BlockSet};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::receiver::{ConnectionState, Receiver, MAX_RECEIVERS};
use crate::session::{self, SessionEvent};
use crate::telemetry::{EngineStatus, ReceiverStatus};
use crate::wav::DebugWavRecorder;

/// Keepalive ping cadence per active receiver.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Reconnect backoff bounds.
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);
/// Ceiling on joining worker threads at stop/shutdown.
const JOIN_LIMIT: Duration = Duration::from_secs(5);
/// Debug WAV capture length.
const WAV_SECONDS: u32 = 10;

/// Shared engine state; the supervisor threads and the public API all
/// hang off one `Arc` of this.
pub(crate) struct EngineInner {
    pub cfg: EngineConfig,
    pub receivers: Vec<Arc<Receiver>>,
    pub assembler: Arc<AssemblerShared>,
    pub events_tx: Sender<SessionEvent>,
    pub stop: Arc<AtomicBool>,
    /// The rate pinned by the first active receiver's mode; cleared when
    /// the last receiver stops.
    pub engine_mode: Mutex<Option<IqMode>>,
    pub started_at: Instant,
}

/// The multi-receiver ingestion engine.
///
/// Owns every receiver slot, the pacing thread, the keepalive ticker,
/// and the session event loop. Dropping the engine shuts everything
/// down in order: receivers, assembler, keepalive, event loop.
pub struct Engine {
    inner: Arc<EngineInner>,
    assembler_thread: Option<JoinHandle<()>>,
    event_thread: Option<JoinHandle<()>>,
    keepalive_thread: Option<JoinHandle<()>>,
    keepalive_stop: Sender<()>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Result<Self, EngineError> {
        cfg.validate()?;

        let receivers: Vec<Arc<Receiver>> =
            (0..MAX_RECEIVERS).map(|id| Arc::new(Receiver::new(id))).collect();
        let assembler = Arc::new(AssemblerShared::new());
        let (events_tx, events_rx) = bounded::<SessionEvent>(64);
        let stop = Arc::new(AtomicBool::new(false));

        let inner = Arc::new(EngineInner {
            cfg,
            receivers,
            assembler: assembler.clone(),
            events_tx,
            stop,
            engine_mode: Mutex::new(None),
            started_at: Instant::now(),
        });

        let assembler_thread = {
            let shared = assembler;
            let receivers = inner.receivers.clone();
            std::thread::Builder::new()
                .name("ul-assembler".to_string())
                .spawn(move || assembler::run(shared, receivers))
                .map_err(|e| EngineError::Config(format!("spawn assembler: {}", e)))?
        };

        let event_thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("ul-events".to_string())
                .spawn(move || event_loop(inner, events_rx))
                .map_err(|e| EngineError::Config(format!("spawn event loop: {}", e)))?
        };

        let (keepalive_stop, keepalive_stop_rx) = bounded::<()>(1);
        let keepalive_thread = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("ul-keepalive".to_string())
                .spawn(move || keepalive_loop(inner, keepalive_stop_rx))
                .map_err(|e| EngineError::Config(format!("spawn keepalive: {}", e)))?
        };

        Ok(Self {
            inner,
            assembler_thread: Some(assembler_thread),
            event_thread: Some(event_thread),
            keepalive_thread: Some(keepalive_thread),
            keepalive_stop,
        })
    }

    /// Admit, connect, and enroll receiver `rx`. Returns once the
    /// receiver is `Connected` (connect and handshake each carry a 5 s
    /// deadline) or with the failure that stopped it.
    pub fn start_receiver(
        &self,
        rx: usize,
        frequency: u64,
        mode: IqMode,
    ) -> Result<(), EngineError> {
        let inner = &self.inner;
        if rx >= MAX_RECEIVERS {
            return Err(EngineError::Config(format!("invalid receiver id {}", rx)));
        }
        let receiver = inner.receivers[rx].clone();

        // All active receivers share one rate; the first one pins it.
        let mut engine_mode = inner.engine_mode.lock().unwrap();
        if let Some(current) = *engine_mode {
            if current != mode {
                return Err(EngineError::Config(format!(
                    "mode {} conflicts with the active rate {} Hz",
                    mode,
                    current.sample_rate()
                )));
            }
        }
        {
            let mut shared = receiver.shared.lock().unwrap();
            if shared.active {
                return Err(EngineError::Config(format!(
                    "receiver {} is already active",
                    rx
                )));
            }
            shared.frequency = frequency;
            shared.mode = Some(mode);
            shared.needs_reconnect = false;
            shared.state = ConnectionState::Admitting;
        }
        // Clear out anything a previous run may have left behind.
        session::teardown_session(&receiver);
        let sample_rate = mode.sample_rate();
        log::info!("starting receiver {} at {} Hz, mode {}", rx, frequency, mode);

        let session_id = match session::admit(&inner.cfg) {
            Ok(session_id) => session_id,
            Err(e) => {
                receiver.shared.lock().unwrap().state = ConnectionState::Error;
                return Err(e);
            }
        };

        // Two seconds of elasticity absorbs network arrival jitter.
        receiver.ring.reset(sample_rate as usize * 2);
        receiver.stats.reset();
        {
            let mut shared = receiver.shared.lock().unwrap();
            shared.session_id = session_id;
            shared.offset_hz = inner.cfg.frequency_offset_hz;
            shared.shifter.reset();
            shared
                .shifter
                .set_increment(FrequencyShifter::increment_for(
                    inner.cfg.frequency_offset_hz,
                    sample_rate,
                ));
            shared.state = ConnectionState::Connecting;
            // The read loop only ingests for an active receiver; arm the
            // flag before the socket opens so no early frames are lost.
            shared.active = true;
        }
        if inner.cfg.debug_rec {
            let path = std::path::PathBuf::from(format!("{}.wav", frequency));
            match DebugWavRecorder::create(&path, sample_rate, WAV_SECONDS) {
                Ok(recorder) => *receiver.wav.lock().unwrap() = Some(recorder),
                Err(e) => log::warn!("receiver {}: {}", rx, e),
            }
        }

        if let Err(e) =
            session::connect_session(&inner.cfg, &receiver, &inner.events_tx, &inner.stop)
        {
            let mut shared = receiver.shared.lock().unwrap();
            shared.active = false;
            shared.state = ConnectionState::Error;
            return Err(e);
        }

        if engine_mode.is_none() {
            inner.assembler.configure(sample_rate);
            *engine_mode = Some(mode);
        }
        inner.assembler.activate(rx);
        Ok(())
    }

    /// Return receiver `rx` to `Disconnected`, stopping its session and
    /// any pending reconnect task. Stopping an idle receiver is a no-op.
    pub fn stop_receiver(&self, rx: usize) -> Result<(), EngineError> {
        let inner = &self.inner;
        if rx >= MAX_RECEIVERS {
            return Err(EngineError::Config(format!("invalid receiver id {}", rx)));
        }
        let mut engine_mode = inner.engine_mode.lock().unwrap();
        let receiver = inner.receivers[rx].clone();

        let reconnect = {
            let mut shared = receiver.shared.lock().unwrap();
            if !shared.active {
                return Ok(());
            }
            shared.active = false;
            shared.needs_reconnect = false;
            shared.state = ConnectionState::Disconnected;
            shared.reconnect_thread.take()
        };
        log::info!("stopping receiver {}", rx);

        inner.assembler.deactivate(rx);
        if let Some(handle) = reconnect {
            session::join_bounded(
                handle,
                JOIN_LIMIT,
                &format!("receiver {} reconnect task", rx),
            );
        }
        session::teardown_session(&receiver);
        if let Some(recorder) = receiver.wav.lock().unwrap().as_mut() {
            recorder.finish();
        }
        *receiver.wav.lock().unwrap() = None;

        let any_active = inner
            .receivers
            .iter()
            .any(|r| r.shared.lock().unwrap().active);
        if !any_active {
            *engine_mode = None;
        }
        Ok(())
    }

    /// Retune without tearing the session down. The stored frequency
    /// updates immediately; if the tune message cannot be sent, the
    /// session reconnects carrying the new frequency.
    pub fn set_frequency(&self, rx: usize, frequency: u64) -> Result<(), EngineError> {
        let inner = &self.inner;
        if rx >= MAX_RECEIVERS {
            return Err(EngineError::Config(format!("invalid receiver id {}", rx)));
        }
        let receiver = inner.receivers[rx].clone();

        let writer = {
            let mut shared = receiver.shared.lock().unwrap();
            shared.frequency = frequency;
            if !shared.active {
                log::debug!(
                    "receiver {}: inactive, stored frequency {} for the next start",
                    rx,
                    frequency
                );
                return Ok(());
            }
            if shared.state != ConnectionState::Connected {
                // A reconnect is in flight; it picks the new frequency up.
                return Ok(());
            }
            shared.writer.as_ref().and_then(|w| w.try_clone().ok())
        };

        let Some(writer) = writer else {
            return Ok(());
        };
        let bandwidth = match (inner.cfg.bandwidth_low, inner.cfg.bandwidth_high) {
            (Some(low), Some(high)) => Some((low, high)),
            _ => None,
        };
        let msg = ul_wire::tune_message(frequency, None, bandwidth);
        let mut w = &writer;
        match ul_wire::write_frame(&mut w, ul_wire::Opcode::Text, msg.as_bytes()) {
            Ok(()) => {
                log::info!("receiver {}: tuned to {} Hz", rx, frequency);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "receiver {}: tune send failed ({}), reconnecting at {} Hz",
                    rx,
                    e,
                    frequency
                );
                {
                    let mut shared = receiver.shared.lock().unwrap();
                    shared.needs_reconnect = true;
                    shared.state = ConnectionState::Reconnecting;
                }
                spawn_reconnect(inner.clone(), rx);
                Ok(())
            }
        }
    }

    /// Change a receiver's software frequency offset. Takes effect on the
    /// next pacing tick; the phase accumulator carries over.
    pub fn set_offset(&self, rx: usize, offset_hz: i32) -> Result<(), EngineError> {
        if rx >= MAX_RECEIVERS {
            return Err(EngineError::Config(format!("invalid receiver id {}", rx)));
        }
        let mut shared = self.inner.receivers[rx].shared.lock().unwrap();
        shared.offset_hz = offset_hz;
        if let Some(mode) = shared.mode {
            let increment = FrequencyShifter::increment_for(offset_hz, mode.sample_rate());
            shared.shifter.set_increment(increment);
        }
        Ok(())
    }

    /// Install (or replace) the downstream block callback.
    pub fn install_callback<F>(&self, callback: F)
    where
        F: FnMut(&BlockSet) + Send + 'static,
    {
        self.inner.assembler.install_callback(Box::new(callback));
    }

    /// Telemetry snapshot across all receiver slots.
    pub fn read_status(&self) -> EngineStatus {
        let inner = &self.inner;
        let mut receivers = Vec::with_capacity(MAX_RECEIVERS);
        let mut active_count = 0u8;
        for r in &inner.receivers {
            let shared = r.shared.lock().unwrap();
            if shared.active {
                active_count += 1;
            }
            receivers.push(ReceiverStatus {
                id: r.id,
                active: shared.active,
                state: shared.state,
                frequency: shared.frequency,
                mode: shared.mode,
                session_id: shared.session_id.clone(),
                samples_received: r.stats.samples_received.load(Ordering::Relaxed),
                compressed_bytes_received: r.stats.compressed_bytes.load(Ordering::Relaxed),
                throughput_kbps: r.stats.throughput_kbps(),
                peak_i: r.stats.peak_i(),
                peak_q: r.stats.peak_q(),
                ring_fill: r.ring.fill_level(),
                ring_overruns: r.ring.overruns(),
                ring_underruns: r.ring.underruns(),
                ring_capacity: r.ring.capacity() as u32,
            });
        }
        let (sample_rate, block_size) = {
            let barrier = inner.assembler.barrier.lock().unwrap();
            (barrier.sample_rate, barrier.block_len as u32)
        };
        EngineStatus {
            receivers,
            total_callbacks: inner.assembler.total_callbacks.load(Ordering::Relaxed),
            total_samples: inner.assembler.total_samples.load(Ordering::Relaxed),
            uptime_ms: inner.started_at.elapsed().as_millis() as u64,
            active_count,
            sample_rate,
            block_size,
        }
    }

    /// Stop everything: receivers, assembler, keepalive, event loop.
    pub fn shutdown(&mut self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("engine shutting down");
        for rx in 0..MAX_RECEIVERS {
            let _ = self.stop_receiver(rx);
        }
        self.inner.assembler.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.assembler_thread.take() {
            session::join_bounded(handle, JOIN_LIMIT, "assembler");
        }
        let _ = self.keepalive_stop.try_send(());
        if let Some(handle) = self.keepalive_thread.take() {
            session::join_bounded(handle, JOIN_LIMIT, "keepalive loop");
        }
        if let Some(handle) = self.event_thread.take() {
            session::join_bounded(handle, JOIN_LIMIT, "event loop");
        }
        log::info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drains session events and schedules reconnects. Stale generations and
/// receivers already being handled are ignored here, which keeps close
/// storms idempotent.
fn event_loop(inner: Arc<EngineInner>, events: ChannelReceiver<SessionEvent>) {
    loop {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(SessionEvent::Closed {
                rx,
                generation,
                reason,
            }) => {
                let receiver = &inner.receivers[rx];
                let schedule = {
                    let mut shared = receiver.shared.lock().unwrap();
                    if inner.stop.load(Ordering::Relaxed)
                        || !shared.active
                        || shared.generation != generation
                        || shared.needs_reconnect
                    {
                        false
                    } else {
                        shared.needs_reconnect = true;
                        shared.state = ConnectionState::Reconnecting;
                        true
                    }
                };
                if schedule {
                    log::warn!(
                        "receiver {}: connection lost ({}), scheduling reconnect",
                        rx,
                        reason
                    );
                    spawn_reconnect(inner.clone(), rx);
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if inner.stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Sends the application-level ping to every connected receiver.
fn keepalive_loop(inner: Arc<EngineInner>, stop_rx: ChannelReceiver<()>) {
    let ticker = tick(KEEPALIVE_INTERVAL);
    loop {
        select! {
            recv(ticker) -> _ => {
                let msg = ul_wire::ping_message();
                for receiver in &inner.receivers {
                    let writer = {
                        let shared = receiver.shared.lock().unwrap();
                        if !shared.active || shared.state != ConnectionState::Connected {
                            continue;
                        }
                        shared.writer.as_ref().and_then(|w| w.try_clone().ok())
                    };
                    if let Some(writer) = writer {
                        let mut w = &writer;
                        if let Err(e) =
                            ul_wire::write_frame(&mut w, ul_wire::Opcode::Text, msg.as_bytes())
                        {
                            log::warn!(
                                "receiver {}: keepalive send failed: {}",
                                receiver.id,
                                e
                            );
                        }
                    }
                }
            }
            recv(stop_rx) -> _ => break,
        }
    }
}

/// Spawn the per-receiver reconnect task, if one is not already running.
fn spawn_reconnect(inner: Arc<EngineInner>, rx: usize) {
    let receiver = inner.receivers[rx].clone();
    let mut shared = receiver.shared.lock().unwrap();
    if shared.reconnect_thread.is_some() {
        return;
    }
    let handle = std::thread::Builder::new()
        .name(format!("ul-reconnect-{}", rx))
        .spawn(move || reconnect_task(inner, rx));
    match handle {
        Ok(handle) => shared.reconnect_thread = Some(handle),
        Err(e) => {
            log::error!("receiver {}: failed to spawn reconnect task: {}", rx, e);
            shared.needs_reconnect = false;
        }
    }
}

/// Reconnection with exponential backoff: tear the old session down
/// (new generation, flushed ring), then sleep-admit-connect until it
/// works or the receiver is stopped. A close that lands while the task
/// is finishing re-arms the outer loop instead of being lost.
fn reconnect_task(inner: Arc<EngineInner>, rx: usize) {
    let receiver = inner.receivers[rx].clone();
    log::info!("receiver {}: reconnect task started", rx);

    loop {
        session::teardown_session(&receiver);

        let mut delay = RECONNECT_INITIAL;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !sleep_while_wanted(&inner, &receiver, delay) {
                break;
            }
            log::info!(
                "receiver {}: reconnect attempt {} after {:?}",
                rx,
                attempt,
                delay
            );

            receiver.shared.lock().unwrap().state = ConnectionState::Admitting;
            let session_id = match session::admit(&inner.cfg) {
                Ok(session_id) => session_id,
                Err(e) => {
                    log::warn!(
                        "receiver {}: admission failed on attempt {}: {}",
                        rx,
                        attempt,
                        e
                    );
                    receiver.shared.lock().unwrap().state = ConnectionState::Reconnecting;
                    delay = (delay * 2).min(RECONNECT_MAX);
                    continue;
                }
            };

            {
                let mut shared = receiver.shared.lock().unwrap();
                shared.session_id = session_id;
                shared.state = ConnectionState::Connecting;
            }
            match session::connect_session(&inner.cfg, &receiver, &inner.events_tx, &inner.stop) {
                Ok(()) => {
                    receiver.shared.lock().unwrap().needs_reconnect = false;
                    log::info!("receiver {}: reconnected on attempt {}", rx, attempt);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "receiver {}: reconnect attempt {} failed: {}",
                        rx,
                        attempt,
                        e
                    );
                    receiver.shared.lock().unwrap().state = ConnectionState::Reconnecting;
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        }

        // Exit or go again, decided in one critical section so a close
        // event racing this task cannot fall between two reconnects.
        let go_again = {
            let mut shared = receiver.shared.lock().unwrap();
            let wanted = shared.active
                && shared.needs_reconnect
                && !inner.stop.load(Ordering::Relaxed);
            if !wanted {
                shared.reconnect_thread = None;
            }
            wanted
        };
        if !go_again {
            log::info!("receiver {}: reconnect task exiting", rx);
            return;
        }
    }
}

/// Interruptible backoff sleep: 100 ms slices, checking on every slice
/// that the reconnect is still wanted.
fn sleep_while_wanted(inner: &Arc<EngineInner>, receiver: &Arc<Receiver>, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if inner.stop.load(Ordering::Relaxed) {
            return false;
        }
        {
            let shared = receiver.shared.lock().unwrap();
            if !shared.active || !shared.needs_reconnect {
                return false;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}
