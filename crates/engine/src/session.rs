// Copyright 2025-2026 CEMAXECUTER LLC

use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::Sender;
use serde_json::json;
use uuid::Uuid;

use ul_wire::{
    client_handshake, parse_server_message, write_frame, FrameReader, Opcode, PayloadDecoder,
    ServerMessage, WireError,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::producer::SampleProducer;
use crate::receiver::{ConnectionState, Receiver};

/// Deadline for the TCP connect and for each handshake read.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Poll granularity of the read loop, so teardown is prompt.
const READ_POLL: Duration = Duration::from_millis(100);
/// Admission POST deadline.
const ADMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Session-lifecycle notifications the supervisor's event loop consumes.
/// Carrying the generation lets stale sessions be told apart from live
/// ones without back-pointers.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Closed {
        rx: usize,
        generation: u64,
        reason: String,
    },
}

/// Everything the read loop needs, captured by value at spawn time.
struct SessionContext {
    receiver: Arc<Receiver>,
    events: Sender<SessionEvent>,
    engine_stop: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    generation: u64,
    swap_iq: bool,
}

/// HTTP admission gate. Draws a fresh session UUID, posts it to
/// `/connection`, and hands the UUID back on success; the same UUID must
/// go into the WebSocket URL.
pub(crate) fn admit(cfg: &EngineConfig) -> Result<String, EngineError> {
    let session_id = Uuid::new_v4().to_string();
    let mut body = json!({ "user_session_id": session_id });
    if let Some(password) = &cfg.password {
        body["password"] = json!(password);
    }

    let url = format!("http://{}:{}/connection", cfg.host, cfg.port);
    let agent = ureq::AgentBuilder::new().timeout(ADMIT_TIMEOUT).build();
    let response = match agent
        .post(&url)
        .set("Content-Type", "application/json")
        .send_string(&body.to_string())
    {
        Ok(response) => response,
        Err(ureq::Error::Status(code, response)) => {
            let text = response.into_string().unwrap_or_default();
            return Err(EngineError::AdmissionRejected(format!(
                "HTTP {}: {}",
                code,
                text.trim()
            )));
        }
        Err(ureq::Error::Transport(e)) => {
            return Err(EngineError::Network(format!("admission request: {}", e)));
        }
    };

    let text = response
        .into_string()
        .map_err(|e| EngineError::Network(format!("admission response: {}", e)))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| EngineError::AdmissionRejected(format!("unparseable response: {}", e)))?;

    if value.get("allowed").and_then(|a| a.as_bool()) == Some(true) {
        Ok(session_id)
    } else {
        let reason = value
            .get("reason")
            .and_then(|r| r.as_str())
            .unwrap_or("not allowed");
        Err(EngineError::AdmissionRejected(reason.to_string()))
    }
}

/// Path and query for the stream socket. The session UUID is the one
/// admission was granted for; this builder never generates a new one.
pub(crate) fn ws_path_and_query(
    cfg: &EngineConfig,
    frequency: u64,
    mode: &str,
    session_id: &str,
) -> String {
    let mut path = format!(
        "/ws?frequency={}&mode={}&user_session_id={}&format={}&version=2",
        frequency,
        mode,
        session_id,
        cfg.format.as_query()
    );
    if let Some(password) = &cfg.password {
        path.push_str("&password=");
        path.push_str(&percent_encode(password));
    }
    if let (Some(low), Some(high)) = (cfg.bandwidth_low, cfg.bandwidth_high) {
        path.push_str(&format!("&bandwidthLow={}&bandwidthHigh={}", low, high));
    }
    path
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Open the stream socket for a receiver and start its read loop. The
/// receiver's frequency, mode, and session id are read under its lock;
/// on success the state is `Connected` and the producer is running.
pub(crate) fn connect_session(
    cfg: &EngineConfig,
    receiver: &Arc<Receiver>,
    events: &Sender<SessionEvent>,
    engine_stop: &Arc<AtomicBool>,
) -> Result<(), EngineError> {
    let (frequency, mode, session_id) = {
        let shared = receiver.shared.lock().unwrap();
        let mode = shared
            .mode
            .ok_or_else(|| EngineError::Config("receiver has no mode".into()))?;
        (shared.frequency, mode, shared.session_id.clone())
    };
    if cfg.use_tls {
        return Err(EngineError::Tls(
            "wss:// requested but this build has no TLS transport".into(),
        ));
    }

    let addr = (cfg.host.as_str(), cfg.port)
        .to_socket_addrs()
        .map_err(|e| EngineError::Network(format!("resolve {}: {}", cfg.host, e)))?
        .next()
        .ok_or_else(|| EngineError::Network(format!("no address for {}", cfg.host)))?;

    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).map_err(|e| {
        if e.kind() == ErrorKind::TimedOut {
            EngineError::ConnectTimeout(format!("tcp connect to {}", addr))
        } else {
            EngineError::Network(format!("tcp connect to {}: {}", addr, e))
        }
    })?;
    stream.set_nodelay(true).ok();
    stream
        .set_read_timeout(Some(CONNECT_TIMEOUT))
        .map_err(|e| EngineError::Network(format!("socket setup: {}", e)))?;
    stream
        .set_write_timeout(Some(CONNECT_TIMEOUT))
        .map_err(|e| EngineError::Network(format!("socket setup: {}", e)))?;

    let path = ws_path_and_query(cfg, frequency, mode.as_str(), &session_id);
    client_handshake(&mut stream, &cfg.host, cfg.port, &path).map_err(|e| match e {
        WireError::Io(io)
            if io.kind() == ErrorKind::WouldBlock || io.kind() == ErrorKind::TimedOut =>
        {
            EngineError::ConnectTimeout("websocket handshake".into())
        }
        WireError::Io(io) => EngineError::Network(format!("websocket handshake: {}", io)),
        WireError::Closed => EngineError::Network("websocket handshake: connection closed".into()),
        WireError::Protocol(msg) => EngineError::Network(format!("websocket handshake: {}", msg)),
    })?;

    stream
        .set_read_timeout(Some(READ_POLL))
        .map_err(|e| EngineError::Network(format!("socket setup: {}", e)))?;

    let writer = stream
        .try_clone()
        .map_err(|e| EngineError::Network(format!("socket clone: {}", e)))?;
    let decoder = PayloadDecoder::new(cfg.format, mode.sample_rate()).map_err(EngineError::Config)?;

    let mut shared = receiver.shared.lock().unwrap();
    if !shared.active {
        // The receiver was stopped while this connect was in flight; do
        // not register a session it will never consume.
        return Err(EngineError::Network("receiver no longer active".into()));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let ctx = SessionContext {
        receiver: receiver.clone(),
        events: events.clone(),
        engine_stop: engine_stop.clone(),
        stop: stop.clone(),
        generation: shared.generation,
        swap_iq: cfg.swap_iq,
    };
    let handle = std::thread::Builder::new()
        .name(format!("ul-net-{}", receiver.id))
        .spawn(move || read_loop(ctx, stream, decoder))
        .map_err(|e| EngineError::Network(format!("spawn read loop: {}", e)))?;

    shared.writer = Some(writer);
    shared.reader_stop = Some(stop);
    shared.read_thread = Some(handle);
    shared.state = ConnectionState::Connected;
    log::info!(
        "receiver {}: connected at {} Hz, mode {} (session {}, gen {})",
        receiver.id,
        frequency,
        mode,
        session_id,
        shared.generation
    );
    Ok(())
}

/// The per-session network thread: reads frames, feeds the producer,
/// answers pings, and reports the close. Frames from a stale generation
/// are dropped without touching receiver state.
fn read_loop(ctx: SessionContext, stream: TcpStream, decoder: PayloadDecoder) {
    let rx = ctx.receiver.id;
    let generation = ctx.generation;
    let mut producer = SampleProducer::new(ctx.receiver.clone(), decoder, ctx.swap_iq);
    let mut reader = FrameReader::new(stream);

    let stop = ctx.stop.clone();
    let engine_stop = ctx.engine_stop.clone();
    let keep_going =
        move || !stop.load(Ordering::Relaxed) && !engine_stop.load(Ordering::Relaxed);

    let reason: String;
    loop {
        if !keep_going() {
            log::debug!("receiver {}: read loop stopping (gen {})", rx, generation);
            return;
        }
        let frame = match reader.read_frame(&keep_going) {
            Ok(None) => return,
            Ok(Some(frame)) => frame,
            Err(WireError::Closed) => {
                reason = "connection closed by server".to_string();
                break;
            }
            Err(WireError::Io(e)) => {
                reason = format!("socket error: {}", e);
                break;
            }
            Err(WireError::Protocol(msg)) => {
                log::warn!("receiver {}: malformed frame: {}", rx, msg);
                reason = format!("malformed frame: {}", msg);
                break;
            }
        };

        // Stale-session guard: a reconnect may already have replaced us.
        {
            let shared = ctx.receiver.shared.lock().unwrap();
            if shared.generation != generation || !shared.active {
                return;
            }
        }

        match frame.opcode {
            Opcode::Binary => producer.ingest_binary(&frame.payload),
            Opcode::Text => match std::str::from_utf8(&frame.payload) {
                Ok(text) => handle_text(rx, text, &mut producer),
                Err(_) => log::debug!("receiver {}: non-utf8 text frame dropped", rx),
            },
            Opcode::Ping => {
                if let Some(writer) = clone_writer(&ctx.receiver) {
                    let mut w = &writer;
                    if let Err(e) = write_frame(&mut w, Opcode::Pong, &frame.payload) {
                        log::debug!("receiver {}: pong send failed: {}", rx, e);
                    }
                }
            }
            Opcode::Pong => {}
            Opcode::Close => {
                reason = "close frame from server".to_string();
                break;
            }
            Opcode::Continuation => {
                log::debug!("receiver {}: unexpected continuation frame", rx);
            }
        }
    }

    // Mark the drop and let the supervisor decide about reconnecting.
    {
        let mut shared = ctx.receiver.shared.lock().unwrap();
        if shared.generation == generation {
            shared.state = ConnectionState::Disconnected;
        }
    }
    log::warn!("receiver {}: session ended: {} (gen {})", rx, reason, generation);
    let _ = ctx.events.send(SessionEvent::Closed {
        rx,
        generation,
        reason,
    });
}

fn handle_text(rx: usize, text: &str, producer: &mut SampleProducer) {
    match parse_server_message(text) {
        Ok(ServerMessage::Audio { data }) => producer.ingest_legacy(&data),
        Ok(ServerMessage::Status {
            session_id,
            frequency,
            mode,
        }) => {
            log::debug!(
                "receiver {}: status session={:?} frequency={:?} mode={:?}",
                rx,
                session_id,
                frequency,
                mode
            );
        }
        Ok(ServerMessage::Error { error }) => {
            log::warn!(
                "receiver {}: server error: {}",
                rx,
                error.as_deref().unwrap_or("unspecified")
            );
        }
        Ok(ServerMessage::Pong) => {
            log::debug!("receiver {}: pong", rx);
        }
        Ok(ServerMessage::Unknown) => {
            log::debug!("receiver {}: unhandled message type", rx);
        }
        Err(e) => {
            log::debug!("receiver {}: {}", rx, e);
        }
    }
}

fn clone_writer(receiver: &Arc<Receiver>) -> Option<TcpStream> {
    let shared = receiver.shared.lock().unwrap();
    shared.writer.as_ref().and_then(|w| w.try_clone().ok())
}

/// Canonical session teardown: invalidate the generation, stop the read
/// task cooperatively, join it, then drop the socket. The ring is flushed
/// last so no callback can mix samples from two generations.
pub(crate) fn teardown_session(receiver: &Arc<Receiver>) {
    let (writer, stop, handle) = {
        let mut shared = receiver.shared.lock().unwrap();
        shared.generation += 1;
        (
            shared.writer.take(),
            shared.reader_stop.take(),
            shared.read_thread.take(),
        )
    };
    if let Some(stop) = stop {
        stop.store(true, Ordering::Relaxed);
    }
    if let Some(writer) = writer {
        let mut w = &writer;
        let _ = write_frame(&mut w, Opcode::Close, &[]);
        let _ = writer.shutdown(Shutdown::Both);
    }
    if let Some(handle) = handle {
        join_bounded(handle, Duration::from_secs(5), "session read loop");
    }
    receiver.ring.flush();
}

/// Join with a ceiling. Overrunning it is a leak worth shouting about,
/// not a reason to hang the supervisor.
pub(crate) fn join_bounded(handle: JoinHandle<()>, limit: Duration, what: &str) {
    let deadline = Instant::now() + limit;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("{} did not exit within {:?}; abandoning it", what, limit);
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ul_wire::StreamFormat;

    #[test]
    fn test_ws_path_includes_identity_and_format() {
        let cfg = EngineConfig::default();
        let path = ws_path_and_query(&cfg, 14_074_000, "iq96", "abc-123");
        assert_eq!(
            path,
            "/ws?frequency=14074000&mode=iq96&user_session_id=abc-123&format=pcm-zstd&version=2"
        );
    }

    #[test]
    fn test_ws_path_with_password_and_bandwidth() {
        let cfg = EngineConfig {
            password: Some("p@ss w/slash".to_string()),
            format: StreamFormat::PcmZstd,
            bandwidth_low: Some(50),
            bandwidth_high: Some(2700),
            ..EngineConfig::default()
        };
        let path = ws_path_and_query(&cfg, 7_074_000, "usb", "id");
        assert!(path.contains("&password=p%40ss%20w%2Fslash"));
        assert!(path.ends_with("&bandwidthLow=50&bandwidthHigh=2700"));
    }

    #[test]
    fn test_percent_encode_unreserved_untouched() {
        assert_eq!(percent_encode("Abc-123_.~"), "Abc-123_.~");
        assert_eq!(percent_encode("a b"), "a%20b");
    }
}
