// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;

/// Errors the supervisor reports synchronously.
///
/// Everything past the initial admission and connect is handled
/// autonomously (reconnection with backoff) and surfaces only through
/// telemetry and the per-receiver state machine.
#[derive(Debug)]
pub enum EngineError {
    /// Invalid receiver id, mode mismatch, malformed configuration.
    Config(String),
    /// The server's admission check said no (or answered non-200).
    AdmissionRejected(String),
    /// TCP connect or WebSocket handshake did not finish in time.
    ConnectTimeout(String),
    /// Connect-time transport failure other than a timeout.
    Network(String),
    /// wss:// requested but this build carries no TLS transport.
    Tls(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Config(msg) => write!(f, "configuration error: {}", msg),
            EngineError::AdmissionRejected(msg) => write!(f, "admission rejected: {}", msg),
            EngineError::ConnectTimeout(msg) => write!(f, "connect timeout: {}", msg),
            EngineError::Network(msg) => write!(f, "network error: {}", msg),
            EngineError::Tls(msg) => write!(f, "tls error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::AdmissionRejected("quota".to_string());
        assert_eq!(err.to_string(), "admission rejected: quota");
    }
}
