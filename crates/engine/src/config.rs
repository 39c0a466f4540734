// Copyright 2025-2026 CEMAXECUTER LLC

use crate::error::EngineError;
use ul_wire::StreamFormat;

/// Engine-wide configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Server hostname or IPv4 address.
    pub host: String,
    /// Server TCP port (HTTP admission and WebSocket share it).
    pub port: u16,
    /// Request wss://. This build has no TLS transport and refuses it.
    pub use_tls: bool,
    /// Server password, sent with admission and in the WebSocket URL.
    pub password: Option<String>,
    /// Binary delivery format negotiated per session.
    pub format: StreamFormat,
    /// Software frequency offset in Hz applied to every receiver at start.
    pub frequency_offset_hz: i32,
    /// Exchange I and Q at ingest for sideband orientation.
    pub swap_iq: bool,
    /// Record the first 10 s of each receiver to `<frequency>.wav`.
    pub debug_rec: bool,
    /// Passband hints for voice modes, sent with tune when present.
    pub bandwidth_low: Option<i32>,
    pub bandwidth_high: Option<i32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            use_tls: false,
            password: None,
            format: StreamFormat::PcmZstd,
            frequency_offset_hz: 0,
            swap_iq: false,
            debug_rec: false,
            bandwidth_low: None,
            bandwidth_high: None,
        }
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<(), EngineError> {
        if !valid_hostname(&self.host) {
            return Err(EngineError::Config(format!(
                "invalid server host: {:?}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(EngineError::Config("server port must be nonzero".into()));
        }
        if self.use_tls {
            return Err(EngineError::Tls(
                "wss:// requested but this build has no TLS transport".into(),
            ));
        }
        Ok(())
    }
}

fn valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bad_host_rejected() {
        let cfg = EngineConfig {
            host: "bad host/with spaces".to_string(),
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));

        let cfg = EngineConfig {
            host: String::new(),
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_zero_port_rejected() {
        let cfg = EngineConfig {
            port: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_tls_refused() {
        let cfg = EngineConfig {
            use_tls: true,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Tls(_))));
    }
}
