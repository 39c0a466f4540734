// Copyright 2025-2026 CEMAXECUTER LLC

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::frame::WireError;

/// Largest handshake response we will buffer before giving up.
const MAX_RESPONSE: usize = 8 * 1024;

/// Perform the client side of the RFC 6455 opening handshake.
///
/// `path_and_query` is everything after the authority, starting with `/`.
/// The stream should carry a read timeout; a server that never answers
/// surfaces as an `Io` timeout error rather than a hang.
pub fn client_handshake<S: Read + Write>(
    stream: &mut S,
    host: &str,
    port: u16,
    path_and_query: &str,
) -> Result<(), WireError> {
    let key: [u8; 16] = rand::random();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}:{}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         User-Agent: uberlink/0.1\r\n\
         \r\n",
        path_and_query,
        host,
        port,
        BASE64.encode(key)
    );
    stream.write_all(request.as_bytes())?;

    // Read the response head byte-by-byte so nothing past the terminating
    // blank line is consumed; frames may follow immediately.
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Err(WireError::Closed),
            Ok(_) => head.push(byte[0]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_RESPONSE {
            return Err(WireError::Protocol("handshake response too large".into()));
        }
    }

    let response = String::from_utf8_lossy(&head);
    let mut lines = response.lines();
    let status = lines.next().unwrap_or("");
    if !status.contains("101") {
        return Err(WireError::Protocol(format!(
            "handshake rejected: {}",
            status.trim()
        )));
    }

    let upgraded = lines.any(|line| {
        let lower = line.to_ascii_lowercase();
        lower.starts_with("upgrade:") && lower.contains("websocket")
    });
    if !upgraded {
        return Err(WireError::Protocol(
            "handshake response missing Upgrade: websocket".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read, Write};

    /// Test double: canned read bytes plus a write sink.
    struct FakeStream {
        rx: Cursor<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl FakeStream {
        fn new(response: &str) -> Self {
            Self {
                rx: Cursor::new(response.as_bytes().to_vec()),
                tx: Vec::new(),
            }
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_accepts_101_with_upgrade() {
        let mut stream = FakeStream::new(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             \r\n",
        );
        client_handshake(&mut stream, "localhost", 8080, "/ws?frequency=7074000").unwrap();
        let sent = String::from_utf8(stream.tx).unwrap();
        assert!(sent.starts_with("GET /ws?frequency=7074000 HTTP/1.1\r\n"));
        assert!(sent.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(sent.contains("Sec-WebSocket-Key: "));
    }

    #[test]
    fn test_rejects_non_101() {
        let mut stream = FakeStream::new("HTTP/1.1 403 Forbidden\r\n\r\n");
        assert!(matches!(
            client_handshake(&mut stream, "localhost", 8080, "/ws"),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_rejects_missing_upgrade_header() {
        let mut stream = FakeStream::new("HTTP/1.1 101 Switching Protocols\r\n\r\n");
        assert!(matches!(
            client_handshake(&mut stream, "localhost", 8080, "/ws"),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_case_insensitive_upgrade() {
        let mut stream = FakeStream::new(
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: WebSocket\r\n\r\n",
        );
        client_handshake(&mut stream, "localhost", 8080, "/ws").unwrap();
    }
}
