// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::io::{self, ErrorKind, Read, Write};

use byteorder::{BigEndian, ByteOrder};

/// Frames larger than this are treated as a protocol violation and tear
/// the connection down.
pub const MAX_PAYLOAD: usize = 1 << 20;

/// RFC 6455 frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Result<Self, WireError> {
        match bits {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WireError::Protocol(format!("bad opcode 0x{:x}", other))),
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One complete, unmasked frame as received from the server.
#[derive(Debug)]
pub struct Frame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// Transport and framing errors.
///
/// `Closed` is end of stream (the peer shut the socket down); `Protocol`
/// is a malformed frame and grounds for tearing the session down; `Io` is
/// everything else the socket can do to us.
#[derive(Debug)]
pub enum WireError {
    Io(io::Error),
    Closed,
    Protocol(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Io(e) => write!(f, "socket error: {}", e),
            WireError::Closed => write!(f, "connection closed by peer"),
            WireError::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for WireError {}

impl From<io::Error> for WireError {
    fn from(e: io::Error) -> Self {
        WireError::Io(e)
    }
}

/// Reads complete frames from a stream configured with a short read
/// timeout.
///
/// Reads accumulate across timeouts so a frame split by the network is
/// never lost; `keep_going` is polled on every timeout, and returning
/// false abandons the read mid-frame (the session is being torn down).
pub struct FrameReader<R: Read> {
    src: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(src: R) -> Self {
        Self { src }
    }

    /// Read one frame. Returns `Ok(None)` if `keep_going` went false
    /// before a full frame arrived.
    pub fn read_frame(
        &mut self,
        keep_going: &dyn Fn() -> bool,
    ) -> Result<Option<Frame>, WireError> {
        let mut header = [0u8; 2];
        if !read_full(&mut self.src, &mut header, keep_going)? {
            return Ok(None);
        }

        let fin = header[0] & 0x80 != 0;
        if header[0] & 0x70 != 0 {
            return Err(WireError::Protocol("reserved bits set".into()));
        }
        let opcode = Opcode::from_bits(header[0] & 0x0F)?;
        if !fin {
            // Fragmented frames are not part of this transport; the server
            // never emits them for audio or control traffic.
            return Err(WireError::Protocol("fragmented frame (FIN=0)".into()));
        }

        let masked = header[1] & 0x80 != 0;
        let mut payload_len = (header[1] & 0x7F) as u64;
        if payload_len == 126 {
            let mut ext = [0u8; 2];
            if !read_full(&mut self.src, &mut ext, keep_going)? {
                return Ok(None);
            }
            payload_len = BigEndian::read_u16(&ext) as u64;
        } else if payload_len == 127 {
            let mut ext = [0u8; 8];
            if !read_full(&mut self.src, &mut ext, keep_going)? {
                return Ok(None);
            }
            payload_len = BigEndian::read_u64(&ext);
        }

        if payload_len > MAX_PAYLOAD as u64 {
            return Err(WireError::Protocol(format!(
                "payload of {} bytes exceeds the {} byte cap",
                payload_len, MAX_PAYLOAD
            )));
        }
        if opcode.is_control() && payload_len > 125 {
            return Err(WireError::Protocol(format!(
                "control frame with {} byte payload",
                payload_len
            )));
        }

        // Servers must not mask, but tolerate it and unmask.
        let mut mask_key = [0u8; 4];
        if masked {
            if !read_full(&mut self.src, &mut mask_key, keep_going)? {
                return Ok(None);
            }
        }

        let mut payload = vec![0u8; payload_len as usize];
        if payload_len > 0 && !read_full(&mut self.src, &mut payload, keep_going)? {
            return Ok(None);
        }
        if masked {
            apply_mask(&mut payload, &mask_key);
        }

        Ok(Some(Frame { opcode, payload }))
    }
}

/// Encode a client frame: FIN set, MASK bit set, fresh random key, payload
/// XOR-masked per RFC 6455.
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x80 | opcode.bits());

    if payload.len() < 126 {
        frame.push(0x80 | payload.len() as u8);
    } else if payload.len() < 65_536 {
        frame.push(0x80 | 126);
        let mut ext = [0u8; 2];
        BigEndian::write_u16(&mut ext, payload.len() as u16);
        frame.extend_from_slice(&ext);
    } else {
        frame.push(0x80 | 127);
        let mut ext = [0u8; 8];
        BigEndian::write_u64(&mut ext, payload.len() as u64);
        frame.extend_from_slice(&ext);
    }

    let mask_key: [u8; 4] = rand::random();
    frame.extend_from_slice(&mask_key);

    let start = frame.len();
    frame.extend_from_slice(payload);
    apply_mask(&mut frame[start..], &mask_key);
    frame
}

/// Encode and write one client frame.
pub fn write_frame<W: Write>(w: &mut W, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(opcode, payload);
    w.write_all(&frame)
}

fn apply_mask(data: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Fill `buf` completely, retrying across read timeouts. Returns
/// `Ok(false)` if `keep_going` went false while waiting.
fn read_full<R: Read>(
    src: &mut R,
    buf: &mut [u8],
    keep_going: &dyn Fn() -> bool,
) -> Result<bool, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => return Err(WireError::Closed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if !keep_going() {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Build an unmasked server-side frame by hand.
    fn server_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        if payload.len() < 126 {
            out.push(payload.len() as u8);
        } else if payload.len() < 65_536 {
            out.push(126);
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            out.push(127);
            out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_parse_small_binary_frame() {
        let wire = server_frame(0x2, b"\x01\x02\x03");
        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_frame(&|| true).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(frame.payload, b"\x01\x02\x03");
    }

    #[test]
    fn test_parse_extended_16bit_length() {
        let payload = vec![0xAB; 300];
        let wire = server_frame(0x1, &payload);
        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_frame(&|| true).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn test_parse_extended_64bit_length() {
        let payload = vec![0x55; 70_000];
        let wire = server_frame(0x2, &payload);
        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_frame(&|| true).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&((MAX_PAYLOAD as u64) + 1).to_be_bytes());
        let mut reader = FrameReader::new(Cursor::new(wire));
        match reader.read_frame(&|| true) {
            Err(WireError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_fragmented_frame_rejected() {
        let wire = vec![0x02, 0x01, 0xFF]; // FIN=0 binary
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.read_frame(&|| true),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_bad_opcode_rejected() {
        let wire = vec![0x83, 0x00]; // opcode 3 is reserved
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(
            reader.read_frame(&|| true),
            Err(WireError::Protocol(_))
        ));
    }

    #[test]
    fn test_eof_is_closed() {
        let mut reader = FrameReader::new(Cursor::new(Vec::new()));
        assert!(matches!(reader.read_frame(&|| true), Err(WireError::Closed)));
    }

    #[test]
    fn test_masked_server_frame_unmasked() {
        // A server should never mask, but the codec copes: mask bit set,
        // 4-byte key, payload XORed.
        let key = [0x11u8, 0x22, 0x33, 0x44];
        let clear = b"hello";
        let mut masked: Vec<u8> = clear.to_vec();
        apply_mask(&mut masked, &key);
        let mut wire = vec![0x81, 0x80 | clear.len() as u8];
        wire.extend_from_slice(&key);
        wire.extend_from_slice(&masked);
        let mut reader = FrameReader::new(Cursor::new(wire));
        let frame = reader.read_frame(&|| true).unwrap().unwrap();
        assert_eq!(frame.payload, clear);
    }

    #[test]
    fn test_client_frame_is_masked() {
        let encoded = encode_frame(Opcode::Text, b"{\"type\":\"ping\"}");
        assert_eq!(encoded[0], 0x81);
        assert_eq!(encoded[1] & 0x80, 0x80, "MASK bit must be set");
        let len = (encoded[1] & 0x7F) as usize;
        let key: [u8; 4] = encoded[2..6].try_into().unwrap();
        let mut payload = encoded[6..6 + len].to_vec();
        apply_mask(&mut payload, &key);
        assert_eq!(payload, b"{\"type\":\"ping\"}");
    }
}
