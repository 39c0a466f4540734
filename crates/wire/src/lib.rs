// Copyright 2025-2026 CEMAXECUTER LLC

pub mod control;
pub mod frame;
pub mod handshake;
pub mod payload;

pub use control::{parse_server_message, ping_message, tune_message, ServerMessage};
pub use frame::{encode_frame, write_frame, Frame, FrameReader, Opcode, WireError, MAX_PAYLOAD};
pub use handshake::client_handshake;
pub use payload::{PayloadDecoder, StreamFormat};
