// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use num_complex::Complex32;

/// Binary delivery format negotiated at session start via the `format`
/// query parameter. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// zstd-compressed PCM packets with a "PC"/"PM" header.
    PcmZstd,
    /// Opus packets behind a 21-byte metadata header.
    Opus,
}

impl StreamFormat {
    /// Value of the `format` query parameter in the WebSocket URL.
    pub fn as_query(self) -> &'static str {
        match self {
            StreamFormat::PcmZstd => "pcm-zstd",
            StreamFormat::Opus => "opus",
        }
    }
}

impl FromStr for StreamFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pcm-zstd" => Ok(StreamFormat::PcmZstd),
            "opus" => Ok(StreamFormat::Opus),
            other => Err(format!(
                "unknown stream format: {} (use pcm-zstd or opus)",
                other
            )),
        }
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query())
    }
}

// PCM packet header layout (little-endian fields, samples big-endian).
const PCM_MAGIC_FULL: u16 = 0x5043; // "PC"
const PCM_MAGIC_MINIMAL: u16 = 0x504D; // "PM"
const PCM_FULL_HEADER: usize = 29;
const PCM_MINIMAL_HEADER: usize = 13;

/// Opus packet metadata header: timestamp u64, sample rate u32, channels
/// u8, baseband power f32, noise density f32, all little-endian.
#[cfg(feature = "opus")]
const OPUS_HEADER: usize = 21;

/// Decodes one binary WebSocket payload into complex samples.
///
/// The format tag is fixed when the session is opened; a decoder never
/// switches formats mid-stream.
pub struct PayloadDecoder {
    format: StreamFormat,
    stream_rate: u32,
    #[cfg(feature = "opus")]
    opus: Option<OpusState>,
}

#[cfg(feature = "opus")]
struct OpusState {
    decoder: opus::Decoder,
    rate: u32,
    channels: u8,
    pcm: Vec<i16>,
}

impl PayloadDecoder {
    pub fn new(format: StreamFormat, stream_rate: u32) -> Result<Self, String> {
        #[cfg(not(feature = "opus"))]
        if format == StreamFormat::Opus {
            return Err(
                "opus support not compiled in (rebuild with --features opus)".to_string()
            );
        }
        Ok(Self {
            format,
            stream_rate,
            #[cfg(feature = "opus")]
            opus: None,
        })
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn stream_rate(&self) -> u32 {
        self.stream_rate
    }

    /// Decode one payload, replacing the contents of `out`. A failure
    /// means this packet only; the session stays up.
    pub fn decode(&mut self, payload: &[u8], out: &mut Vec<Complex32>) -> Result<(), String> {
        out.clear();
        match self.format {
            StreamFormat::PcmZstd => decode_pcm_zstd(payload, out),
            StreamFormat::Opus => self.decode_opus(payload, out),
        }
    }

    #[cfg(feature = "opus")]
    fn decode_opus(&mut self, payload: &[u8], out: &mut Vec<Complex32>) -> Result<(), String> {
        if payload.len() < OPUS_HEADER {
            return Err(format!("opus packet too short: {} bytes", payload.len()));
        }
        let rate = LittleEndian::read_u32(&payload[8..12]);
        let channels = payload[12];
        if channels == 0 || channels > 2 {
            return Err(format!("opus packet with {} channels", channels));
        }

        let rebuild = match &self.opus {
            Some(state) => state.rate != rate || state.channels != channels,
            None => true,
        };
        if rebuild {
            let ch = if channels == 2 {
                opus::Channels::Stereo
            } else {
                opus::Channels::Mono
            };
            let decoder = opus::Decoder::new(rate, ch)
                .map_err(|e| format!("opus decoder init ({} Hz): {}", rate, e))?;
            self.opus = Some(OpusState {
                decoder,
                rate,
                channels,
                // 120 ms at 48 kHz is the largest frame Opus can carry.
                pcm: vec![0i16; 5760 * channels as usize],
            });
        }

        let state = self.opus.as_mut().unwrap();
        let frames = state
            .decoder
            .decode(&payload[OPUS_HEADER..], &mut state.pcm, false)
            .map_err(|e| format!("opus decode: {}", e))?;

        // Downsampling to the stream rate is plain 2:1 decimation with no
        // anti-alias filter; the server band-limits before encoding.
        let step = if rate == self.stream_rate {
            1
        } else if rate == self.stream_rate * 2 {
            2
        } else {
            return Err(format!(
                "opus rate {} incompatible with stream rate {}",
                rate, self.stream_rate
            ));
        };

        let ch = state.channels as usize;
        out.reserve(frames / step + 1);
        for k in (0..frames).step_by(step) {
            let i = state.pcm[k * ch] as f32 / 32768.0;
            let q = if ch == 2 {
                state.pcm[k * ch + 1] as f32 / 32768.0
            } else {
                0.0
            };
            out.push(Complex32::new(i, q));
        }
        Ok(())
    }

    #[cfg(not(feature = "opus"))]
    fn decode_opus(&mut self, _payload: &[u8], _out: &mut Vec<Complex32>) -> Result<(), String> {
        Err("opus support not compiled in".to_string())
    }

    /// Decode the legacy JSON transport's base64 body (big-endian int16
    /// I/Q pairs), appending to `out`.
    pub fn decode_legacy_audio(data: &str, out: &mut Vec<Complex32>) -> Result<(), String> {
        let bytes = BASE64
            .decode(data)
            .map_err(|e| format!("base64 decode: {}", e))?;
        decode_be_pairs(&bytes, out);
        Ok(())
    }
}

fn decode_pcm_zstd(payload: &[u8], out: &mut Vec<Complex32>) -> Result<(), String> {
    let data = zstd::stream::decode_all(payload).map_err(|e| format!("zstd decode: {}", e))?;
    if data.len() < 2 {
        return Err(format!("pcm packet too short: {} bytes", data.len()));
    }
    let magic = LittleEndian::read_u16(&data[..2]);
    let header = match magic {
        PCM_MAGIC_FULL => PCM_FULL_HEADER,
        PCM_MAGIC_MINIMAL => PCM_MINIMAL_HEADER,
        other => return Err(format!("bad pcm magic 0x{:04x}", other)),
    };
    if data.len() < header {
        return Err(format!(
            "pcm packet truncated: {} bytes with a {} byte header",
            data.len(),
            header
        ));
    }
    decode_be_pairs(&data[header..], out);
    Ok(())
}

/// Interleaved big-endian int16 I/Q pairs, scaled to [-1, 1).
fn decode_be_pairs(bytes: &[u8], out: &mut Vec<Complex32>) {
    let pairs = bytes.len() / 4;
    out.reserve(pairs);
    for k in 0..pairs {
        let i = BigEndian::read_i16(&bytes[k * 4..]) as f32 / 32768.0;
        let q = BigEndian::read_i16(&bytes[k * 4 + 2..]) as f32 / 32768.0;
        out.push(Complex32::new(i, q));
    }
}
