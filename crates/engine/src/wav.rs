// Copyright 2025-2026 CEMAXECUTER LLC

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Short diagnostic capture of one receiver's stream, written as 32-bit
/// float stereo WAV (I left, Q right). Samples are taken before the
/// frequency shifter so the recording shows what the server delivered.
pub(crate) struct DebugWavRecorder {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    remaining: u64,
    path: String,
}

impl DebugWavRecorder {
    pub fn create(path: &Path, sample_rate: u32, seconds: u32) -> Result<Self, String> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = hound::WavWriter::create(path, spec)
            .map_err(|e| format!("failed to create {}: {}", path.display(), e))?;
        log::info!(
            "debug recording {} ({} s at {} Hz)",
            path.display(),
            seconds,
            sample_rate
        );
        Ok(Self {
            writer: Some(writer),
            remaining: sample_rate as u64 * seconds as u64,
            path: path.display().to_string(),
        })
    }

    /// Append one sample pair; finalizes the file when the cap is hit.
    pub fn push(&mut self, i: f32, q: f32) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if writer.write_sample(i).and_then(|_| writer.write_sample(q)).is_err() {
            log::warn!("debug recording {}: write failed, stopping", self.path);
            self.finish();
            return;
        }
        self.remaining -= 1;
        if self.remaining == 0 {
            log::info!("debug recording {} completed", self.path);
            self.finish();
        }
    }

    pub fn finish(&mut self) {
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.finalize() {
                log::warn!("debug recording {}: finalize failed: {}", self.path, e);
            }
        }
    }
}

impl Drop for DebugWavRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_and_finalizes() {
        let dir = std::env::temp_dir();
        let path = dir.join("ul_engine_wav_test.wav");
        let _ = std::fs::remove_file(&path);

        let mut rec = DebugWavRecorder::create(&path, 100, 1).unwrap();
        for k in 0..150 {
            rec.push(k as f32 / 150.0, -(k as f32) / 150.0);
        }
        // Cap is 100 samples; the recorder finalized itself.
        assert!(rec.writer.is_none());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 100);
        assert_eq!(reader.len(), 200); // interleaved I/Q
        let _ = std::fs::remove_file(&path);
    }
}
