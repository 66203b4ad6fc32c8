//! Chunked PCM reader for `.wav` files
//!
//! Supports 8/16/24/32-bit integer and 32-bit float samples, any channel
//! count. Samples come out interleaved and normalised to `f32`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use hound::WavReader;

use crate::error::PlaybackError;

/// Sample encoding in the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Int,
    Float,
}

/// Header fields needed to configure the output stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub sample_kind: SampleKind,
    /// Frames (samples per channel) in the file
    pub frames: u32,
}

impl WavHeader {
    fn from_reader<R: std::io::Read>(
        reader: &WavReader<R>,
        path: &Path,
    ) -> Result<Self, PlaybackError> {
        let spec = reader.spec();
        let sample_kind = match spec.sample_format {
            hound::SampleFormat::Int => SampleKind::Int,
            hound::SampleFormat::Float => SampleKind::Float,
        };

        let supported = match sample_kind {
            SampleKind::Int => matches!(spec.bits_per_sample, 8 | 16 | 24 | 32),
            SampleKind::Float => spec.bits_per_sample == 32,
        };
        if !supported {
            return Err(PlaybackError::UnsupportedFormat(format!(
                "{}: {}-bit {:?} samples",
                path.display(),
                spec.bits_per_sample,
                sample_kind
            )));
        }
        if spec.channels == 0 {
            return Err(PlaybackError::UnsupportedFormat(format!(
                "{}: no channels",
                path.display()
            )));
        }

        Ok(Self {
            channels: spec.channels,
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
            sample_kind,
            frames: reader.duration(),
        })
    }
}

/// Open file positioned at the next unread frame
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    header: WavHeader,
    path: PathBuf,
}

impl std::fmt::Debug for WavSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WavSource")
            .field("path", &self.path)
            .field("header", &self.header)
            .finish()
    }
}

impl WavSource {
    /// Open and validate a file. Nothing is decoded yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PlaybackError> {
        let path = path.as_ref();
        let reader = WavReader::open(path).map_err(|e| match e {
            hound::Error::IoError(io) => PlaybackError::FileOpen {
                path: path.to_path_buf(),
                reason: io.to_string(),
            },
            other => PlaybackError::UnsupportedFormat(format!("{}: {}", path.display(), other)),
        })?;
        let header = WavHeader::from_reader(&reader, path)?;

        tracing::debug!(
            "Opened {}: {} ch, {} Hz, {}-bit, {} frames",
            path.display(),
            header.channels,
            header.sample_rate,
            header.bits_per_sample,
            header.frames
        );

        Ok(Self {
            reader,
            header,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &WavHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read up to `frames` frames into `out` (cleared first).
    ///
    /// Returns the number of whole frames read; 0 means end of data. A
    /// trailing partial frame is dropped.
    pub fn read_chunk(
        &mut self,
        frames: usize,
        out: &mut Vec<f32>,
    ) -> Result<usize, PlaybackError> {
        let channels = self.header.channels as usize;
        let wanted = frames * channels;
        out.clear();

        match self.header.sample_kind {
            SampleKind::Float => {
                for sample in self.reader.samples::<f32>().take(wanted) {
                    out.push(sample.map_err(read_error)?);
                }
            }
            SampleKind::Int => {
                // hound yields 8-bit data already re-centred around zero
                let scale = (1u64 << (self.header.bits_per_sample - 1)) as f32;
                for sample in self.reader.samples::<i32>().take(wanted) {
                    out.push(sample.map_err(read_error)? as f32 / scale);
                }
            }
        }

        out.truncate(out.len() / channels * channels);
        Ok(out.len() / channels)
    }
}

fn read_error(e: hound::Error) -> PlaybackError {
    PlaybackError::Stream(format!("read failed: {}", e))
}
