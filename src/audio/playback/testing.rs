//! Test doubles for the playback path

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::audio::device::Device;
use crate::audio::playback::output::{OutputBackend, OutputSink, StreamParams};
use crate::error::PlaybackError;

/// Write a 16-bit PCM file with a ramp signal
pub(crate) fn write_wav(
    dir: &Path,
    name: &str,
    channels: u16,
    sample_rate: u32,
    frames: u32,
) -> PathBuf {
    let path = dir.join(name);
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for frame in 0..frames {
        for _ in 0..channels {
            writer.write_sample(((frame % 512) as i16 - 256) * 64).unwrap();
        }
    }
    writer.finalize().unwrap();
    path
}

/// What the recording backend has seen
#[derive(Debug, Clone, Default)]
pub(crate) struct Recording {
    pub opened: Vec<(String, StreamParams)>,
    pub samples_written: usize,
    pub chunks: usize,
    pub pauses: usize,
    pub resumes: usize,
    pub drained: bool,
}

/// Output backend that records stream parameters and writes
#[derive(Clone, Default)]
pub(crate) struct RecordingBackend {
    recording: Arc<Mutex<Recording>>,
    reject_open: bool,
    fail_after: Option<usize>,
    write_delay: Duration,
    open_delay: Duration,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to open any stream
    pub fn rejecting(mut self) -> Self {
        self.reject_open = true;
        self
    }

    /// Fail every write after the first `chunks`
    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Sleep this long in every write
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Sleep this long before opening the stream
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn recording(&self) -> Recording {
        self.recording.lock().clone()
    }
}

impl OutputBackend for RecordingBackend {
    fn open(
        &self,
        device: &Device,
        params: &StreamParams,
    ) -> Result<Box<dyn OutputSink>, PlaybackError> {
        if !self.open_delay.is_zero() {
            thread::sleep(self.open_delay);
        }
        if self.reject_open {
            return Err(PlaybackError::DeviceRejected(format!("{} refused", device.name)));
        }
        self.recording.lock().opened.push((device.name.clone(), *params));
        Ok(Box::new(RecordingSink {
            recording: self.recording.clone(),
            fail_after: self.fail_after,
            write_delay: self.write_delay,
        }))
    }
}

struct RecordingSink {
    recording: Arc<Mutex<Recording>>,
    fail_after: Option<usize>,
    write_delay: Duration,
}

impl OutputSink for RecordingSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        if !self.write_delay.is_zero() {
            thread::sleep(self.write_delay);
        }
        let mut recording = self.recording.lock();
        if self.fail_after.is_some_and(|limit| recording.chunks >= limit) {
            return Err(PlaybackError::DeviceFailure("device unplugged".into()));
        }
        recording.chunks += 1;
        recording.samples_written += samples.len();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.recording.lock().pauses += 1;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.recording.lock().resumes += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), PlaybackError> {
        self.recording.lock().drained = true;
        Ok(())
    }
}
