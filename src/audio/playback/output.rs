//! Output path of the playback worker
//!
//! [`OutputBackend::open`] is called on the worker thread and the returned
//! sink never leaves it, so sinks may hold thread-bound stream handles.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver};

use crate::audio::buffer::{SampleQueue, SharedSampleQueue};
use crate::audio::device::Device;
use crate::config::PlaybackConfig;
use crate::error::PlaybackError;

/// Output stream configuration derived from the file header and the device.
///
/// Channel reduction is naive: interleaved samples are written unchanged to
/// a stream with fewer channels, and the rate is scaled by the same ratio so
/// the wall-clock duration stays that of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    /// Channels of the output stream
    pub channels: u16,
    /// Rate of the output stream
    pub sample_rate: u32,
    pub file_channels: u16,
    pub file_rate: u32,
}

impl StreamParams {
    /// `channels = min(file, device)`, `rate = floor(file_rate * file_channels / channels)`
    pub fn negotiate(
        file_channels: u16,
        file_rate: u32,
        device: &Device,
    ) -> Result<Self, PlaybackError> {
        if device.max_output_channels == 0 {
            return Err(PlaybackError::DeviceRejected(format!(
                "{} has no output channels",
                device.name
            )));
        }
        if file_channels == 0 {
            return Err(PlaybackError::UnsupportedFormat("file has no channels".into()));
        }

        let channels = file_channels.min(device.max_output_channels);
        let scaled = u64::from(file_rate) * u64::from(file_channels) / u64::from(channels);
        let sample_rate = u32::try_from(scaled).map_err(|_| {
            PlaybackError::UnsupportedFormat(format!("scaled rate {} out of range", scaled))
        })?;

        Ok(Self {
            channels,
            sample_rate,
            file_channels,
            file_rate,
        })
    }

    /// True if the file has more channels than the stream
    pub fn is_reduced(&self) -> bool {
        self.channels < self.file_channels
    }
}

/// Opens output streams on a device
pub trait OutputBackend: Send + Sync {
    fn open(
        &self,
        device: &Device,
        params: &StreamParams,
    ) -> Result<Box<dyn OutputSink>, PlaybackError>;
}

/// An open output stream, owned by the worker thread
pub trait OutputSink {
    /// Queue interleaved samples. Blocks for at most the write timeout; an
    /// error means the device is gone.
    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError>;

    fn pause(&mut self) -> Result<(), PlaybackError>;

    fn resume(&mut self) -> Result<(), PlaybackError>;

    /// Wait for queued samples to be played
    fn drain(&mut self) -> Result<(), PlaybackError>;
}

/// cpal output streams
pub struct CpalOutput {
    chunk_frames: usize,
    queue_chunks: usize,
    write_timeout: Duration,
}

impl CpalOutput {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            chunk_frames: config.chunk_frames,
            queue_chunks: config.queue_chunks,
            write_timeout: config.write_timeout(),
        }
    }

    /// First output device whose cpal name is a prefix of the friendly name;
    /// cpal hosts may report truncated names.
    fn find_device(friendly_name: &str) -> Result<cpal::Device, PlaybackError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| PlaybackError::DeviceRejected(e.to_string()))?;

        for device in devices {
            match device.name() {
                Ok(name) if !name.is_empty() && friendly_name.starts_with(&name) => {
                    return Ok(device)
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping output device without a name: {}", e),
            }
        }

        Err(PlaybackError::DeviceRejected(format!(
            "no output device matches {}",
            friendly_name
        )))
    }

    fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
        device: &cpal::Device,
        config: &StreamConfig,
        queue: SharedSampleQueue,
        error_tx: crossbeam_channel::Sender<String>,
    ) -> Result<Stream, PlaybackError> {
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let mut starved = false;
                    for sample in data.iter_mut() {
                        let value = match queue.try_pop() {
                            Some(value) => value,
                            None => {
                                starved = true;
                                0.0
                            }
                        };
                        *sample = T::from_sample(value);
                    }
                    if starved {
                        queue.note_underrun();
                    }
                },
                move |err| {
                    let _ = error_tx.try_send(err.to_string());
                },
                None,
            )
            .map_err(|e| PlaybackError::DeviceRejected(e.to_string()))
    }
}

impl OutputBackend for CpalOutput {
    fn open(
        &self,
        device: &Device,
        params: &StreamParams,
    ) -> Result<Box<dyn OutputSink>, PlaybackError> {
        let cpal_device = Self::find_device(&device.name)?;
        let sample_format = cpal_device
            .default_output_config()
            .map_err(|e| PlaybackError::DeviceRejected(e.to_string()))?
            .sample_format();

        let config = StreamConfig {
            channels: params.channels,
            sample_rate: cpal::SampleRate(params.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = self.chunk_frames * self.queue_chunks * params.file_channels as usize;
        let queue: SharedSampleQueue = Arc::new(SampleQueue::new(capacity));
        let (error_tx, error_rx) = bounded::<String>(16);

        let shared = queue.clone();
        let stream = match sample_format {
            cpal::SampleFormat::F32 => {
                Self::build_stream::<f32>(&cpal_device, &config, shared, error_tx)?
            }
            cpal::SampleFormat::I16 => {
                Self::build_stream::<i16>(&cpal_device, &config, shared, error_tx)?
            }
            cpal::SampleFormat::U16 => {
                Self::build_stream::<u16>(&cpal_device, &config, shared, error_tx)?
            }
            format => {
                return Err(PlaybackError::DeviceRejected(format!(
                    "unsupported sample format {:?}",
                    format
                )))
            }
        };
        stream
            .play()
            .map_err(|e| PlaybackError::Stream(e.to_string()))?;

        tracing::info!(
            "Output stream on {}: {} ch @ {} Hz ({:?}, {} samples queued)",
            device.name,
            params.channels,
            params.sample_rate,
            sample_format,
            queue.capacity()
        );

        Ok(Box::new(CpalSink {
            stream,
            queue,
            error_rx,
            write_timeout: self.write_timeout,
        }))
    }
}

struct CpalSink {
    stream: Stream,
    queue: SharedSampleQueue,
    error_rx: Receiver<String>,
    write_timeout: Duration,
}

impl CpalSink {
    fn check_errors(&self) -> Result<(), PlaybackError> {
        match self.error_rx.try_recv() {
            Ok(err) => Err(PlaybackError::DeviceFailure(err)),
            Err(_) => Ok(()),
        }
    }
}

impl OutputSink for CpalSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        self.check_errors()?;
        let written = self.queue.write_all(samples, self.write_timeout);
        if written < samples.len() {
            return Err(PlaybackError::DeviceFailure(format!(
                "output stalled for {:?}",
                self.write_timeout
            )));
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        self.stream.pause().map_err(|e| PlaybackError::Stream(e.to_string()))
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        self.stream.play().map_err(|e| PlaybackError::Stream(e.to_string()))
    }

    fn drain(&mut self) -> Result<(), PlaybackError> {
        if !self.queue.wait_empty(self.write_timeout) {
            return Err(PlaybackError::DeviceFailure("output did not drain".into()));
        }
        self.check_errors()?;
        let (underruns, overflows) = (self.queue.underrun_count(), self.queue.overflow_count());
        if underruns > 0 || overflows > 0 {
            tracing::debug!("Output underruns: {}, stalled writes: {}", underruns, overflows);
        }
        Ok(())
    }
}

/// Discards samples at the pace a real device would consume them
pub struct NullOutput;

impl OutputBackend for NullOutput {
    fn open(
        &self,
        device: &Device,
        params: &StreamParams,
    ) -> Result<Box<dyn OutputSink>, PlaybackError> {
        tracing::info!(
            "Null output for {}: {} ch @ {} Hz",
            device.name,
            params.channels,
            params.sample_rate
        );
        Ok(Box::new(NullSink {
            samples_per_second: f64::from(params.channels) * f64::from(params.sample_rate),
        }))
    }
}

struct NullSink {
    samples_per_second: f64,
}

impl OutputSink for NullSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), PlaybackError> {
        if self.samples_per_second > 0.0 {
            let seconds = samples.len() as f64 / self.samples_per_second;
            std::thread::sleep(Duration::from_secs_f64(seconds));
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }

    fn drain(&mut self) -> Result<(), PlaybackError> {
        Ok(())
    }
}
