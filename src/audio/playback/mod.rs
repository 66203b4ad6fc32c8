//! Playback engine
//!
//! Renders one file to one device on a dedicated worker thread. The engine
//! keeps the controller-side transport state and the session binding; the
//! worker only receives [`TransportCommand`]s and reports back through
//! [`WorkerEvent`]s and a [`CompletionLatch`].
//!
//! Worker failures never surface as errors after `play` returns: they end the
//! session early and are kept as [`PlaybackEngine::last_finish_reason`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::audio::device::Device;
use crate::config::PlaybackConfig;
use crate::error::PlaybackError;

pub mod output;
pub mod wav;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use output::{CpalOutput, NullOutput, OutputBackend, OutputSink, StreamParams};
pub use wav::{WavHeader, WavSource};
pub use worker::{CompletionLatch, FinishReason, TransportCommand, WorkerEvent};

/// Transport state as set by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// Whether the worker of the bound session is still alive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Running,
    Finished,
}

/// A worker bound to one (device, file) pair
struct Session {
    device: Device,
    path: PathBuf,
    commands: Sender<TransportCommand>,
    events: Receiver<WorkerEvent>,
    latch: CompletionLatch,
    handle: Option<JoinHandle<()>>,
}

impl Session {
    /// Join the worker and collect its finish reason
    fn close(mut self) -> FinishReason {
        let mut reason = None;

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Playback worker for {} panicked", self.path.display());
                reason = Some(FinishReason::DeviceFailure("worker panicked".into()));
            }
        }

        for event in self.events.try_iter() {
            if let WorkerEvent::Finished(finished) = event {
                reason = Some(finished);
            }
        }

        reason.unwrap_or(FinishReason::Stopped)
    }
}

/// Play/pause/stop transport over a worker thread
pub struct PlaybackEngine {
    backend: Arc<dyn OutputBackend>,
    config: PlaybackConfig,
    transport: TransportState,
    session: Option<Session>,
    last_finish: Option<FinishReason>,
    /// Workers whose stream did not open in time; joined once they exit
    detached: Vec<JoinHandle<()>>,
}

impl PlaybackEngine {
    pub fn new(backend: Arc<dyn OutputBackend>, config: PlaybackConfig) -> Self {
        Self {
            backend,
            config,
            transport: TransportState::Stopped,
            session: None,
            last_finish: None,
            detached: Vec::new(),
        }
    }

    /// Engine rendering through cpal output streams
    pub fn with_cpal(config: PlaybackConfig) -> Self {
        let backend = Arc::new(CpalOutput::new(&config));
        Self::new(backend, config)
    }

    /// Start playback, or resume a paused session.
    ///
    /// With a session bound and playing this does nothing, even if the
    /// worker has already finished; call [`acknowledge_finished`] first.
    /// File and device errors are reported before any worker is spawned.
    ///
    /// [`acknowledge_finished`]: Self::acknowledge_finished
    pub fn play(&mut self, device: &Device, path: impl AsRef<Path>) -> Result<(), PlaybackError> {
        self.reap_detached();
        if let Some(session) = &self.session {
            match self.transport {
                TransportState::Paused => {
                    let _ = session.commands.send(TransportCommand::Resume);
                    self.transport = TransportState::Playing;
                    tracing::info!("Resumed {}", session.path.display());
                }
                _ => tracing::debug!("play() ignored, {} already bound", session.path.display()),
            }
            return Ok(());
        }

        let path = path.as_ref();
        let source = WavSource::open(path)?;
        let header = *source.header();
        let params = StreamParams::negotiate(header.channels, header.sample_rate, device)?;
        if params.is_reduced() {
            tracing::info!(
                "{} ch file on {} ch device: rate {} -> {}",
                header.channels,
                params.channels,
                header.sample_rate,
                params.sample_rate
            );
        }

        let (command_tx, command_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let latch = CompletionLatch::new();

        let context = worker::WorkerContext {
            backend: self.backend.clone(),
            device: device.clone(),
            source,
            params,
            chunk_frames: self.config.chunk_frames,
            commands: command_rx,
            events: event_tx,
            latch: latch.clone(),
        };

        let handle = thread::Builder::new()
            .name("playback-worker".into())
            .spawn(move || worker::run(context))
            .map_err(|e| PlaybackError::WorkerSpawn(e.to_string()))?;

        match event_rx.recv_timeout(self.config.start_timeout()) {
            Ok(WorkerEvent::Started) => {}
            Ok(WorkerEvent::OpenFailed(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Ok(WorkerEvent::Finished(reason)) => {
                let _ = handle.join();
                return Err(PlaybackError::Stream(format!(
                    "worker finished before starting: {}",
                    reason
                )));
            }
            Err(RecvTimeoutError::Timeout) => {
                // The worker exits on its own once the open call returns
                let _ = command_tx.send(TransportCommand::Stop);
                tracing::warn!("Output on {} did not open in time, detaching worker", device.name);
                self.detached.push(handle);
                return Err(PlaybackError::DeviceRejected(format!(
                    "{} did not open within {:?}",
                    device.name,
                    self.config.start_timeout()
                )));
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                return Err(PlaybackError::Stream("worker exited before opening the stream".into()));
            }
        }

        self.session = Some(Session {
            device: device.clone(),
            path: path.to_path_buf(),
            commands: command_tx,
            events: event_rx,
            latch,
            handle: Some(handle),
        });
        self.transport = TransportState::Playing;
        Ok(())
    }

    /// Suspend output before the next chunk. No effect unless playing.
    pub fn pause(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if self.transport != TransportState::Playing {
            return;
        }

        let _ = session.commands.send(TransportCommand::Pause);
        self.transport = TransportState::Paused;
        tracing::info!("Paused {}", session.path.display());
    }

    /// Terminate the worker and wait for it. Idempotent; returns at once when
    /// nothing is bound.
    pub fn stop(&mut self) {
        self.transport = TransportState::Stopped;
        self.reap_detached();
        let Some(session) = self.session.take() else {
            return;
        };

        // A paused worker is parked on the channel and wakes on this
        let _ = session.commands.send(TransportCommand::Stop);
        while !session.latch.is_finished() {
            thread::sleep(self.config.stop_poll());
        }

        let path = session.path.clone();
        let reason = session.close();
        tracing::info!("Stopped {} ({})", path.display(), reason);
        self.last_finish = Some(reason);
    }

    /// Join detached workers that have exited
    fn reap_detached(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) =
            self.detached.drain(..).partition(|handle| handle.is_finished());
        self.detached = running;
        for handle in finished {
            if handle.join().is_err() {
                tracing::error!("Detached playback worker panicked");
            }
        }
    }

    /// Non-blocking: true while the bound worker is running
    pub fn is_playing(&self) -> bool {
        self.completion() == CompletionState::Running
    }

    pub fn completion(&self) -> CompletionState {
        match &self.session {
            Some(session) if !session.latch.is_finished() => CompletionState::Running,
            _ => CompletionState::Finished,
        }
    }

    /// Release the binding of a session whose worker has finished.
    ///
    /// Returns the finish reason the first time; `None` when nothing is
    /// bound or the worker is still running.
    pub fn acknowledge_finished(&mut self) -> Option<FinishReason> {
        let session = self.session.as_ref()?;
        if !session.latch.is_finished() {
            tracing::debug!(
                "acknowledge_finished() while {} is still running",
                session.path.display()
            );
            return None;
        }

        let session = self.session.take()?;
        let reason = session.close();
        self.transport = TransportState::Stopped;
        self.last_finish = Some(reason.clone());
        Some(reason)
    }

    pub fn transport(&self) -> TransportState {
        self.transport
    }

    /// How the most recently released session ended
    pub fn last_finish_reason(&self) -> Option<&FinishReason> {
        self.last_finish.as_ref()
    }

    pub fn current_device(&self) -> Option<&Device> {
        self.session.as_ref().map(|s| &s.device)
    }

    pub fn current_file(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
        if !self.detached.is_empty() {
            tracing::debug!("Waiting for {} detached playback worker(s)", self.detached.len());
        }
        for handle in self.detached.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::testing::{write_wav, RecordingBackend};
    use proptest::prelude::*;
    use std::time::{Duration, Instant};

    fn engine(backend: &RecordingBackend) -> PlaybackEngine {
        let config = PlaybackConfig {
            chunk_frames: 256,
            ..PlaybackConfig::default()
        };
        PlaybackEngine::new(Arc::new(backend.clone()), config)
    }

    fn wait_until_finished(engine: &PlaybackEngine) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.is_playing() {
            assert!(Instant::now() < deadline, "worker did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_mono_file_keeps_rate_on_stereo_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "mono.wav", 1, 44100, 1024);
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        engine.play(&speakers, &path).unwrap();
        wait_until_finished(&engine);

        let opened = backend.recording().opened;
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].0, "Speakers");
        assert_eq!(opened[0].1.channels, 1);
        assert_eq!(opened[0].1.sample_rate, 44100);
    }

    #[test]
    fn test_stereo_file_on_mono_device_doubles_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "stereo.wav", 2, 22050, 512);
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);
        let mono = Device::new("mono", "Mono", 1);

        engine.play(&mono, &path).unwrap();
        wait_until_finished(&engine);

        let params = backend.recording().opened[0].1;
        assert_eq!(params.channels, 1);
        assert_eq!(params.sample_rate, 44100);
        // Interleaved data goes out unchanged
        assert_eq!(backend.recording().samples_written, 1024);
    }

    #[test]
    fn test_missing_file_spawns_nothing() {
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        let err = engine.play(&speakers, "/no/such/file.wav").unwrap_err();
        assert!(matches!(err, PlaybackError::FileOpen { .. }));
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert!(!engine.is_playing());
        assert!(backend.recording().opened.is_empty());
    }

    #[test]
    fn test_rejected_device_leaves_engine_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 2, 48000, 256);
        let backend = RecordingBackend::new().rejecting();
        let mut engine = engine(&backend);

        let err = engine.play(&Device::new("x", "X", 2), &path).unwrap_err();
        assert!(matches!(err, PlaybackError::DeviceRejected(_)));
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert!(engine.current_device().is_none());
    }

    #[test]
    fn test_slow_open_worker_is_joined_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 2, 48000, 256);
        let backend = RecordingBackend::new().with_open_delay(Duration::from_millis(200));
        let config = PlaybackConfig {
            start_timeout_ms: 20,
            ..PlaybackConfig::default()
        };
        let mut engine = PlaybackEngine::new(Arc::new(backend.clone()), config);

        let err = engine.play(&Device::new("x", "X", 2), &path).unwrap_err();
        assert!(matches!(err, PlaybackError::DeviceRejected(_)));
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert_eq!(engine.detached.len(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.detached.is_empty() {
            assert!(Instant::now() < deadline, "detached worker never exited");
            thread::sleep(Duration::from_millis(20));
            engine.stop();
        }

        // The late stream was opened, then torn down without rendering
        let recording = backend.recording();
        assert_eq!(recording.opened.len(), 1);
        assert_eq!(recording.chunks, 0);
    }

    #[test]
    fn test_natural_completion_needs_acknowledgement() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "short.wav", 1, 8000, 300);
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        engine.play(&speakers, &path).unwrap();
        wait_until_finished(&engine);

        // Still bound until acknowledged
        assert_eq!(engine.transport(), TransportState::Playing);
        assert_eq!(engine.current_file(), Some(path.as_path()));
        engine.play(&speakers, &path).unwrap();
        assert_eq!(backend.recording().opened.len(), 1);

        assert_eq!(engine.acknowledge_finished(), Some(FinishReason::EndOfStream));
        assert_eq!(engine.acknowledge_finished(), None);
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert_eq!(engine.last_finish_reason(), Some(&FinishReason::EndOfStream));
    }

    #[test]
    fn test_pause_then_stop_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "long.wav", 2, 8000, 100_000);
        let backend = RecordingBackend::new().with_write_delay(Duration::from_millis(2));
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        engine.play(&speakers, &path).unwrap();
        engine.pause();
        assert_eq!(engine.transport(), TransportState::Paused);
        assert!(engine.is_playing());

        engine.stop();
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert!(!engine.is_playing());
        assert_eq!(engine.last_finish_reason(), Some(&FinishReason::Stopped));
        assert_eq!(backend.recording().pauses, 1);
    }

    #[test]
    fn test_pause_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "long.wav", 1, 8000, 50_000);
        let backend = RecordingBackend::new().with_write_delay(Duration::from_millis(2));
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        engine.play(&speakers, &path).unwrap();
        engine.pause();
        engine.play(&speakers, &path).unwrap();
        assert_eq!(engine.transport(), TransportState::Playing);

        engine.stop();
        assert_eq!(backend.recording().opened.len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);

        engine.stop();
        engine.stop();
        assert_eq!(engine.transport(), TransportState::Stopped);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_pause_without_session_is_ignored() {
        let backend = RecordingBackend::new();
        let mut engine = engine(&backend);
        engine.pause();
        assert_eq!(engine.transport(), TransportState::Stopped);
    }

    #[test]
    fn test_device_failure_ends_playback_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "long.wav", 2, 8000, 100_000);
        let backend = RecordingBackend::new().failing_after(3);
        let mut engine = engine(&backend);
        let speakers = Device::new("speakers", "Speakers", 2);

        engine.play(&speakers, &path).unwrap();
        wait_until_finished(&engine);

        assert!(matches!(
            engine.acknowledge_finished(),
            Some(FinishReason::DeviceFailure(_))
        ));
        assert_eq!(backend.recording().chunks, 3);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Play,
        Pause,
        Stop,
        Acknowledge,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Play),
            Just(Op::Pause),
            Just(Op::Stop),
            Just(Op::Acknowledge),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_any_transport_sequence_ends_stopped(ops in prop::collection::vec(op(), 1..8)) {
            let dir = tempfile::tempdir().unwrap();
            let path = write_wav(dir.path(), "tone.wav", 2, 8000, 8192);
            let backend = RecordingBackend::new().with_write_delay(Duration::from_millis(1));
            let mut engine = engine(&backend);
            let speakers = Device::new("speakers", "Speakers", 2);

            for op in ops {
                let before = engine.transport();
                match op {
                    Op::Play => {
                        engine.play(&speakers, &path).unwrap();
                        prop_assert_ne!(engine.transport(), TransportState::Stopped);
                    }
                    Op::Pause => {
                        engine.pause();
                        if before == TransportState::Stopped {
                            prop_assert_eq!(engine.transport(), TransportState::Stopped);
                        } else {
                            prop_assert_eq!(engine.transport(), TransportState::Paused);
                        }
                    }
                    Op::Stop => {
                        engine.stop();
                        prop_assert_eq!(engine.transport(), TransportState::Stopped);
                        prop_assert!(!engine.is_playing());
                    }
                    Op::Acknowledge => {
                        engine.acknowledge_finished();
                    }
                }
            }

            engine.stop();
            prop_assert_eq!(engine.transport(), TransportState::Stopped);
            prop_assert!(!engine.is_playing());
            engine.stop();
            prop_assert_eq!(engine.transport(), TransportState::Stopped);
        }
    }
}
