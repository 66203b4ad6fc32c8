//! Playback worker: transport commands in, status events out
//!
//! The worker owns the file and the output sink. The engine talks to it only
//! through a command channel and reads back a [`WorkerEvent`] stream plus a
//! [`CompletionLatch`] it can poll without blocking.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::audio::device::Device;
use crate::audio::playback::output::{OutputBackend, OutputSink, StreamParams};
use crate::audio::playback::wav::WavSource;
use crate::error::PlaybackError;

/// Controller to worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    Resume,
    Pause,
    Stop,
}

/// Why a worker ended
#[derive(Debug, Clone, PartialEq)]
pub enum FinishReason {
    /// All frames were written and drained
    EndOfStream,
    /// A stop command was observed
    Stopped,
    /// The output stream failed mid-playback
    DeviceFailure(String),
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FinishReason::EndOfStream => f.write_str("end of stream"),
            FinishReason::Stopped => f.write_str("stopped"),
            FinishReason::DeviceFailure(reason) => write!(f, "device failure: {}", reason),
        }
    }
}

/// Worker to controller
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The output stream is open and rendering begins
    Started,
    /// The output stream could not be opened; the worker exits
    OpenFailed(PlaybackError),
    Finished(FinishReason),
}

/// Set-once completion flag shared by worker and engine
#[derive(Debug, Clone, Default)]
pub struct CompletionLatch(Arc<AtomicBool>);

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn finish(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Sets the latch when the worker body returns or unwinds
struct FinishGuard(CompletionLatch);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// What the render loop does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Terminate,
}

/// Transport state as seen from inside the worker.
///
/// Checked before every chunk: pending commands are applied, and while paused
/// the worker parks on the command channel until resumed or stopped.
pub struct RenderControl {
    commands: Receiver<TransportCommand>,
    paused: bool,
}

impl RenderControl {
    pub fn new(commands: Receiver<TransportCommand>) -> Self {
        Self {
            commands,
            paused: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Apply pending commands and decide whether the next chunk is written.
    /// A dropped command channel counts as a stop.
    pub fn before_chunk(&mut self, sink: &mut dyn OutputSink) -> Result<Gate, PlaybackError> {
        loop {
            let command = if self.paused {
                self.commands.recv().ok()
            } else {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => return Ok(Gate::Proceed),
                    Err(TryRecvError::Disconnected) => None,
                }
            };

            match command {
                None | Some(TransportCommand::Stop) => return Ok(Gate::Terminate),
                Some(TransportCommand::Pause) => {
                    if !self.paused {
                        self.paused = true;
                        sink.pause()?;
                        tracing::debug!("Worker paused");
                    }
                }
                Some(TransportCommand::Resume) => {
                    if self.paused {
                        self.paused = false;
                        sink.resume()?;
                        tracing::debug!("Worker resumed");
                    }
                }
            }
        }
    }
}

/// Everything a worker needs, moved onto its thread
pub struct WorkerContext {
    pub backend: Arc<dyn OutputBackend>,
    pub device: Device,
    pub source: WavSource,
    pub params: StreamParams,
    pub chunk_frames: usize,
    pub commands: Receiver<TransportCommand>,
    pub events: Sender<WorkerEvent>,
    pub latch: CompletionLatch,
}

/// Worker thread body
pub fn run(ctx: WorkerContext) {
    let WorkerContext {
        backend,
        device,
        mut source,
        params,
        chunk_frames,
        commands,
        events,
        latch,
    } = ctx;
    let _guard = FinishGuard(latch);
    let path: PathBuf = source.path().to_path_buf();

    let mut sink = match backend.open(&device, &params) {
        Ok(sink) => sink,
        Err(e) => {
            tracing::warn!("Cannot open output on {}: {}", device.name, e);
            let _ = events.send(WorkerEvent::OpenFailed(e));
            return;
        }
    };
    let _ = events.send(WorkerEvent::Started);
    tracing::info!("Playing {} on {}", path.display(), device.name);

    let mut control = RenderControl::new(commands);
    let reason = render(&mut source, sink.as_mut(), &mut control, chunk_frames);
    drop(sink);

    match &reason {
        FinishReason::DeviceFailure(err) => {
            tracing::warn!("Playback of {} ended early: {}", path.display(), err)
        }
        other => tracing::info!("Playback of {} finished: {}", path.display(), other),
    }
    let _ = events.send(WorkerEvent::Finished(reason));
}

/// Render loop. Errors never escape; they become the finish reason.
pub fn render(
    source: &mut WavSource,
    sink: &mut dyn OutputSink,
    control: &mut RenderControl,
    chunk_frames: usize,
) -> FinishReason {
    let mut chunk = Vec::with_capacity(chunk_frames * source.header().channels as usize);

    loop {
        match control.before_chunk(sink) {
            Ok(Gate::Proceed) => {}
            Ok(Gate::Terminate) => return FinishReason::Stopped,
            Err(e) => return FinishReason::DeviceFailure(e.to_string()),
        }

        match source.read_chunk(chunk_frames, &mut chunk) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                // Truncated or damaged data ends playback at the last good chunk
                tracing::warn!("{}: {}", source.path().display(), e);
                break;
            }
        }

        if let Err(e) = sink.write(&chunk) {
            return FinishReason::DeviceFailure(e.to_string());
        }
    }

    match sink.drain() {
        Ok(()) => FinishReason::EndOfStream,
        Err(e) => FinishReason::DeviceFailure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::playback::testing::{write_wav, RecordingBackend};
    use crossbeam_channel::unbounded;

    fn open_sink(backend: &RecordingBackend) -> Box<dyn OutputSink> {
        let device = Device::new("dev", "Dev", 2);
        let params = StreamParams::negotiate(2, 8000, &device).unwrap();
        backend.open(&device, &params).unwrap()
    }

    #[test]
    fn test_gate_proceeds_without_commands() {
        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (_tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        assert_eq!(control.before_chunk(sink.as_mut()).unwrap(), Gate::Proceed);
        assert!(!control.is_paused());
    }

    #[test]
    fn test_pause_then_resume_is_applied_in_order() {
        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        tx.send(TransportCommand::Pause).unwrap();
        tx.send(TransportCommand::Resume).unwrap();
        assert_eq!(control.before_chunk(sink.as_mut()).unwrap(), Gate::Proceed);

        let recording = backend.recording();
        assert_eq!(recording.pauses, 1);
        assert_eq!(recording.resumes, 1);
    }

    #[test]
    fn test_stop_wakes_paused_worker() {
        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        tx.send(TransportCommand::Pause).unwrap();
        tx.send(TransportCommand::Stop).unwrap();
        assert_eq!(control.before_chunk(sink.as_mut()).unwrap(), Gate::Terminate);
        assert!(control.is_paused());
    }

    #[test]
    fn test_dropped_channel_terminates() {
        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (tx, rx) = unbounded::<TransportCommand>();
        let mut control = RenderControl::new(rx);
        drop(tx);

        assert_eq!(control.before_chunk(sink.as_mut()).unwrap(), Gate::Terminate);
    }

    #[test]
    fn test_duplicate_commands_are_ignored() {
        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        tx.send(TransportCommand::Resume).unwrap();
        tx.send(TransportCommand::Pause).unwrap();
        tx.send(TransportCommand::Pause).unwrap();
        tx.send(TransportCommand::Resume).unwrap();
        tx.send(TransportCommand::Resume).unwrap();
        assert_eq!(control.before_chunk(sink.as_mut()).unwrap(), Gate::Proceed);

        let recording = backend.recording();
        assert_eq!(recording.pauses, 1);
        assert_eq!(recording.resumes, 1);
    }

    #[test]
    fn test_render_writes_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 2, 8000, 1000);
        let mut source = WavSource::open(&path).unwrap();

        let backend = RecordingBackend::new();
        let mut sink = open_sink(&backend);
        let (_tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        let reason = render(&mut source, sink.as_mut(), &mut control, 256);
        assert_eq!(reason, FinishReason::EndOfStream);

        let recording = backend.recording();
        assert_eq!(recording.samples_written, 2000);
        assert_eq!(recording.chunks, 4);
        assert!(recording.drained);
    }

    #[test]
    fn test_write_failure_becomes_finish_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 1, 8000, 4096);
        let mut source = WavSource::open(&path).unwrap();

        let backend = RecordingBackend::new().failing_after(2);
        let mut sink = open_sink(&backend);
        let (_tx, rx) = unbounded();
        let mut control = RenderControl::new(rx);

        let reason = render(&mut source, sink.as_mut(), &mut control, 256);
        assert!(matches!(reason, FinishReason::DeviceFailure(_)));
        assert_eq!(backend.recording().chunks, 2);
    }

    #[test]
    fn test_latch_is_set_when_worker_exits() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wav(dir.path(), "tone.wav", 1, 8000, 100);
        let latch = CompletionLatch::new();
        let (_cmd_tx, cmd_rx) = unbounded();
        let (ev_tx, ev_rx) = unbounded();
        let device = Device::new("dev", "Dev", 2);

        run(WorkerContext {
            backend: Arc::new(RecordingBackend::new().rejecting()),
            params: StreamParams::negotiate(1, 8000, &device).unwrap(),
            device,
            source: WavSource::open(&path).unwrap(),
            chunk_frames: 64,
            commands: cmd_rx,
            events: ev_tx,
            latch: latch.clone(),
        });

        assert!(latch.is_finished());
        assert!(matches!(ev_rx.try_recv(), Ok(WorkerEvent::OpenFailed(_))));
    }
}
