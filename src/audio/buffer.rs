//! Lock-free sample queue between the playback worker and the output callback
//!
//! Single producer (the worker writing decoded chunks), single consumer (the
//! realtime output callback). The producer may block for a bounded time when
//! the queue is full; the consumer never blocks and pads with silence.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Granularity of the producer's wait when the queue is full
const WAIT_STEP: Duration = Duration::from_millis(1);

/// Bounded queue of interleaved f32 samples
pub struct SampleQueue {
    queue: ArrayQueue<f32>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl SampleQueue {
    /// Create a queue holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Pop one sample without counting an underrun
    pub fn try_pop(&self) -> Option<f32> {
        self.queue.pop()
    }

    /// Record that the consumer ran out of samples during one callback
    pub fn note_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Queue every sample, waiting for space until `timeout` elapses.
    ///
    /// Returns the number of samples queued; less than `samples.len()` means
    /// the consumer stalled for the whole timeout.
    pub fn write_all(&self, samples: &[f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < samples.len() {
            if self.queue.push(samples[written]).is_ok() {
                written += 1;
                continue;
            }
            if Instant::now() >= deadline {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                break;
            }
            thread::sleep(WAIT_STEP);
        }

        written
    }

    /// Wait until the consumer has taken every queued sample.
    /// Returns false if the queue was still non-empty at `timeout`.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(WAIT_STEP);
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a sample queue
pub type SharedSampleQueue = Arc<SampleQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_basic() {
        let queue = SampleQueue::new(4);

        assert_eq!(queue.write_all(&[0.25, -0.5], Duration::from_millis(10)), 2);
        assert_eq!(queue.capacity(), 4);

        assert_eq!(queue.try_pop(), Some(0.25));
        assert_eq!(queue.try_pop(), Some(-0.5));
        assert!(queue.is_empty());
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn test_write_all_times_out_without_consumer() {
        let queue = SampleQueue::new(3);
        let written = queue.write_all(&[0.1; 5], Duration::from_millis(20));
        assert_eq!(written, 3);
        assert_eq!(queue.overflow_count(), 1);
    }

    #[test]
    fn test_write_all_waits_for_consumer() {
        let queue = Arc::new(SampleQueue::new(2));
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut taken = 0;
                while taken < 6 {
                    if queue.try_pop().is_some() {
                        taken += 1;
                    } else {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        };

        let written = queue.write_all(&[0.5; 6], Duration::from_secs(2));
        assert_eq!(written, 6);
        consumer.join().unwrap();
        assert!(queue.wait_empty(Duration::from_millis(100)));
    }

    #[test]
    fn test_wait_empty_and_underrun() {
        let queue = SampleQueue::new(8);
        queue.write_all(&[1.0; 5], Duration::from_millis(10));
        assert!(!queue.wait_empty(Duration::from_millis(5)));

        while queue.try_pop().is_some() {}
        assert!(queue.wait_empty(Duration::from_millis(5)));

        queue.note_underrun();
        assert_eq!(queue.underrun_count(), 1);
        assert_eq!(queue.overflow_count(), 0);
    }
}
