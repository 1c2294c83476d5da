use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Fixed-window moving average over request latencies.
///
/// `next` and `reset` mutate the sample window under a mutex; the most
/// recent mean is mirrored into an atomic so `last` never contends with the
/// request path.
pub struct MovingAverage {
    window: usize,
    samples: Mutex<Window>,
    last_nanos: AtomicU64,
}

struct Window {
    durations: VecDeque<Duration>,
    sum: Duration,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        assert!(window >= 1, "window must hold at least one sample");
        Self {
            window,
            samples: Mutex::new(Window {
                durations: VecDeque::with_capacity(window),
                sum: Duration::ZERO,
            }),
            last_nanos: AtomicU64::new(0),
        }
    }

    /// Append a sample, discarding the oldest once the window is full, and
    /// return the new mean. Nanosecond precision, truncated toward zero.
    pub fn next(&self, d: Duration) -> Duration {
        let mut win = self.samples.lock().expect("moving average lock poisoned");
        if win.durations.len() == self.window {
            if let Some(oldest) = win.durations.pop_front() {
                win.sum -= oldest;
            }
        }
        win.sum += d;
        win.durations.push_back(d);
        let mean = win.sum.as_nanos() / win.durations.len() as u128;
        let mean = u64::try_from(mean).unwrap_or(u64::MAX);
        self.last_nanos.store(mean, Ordering::Release);
        Duration::from_nanos(mean)
    }

    /// The mean observed at the most recent `next` call, or zero if no
    /// sample was ever recorded or after `reset`.
    pub fn last(&self) -> Duration {
        Duration::from_nanos(self.last_nanos.load(Ordering::Acquire))
    }

    pub fn reset(&self) {
        let mut win = self.samples.lock().expect("moving average lock poisoned");
        win.durations.clear();
        win.sum = Duration::ZERO;
        self.last_nanos.store(0, Ordering::Release);
    }
}
