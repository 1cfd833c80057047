use crate::SampleBuffer;
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Capture statistics, with both *all-time* counters and a *sliding 1 s
/// window* rate.
#[derive(Debug, Clone)]
pub struct Counter {
    /// All-time number of captures
    pub n_captures: usize,
    /// All-time samples over every channel
    pub total_samples: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    captures: VecDeque<(Instant, usize)>,
    samples_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Self::with_window(Duration::from_secs(1))
    }
}

impl Counter {
    /// Create a new Counter with a 1 s sliding window.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_window(window: Duration) -> Self {
        Counter {
            n_captures: 0,
            total_samples: 0,
            t_begin: Instant::now(),
            window,
            captures: VecDeque::new(),
            samples_in_window: 0,
        }
    }

    /// Long-term average since t_begin, in captures/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        self.n_captures as f64 / secs
    }

    /// Captures per second over the sliding window
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.captures.len() as f64 / secs
    }

    /// Samples per second over the sliding window
    pub fn sample_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.samples_in_window as f64 / secs
    }

    /// Record a capture, counting the samples of every channel in it.
    pub fn record(&mut self, capture: &[SampleBuffer]) {
        self.increment(capture.iter().map(SampleBuffer::len).sum());
    }

    /// Record a capture of `samples` samples over all channels.
    pub fn increment(&mut self, samples: usize) {
        self.increment_at(Instant::now(), samples);
    }

    fn increment_at(&mut self, now: Instant, samples: usize) {
        self.n_captures += 1;
        self.total_samples += samples;

        self.captures.push_back((now, samples));
        self.samples_in_window += samples;

        while let Some(&(ts, n)) = self.captures.front() {
            if now.duration_since(ts) > self.window {
                self.captures.pop_front();
                self.samples_in_window -= n;
            } else {
                break;
            }
        }
    }

    /// Reset both all-time counters and the sliding window.
    pub fn reset(&mut self) {
        self.n_captures = 0;
        self.total_samples = 0;
        self.t_begin = Instant::now();

        self.captures.clear();
        self.samples_in_window = 0;
    }
}

/// Engineering-notation helper for axis labels and the status line.
pub fn si(value: f64, unit: &str) -> String {
    let abs = value.abs();
    let (scaled, prefix) = if abs >= 1e6 {
        (value / 1e6, "M")
    } else if abs >= 1e3 {
        (value / 1e3, "k")
    } else if abs >= 1.0 || abs == 0.0 {
        (value, "")
    } else if abs >= 1e-3 {
        (value * 1e3, "m")
    } else if abs >= 1e-6 {
        (value * 1e6, "µ")
    } else {
        (value * 1e9, "n")
    };
    format!("{scaled:.3} {prefix}{unit}")
}
