/*!
Rolling duration statistics.

`TimeAverage` keeps a fixed-capacity ring of the most recent measurements and
an all-time maximum that survives ring turnover. Two usage styles:

- `start()` / `end()` brackets a single measured section;
- `tick()` records the period between successive calls (first call arms it).

All statistics are O(n) over the ring on read and O(1) on record; nothing
allocates after construction, so recording is safe on the 360 Hz path.
*/

use std::time::{Duration, Instant};

pub struct TimeAverage {
    name: String,
    samples: Vec<Duration>,
    head: usize,
    len: usize,
    started: Option<Instant>,
    last_tick: Option<Instant>,
    all_time_max: Duration,
    count: u64,
}

impl TimeAverage {
    pub fn new(name: &str, capacity: usize) -> Self {
        TimeAverage {
            name: name.to_string(),
            samples: vec![Duration::ZERO; capacity.max(1)],
            head: 0,
            len: 0,
            started: None,
            last_tick: None,
            all_time_max: Duration::ZERO,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arm the start/end bracket.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Close the bracket opened by `start` and record the elapsed time.
    /// Returns the measurement, or zero if `start` was never called.
    pub fn end(&mut self) -> Duration {
        match self.started.take() {
            Some(t0) => {
                let elapsed = t0.elapsed();
                self.record(elapsed);
                elapsed
            }
            None => Duration::ZERO,
        }
    }

    /// Record the period since the previous `tick`. The first call only arms
    /// the timer.
    pub fn tick(&mut self) {
        let now = Instant::now();
        if let Some(prev) = self.last_tick.replace(now) {
            self.record(now - prev);
        }
    }

    fn record(&mut self, sample: Duration) {
        self.samples[self.head] = sample;
        self.head = (self.head + 1) % self.samples.len();
        self.len = (self.len + 1).min(self.samples.len());
        self.count += 1;
        if sample > self.all_time_max {
            self.all_time_max = sample;
        }
    }

    fn ring(&self) -> &[Duration] {
        &self.samples[..self.len]
    }

    pub fn min(&self) -> Duration {
        self.ring().iter().copied().min().unwrap_or(Duration::ZERO)
    }

    /// Maximum over the current ring contents only.
    pub fn max(&self) -> Duration {
        self.ring().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn mean(&self) -> Duration {
        if self.len == 0 {
            return Duration::ZERO;
        }
        let total: Duration = self.ring().iter().sum();
        total / self.len as u32
    }

    /// Maximum over the whole lifetime, unaffected by ring turnover.
    pub fn all_time_max(&self) -> Duration {
        self.all_time_max
    }

    /// Number of samples recorded over the lifetime.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Drop all samples and re-arm. The all-time maximum is cleared too.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.count = 0;
        self.started = None;
        self.last_tick = None;
        self.all_time_max = Duration::ZERO;
    }

    /// One-line summary for status output and shutdown reports.
    pub fn summary(&self) -> String {
        format!(
            "{}: min={}us avg={}us max={}us all-time-max={}us samples={}",
            self.name,
            self.min().as_micros(),
            self.mean().as_micros(),
            self.max().as_micros(),
            self.all_time_max.as_micros(),
            self.count,
        )
    }
}
