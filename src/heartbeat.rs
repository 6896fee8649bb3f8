/*!
Software watchdog heartbeat.

The firmware arms a watchdog that drops beam permits if the software stops
beating. Two policies:

- `BlockingHeartbeat`: the caller's thread writes the heartbeat register.
- `NonBlockingHeartbeat`: the caller posts a request through a condition
  variable and a dedicated writer thread performs the register access. The
  caller waits only until the *previous* beat has been consumed, so the
  evaluation loop never blocks behind a slow register write.

Both record the beat count, the watchdog-error count (the error flag is
read-and-cleared on every beat), and rolling transmit period/duration
statistics.
*/

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info};

use crate::firmware::FirmwareIo;
use crate::timer::TimeAverage;

/// Watchdog period programmed into the firmware, in microseconds.
pub const DEFAULT_WATCHDOG_TIMEOUT_US: u32 = 3500;

/// How long the writer thread waits for a beat request before counting a
/// request timeout.
pub const REQUEST_TIMEOUT_MS: u64 = 5;

struct BeatCore {
    fw: Arc<dyn FirmwareIo>,
    tx_period: TimeAverage,
    tx_duration: TimeAverage,
    beat_count: u64,
    wd_error_count: u64,
}

impl BeatCore {
    fn new(fw: Arc<dyn FirmwareIo>, timer_capacity: usize) -> Self {
        BeatCore {
            fw,
            tx_period: TimeAverage::new("heartbeat period", timer_capacity),
            tx_duration: TimeAverage::new("heartbeat duration", timer_capacity),
            beat_count: 0,
            wd_error_count: 0,
        }
    }

    fn beat_once(&mut self) {
        self.tx_duration.start();
        if self.fw.take_watchdog_error() {
            self.wd_error_count += 1;
        }
        if let Err(e) = self.fw.heartbeat() {
            error!("heartbeat write failed: {e}");
        }
        self.tx_period.tick();
        self.beat_count += 1;
        self.tx_duration.end();
    }

    fn clear(&mut self) {
        self.tx_period.clear();
        self.tx_duration.clear();
        self.beat_count = 0;
        self.wd_error_count = 0;
    }

    fn report(&self) -> String {
        format!(
            "heartbeats={} watchdog-errors={}\n  {}\n  {}",
            self.beat_count,
            self.wd_error_count,
            self.tx_period.summary(),
            self.tx_duration.summary(),
        )
    }
}

/// Heartbeat written directly from the calling thread.
pub struct BlockingHeartbeat {
    core: Mutex<BeatCore>,
}

impl BlockingHeartbeat {
    pub fn new(fw: Arc<dyn FirmwareIo>, watchdog_timeout_us: u32, timer_capacity: usize) -> Self {
        fw.set_watchdog_timeout(watchdog_timeout_us);
        BlockingHeartbeat {
            core: Mutex::new(BeatCore::new(fw, timer_capacity)),
        }
    }

    pub fn beat(&self) {
        self.core.lock().unwrap().beat_once();
    }

    pub fn beat_count(&self) -> u64 {
        self.core.lock().unwrap().beat_count
    }

    pub fn wd_error_count(&self) -> u64 {
        self.core.lock().unwrap().wd_error_count
    }

    pub fn clear(&self) {
        self.core.lock().unwrap().clear();
    }

    pub fn report(&self) -> String {
        self.core.lock().unwrap().report()
    }
}

struct HeartbeatShared {
    state: Mutex<HeartbeatState>,
    signal: Condvar,
    run: AtomicBool,
    request_timeouts: AtomicU64,
}

struct HeartbeatState {
    beat_requested: bool,
    core: BeatCore,
}

/// Heartbeat written by a dedicated thread; `beat` only posts a request.
pub struct NonBlockingHeartbeat {
    shared: Arc<HeartbeatShared>,
    writer: Option<JoinHandle<()>>,
}

impl NonBlockingHeartbeat {
    pub fn new(fw: Arc<dyn FirmwareIo>, watchdog_timeout_us: u32, timer_capacity: usize) -> Self {
        fw.set_watchdog_timeout(watchdog_timeout_us);
        let shared = Arc::new(HeartbeatShared {
            state: Mutex::new(HeartbeatState {
                beat_requested: false,
                core: BeatCore::new(fw, timer_capacity),
            }),
            signal: Condvar::new(),
            run: AtomicBool::new(true),
            request_timeouts: AtomicU64::new(0),
        });

        let writer = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("heartbeat".into())
                .spawn(move || heartbeat_writer(shared))
                .expect("failed to spawn heartbeat thread")
        };

        NonBlockingHeartbeat {
            shared,
            writer: Some(writer),
        }
    }

    /// Request a beat. Waits for the previous request to be consumed first,
    /// then returns without waiting for the register write itself.
    pub fn beat(&self) {
        let state = self.shared.state.lock().unwrap();
        let mut state = self
            .shared
            .signal
            .wait_while(state, |s| s.beat_requested)
            .unwrap();
        state.beat_requested = true;
        drop(state);
        self.shared.signal.notify_all();
    }

    pub fn beat_count(&self) -> u64 {
        self.shared.state.lock().unwrap().core.beat_count
    }

    pub fn wd_error_count(&self) -> u64 {
        self.shared.state.lock().unwrap().core.wd_error_count
    }

    /// Writer-side waits that expired without a pending request.
    pub fn request_timeouts(&self) -> u64 {
        self.shared.request_timeouts.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        let state = self.shared.state.lock().unwrap();
        let mut state = self
            .shared
            .signal
            .wait_while(state, |s| s.beat_requested)
            .unwrap();
        state.core.clear();
        self.shared.request_timeouts.store(0, Ordering::Relaxed);
    }

    pub fn report(&self) -> String {
        format!(
            "request-timeouts={}\n  {}",
            self.request_timeouts(),
            self.shared.state.lock().unwrap().core.report(),
        )
    }
}

impl Drop for NonBlockingHeartbeat {
    fn drop(&mut self) {
        self.shared.run.store(false, Ordering::Relaxed);
        self.shared.signal.notify_all();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn heartbeat_writer(shared: Arc<HeartbeatShared>) {
    crate::rt::configure_current_thread(87);
    info!("heartbeat writer started");
    loop {
        let state = shared.state.lock().unwrap();
        let (mut state, timeout) = shared
            .signal
            .wait_timeout_while(state, Duration::from_millis(REQUEST_TIMEOUT_MS), |s| {
                !s.beat_requested
            })
            .unwrap();

        if state.beat_requested {
            state.core.beat_once();
            state.beat_requested = false;
            drop(state);
            shared.signal.notify_all();
        } else if timeout.timed_out() && shared.run.load(Ordering::Relaxed) {
            shared.request_timeouts.fetch_add(1, Ordering::Relaxed);
        }

        if !shared.run.load(Ordering::Relaxed) {
            info!("heartbeat writer stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::SimFirmware;

    #[test]
    fn blocking_beat_toggles_register() {
        let fw = Arc::new(SimFirmware::new());
        let hb = BlockingHeartbeat::new(Arc::clone(&fw) as Arc<dyn FirmwareIo>, 3500, 8);
        assert_eq!(fw.watchdog_timeout(), 3500);
        hb.beat();
        hb.beat();
        assert_eq!(fw.heartbeat_count(), 2);
        assert_eq!(hb.beat_count(), 2);
    }

    #[test]
    fn blocking_beat_counts_watchdog_errors() {
        let fw = Arc::new(SimFirmware::new());
        let hb = BlockingHeartbeat::new(Arc::clone(&fw) as Arc<dyn FirmwareIo>, 3500, 8);
        fw.inject_watchdog_error();
        hb.beat();
        hb.beat();
        assert_eq!(hb.wd_error_count(), 1);
    }

    #[test]
    fn non_blocking_beat_reaches_firmware() {
        let fw = Arc::new(SimFirmware::new());
        let hb = NonBlockingHeartbeat::new(Arc::clone(&fw) as Arc<dyn FirmwareIo>, 3500, 8);
        hb.beat();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fw.heartbeat_count() == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(fw.heartbeat_count(), 1);
        assert_eq!(hb.beat_count(), 1);
    }

    #[test]
    fn idle_writer_counts_request_timeouts() {
        let fw = Arc::new(SimFirmware::new());
        let hb = NonBlockingHeartbeat::new(fw as Arc<dyn FirmwareIo>, 3500, 8);
        std::thread::sleep(Duration::from_millis(30));
        assert!(hb.request_timeouts() > 0);
    }

    #[test]
    fn drop_stops_writer() {
        let fw = Arc::new(SimFirmware::new());
        let hb = NonBlockingHeartbeat::new(fw as Arc<dyn FirmwareIo>, 3500, 8);
        hb.beat();
        drop(hb);
        // Nothing to assert beyond "join did not hang".
    }
}
