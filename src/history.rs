/*!
History channel: every observable state transition is published as a fixed
20-byte UDP datagram to an external collector.

Producers (the evaluation and bypass threads) enqueue into a small in-process
queue and never block; a background sender thread drains the queue and emits
one datagram per message. When the queue is full the message is dropped and
a warning logged - the audit channel must never stall the interlock path.
*/

use std::collections::VecDeque;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info, warn};

/// Default collector endpoint.
pub const DEFAULT_COLLECTOR: &str = "lcls-dev3:3356";

/// Soft cap on the in-process queue; overflow drops the message.
pub const HISTORY_QUEUE_MAX: usize = 100;

/// Encoded record size on the wire.
pub const HISTORY_MESSAGE_SIZE: usize = 20;

/// Auxiliary index reported for digital bypass transitions (analog ones
/// report the integrator index instead).
pub const BYPASS_DIGITAL_INDEX: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum HistoryKind {
    /// Fault changed state (faulted / not faulted).
    FaultState = 1,
    /// Bypass expired, created or cancelled.
    BypassState = 2,
    /// Bypass value changed.
    BypassValue = 3,
    /// Change in allowed beam class for a destination.
    Mitigation = 4,
    /// Change in a digital input.
    DeviceInput = 5,
    /// Change in an analog channel threshold status.
    AnalogDevice = 6,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryMessage {
    pub kind: HistoryKind,
    pub id: u32,
    pub old_value: u32,
    pub new_value: u32,
    pub aux: u32,
}

impl HistoryMessage {
    pub fn encode(&self) -> [u8; HISTORY_MESSAGE_SIZE] {
        let mut buf = [0u8; HISTORY_MESSAGE_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.kind as u32);
        LittleEndian::write_u32(&mut buf[4..8], self.id);
        LittleEndian::write_u32(&mut buf[8..12], self.old_value);
        LittleEndian::write_u32(&mut buf[12..16], self.new_value);
        LittleEndian::write_u32(&mut buf[16..20], self.aux);
        buf
    }
}

struct Shared {
    queue: Mutex<VecDeque<HistoryMessage>>,
    available: Condvar,
    sent: AtomicU64,
    dropped: AtomicU64,
    enabled: AtomicBool,
}

/// Cheap cloneable producer handle. One sender thread per process drains the
/// shared queue.
#[derive(Clone)]
pub struct History {
    shared: Arc<Shared>,
}

impl History {
    pub fn new() -> Self {
        History {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn log(&self, kind: HistoryKind, id: u32, old_value: u32, new_value: u32, aux: u32) {
        if !self.shared.enabled.load(Ordering::Relaxed) {
            return;
        }
        let message = HistoryMessage {
            kind,
            id,
            old_value,
            new_value,
            aux,
        };
        {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= HISTORY_QUEUE_MAX {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "history queue full ({} entries), dropping {:?} for id {}",
                    HISTORY_QUEUE_MAX, kind, id
                );
                return;
            }
            queue.push_back(message);
        }
        self.shared.available.notify_one();
    }

    pub fn log_fault(&self, id: u32, old_value: u32, new_value: u32, fault_state_id: u32) {
        self.log(HistoryKind::FaultState, id, old_value, new_value, fault_state_id);
    }

    pub fn log_bypass_state(&self, id: u32, old_value: u32, new_value: u32, index: u32) {
        self.log(HistoryKind::BypassState, id, old_value, new_value, index);
    }

    pub fn log_bypass_value(&self, id: u32, old_value: u32, new_value: u32) {
        self.log(HistoryKind::BypassValue, id, old_value, new_value, 0);
    }

    pub fn log_mitigation(&self, id: u32, old_value: u32, new_value: u32) {
        self.log(HistoryKind::Mitigation, id, old_value, new_value, 0);
    }

    pub fn log_device_input(&self, id: u32, old_value: u32, new_value: u32) {
        self.log(HistoryKind::DeviceInput, id, old_value, new_value, 0);
    }

    pub fn log_analog_device(&self, id: u32, old_value: u32, new_value: u32) {
        self.log(HistoryKind::AnalogDevice, id, old_value, new_value, 0);
    }

    /// Messages delivered to the collector so far.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Messages dropped on queue overflow.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Take everything currently queued. Used by tests and by status dumps
    /// when no sender thread is running.
    pub fn drain(&self) -> Vec<HistoryMessage> {
        self.shared.queue.lock().unwrap().drain(..).collect()
    }

    /// Start the background sender. Resolution and socket setup failures are
    /// returned so the caller can decide whether to run without the channel.
    pub fn start_sender(
        &self,
        collector: &str,
        run: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let addr = collector
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("history collector {collector} did not resolve"),
                )
            })?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        let shared = Arc::clone(&self.shared);
        info!("history sender ready, collector {addr}");

        std::thread::Builder::new()
            .name("history".into())
            .spawn(move || {
                while run.load(Ordering::Relaxed) {
                    let message = {
                        let mut queue = shared.queue.lock().unwrap();
                        while queue.is_empty() {
                            let (guard, result) = shared
                                .available
                                .wait_timeout(queue, Duration::from_millis(100))
                                .unwrap();
                            queue = guard;
                            if result.timed_out() && queue.is_empty() {
                                break;
                            }
                        }
                        queue.pop_front()
                    };
                    let Some(message) = message else {
                        continue;
                    };
                    match socket.send_to(&message.encode(), addr) {
                        Ok(n) if n == HISTORY_MESSAGE_SIZE => {
                            shared.sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(n) => {
                            error!("short history datagram: sent {n} of {HISTORY_MESSAGE_SIZE}");
                        }
                        Err(e) => error!("failed to send history message: {e}"),
                    }
                }
                info!("history sender stopped");
            })
    }
}

impl Default for History {
    fn default() -> Self {
        History::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_little_endian_20_bytes() {
        let m = HistoryMessage {
            kind: HistoryKind::BypassState,
            id: 0x0102_0304,
            old_value: 1,
            new_value: 0,
            aux: BYPASS_DIGITAL_INDEX,
        };
        let buf = m.encode();
        assert_eq!(buf.len(), HISTORY_MESSAGE_SIZE);
        assert_eq!(&buf[0..4], &[2, 0, 0, 0]);
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[8..12], &[1, 0, 0, 0]);
        assert_eq!(&buf[16..20], &[100, 0, 0, 0]);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let h = History::new();
        for i in 0..(HISTORY_QUEUE_MAX as u32 + 5) {
            h.log_device_input(i, 0, 1);
        }
        assert_eq!(h.dropped(), 5);
        assert_eq!(h.drain().len(), HISTORY_QUEUE_MAX);
    }

    #[test]
    fn disabled_handle_is_silent() {
        let h = History::new();
        h.set_enabled(false);
        h.log_fault(1, 0, 1, 0);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn sender_delivers_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = receiver.local_addr().unwrap();

        let run = Arc::new(AtomicBool::new(true));
        let h = History::new();
        let handle = h.start_sender(&addr.to_string(), Arc::clone(&run)).unwrap();

        h.log_mitigation(7, 5, 2);
        let mut buf = [0u8; 64];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, HISTORY_MESSAGE_SIZE);
        assert_eq!(LittleEndian::read_u32(&buf[0..4]), HistoryKind::Mitigation as u32);
        assert_eq!(LittleEndian::read_u32(&buf[4..8]), 7);

        run.store(false, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(h.sent(), 1);
    }
}
