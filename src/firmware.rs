/*!
Firmware I/O plane.

`FirmwareIo` is the seam between the engine and the interlock fabric: update
and power-class-change streams, per-card configuration writes, the
application timeout registers, the software mitigation word pair, beam
timing tables, and the watchdog/heartbeat registers. `SimFirmware` is the
in-memory implementation used by tests and hardware-less operation; a real
transport implements the same trait.

The long-running worker loops live here too: the update-stream reader, the
mitigation writer and the power-class-change monitor. Each polls the shared
`run` flag inside its blocking timeout and exits cooperatively.
*/

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info};
use thiserror::Error;

use crate::defs::{
    FW_NUM_BEAM_CLASSES, NUM_APPLICATIONS, NUM_DESTINATIONS, PC_CHANGE_TIMEOUT_US,
    POWER_CLASS_BIT_SIZE, UPDATE_BUFFER_SIZE_BYTES, UPDATE_TIMEOUT_US,
};
use crate::queue::Queue;
use crate::timer::TimeAverage;

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("firmware register access failed: {0}")]
    Register(String),
    #[error("firmware stream failed: {0}")]
    Stream(String),
}

/// Access to the central node firmware. All methods take `&self`; an
/// implementation provides its own interior synchronisation so it can be
/// shared across the worker threads.
pub trait FirmwareIo: Send + Sync {
    /// Read one update packet. Returns 0 on timeout.
    fn read_update(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, FirmwareError>;

    /// Read one power-class-change record. Returns 0 on timeout.
    fn read_pc_change(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, FirmwareError>;

    /// Write one card's configuration slice.
    fn write_config(&self, card_number: u32, slice: &[u8]) -> Result<(), FirmwareError>;

    /// Stage a card's timeout-enable bit. Takes effect on the next
    /// `write_app_timeout_mask`.
    fn set_app_timeout_enable(&self, card_number: u32, enable: bool);

    /// Currently staged timeout-enable bit for a card.
    fn app_timeout_enable(&self, card_number: u32) -> bool;

    /// True when the firmware flagged the card as timed out (no traffic).
    fn app_timeout_status(&self, card_number: u32) -> bool;

    /// Commit the staged timeout-enable bits.
    fn write_app_timeout_mask(&self) -> Result<(), FirmwareError>;

    /// Write the two software mitigation words.
    fn write_mitigation(&self, buffer: &[u32; 2]) -> Result<(), FirmwareError>;

    /// Write the per-beam-class timing parameters.
    fn write_timing(
        &self,
        time: &[u32; FW_NUM_BEAM_CLASSES],
        period: &[u32; FW_NUM_BEAM_CLASSES],
        charge: &[u32; FW_NUM_BEAM_CLASSES],
    ) -> Result<(), FirmwareError>;

    /// Atomically flip the hardware to the newly written configuration.
    fn switch_config(&self) -> Result<(), FirmwareError>;

    /// Toggle the software heartbeat bit.
    fn heartbeat(&self) -> Result<(), FirmwareError>;

    /// Read and clear the software watchdog error flag.
    fn take_watchdog_error(&self) -> bool;

    /// Program the software watchdog period, in microseconds.
    fn set_watchdog_timeout(&self, micros: u32);
}

/// One power-class-change telemetry record: 24 bytes on the wire.
/// `tag` increments monotonically; `flags` bit 0 is "monitor ready" and
/// must be zero for the record to count; `power_class` packs one 4-bit
/// class per destination.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PcChangeRecord {
    pub tag: u32,
    pub flags: u16,
    pub timestamp: u64,
    pub power_class: u64,
}

pub const PC_CHANGE_RECORD_SIZE: usize = 24;

impl PcChangeRecord {
    pub fn encode(&self) -> [u8; PC_CHANGE_RECORD_SIZE] {
        let mut buf = [0u8; PC_CHANGE_RECORD_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.tag);
        LittleEndian::write_u16(&mut buf[4..6], self.flags);
        LittleEndian::write_u64(&mut buf[8..16], self.timestamp);
        LittleEndian::write_u64(&mut buf[16..24], self.power_class);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != PC_CHANGE_RECORD_SIZE {
            return None;
        }
        Some(PcChangeRecord {
            tag: LittleEndian::read_u32(&buf[0..4]),
            flags: LittleEndian::read_u16(&buf[4..6]),
            timestamp: LittleEndian::read_u64(&buf[8..16]),
            power_class: LittleEndian::read_u64(&buf[16..24]),
        })
    }
}

/// Counters maintained by the power-class-change monitor.
#[derive(Clone, Debug)]
pub struct PcCounters {
    pub valid: u64,
    pub same_tag: u64,
    pub lost: u64,
    pub out_of_order: u64,
    pub bad_size: u64,
    /// One counter per flag bit observed set.
    pub flag_errors: [u64; 16],
    /// Transition counts per destination x power class.
    pub transitions: [[u64; 1 << POWER_CLASS_BIT_SIZE]; NUM_DESTINATIONS],
    pub last: Option<PcChangeRecord>,
}

impl Default for PcCounters {
    fn default() -> Self {
        PcCounters {
            valid: 0,
            same_tag: 0,
            lost: 0,
            out_of_order: 0,
            bad_size: 0,
            flag_errors: [0; 16],
            transitions: [[0; 1 << POWER_CLASS_BIT_SIZE]; NUM_DESTINATIONS],
            last: None,
        }
    }
}

impl PcCounters {
    pub fn report(&self) -> String {
        format!(
            "pc-change: valid={} same-tag={} lost={} out-of-order={} bad-size={}",
            self.valid, self.same_tag, self.lost, self.out_of_order, self.bad_size
        )
    }
}

/// Consumes raw power-class-change packets and keeps the tag-continuity and
/// per-destination transition counters.
pub struct PowerClassMonitor {
    inner: Mutex<PcCounters>,
}

impl PowerClassMonitor {
    pub fn new() -> Self {
        PowerClassMonitor {
            inner: Mutex::new(PcCounters::default()),
        }
    }

    pub fn process_packet(&self, buf: &[u8]) {
        let mut counters = self.inner.lock().unwrap();
        let Some(record) = PcChangeRecord::decode(buf) else {
            counters.bad_size += 1;
            return;
        };

        match counters.last {
            None => counters.valid += 1,
            Some(previous) => {
                let delta = record.tag as i64 - previous.tag as i64;
                if delta == 1 {
                    counters.valid += 1;
                } else if delta == 0 {
                    counters.same_tag += 1;
                } else if delta > 1 {
                    counters.lost += (delta - 1) as u64;
                } else {
                    counters.out_of_order += 1;
                }
            }
        }

        for bit in 0..16 {
            if record.flags & (1 << bit) != 0 {
                counters.flag_errors[bit] += 1;
            }
        }

        // Transition counters only count while the monitor is ready.
        if record.flags & 0x01 == 0 {
            let mut word = record.power_class;
            for dest in 0..NUM_DESTINATIONS {
                let class = (word & ((1 << POWER_CLASS_BIT_SIZE) - 1)) as usize;
                counters.transitions[dest][class] += 1;
                word >>= POWER_CLASS_BIT_SIZE;
            }
        }

        counters.last = Some(record);
    }

    pub fn counters(&self) -> PcCounters {
        self.inner.lock().unwrap().clone()
    }
}

impl Default for PowerClassMonitor {
    fn default() -> Self {
        PowerClassMonitor::new()
    }
}

/// Counters shared between the update-stream reader and status output.
#[derive(Default)]
pub struct UpdateReaderStats {
    pub packets: AtomicU64,
    pub timeouts: AtomicU64,
    pub short_reads: AtomicU64,
    pub errors: AtomicU64,
}

struct SimState {
    config: BTreeMap<u32, Vec<u8>>,
    timeout_enable: Vec<bool>,
    timeout_status: Vec<bool>,
    timeout_mask_writes: u64,
    mitigation_writes: Vec<[u32; 2]>,
    timing: Option<([u32; FW_NUM_BEAM_CLASSES], [u32; FW_NUM_BEAM_CLASSES], [u32; FW_NUM_BEAM_CLASSES])>,
    switch_count: u64,
    heartbeat_bit: bool,
    heartbeat_count: u64,
    watchdog_error: bool,
    watchdog_timeout_us: u32,
    fail_writes: bool,
}

/// In-memory firmware: streams are queues, registers are plain fields.
/// Tests (and the hardware-less daemon) inject update packets and inspect
/// what the engine wrote back.
pub struct SimFirmware {
    update_stream: Queue<Vec<u8>>,
    pc_stream: Queue<Vec<u8>>,
    state: Mutex<SimState>,
}

impl SimFirmware {
    pub fn new() -> Self {
        SimFirmware {
            update_stream: Queue::new(),
            pc_stream: Queue::new(),
            state: Mutex::new(SimState {
                config: BTreeMap::new(),
                timeout_enable: vec![false; NUM_APPLICATIONS as usize],
                timeout_status: vec![false; NUM_APPLICATIONS as usize],
                timeout_mask_writes: 0,
                mitigation_writes: Vec::new(),
                timing: None,
                switch_count: 0,
                heartbeat_bit: false,
                heartbeat_count: 0,
                watchdog_error: false,
                watchdog_timeout_us: 0,
                fail_writes: false,
            }),
        }
    }

    /// Queue an update packet for the next `read_update`.
    pub fn push_update(&self, packet: Vec<u8>) {
        self.update_stream.push(packet);
    }

    /// Queue a power-class-change record for the next `read_pc_change`.
    pub fn push_pc_change(&self, record: &PcChangeRecord) {
        self.pc_stream.push(record.encode().to_vec());
    }

    /// Mark a card as timed out (true) or healthy (false).
    pub fn set_app_timeout_status(&self, card_number: u32, timed_out: bool) {
        self.state.lock().unwrap().timeout_status[card_number as usize] = timed_out;
    }

    pub fn inject_watchdog_error(&self) {
        self.state.lock().unwrap().watchdog_error = true;
    }

    /// Make every register write fail, to exercise the error paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn written_config(&self, card_number: u32) -> Option<Vec<u8>> {
        self.state.lock().unwrap().config.get(&card_number).cloned()
    }

    pub fn last_mitigation(&self) -> Option<[u32; 2]> {
        self.state.lock().unwrap().mitigation_writes.last().copied()
    }

    pub fn mitigation_write_count(&self) -> usize {
        self.state.lock().unwrap().mitigation_writes.len()
    }

    pub fn timing(
        &self,
    ) -> Option<([u32; FW_NUM_BEAM_CLASSES], [u32; FW_NUM_BEAM_CLASSES], [u32; FW_NUM_BEAM_CLASSES])>
    {
        self.state.lock().unwrap().timing
    }

    pub fn switch_count(&self) -> u64 {
        self.state.lock().unwrap().switch_count
    }

    pub fn timeout_mask_writes(&self) -> u64 {
        self.state.lock().unwrap().timeout_mask_writes
    }

    pub fn heartbeat_count(&self) -> u64 {
        self.state.lock().unwrap().heartbeat_count
    }

    pub fn watchdog_timeout(&self) -> u32 {
        self.state.lock().unwrap().watchdog_timeout_us
    }

    fn check_writable(&self, what: &str) -> Result<(), FirmwareError> {
        if self.state.lock().unwrap().fail_writes {
            Err(FirmwareError::Register(format!("{what}: simulated failure")))
        } else {
            Ok(())
        }
    }
}

impl Default for SimFirmware {
    fn default() -> Self {
        SimFirmware::new()
    }
}

impl FirmwareIo for SimFirmware {
    fn read_update(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, FirmwareError> {
        match self.update_stream.pop_timeout(timeout) {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn read_pc_change(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, FirmwareError> {
        match self.pc_stream.pop_timeout(timeout) {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write_config(&self, card_number: u32, slice: &[u8]) -> Result<(), FirmwareError> {
        self.check_writable("write_config")?;
        self.state
            .lock()
            .unwrap()
            .config
            .insert(card_number, slice.to_vec());
        Ok(())
    }

    fn set_app_timeout_enable(&self, card_number: u32, enable: bool) {
        self.state.lock().unwrap().timeout_enable[card_number as usize] = enable;
    }

    fn app_timeout_enable(&self, card_number: u32) -> bool {
        self.state.lock().unwrap().timeout_enable[card_number as usize]
    }

    fn app_timeout_status(&self, card_number: u32) -> bool {
        self.state.lock().unwrap().timeout_status[card_number as usize]
    }

    fn write_app_timeout_mask(&self) -> Result<(), FirmwareError> {
        self.check_writable("write_app_timeout_mask")?;
        self.state.lock().unwrap().timeout_mask_writes += 1;
        Ok(())
    }

    fn write_mitigation(&self, buffer: &[u32; 2]) -> Result<(), FirmwareError> {
        self.check_writable("write_mitigation")?;
        self.state.lock().unwrap().mitigation_writes.push(*buffer);
        Ok(())
    }

    fn write_timing(
        &self,
        time: &[u32; FW_NUM_BEAM_CLASSES],
        period: &[u32; FW_NUM_BEAM_CLASSES],
        charge: &[u32; FW_NUM_BEAM_CLASSES],
    ) -> Result<(), FirmwareError> {
        self.check_writable("write_timing")?;
        self.state.lock().unwrap().timing = Some((*time, *period, *charge));
        Ok(())
    }

    fn switch_config(&self) -> Result<(), FirmwareError> {
        self.check_writable("switch_config")?;
        self.state.lock().unwrap().switch_count += 1;
        Ok(())
    }

    fn heartbeat(&self) -> Result<(), FirmwareError> {
        self.check_writable("heartbeat")?;
        let mut state = self.state.lock().unwrap();
        state.heartbeat_bit = !state.heartbeat_bit;
        state.heartbeat_count += 1;
        Ok(())
    }

    fn take_watchdog_error(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        std::mem::take(&mut state.watchdog_error)
    }

    fn set_watchdog_timeout(&self, micros: u32) {
        self.state.lock().unwrap().watchdog_timeout_us = micros;
    }
}

/// Update-stream reader: blocking reads into fixed-size buffers pushed onto
/// the update queue. Timeouts are counted, not fatal; a missed packet is a
/// skipped cycle.
pub fn run_update_reader(
    fw: Arc<dyn FirmwareIo>,
    queue: Arc<Queue<Vec<u8>>>,
    run: Arc<AtomicBool>,
    stats: Arc<UpdateReaderStats>,
) {
    crate::rt::configure_current_thread(85);
    crate::rt::lock_memory();
    info!("firmware update reader started");

    let mut period = TimeAverage::new("update stream period", 360);
    let mut timeout = Duration::from_micros(crate::defs::FIRST_UPDATE_TIMEOUT_US);
    while run.load(Ordering::Relaxed) {
        let mut buffer = vec![0u8; UPDATE_BUFFER_SIZE_BYTES];
        match fw.read_update(&mut buffer, timeout) {
            Ok(0) => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Ok(n) if n == UPDATE_BUFFER_SIZE_BYTES => {
                stats.packets.fetch_add(1, Ordering::Relaxed);
                period.tick();
                queue.push(buffer);
            }
            Ok(_) => {
                stats.short_reads.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.errors.fetch_add(1, Ordering::Relaxed);
                error!("update stream read failed: {e}");
            }
        }
        timeout = Duration::from_micros(UPDATE_TIMEOUT_US);
    }
    info!("firmware update reader stopped; {}", period.summary());
}

/// Mitigation writer: consumes per-cycle mitigation buffers and writes them
/// to the firmware, measuring the transmit duration. A failed write is
/// logged and dropped; the next cycle supersedes it anyway.
pub fn run_mitigation_writer(
    fw: Arc<dyn FirmwareIo>,
    queue: Arc<Queue<[u32; 2]>>,
    run: Arc<AtomicBool>,
) {
    crate::rt::configure_current_thread(87);
    crate::rt::lock_memory();
    info!("mitigation writer started");

    let mut tx = TimeAverage::new("mitigation transmit", 360);
    while run.load(Ordering::Relaxed) {
        if let Some(buffer) = queue.pop_timeout(Duration::from_millis(100)) {
            tx.start();
            if let Err(e) = fw.write_mitigation(&buffer) {
                error!("mitigation write failed: {e}");
            }
            tx.end();
        }
    }
    info!("mitigation writer stopped; {}", tx.summary());
}

/// Power-class-change reader: 100 us polled stream into the monitor's
/// counters.
pub fn run_pc_change_reader(
    fw: Arc<dyn FirmwareIo>,
    monitor: Arc<PowerClassMonitor>,
    run: Arc<AtomicBool>,
) {
    info!("power class change reader started");
    let mut buffer = [0u8; 1024];
    let timeout = Duration::from_micros(PC_CHANGE_TIMEOUT_US);
    while run.load(Ordering::Relaxed) {
        match fw.read_pc_change(&mut buffer, timeout) {
            Ok(0) => {}
            Ok(n) => monitor.process_packet(&buffer[..n]),
            Err(e) => error!("pc-change stream read failed: {e}"),
        }
    }
    info!("power class change reader stopped");
}
