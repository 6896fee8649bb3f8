/*!
Evaluation engine: the 360 Hz interlock pipeline.

Each cycle runs these phases in order:

1. Prepare: every destination starts at the highest beam class (tentative)
   and the lowest (allowed); the software mitigation buffer is zeroed.
2. Decode: the update packet is decoded into channel values (`inputs`).
3. Faults: each fault's composite value is assembled from its inputs
   (bypass values substituting for bypassed SLOW inputs) and matched
   against its states; the default state arms when nothing matched.
4. Ignore conditions: faults gated by a satisfied condition are marked
   ignored, including integrator-specific analog ignores.
5. Mitigate: every faulted, not-ignored state min-reduces the tentative
   class of the destinations its allowed classes name.
6. Overrides and emit: the force / max-permit / soft-permit lattice is
   applied per destination and the 4-bit class nibbles are folded into the
   mitigation buffer.
7. The buffer is pushed (non-blocking) to the mitigation writer.
8. A firmware configuration reload runs if anything requested one.

The engine owns the `Database`. Other threads never touch it: the bypass
manager is snapshotted at the top of each cycle and operator actions arrive
over a command channel drained at the same point, which keeps every cycle
deterministic.

The tentative-starts-high, monotone-decrease design keeps the fold
associative and commutative; a partial evaluation can only be
over-restrictive, never over-permissive.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use log::{error, info, trace, warn};

use crate::buffer::DoubleBuffer;
use crate::bypass::{BypassManager, BypassStatus, BypassType};
use crate::db::{self, fwconfig, ChannelRef, Database};
use crate::defs::{UPDATE_BUFFER_SIZE_BYTES, UPDATE_TIMESTAMP_OFFSET, UPDATE_TIMEOUT_US};
use crate::firmware::FirmwareIo;
use crate::heartbeat::NonBlockingHeartbeat;
use crate::history::History;
use crate::inputs;
use crate::queue::Queue;
use crate::timer::TimeAverage;

/// Update-header timestamp gaps above this are counted as long gaps
/// (nanoseconds; a healthy period is ~2.7 ms).
const LONG_GAP_NS: u64 = 12_000_000;

/// Operator actions, applied at the top of the next cycle.
#[derive(Clone, Debug)]
pub enum EngineCommand {
    SetBypass {
        kind: BypassType,
        device_id: u32,
        value: u32,
        until: u64,
        integrator: u32,
        test_mode: bool,
    },
    ForceBeamClass {
        destination_id: u32,
        beam_class_id: u32,
    },
    SoftPermit {
        destination_id: u32,
        beam_class_id: u32,
    },
    MaxPermit {
        beam_class_id: u32,
    },
    SetCardIgnored {
        card_id: u32,
        ignored: bool,
    },
    UnlatchAll,
    ReloadConfig,
    ClearCounters,
}

pub struct Engine {
    db: Database,
    bypass: Arc<Mutex<BypassManager>>,
    firmware: Arc<dyn FirmwareIo>,
    history: History,
    heartbeat: Option<NonBlockingHeartbeat>,

    update_buffer: Arc<DoubleBuffer>,
    update_queue: Arc<Queue<Vec<u8>>>,
    mitigation_queue: Arc<Queue<[u32; 2]>>,
    commands_tx: Sender<EngineCommand>,
    commands_rx: Receiver<EngineCommand>,
    run: Arc<AtomicBool>,

    // Iteration orders, rebuilt when a database is installed.
    card_order: Vec<u32>,
    fault_order: Vec<u32>,
    condition_order: Vec<u32>,

    input_update_timeout: Duration,
    initialized: bool,
    pending_reload: bool,

    input_update_time: TimeAverage,
    check_fault_time: TimeAverage,
    evaluation_cycle_time: TimeAverage,
    update_counter: u64,
    update_timeout_counter: u64,
    reload_counter: u64,
    invariant_violation_counter: u64,
    last_update_timestamp: u64,
    max_timestamp_delta: u64,
    long_gap_counter: u64,
}

impl Engine {
    pub fn new(firmware: Arc<dyn FirmwareIo>, history: History, run: Arc<AtomicBool>) -> Self {
        let (commands_tx, commands_rx) = std::sync::mpsc::channel();
        Engine {
            db: Database::empty(),
            bypass: Arc::new(Mutex::new(BypassManager::new(history.clone()))),
            firmware,
            history,
            heartbeat: None,
            update_buffer: Arc::new(DoubleBuffer::new(UPDATE_BUFFER_SIZE_BYTES)),
            update_queue: Arc::new(Queue::new()),
            mitigation_queue: Arc::new(Queue::new()),
            commands_tx,
            commands_rx,
            run,
            card_order: Vec::new(),
            fault_order: Vec::new(),
            condition_order: Vec::new(),
            input_update_timeout: Duration::from_micros(UPDATE_TIMEOUT_US),
            initialized: false,
            pending_reload: false,
            input_update_time: TimeAverage::new("input update", 360),
            check_fault_time: TimeAverage::new("fault evaluation", 360),
            evaluation_cycle_time: TimeAverage::new("evaluation cycle", 360),
            update_counter: 0,
            update_timeout_counter: 0,
            reload_counter: 0,
            invariant_violation_counter: 0,
            last_update_timestamp: 0,
            max_timestamp_delta: 0,
            long_gap_counter: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn bypass_manager(&self) -> Arc<Mutex<BypassManager>> {
        Arc::clone(&self.bypass)
    }

    pub fn update_queue(&self) -> Arc<Queue<Vec<u8>>> {
        Arc::clone(&self.update_queue)
    }

    pub fn mitigation_queue(&self) -> Arc<Queue<[u32; 2]>> {
        Arc::clone(&self.mitigation_queue)
    }

    pub fn command_sender(&self) -> Sender<EngineCommand> {
        self.commands_tx.clone()
    }

    pub fn set_heartbeat(&mut self, heartbeat: NonBlockingHeartbeat) {
        self.heartbeat = Some(heartbeat);
    }

    pub fn set_input_update_timeout(&mut self, timeout: Duration) {
        self.input_update_timeout = timeout;
    }

    /// Copy of the raw update packet currently visible to the decoder.
    pub fn update_buffer_snapshot(&self) -> Vec<u8> {
        self.update_buffer.snapshot()
    }

    pub fn update_count(&self) -> u64 {
        self.update_counter
    }

    pub fn update_timeout_count(&self) -> u64 {
        self.update_timeout_counter
    }

    pub fn reload_count(&self) -> u64 {
        self.reload_counter
    }

    pub fn invariant_violation_count(&self) -> u64 {
        self.invariant_violation_counter
    }

    /// Load a configuration from a YAML file and install it. On failure the
    /// previous database stays in place and keeps being evaluated.
    pub fn load_config(&mut self, path: impl AsRef<std::path::Path>) -> Result<(), crate::error::ConfigError> {
        let db = db::load_file(path)?;
        self.install_database(db)
    }

    /// Load a configuration from YAML text (tests, embedded fixtures).
    pub fn load_config_str(
        &mut self,
        text: &str,
        name: &str,
    ) -> Result<(), crate::error::ConfigError> {
        let db = db::load_str(text, name)?;
        self.install_database(db)
    }

    fn install_database(&mut self, mut db: Database) -> Result<(), crate::error::ConfigError> {
        {
            let mut bypass = self.bypass.lock().unwrap();
            // The bypass map is created once; records persist across
            // configuration reloads.
            if !bypass.is_initialized() {
                bypass.create_bypass_map(&db);
            }
            bypass.assign_bypass(&mut db)?;
        }

        // The initial configuration write must succeed; the machine cannot
        // run against an unconfigured fabric.
        fwconfig::write_firmware_configuration(&db, self.firmware.as_ref(), true)
            .map_err(|e| crate::error::ConfigError::FirmwareWrite(e.to_string()))?;

        self.card_order = db.application_cards.keys().copied().collect();
        self.fault_order = db.faults.keys().copied().collect();
        self.condition_order = db.ignore_conditions.keys().copied().collect();
        info!(
            "configuration installed: {} ({} cards, {} faults)",
            db.name,
            db.application_cards.len(),
            db.faults.len()
        );
        self.db = db;
        self.initialized = true;
        Ok(())
    }

    /// One full evaluation cycle. Returns false when no update packet
    /// arrived within the timeout (the cycle is skipped and counted).
    pub fn run_cycle(&mut self) -> bool {
        self.drain_commands();

        let mut reload = std::mem::take(&mut self.pending_reload);
        {
            let mut bypass = self.bypass.lock().unwrap();
            bypass.snapshot_into(&mut self.db);
            reload |= bypass.take_refresh_request();
        }

        let Some(packet) = self.update_queue.pop_timeout(self.input_update_timeout) else {
            self.update_timeout_counter += 1;
            return false;
        };

        self.evaluation_cycle_time.start();
        self.update_buffer.write(&packet);
        drop(packet);

        self.set_tentative_beam_class();

        let buffer = Arc::clone(&self.update_buffer);
        reload |= buffer.read(|data| self.process_packet(data));
        buffer.done_reading();

        self.check_fault_time.start();
        self.evaluate_faults();
        self.evaluate_ignore_conditions();
        self.mitigate();
        self.set_allowed_beam_class();
        self.check_fault_time.end();

        self.mitigation_queue
            .push(self.db.software_mitigation_buffer);

        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.beat();
        }

        if reload {
            self.reload_firmware_config();
        }

        self.evaluation_cycle_time.end();
        self.update_counter += 1;
        true
    }

    /// Evaluation thread body: cycles until the shared run flag clears.
    pub fn run_evaluation_loop(&mut self) {
        crate::rt::configure_current_thread(86);
        crate::rt::lock_memory();
        info!("evaluation loop started");
        while self.run.load(Ordering::Relaxed) {
            self.run_cycle();
        }
        info!("evaluation loop stopped\n{}", self.stats_report());
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands_rx.try_recv() {
                Ok(command) => self.apply_command(command),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn apply_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::SetBypass {
                kind,
                device_id,
                value,
                until,
                integrator,
                test_mode,
            } => {
                let result = self.bypass.lock().unwrap().set_threshold_bypass(
                    kind, device_id, value, until, integrator, test_mode,
                );
                if let Err(e) = result {
                    warn!("bypass request rejected: {e}");
                }
            }
            EngineCommand::ForceBeamClass {
                destination_id,
                beam_class_id,
            } => self.db.force_beam_destination(destination_id, beam_class_id),
            EngineCommand::SoftPermit {
                destination_id,
                beam_class_id,
            } => self.db.soft_permit_destination(destination_id, beam_class_id),
            EngineCommand::MaxPermit { beam_class_id } => self.db.set_max_permit(beam_class_id),
            EngineCommand::SetCardIgnored { card_id, ignored } => {
                if let Some(card) = self.db.application_cards.get_mut(&card_id) {
                    card.ignore_requested = ignored;
                }
            }
            EngineCommand::UnlatchAll => self.db.unlatch_all(),
            EngineCommand::ReloadConfig => self.pending_reload = true,
            EngineCommand::ClearCounters => self.clear_counters(),
        }
    }

    /// Phase 1: destinations start wide open (tentative) and fully closed
    /// (allowed); faults only ever lower the tentative class from here.
    fn set_tentative_beam_class(&mut self) {
        let highest = self.db.highest_beam_class;
        let lowest = self.db.lowest_beam_class;
        for dest in self.db.beam_destinations.values_mut() {
            dest.tentative_beam_class = Some(highest);
            dest.allowed_beam_class = Some(lowest);
        }
        self.db.clear_mitigation_buffer();
    }

    /// Phase 2 plus header bookkeeping.
    fn process_packet(&mut self, packet: &[u8]) -> bool {
        let timestamp = LittleEndian::read_u64(
            &packet[UPDATE_TIMESTAMP_OFFSET..UPDATE_TIMESTAMP_OFFSET + 8],
        );
        if self.last_update_timestamp != 0 {
            let delta = timestamp.wrapping_sub(self.last_update_timestamp);
            if delta > self.max_timestamp_delta {
                self.max_timestamp_delta = delta;
            }
            if delta > LONG_GAP_NS {
                self.long_gap_counter += 1;
            }
        }
        self.last_update_timestamp = timestamp;

        self.input_update_time.start();
        let reload = inputs::update_inputs(
            &mut self.db,
            &self.card_order,
            packet,
            self.firmware.as_ref(),
            &self.history,
        );
        self.input_update_time.end();
        reload
    }

    /// Phase 3: compose fault values and match states.
    fn evaluate_faults(&mut self) {
        for fault_index in 0..self.fault_order.len() {
            let fault_id = self.fault_order[fault_index];

            let (value, any_offline) = {
                let db = &self.db;
                let fault = &db.faults[&fault_id];
                let mut value = 0u32;
                let mut any_offline = false;
                for input_id in &fault.fault_input_ids {
                    let input = &db.fault_inputs[input_id];
                    let input_value = match input.channel {
                        Some(ChannelRef::Digital(channel_id)) => {
                            let channel = &db.digital_channels[&channel_id];
                            any_offline |= channel.faulted_offline;
                            // A bypass value substitutes only for software
                            // (SLOW) evaluation; fast inputs are disarmed
                            // in the firmware configuration instead.
                            if input.bypass_status == BypassStatus::Valid
                                && !input.fast_evaluation
                            {
                                input.bypass_value
                            } else {
                                channel.value
                            }
                        }
                        Some(ChannelRef::Analog(channel_id)) => {
                            let channel = &db.analog_channels[&channel_id];
                            any_offline |= channel.faulted_offline;
                            channel.masked_value()
                        }
                        None => 0,
                    };
                    value |= input_value << input.bit_position;
                }
                (value, any_offline)
            };

            let (state_ids, default_state_id, old_value) = {
                let fault = self.db.faults.get_mut(&fault_id).unwrap();
                let old_value = fault.value;
                fault.update_value(value);
                fault.faulted_offline = any_offline;
                (
                    fault.fault_state_ids.clone(),
                    fault.default_fault_state_id,
                    old_value,
                )
            };

            let mut any_matched = false;
            let mut matched_state = 0u32;
            for state_id in &state_ids {
                let state = self.db.fault_states.get_mut(state_id).unwrap();
                // Ignores are re-derived every cycle.
                state.ignored = false;
                let masked = value & state.mask;
                if state.value == masked {
                    state.faulted = true;
                    any_matched = true;
                    matched_state = *state_id;
                    trace!(
                        "fault {fault_id} state {state_id} matched (value={value:#x} masked={masked:#x})"
                    );
                } else {
                    state.faulted = false;
                }
            }

            // No state matched: the default state (if any) arms instead.
            if !any_matched {
                if let Some(default_id) = default_state_id {
                    self.db.fault_states.get_mut(&default_id).unwrap().faulted = true;
                }
            }

            self.db.faults.get_mut(&fault_id).unwrap().faulted = any_matched;
            if old_value != value {
                self.history
                    .log_fault(fault_id, old_value, value, matched_state);
            }
        }
    }

    /// Phase 4: a satisfied condition marks every governed fault state
    /// ignored; analog states propagate to their integrator flags.
    fn evaluate_ignore_conditions(&mut self) {
        for condition_index in 0..self.condition_order.len() {
            let condition_id = self.condition_order[condition_index];
            let (channel_id, expected, fault_ids) = {
                let condition = &self.db.ignore_conditions[&condition_id];
                (
                    condition.digital_channel_id,
                    condition.value,
                    condition.fault_ids.clone(),
                )
            };
            let state = self.db.digital_channels[&channel_id].value == expected;
            self.db
                .ignore_conditions
                .get_mut(&condition_id)
                .unwrap()
                .state = state;
            trace!("ignore condition {condition_id} is {state}");

            for fault_id in fault_ids {
                let (state_ids, input_ids) = {
                    let fault = self.db.faults.get_mut(&fault_id).unwrap();
                    fault.ignored = state;
                    (fault.fault_state_ids.clone(), fault.fault_input_ids.clone())
                };
                for state_id in &state_ids {
                    let integrator = {
                        let fault_state = self.db.fault_states.get_mut(state_id).unwrap();
                        fault_state.ignored = state;
                        fault_state.integrator
                    };
                    // Integrator-specific analog ignore.
                    for input_id in &input_ids {
                        if let Some(ChannelRef::Analog(analog_id)) =
                            self.db.fault_inputs[input_id].channel
                        {
                            let channel =
                                self.db.analog_channels.get_mut(&analog_id).unwrap();
                            match integrator {
                                Some(i) => channel.ignored_integrator[i] = state,
                                None => channel.ignored = state,
                            }
                        }
                    }
                }
            }
        }
    }

    /// Phase 5: min-reduce destination tentative classes over all faulted,
    /// not-ignored states (the default state participates identically).
    fn mitigate(&mut self) {
        let db = &mut self.db;
        let faults = &db.faults;
        let fault_states = &db.fault_states;
        let allowed_classes = &db.allowed_classes;
        let destinations = &mut db.beam_destinations;

        for fault in faults.values() {
            for state_id in &fault.fault_state_ids {
                let state = &fault_states[state_id];
                if !state.faulted || state.ignored {
                    continue;
                }
                for ac_id in &state.allowed_class_ids {
                    let ac = &allowed_classes[ac_id];
                    let dest = destinations.get_mut(&ac.beam_destination_id).unwrap();
                    if let Some(tentative) = dest.tentative_beam_class {
                        if tentative.number > ac.beam_class.number {
                            trace!(
                                "destination {} tentative lowered to {} by fault {} state {}",
                                dest.name, ac.beam_class.number, fault.name, state_id
                            );
                            dest.tentative_beam_class = Some(ac.beam_class);
                        }
                    }
                }
            }
        }
    }

    /// Phase 6: overrides, mitigation buffer fill, history, invariants.
    fn set_allowed_beam_class(&mut self) {
        let lowest = self.db.lowest_beam_class;
        let highest = self.db.highest_beam_class;
        let mut violations = 0u64;

        let Database {
            beam_destinations,
            software_mitigation_buffer,
            ..
        } = &mut self.db;

        for dest in beam_destinations.values_mut() {
            dest.set_allowed_beam_class(software_mitigation_buffer);

            let allowed = dest.allowed_beam_class.unwrap_or(lowest);
            let tentative = dest.tentative_beam_class.unwrap_or(lowest);
            let in_range = allowed.number >= lowest.number
                && allowed.number <= highest.number
                && allowed.number <= tentative.number;
            if !in_range {
                violations += 1;
                debug_assert!(
                    in_range,
                    "beam class invariant violated for destination {}",
                    dest.id
                );
            }

            if dest.allowed_beam_class != dest.previous_allowed_beam_class {
                let previous = dest.previous_allowed_beam_class.unwrap_or(lowest);
                self.history
                    .log_mitigation(dest.id, previous.number, allowed.number);
                dest.previous_allowed_beam_class = dest.allowed_beam_class;
            }
        }
        self.invariant_violation_counter += violations;
    }

    /// Phase 8: rewrite and switch the firmware configuration.
    fn reload_firmware_config(&mut self) {
        self.reload_counter += 1;
        if let Err(e) =
            fwconfig::write_firmware_configuration(&self.db, self.firmware.as_ref(), false)
        {
            // Tolerated: the next reload retries with fresh state.
            error!("firmware configuration reload failed: {e}");
        }
    }

    pub fn clear_counters(&mut self) {
        self.input_update_time.clear();
        self.check_fault_time.clear();
        self.evaluation_cycle_time.clear();
        self.update_counter = 0;
        self.update_timeout_counter = 0;
        self.reload_counter = 0;
        self.invariant_violation_counter = 0;
        self.max_timestamp_delta = 0;
        self.long_gap_counter = 0;
        self.update_queue.clear_counters();
        self.mitigation_queue.clear_counters();
    }

    pub fn stats_report(&self) -> String {
        let mut out = String::new();
        out.push_str(">> Engine stats:\n");
        out.push_str(&format!(
            "  cycles={} timeouts={} reloads={} invariant-violations={}\n",
            self.update_counter,
            self.update_timeout_counter,
            self.reload_counter,
            self.invariant_violation_counter
        ));
        out.push_str(&format!(
            "  max-update-gap={}ns long-gaps={}\n",
            self.max_timestamp_delta, self.long_gap_counter
        ));
        out.push_str(&format!("  {}\n", self.input_update_time.summary()));
        out.push_str(&format!("  {}\n", self.check_fault_time.summary()));
        out.push_str(&format!("  {}\n", self.evaluation_cycle_time.summary()));
        out.push_str(&format!(
            "  update-queue-watermark={} mitigation-queue-watermark={}\n",
            self.update_queue.watermark(),
            self.mitigation_queue.watermark()
        ));
        if let Some(heartbeat) = &self.heartbeat {
            out.push_str(&format!("  {}\n", heartbeat.report()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::SimFirmware;
    use crate::test_utils;

    fn engine_fixture() -> (Engine, Arc<SimFirmware>, History) {
        let fw = Arc::new(SimFirmware::new());
        let history = History::new();
        let run = Arc::new(AtomicBool::new(true));
        let mut engine = Engine::new(
            Arc::clone(&fw) as Arc<dyn FirmwareIo>,
            history.clone(),
            run,
        );
        engine
            .load_config_str(&test_utils::small_database_yaml(), "fixture")
            .unwrap();
        (engine, fw, history)
    }

    fn cycle(engine: &mut Engine, packet: Vec<u8>) {
        engine.update_queue().push(packet);
        assert!(engine.run_cycle());
    }

    fn allowed(engine: &Engine, destination_id: u32) -> u32 {
        engine.database().beam_destinations[&destination_id]
            .allowed_beam_class
            .unwrap()
            .number
    }

    #[test]
    fn scenario_a_no_faults_full_power() {
        let (mut engine, _, _) = engine_fixture();
        let packet = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, packet);
        assert_eq!(allowed(&engine, 1), 7);
        assert_eq!(allowed(&engine, 2), 7);
    }

    #[test]
    fn scenario_b_single_fault_lowers_and_recovers() {
        let (mut engine, _, _) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);

        let nominal = test_utils::packet_with_digital(engine.database(), channel, 0);
        cycle(&mut engine, nominal.clone());
        assert_eq!(allowed(&engine, 1), 7);

        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted);
        assert_eq!(allowed(&engine, 1), 2);

        cycle(&mut engine, nominal);
        assert_eq!(allowed(&engine, 1), 7);
    }

    #[test]
    fn scenario_c_bypass_blocks_fault_until_expiry() {
        let (mut engine, _, _) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let input_id = engine.database().digital_channels[&channel].fault_input_ids[0];
        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);

        cycle(&mut engine, faulted.clone());
        assert_eq!(allowed(&engine, 1), 2);

        // Bypass the input to 0 until t=100: the live fault disappears.
        engine
            .bypass_manager()
            .lock()
            .unwrap()
            .set_bypass(BypassType::Digital, input_id, 0, 100, true)
            .unwrap();
        cycle(&mut engine, faulted.clone());
        assert_eq!(allowed(&engine, 1), 7);

        // Time reaches t=101: the bypass expires and the live value rules.
        engine
            .bypass_manager()
            .lock()
            .unwrap()
            .check_bypass_queue(Some(101));
        cycle(&mut engine, faulted);
        assert_eq!(allowed(&engine, 1), 2);
    }

    #[test]
    fn scenario_d_ignore_condition_suppresses_fault() {
        let (mut engine, _, _) = engine_fixture();
        let gated = test_utils::digital_channel_id(engine.database(), 1);
        let gate = test_utils::gate_channel_id(engine.database());

        // Gate low: the gated fault mitigates as usual.
        let mut packet = test_utils::packet_with_digital(engine.database(), gated, 1);
        cycle(&mut engine, packet.clone());
        assert_eq!(allowed(&engine, 1), 5);

        // Gate high: the condition is met, the fault is ignored.
        test_utils::overlay_digital(engine.database(), &mut packet, gate, 1);
        cycle(&mut engine, packet);
        assert_eq!(allowed(&engine, 1), 7);
        assert!(engine.database().ignore_conditions.values().next().unwrap().state);
    }

    #[test]
    fn scenario_e_multi_fault_fold_takes_minimum() {
        let (mut engine, _, _) = engine_fixture();
        let db = engine.database();
        let c1 = test_utils::digital_channel_id(db, 0);
        let c2 = test_utils::digital_channel_id(db, 1);
        let c3 = test_utils::digital_channel_id(db, 3);

        // F1 -> class 2, F2 -> class 5, F3 -> class 6: minimum wins.
        let mut packet = test_utils::packet_with_digital(db, c1, 1);
        test_utils::overlay_digital(db, &mut packet, c2, 1);
        test_utils::overlay_digital(db, &mut packet, c3, 1);
        cycle(&mut engine, packet);
        assert_eq!(allowed(&engine, 1), 2);
    }

    #[test]
    fn scenario_f_soft_permit_lattice() {
        let (mut engine, _, _) = engine_fixture();
        let sender = engine.command_sender();

        // Tentative 7, soft permit 3 -> allowed 3 (class id 4 is number 3).
        sender
            .send(EngineCommand::SoftPermit {
                destination_id: 1,
                beam_class_id: 4,
            })
            .unwrap();
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal);
        assert_eq!(allowed(&engine, 1), 3);

        // Tentative 2 (fault), soft permit 5 -> allowed 2: never raises.
        sender
            .send(EngineCommand::SoftPermit {
                destination_id: 1,
                beam_class_id: 6,
            })
            .unwrap();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted);
        assert_eq!(allowed(&engine, 1), 2);
    }

    #[test]
    fn force_beam_class_lowers_tentative() {
        let (mut engine, _, _) = engine_fixture();
        let sender = engine.command_sender();
        sender
            .send(EngineCommand::ForceBeamClass {
                destination_id: 1,
                beam_class_id: 2, // number 1
            })
            .unwrap();
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal.clone());
        assert_eq!(allowed(&engine, 1), 1);

        // Clearing the force restores full power.
        sender
            .send(EngineCommand::ForceBeamClass {
                destination_id: 1,
                beam_class_id: crate::defs::CLEAR_BEAM_CLASS,
            })
            .unwrap();
        cycle(&mut engine, nominal);
        assert_eq!(allowed(&engine, 1), 7);
    }

    #[test]
    fn analog_fault_limits_its_destination() {
        let (mut engine, _, _) = engine_fixture();
        let analog = *engine.database().analog_channels.keys().next().unwrap();
        let mut packet = test_utils::nominal_packet(engine.database());
        // Integrator 1, threshold 0 => value bit 8, matching the analog
        // fault state (value 0x100) that caps destination 2 at class 1.
        test_utils::set_analog_threshold(engine.database(), &mut packet, analog, 1, 0, true);
        cycle(&mut engine, packet);
        assert_eq!(allowed(&engine, 2), 1);
        assert_eq!(allowed(&engine, 1), 7);
    }

    #[test]
    fn analog_bypass_masks_integrator_fault() {
        let (mut engine, _, _) = engine_fixture();
        let analog = *engine.database().analog_channels.keys().next().unwrap();
        let mut packet = test_utils::nominal_packet(engine.database());
        test_utils::set_analog_threshold(engine.database(), &mut packet, analog, 1, 0, true);

        engine
            .bypass_manager()
            .lock()
            .unwrap()
            .set_threshold_bypass(BypassType::Analog, analog, 0, 100, 1, true)
            .unwrap();
        cycle(&mut engine, packet.clone());
        assert_eq!(allowed(&engine, 2), 7);

        engine
            .bypass_manager()
            .lock()
            .unwrap()
            .check_bypass_queue(Some(101));
        cycle(&mut engine, packet);
        assert_eq!(allowed(&engine, 2), 1);
    }

    #[test]
    fn mitigation_buffer_carries_destination_nibbles() {
        let (mut engine, _, _) = engine_fixture();
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal);
        let buffer = engine.mitigation_queue().try_pop().unwrap();
        // Destination 1 owns nibble 0, destination 2 nibble 1; both at 7.
        assert_eq!(buffer[0] & 0xF, 7);
        assert_eq!((buffer[0] >> 4) & 0xF, 7);
        assert_eq!(buffer[1], 0);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let (mut engine, _, _) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted.clone());
        let first = allowed(&engine, 1);
        cycle(&mut engine, faulted);
        assert_eq!(allowed(&engine, 1), first);
        assert_eq!(engine.invariant_violation_count(), 0);
    }

    #[test]
    fn missing_packet_skips_cycle() {
        let (mut engine, _, _) = engine_fixture();
        engine.set_input_update_timeout(Duration::from_millis(1));
        assert!(!engine.run_cycle());
        assert_eq!(engine.update_timeout_count(), 1);
        assert_eq!(engine.update_count(), 0);
    }

    #[test]
    fn fault_transitions_are_published() {
        let (mut engine, _, history) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal);
        let _ = history.drain();

        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted);
        let messages = history.drain();
        assert!(messages
            .iter()
            .any(|m| m.kind == crate::history::HistoryKind::FaultState));
        assert!(messages
            .iter()
            .any(|m| m.kind == crate::history::HistoryKind::Mitigation));
    }

    #[test]
    fn failed_reload_keeps_previous_database() {
        let (mut engine, fw, _) = engine_fixture();
        let name_before = engine.database().name.clone();
        fw.set_fail_writes(true);
        let err = engine.load_config_str(&test_utils::small_database_yaml(), "second");
        assert!(err.is_err());
        assert_eq!(engine.database().name, name_before);
        fw.set_fail_writes(false);
        // Bad YAML likewise leaves the database untouched.
        assert!(engine.load_config_str("Bogus:\n- id: 1\n", "bad").is_err());
        assert_eq!(engine.database().name, name_before);
    }

    #[test]
    fn bypass_transitions_reload_firmware_configuration() {
        // Fast fixture: the fast input's bypass carries config_update, and
        // the card bypass transition itself flips the timeout enable.
        let fw = Arc::new(SimFirmware::new());
        let run = Arc::new(AtomicBool::new(true));
        let mut engine = Engine::new(
            Arc::clone(&fw) as Arc<dyn FirmwareIo>,
            History::new(),
            run,
        );
        engine
            .load_config_str(&test_utils::fast_database_yaml(false), "fast")
            .unwrap();

        let fast_input = engine
            .database()
            .fault_inputs
            .values()
            .find(|i| i.fast_evaluation)
            .unwrap()
            .id;

        // Warm-up cycle: the first update flips every card's active flag
        // and reloads once.
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal.clone());
        let switches_before = fw.switch_count();

        engine
            .command_sender()
            .send(EngineCommand::SetBypass {
                kind: BypassType::Digital,
                device_id: fast_input,
                value: 0,
                until: 100,
                integrator: 0,
                test_mode: true,
            })
            .unwrap();
        cycle(&mut engine, nominal.clone());
        let after_set = fw.switch_count();
        assert!(after_set > switches_before);

        // Expiry through the queue requests another reload, with no new
        // operator action involved.
        engine
            .bypass_manager()
            .lock()
            .unwrap()
            .check_bypass_queue(Some(101));
        cycle(&mut engine, nominal.clone());
        cycle(&mut engine, nominal);
        assert!(fw.switch_count() > after_set);
    }

    #[test]
    fn card_ignore_request_disables_timeout_check() {
        let (mut engine, fw, _) = engine_fixture();
        let card_id = *engine.database().application_cards.keys().next().unwrap();
        let number = engine.database().application_cards[&card_id].number;
        let nominal = test_utils::nominal_packet(engine.database());
        cycle(&mut engine, nominal.clone());
        assert!(engine.database().application_cards[&card_id].active);

        engine
            .command_sender()
            .send(EngineCommand::SetCardIgnored {
                card_id,
                ignored: true,
            })
            .unwrap();
        cycle(&mut engine, nominal.clone());
        let card = &engine.database().application_cards[&card_id];
        assert!(card.ignored);
        assert!(!card.active);
        assert!(!fw.app_timeout_enable(number));

        engine
            .command_sender()
            .send(EngineCommand::SetCardIgnored {
                card_id,
                ignored: false,
            })
            .unwrap();
        cycle(&mut engine, nominal);
        assert!(!engine.database().application_cards[&card_id].ignored);
        assert!(fw.app_timeout_enable(number));
    }

    #[test]
    fn status_reports_render() {
        let (mut engine, _, _) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted);

        let db = engine.database();
        assert!(db.show_faults().contains("STOPPER_FAULT"));
        assert!(db.show_beam_destinations().contains("D0"));
        assert!(db.show_info().contains("fixture"));
        assert!(engine.stats_report().contains("cycles=1"));
    }

    #[test]
    fn unlatch_all_command_clears_latches() {
        let (mut engine, _, _) = engine_fixture();
        let channel = test_utils::digital_channel_id(engine.database(), 0);
        let faulted = test_utils::packet_with_digital(engine.database(), channel, 1);
        cycle(&mut engine, faulted);
        let nominal = test_utils::packet_with_digital(engine.database(), channel, 0);
        cycle(&mut engine, nominal.clone());
        assert_eq!(engine.database().digital_channels[&channel].latched_value, 1);

        engine.command_sender().send(EngineCommand::UnlatchAll).unwrap();
        cycle(&mut engine, nominal);
        assert_eq!(engine.database().digital_channels[&channel].latched_value, 0);
    }
}
