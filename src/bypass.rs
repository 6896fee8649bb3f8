/*!
Bypass manager: time-bounded overrides of individual inputs.

Every fault input owns one bypass record and every analog channel owns one
per integrator, all allocated on the first configuration load and surviving
reloads. Expirations are driven by a min-heap of `(until, bypass)` entries
swept at 1 Hz.

Extension and shortening never remove heap entries; a new entry is pushed
and the stale one is recognised at pop time by comparing the entry's
timestamp against the record's current `until`. A stale pop may resurrect a
record that an earlier (shorter) entry expired out of order; that is the
intended repair, and it emits no history.

The engine never reads these records directly: at the top of each cycle it
takes a snapshot that copies per-input status/value pairs and derives the
per-channel analog bypass masks into the database.
*/

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};

use crate::db::{Database, Evaluation};
use crate::defs::ANALOG_MAX_INTEGRATORS_PER_CHANNEL;
use crate::error::ConfigError;
use crate::history::{History, BYPASS_DIGITAL_INDEX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BypassType {
    Digital,
    Analog,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BypassStatus {
    Valid = 0,
    Expired = 1,
}

/// An expiring override on one input (digital) or one integrator of an
/// analog channel. `value` is only consulted for SLOW evaluation; a FAST
/// input is disarmed in the firmware configuration instead.
#[derive(Clone, Debug)]
pub struct InputBypass {
    pub id: u32,
    /// Fault input id (digital) or analog channel id.
    pub device_id: u32,
    pub kind: BypassType,
    /// Integrator index for analog bypasses.
    pub index: u32,
    pub value: u32,
    /// Seconds since the epoch; 0 while expired.
    pub until: u64,
    pub status: BypassStatus,
    /// A status change must trigger a firmware configuration reload.
    pub config_update: bool,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub struct BypassManager {
    map: BTreeMap<u32, InputBypass>,
    queue: BinaryHeap<Reverse<(u64, u32)>>,
    digital_by_input: BTreeMap<u32, u32>,
    analog_by_channel: BTreeMap<(u32, u32), u32>,
    refresh_firmware_configuration: bool,
    initialized: bool,
    history: History,
}

impl BypassManager {
    pub fn new(history: History) -> Self {
        BypassManager {
            map: BTreeMap::new(),
            queue: BinaryHeap::new(),
            digital_by_input: BTreeMap::new(),
            analog_by_channel: BTreeMap::new(),
            refresh_firmware_configuration: false,
            initialized: false,
            history,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Allocate the bypass records. Called once, on the first configuration
    /// load; the records are shared by every configuration loaded after.
    pub fn create_bypass_map(&mut self, db: &Database) {
        debug!("creating bypass map");
        let mut next_id = 0u32;

        for input in db.fault_inputs.values() {
            self.map.insert(
                next_id,
                InputBypass {
                    id: next_id,
                    device_id: input.id,
                    kind: BypassType::Digital,
                    index: 0,
                    value: 0,
                    until: 0,
                    status: BypassStatus::Expired,
                    config_update: input.fast_evaluation,
                },
            );
            next_id += 1;
        }

        for channel in db.analog_channels.values() {
            for integrator in 0..ANALOG_MAX_INTEGRATORS_PER_CHANNEL as u32 {
                self.map.insert(
                    next_id,
                    InputBypass {
                        id: next_id,
                        device_id: channel.id,
                        kind: BypassType::Analog,
                        index: integrator,
                        value: 0,
                        until: 0,
                        status: BypassStatus::Expired,
                        config_update: channel.evaluation == Evaluation::Fast,
                    },
                );
                next_id += 1;
            }
        }
    }

    /// Point every input of a freshly loaded database at its bypass record.
    /// Fails if any input lacks a bypass or any bypass lacks an input.
    pub fn assign_bypass(&mut self, db: &mut Database) -> Result<(), ConfigError> {
        debug!("assigning bypass records to database inputs");
        self.digital_by_input.clear();
        self.analog_by_channel.clear();

        for (bypass_id, bypass) in self.map.iter_mut() {
            match bypass.kind {
                BypassType::Digital => {
                    let input = db.fault_inputs.get_mut(&bypass.device_id).ok_or(
                        ConfigError::MissingChannelForBypass {
                            kind: "FaultInput",
                            bypass_id: *bypass_id,
                            device_id: bypass.device_id,
                        },
                    )?;
                    input.bypass_id = Some(*bypass_id);
                    if input.fast_evaluation {
                        bypass.config_update = true;
                    }
                    self.digital_by_input.insert(bypass.device_id, *bypass_id);
                }
                BypassType::Analog => {
                    if !db.analog_channels.contains_key(&bypass.device_id) {
                        return Err(ConfigError::MissingChannelForBypass {
                            kind: "AnalogChannel",
                            bypass_id: *bypass_id,
                            device_id: bypass.device_id,
                        });
                    }
                    self.analog_by_channel
                        .insert((bypass.device_id, bypass.index), *bypass_id);
                }
            }
        }

        let unassigned_inputs: Vec<u32> = db
            .fault_inputs
            .values()
            .filter(|i| i.bypass_id.is_none())
            .map(|i| i.id)
            .collect();
        let unassigned_channels: Vec<u32> = db
            .analog_channels
            .keys()
            .filter(|id| {
                (0..ANALOG_MAX_INTEGRATORS_PER_CHANNEL as u32)
                    .any(|i| !self.analog_by_channel.contains_key(&(**id, i)))
            })
            .copied()
            .collect();
        if !unassigned_inputs.is_empty() || !unassigned_channels.is_empty() {
            return Err(ConfigError::UnassignedBypass {
                fault_inputs: unassigned_inputs,
                analog_channels: unassigned_channels,
            });
        }

        self.initialized = true;
        Ok(())
    }

    /// Create, extend, shorten or cancel a bypass on a digital input.
    pub fn set_bypass(
        &mut self,
        kind: BypassType,
        device_id: u32,
        value: u32,
        until: u64,
        test_mode: bool,
    ) -> Result<(), ConfigError> {
        self.set_threshold_bypass(kind, device_id, value, until, 0, test_mode)
    }

    /// As `set_bypass`, addressing one integrator of an analog channel.
    ///
    /// `until == 0` cancels immediately. `test_mode` pins "now" to
    /// `until - 1` for deterministic tests.
    pub fn set_threshold_bypass(
        &mut self,
        kind: BypassType,
        device_id: u32,
        value: u32,
        until: u64,
        integrator: u32,
        test_mode: bool,
    ) -> Result<(), ConfigError> {
        let bypass_id = match kind {
            BypassType::Digital => {
                *self
                    .digital_by_input
                    .get(&device_id)
                    .ok_or(ConfigError::UnknownBypassDevice {
                        kind: "FaultInput",
                        device_id,
                    })?
            }
            BypassType::Analog => *self
                .analog_by_channel
                .get(&(device_id, integrator))
                .ok_or(ConfigError::UnknownBypassDevice {
                    kind: "AnalogChannel",
                    device_id,
                })?,
        };
        let bypass = self.map.get_mut(&bypass_id).unwrap();
        let aux = match bypass.kind {
            BypassType::Digital => BYPASS_DIGITAL_INDEX,
            BypassType::Analog => bypass.index,
        };

        if until == 0 {
            // Cancel. Any queue entries left behind become stale pops.
            self.history.log_bypass_state(
                device_id,
                bypass.status as u32,
                BypassStatus::Expired as u32,
                aux,
            );
            bypass.status = BypassStatus::Expired;
            bypass.until = 0;
            if bypass.config_update {
                self.refresh_firmware_configuration = true;
            }
            debug!("bypass cancelled for device {device_id} (integrator {integrator})");
            return Ok(());
        }

        let now = if test_mode { until - 1 } else { unix_now() };
        if until > now {
            self.history.log_bypass_state(
                device_id,
                bypass.status as u32,
                BypassStatus::Valid as u32,
                aux,
            );
            if bypass.value != value {
                self.history.log_bypass_value(device_id, bypass.value, value);
            }
            if bypass.config_update {
                self.refresh_firmware_configuration = true;
            }
            bypass.until = until;
            bypass.status = BypassStatus::Valid;
            bypass.value = value;
            self.queue.push(Reverse((until, bypass_id)));
            debug!(
                "bypass set for device {device_id} (integrator {integrator}) until {until}"
            );
        }
        Ok(())
    }

    /// Sweep expired entries off the head of the heap. `now` defaults to
    /// the wall clock; tests pass explicit timestamps.
    pub fn check_bypass_queue(&mut self, now: Option<u64>) {
        let now = now.unwrap_or_else(unix_now);
        while self.expire_top(now) {}
    }

    fn expire_top(&mut self, now: u64) -> bool {
        let Some(&Reverse((entry_until, bypass_id))) = self.queue.peek() else {
            return false;
        };
        if entry_until > now {
            return false;
        }
        self.queue.pop();

        let bypass = self.map.get_mut(&bypass_id).unwrap();
        if bypass.until > entry_until {
            // The record was extended after this entry was queued; the
            // entry is stale. A record expired by an out-of-order shorter
            // entry is restored to Valid here.
            if bypass.status == BypassStatus::Expired {
                bypass.status = BypassStatus::Valid;
            }
        } else {
            if bypass.status == BypassStatus::Valid {
                let aux = match bypass.kind {
                    BypassType::Digital => BYPASS_DIGITAL_INDEX,
                    BypassType::Analog => bypass.index,
                };
                self.history.log_bypass_state(
                    bypass.device_id,
                    BypassStatus::Valid as u32,
                    BypassStatus::Expired as u32,
                    aux,
                );
                debug!(
                    "bypass expired for device {} (until {})",
                    bypass.device_id, entry_until
                );
            }
            bypass.status = BypassStatus::Expired;
            if bypass.config_update {
                self.refresh_firmware_configuration = true;
            }
        }
        true
    }

    /// Copy bypass state into the database: per-input status/value and the
    /// derived per-channel analog masks. Runs at the top of every cycle.
    pub fn snapshot_into(&self, db: &mut Database) {
        for input in db.fault_inputs.values_mut() {
            if let Some(bypass_id) = input.bypass_id {
                let bypass = &self.map[&bypass_id];
                input.bypass_status = bypass.status;
                input.bypass_value = bypass.value;
            }
        }
        for channel in db.analog_channels.values_mut() {
            let mut mask = u32::MAX;
            for integrator in 0..ANALOG_MAX_INTEGRATORS_PER_CHANNEL as u32 {
                if let Some(bypass_id) = self.analog_by_channel.get(&(channel.id, integrator)) {
                    if self.map[bypass_id].status == BypassStatus::Valid {
                        mask &= !(0xFFu32 << (integrator * 8));
                    }
                }
            }
            channel.bypass_mask = mask;
        }
    }

    /// Consume the deferred firmware-reconfiguration request.
    pub fn take_refresh_request(&mut self) -> bool {
        std::mem::take(&mut self.refresh_firmware_configuration)
    }

    pub fn bypass(&self, bypass_id: u32) -> Option<&InputBypass> {
        self.map.get(&bypass_id)
    }

    pub fn digital_bypass(&self, fault_input_id: u32) -> Option<&InputBypass> {
        self.digital_by_input
            .get(&fault_input_id)
            .and_then(|id| self.map.get(id))
    }

    pub fn analog_bypass(&self, channel_id: u32, integrator: u32) -> Option<&InputBypass> {
        self.analog_by_channel
            .get(&(channel_id, integrator))
            .and_then(|id| self.map.get(id))
    }

    /// Queue contents ordered by expiration, for status output.
    pub fn queue_report(&self) -> String {
        use std::fmt::Write as _;
        let mut entries: Vec<_> = self.queue.iter().map(|Reverse(e)| *e).collect();
        entries.sort_unstable();
        let mut out = format!(
            "=== Bypass queue ({} entries, now {}) ===\n",
            entries.len(),
            unix_now()
        );
        for (until, bypass_id) in entries {
            let bypass = &self.map[&bypass_id];
            let _ = writeln!(
                out,
                "  {until}: device {}{}{}{} value={}",
                bypass.device_id,
                match bypass.kind {
                    BypassType::Analog => format!(" integrator {}", bypass.index),
                    BypassType::Digital => String::new(),
                },
                if bypass.config_update { " [FW]" } else { "" },
                match bypass.status {
                    BypassStatus::Valid => " [VALID]",
                    BypassStatus::Expired => " [EXPIRED]",
                },
                bypass.value,
            );
        }
        out
    }
}

/// Background 1 Hz expiration sweep. The engine observes the results via
/// its per-cycle snapshot and refresh-request check.
pub fn run_bypass_thread(manager: Arc<Mutex<BypassManager>>, run: Arc<AtomicBool>) {
    info!("bypass thread started");
    while run.load(Ordering::Relaxed) {
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(100));
            if !run.load(Ordering::Relaxed) {
                info!("bypass thread stopped");
                return;
            }
        }
        manager.lock().unwrap().check_bypass_queue(None);
    }
    info!("bypass thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryKind;
    use crate::test_utils;

    fn manager_with_db() -> (BypassManager, Database, History) {
        let mut db = test_utils::small_database();
        let history = History::new();
        let mut manager = BypassManager::new(history.clone());
        manager.create_bypass_map(&db);
        manager.assign_bypass(&mut db).unwrap();
        (manager, db, history)
    }

    fn first_input_id(db: &Database) -> u32 {
        *db.fault_inputs.keys().next().unwrap()
    }

    #[test]
    fn every_input_gets_a_bypass() {
        let (manager, db, _) = manager_with_db();
        assert!(manager.is_initialized());
        for input in db.fault_inputs.values() {
            assert!(input.bypass_id.is_some());
        }
        for channel_id in db.analog_channels.keys() {
            for integrator in 0..4 {
                assert!(manager.analog_bypass(*channel_id, integrator).is_some());
            }
        }
    }

    #[test]
    fn queue_head_is_beyond_now_after_check() {
        let (mut manager, db, _) = manager_with_db();
        let input = first_input_id(&db);
        manager
            .set_bypass(BypassType::Digital, input, 0, 1000, true)
            .unwrap();
        manager.check_bypass_queue(Some(1500));
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Expired
        );
        // Nothing left at or before 1500.
        assert!(manager.queue.peek().is_none());
    }

    #[test]
    fn cancel_expires_immediately() {
        let (mut manager, db, _) = manager_with_db();
        let input = first_input_id(&db);
        manager
            .set_bypass(BypassType::Digital, input, 1, 1000, true)
            .unwrap();
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Valid
        );
        manager
            .set_bypass(BypassType::Digital, input, 0, 0, true)
            .unwrap();
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Expired
        );
    }

    #[test]
    fn extension_outlives_the_first_deadline() {
        let (mut manager, db, _) = manager_with_db();
        let input = first_input_id(&db);
        manager
            .set_bypass(BypassType::Digital, input, 1, 1000, true)
            .unwrap();
        manager
            .set_bypass(BypassType::Digital, input, 1, 2000, true)
            .unwrap();

        manager.check_bypass_queue(Some(1000));
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Valid
        );
        manager.check_bypass_queue(Some(2000));
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Expired
        );
    }

    #[test]
    fn shortening_expires_early_and_stays_expired() {
        let (mut manager, db, _) = manager_with_db();
        let input = first_input_id(&db);
        manager
            .set_bypass(BypassType::Digital, input, 1, 2000, true)
            .unwrap();
        manager
            .set_bypass(BypassType::Digital, input, 1, 1000, true)
            .unwrap();

        manager.check_bypass_queue(Some(1000));
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Expired
        );
        manager.check_bypass_queue(Some(2000));
        assert_eq!(
            manager.digital_bypass(input).unwrap().status,
            BypassStatus::Expired
        );
    }

    #[test]
    fn analog_bypass_masks_only_its_integrator() {
        let (mut manager, mut db, _) = manager_with_db();
        let channel_id = *db.analog_channels.keys().next().unwrap();
        manager
            .set_threshold_bypass(BypassType::Analog, channel_id, 0, 1000, 1, true)
            .unwrap();
        manager.snapshot_into(&mut db);
        assert_eq!(db.analog_channels[&channel_id].bypass_mask, 0xFFFF_00FF);

        manager.check_bypass_queue(Some(1000));
        manager.snapshot_into(&mut db);
        assert_eq!(db.analog_channels[&channel_id].bypass_mask, u32::MAX);
    }

    #[test]
    fn config_update_bypass_requests_refresh() {
        let (mut manager, mut db, _) = manager_with_db();
        let input = first_input_id(&db);
        // Force the record to require configuration reloads.
        db.fault_inputs.get_mut(&input).unwrap().fast_evaluation = true;
        manager.assign_bypass(&mut db).unwrap();
        assert!(!manager.take_refresh_request());

        manager
            .set_bypass(BypassType::Digital, input, 0, 1000, true)
            .unwrap();
        assert!(manager.take_refresh_request());
        assert!(!manager.take_refresh_request());

        manager.check_bypass_queue(Some(1000));
        assert!(manager.take_refresh_request());
    }

    #[test]
    fn history_emitted_on_every_status_transition() {
        let (mut manager, db, history) = manager_with_db();
        let input = first_input_id(&db);
        let _ = history.drain();

        manager
            .set_bypass(BypassType::Digital, input, 1, 1000, true)
            .unwrap();
        manager.check_bypass_queue(Some(1000));

        let messages = history.drain();
        let states: Vec<_> = messages
            .iter()
            .filter(|m| m.kind == HistoryKind::BypassState)
            .collect();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].new_value, BypassStatus::Valid as u32);
        assert_eq!(states[1].new_value, BypassStatus::Expired as u32);
        assert_eq!(states[1].aux, BYPASS_DIGITAL_INDEX);
    }

    #[test]
    fn stale_entry_does_not_emit_history() {
        let (mut manager, db, history) = manager_with_db();
        let input = first_input_id(&db);
        manager
            .set_bypass(BypassType::Digital, input, 1, 1000, true)
            .unwrap();
        manager
            .set_bypass(BypassType::Digital, input, 1, 2000, true)
            .unwrap();
        let _ = history.drain();

        // Pops the stale 1000 entry only; the bypass stays valid silently.
        manager.check_bypass_queue(Some(1000));
        assert!(history.drain().is_empty());
    }

    #[test]
    fn unknown_device_is_rejected() {
        let (mut manager, _, _) = manager_with_db();
        let err = manager
            .set_bypass(BypassType::Digital, 0xDEAD, 0, 1000, true)
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownBypassDevice { .. }));
    }
}
