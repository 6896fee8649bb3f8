/*!
Entity definitions and the `Database` container.

Entities keep both their document fields (loaded from YAML) and the derived
per-cycle state. References are plain `u32` ids into the sibling tables;
back-reference sets are id vectors populated during link-up. `BTreeMap`
tables give deterministic iteration order, matching the relational source.
*/

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::bypass::BypassStatus;
use crate::defs::{ANALOG_MAX_INTEGRATORS_PER_CHANNEL, CLEAR_BEAM_CLASS, NUM_DESTINATIONS};

/// How an input participates in fault evaluation. SLOW inputs are evaluated
/// by this engine at 360 Hz; FAST inputs are evaluated directly in firmware
/// and only configured from here; NONE inputs are monitored but feed no
/// fault logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Evaluation {
    #[default]
    Slow,
    Fast,
    None,
}

impl From<u32> for Evaluation {
    fn from(raw: u32) -> Self {
        match raw {
            0 => Evaluation::Slow,
            1 => Evaluation::Fast,
            _ => Evaluation::None,
        }
    }
}

/// A fault input reads either one digital channel or one analog channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRef {
    Digital(u32),
    Analog(u32),
}

/// Cached (id, ordinal) pair for a beam class. The ordinal is what every
/// comparison uses: lower number = more restrictive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BeamClassRef {
    pub id: u32,
    pub number: u32,
}

/// Physical chassis hosting application cards.
#[derive(Clone, Debug, Default)]
pub struct Crate {
    pub id: u32,
    pub num_slots: u32,
    pub location: String,
    pub rack: String,
    pub elevation: u32,
    pub area: String,
    pub node: String,
}

/// Link node metadata (group routing for a crate).
#[derive(Clone, Debug, Default)]
pub struct LinkNode {
    pub id: u32,
    pub location: String,
    pub group_link: String,
    pub rx_pgp: u32,
    pub ln_type: u32,
    pub ln_id: u32,
    pub crate_id: u32,
    pub group_id: u32,
}

/// Provenance of the loaded configuration.
#[derive(Clone, Debug, Default)]
pub struct DatabaseInfo {
    pub source: String,
    pub date: String,
    pub user: String,
    pub md5sum: String,
}

/// Class of application card: channel capacity and integrator count.
#[derive(Clone, Debug, Default)]
pub struct ApplicationType {
    pub id: u32,
    pub num_integrators: u32,
    pub analog_channel_count: u32,
    pub digital_channel_count: u32,
    pub software_channel_count: u32,
    pub name: String,
}

/// One physical card. Owns either digital or analog channels, never both.
#[derive(Clone, Debug, Default)]
pub struct ApplicationCard {
    pub id: u32,
    pub number: u32,
    pub slot_number: u32,
    pub crate_id: u32,
    pub application_type_id: u32,

    // Link-up results.
    pub digital_channel_ids: Vec<u32>,
    pub analog_channel_ids: Vec<u32>,
    pub has_inputs: bool,

    // Per-cycle state.
    /// Latest 360 Hz packet from this card was non-zero.
    pub online: bool,
    /// Firmware timeout mask bit is set for this card.
    pub active: bool,
    /// Some input of this card currently holds a valid bypass.
    pub bypassed: bool,
    /// Externally requested ignore is currently applied.
    pub ignored: bool,
    /// Externally requested ignore (mode driven), applied on the next cycle.
    pub ignore_requested: bool,
}

impl ApplicationCard {
    pub fn is_digital(&self) -> bool {
        !self.digital_channel_ids.is_empty()
    }

    pub fn is_analog(&self) -> bool {
        !self.analog_channel_ids.is_empty()
    }
}

/// One logical digital input of a card.
#[derive(Clone, Debug, Default)]
pub struct DigitalChannel {
    pub id: u32,
    pub number: u32,
    pub card_id: u32,
    pub name: String,
    pub z_name: String,
    pub o_name: String,
    pub z_location: f32,
    pub debounce: u32,
    /// Input level considered faulted; becomes `fault_value`.
    pub alarm_state: u32,
    pub auto_reset: bool,
    pub evaluation: Evaluation,
    pub fault_value: u32,

    // Per-cycle state.
    pub value: u32,
    pub previous_value: u32,
    pub latched_value: u32,
    /// Count of cycles with was-low == was-high == 0 (no packet from card).
    pub invalid_value_count: u32,
    pub was_low_bit: u32,
    pub was_high_bit: u32,
    pub faulted_offline: bool,
    pub mode_active: bool,

    // Link-up results.
    pub fault_input_ids: Vec<u32>,
    pub fault_state_ids: Vec<u32>,

    // Fast-evaluation configuration, folded from the fault states.
    pub fast_destination_mask: u16,
    pub fast_power_class: u16,
    pub fast_expected_state: u8,
}

impl DigitalChannel {
    /// Direct value injection (tests and slow paths). Latches when the new
    /// value is the fault level; auto-reset channels never hold a latch.
    pub fn update_value(&mut self, v: u32) {
        self.previous_value = self.value;
        self.value = v;
        if v == self.fault_value {
            self.latched_value = self.fault_value;
        }
        if self.auto_reset {
            self.latched_value = self.value;
        }
    }

    pub fn unlatch(&mut self) {
        self.latched_value = self.value;
    }
}

/// One analog input. The value is a bitfield of up to four 8-bit integrator
/// comparator states; bit set = threshold exceeded.
#[derive(Clone, Debug)]
pub struct AnalogChannel {
    pub id: u32,
    pub number: u32,
    pub card_id: u32,
    pub name: String,
    pub egu: String,
    pub offset: f32,
    pub slope: f32,
    pub z_location: f32,
    pub integrator: u32,
    pub gain_bay: u32,
    pub gain_channel: u32,
    pub auto_reset: bool,
    pub evaluation: Evaluation,

    // Link-up results.
    pub num_integrators: u32,
    pub num_channels_card: u32,
    pub fault_input_ids: Vec<u32>,
    pub fault_state_ids: Vec<u32>,

    // Per-cycle state.
    pub value: u32,
    pub previous_value: u32,
    pub latched_value: u32,
    pub invalid_value_count: u32,
    pub ignored: bool,
    pub ignored_integrator: [bool; ANALOG_MAX_INTEGRATORS_PER_CHANNEL],
    pub faulted_offline: bool,
    pub mode_active: bool,
    /// One byte per integrator; 0xFF = not bypassed, 0x00 = bypassed.
    /// Refreshed from the bypass snapshot each cycle.
    pub bypass_mask: u32,

    // Fast-evaluation configuration, folded from the fault states.
    pub fast_destination_mask: [u16; ANALOG_MAX_INTEGRATORS_PER_CHANNEL],
    pub fast_power_class: [u16; 32],
}

impl Default for AnalogChannel {
    fn default() -> Self {
        AnalogChannel {
            id: 0,
            number: 0,
            card_id: 0,
            name: String::new(),
            egu: String::new(),
            offset: 0.0,
            slope: 0.0,
            z_location: 0.0,
            integrator: 0,
            gain_bay: 0,
            gain_channel: 0,
            auto_reset: false,
            evaluation: Evaluation::Slow,
            num_integrators: 0,
            num_channels_card: 0,
            fault_input_ids: Vec::new(),
            fault_state_ids: Vec::new(),
            value: 0,
            previous_value: 0,
            latched_value: 0,
            invalid_value_count: 0,
            ignored: false,
            ignored_integrator: [false; ANALOG_MAX_INTEGRATORS_PER_CHANNEL],
            faulted_offline: false,
            mode_active: false,
            bypass_mask: u32::MAX,
            fast_destination_mask: [0; ANALOG_MAX_INTEGRATORS_PER_CHANNEL],
            fast_power_class: [0; 32],
        }
    }
}

impl AnalogChannel {
    /// Direct value injection. Any newly set threshold bit joins the latch.
    pub fn update_value(&mut self, v: u32) {
        self.previous_value = self.value;
        self.value = v;
        if (v | self.latched_value) != self.latched_value {
            self.latched_value |= v;
        }
    }

    /// Effective value for slow evaluation: threshold bits of bypassed
    /// integrators read as zero.
    pub fn masked_value(&self) -> u32 {
        self.value & self.bypass_mask
    }

    pub fn unlatch(&mut self) {
        self.latched_value = self.value;
    }
}

/// One bit contribution to a fault's composite value.
#[derive(Clone, Debug)]
pub struct FaultInput {
    pub id: u32,
    pub fault_id: u32,
    pub channel_id: u32,
    pub bit_position: u32,

    // Link-up results.
    pub channel: Option<ChannelRef>,
    /// The single fault state this input signals, when its fault has
    /// exactly one.
    pub fault_state_id: Option<u32>,
    pub fast_evaluation: bool,

    // Bypass snapshot, refreshed at the top of each cycle.
    pub bypass_id: Option<u32>,
    pub bypass_status: BypassStatus,
    pub bypass_value: u32,
}

impl Default for FaultInput {
    fn default() -> Self {
        FaultInput {
            id: 0,
            fault_id: 0,
            channel_id: 0,
            bit_position: 0,
            channel: None,
            fault_state_id: None,
            fast_evaluation: false,
            bypass_id: None,
            bypass_status: BypassStatus::Expired,
            bypass_value: 0,
        }
    }
}

/// Declarative fault: a named composite of inputs with a set of states.
#[derive(Clone, Debug, Default)]
pub struct Fault {
    pub id: u32,
    pub name: String,
    pub pv: String,
    pub ignore_condition_ids: Vec<u32>,

    // Link-up results.
    pub fault_input_ids: Vec<u32>,
    pub fault_state_ids: Vec<u32>,
    pub default_fault_state_id: Option<u32>,
    pub evaluation: Evaluation,

    // Per-cycle state.
    pub value: u32,
    pub old_value: u32,
    pub faulted: bool,
    pub ignored: bool,
    pub faulted_offline: bool,
}

impl Fault {
    pub fn update_value(&mut self, v: u32) {
        self.old_value = self.value;
        self.value = v;
    }
}

/// A (mask, value) pattern identifying one concrete failure mode of a fault.
#[derive(Clone, Debug, Default)]
pub struct FaultState {
    pub id: u32,
    pub fault_id: u32,
    pub name: String,
    pub mask: u32,
    pub value: u32,
    pub default_state: bool,
    pub mitigation_ids: Vec<u32>,

    // Link-up results.
    pub allowed_class_ids: Vec<u32>,
    /// For analog states: integrator index derived from the first non-zero
    /// octet of `value`.
    pub integrator: Option<usize>,
    /// For analog states: index of the first set bit of `value`.
    pub threshold_index: Option<usize>,

    // Per-cycle state.
    pub faulted: bool,
    pub ignored: bool,
}

/// Ordinal power level; lower number = more restrictive.
#[derive(Clone, Debug, Default)]
pub struct BeamClass {
    pub id: u32,
    pub number: u32,
    pub name: String,
    pub integration_window: u32,
    pub min_period: u32,
    pub total_charge: u32,
}

/// One of up to 16 gated beam destinations.
#[derive(Clone, Debug, Default)]
pub struct BeamDestination {
    pub id: u32,
    pub name: String,
    pub destination_mask: u16,
    pub display_order: u16,
    pub buffer0_destination_mask: u32,
    pub buffer1_destination_mask: u32,

    // Per-cycle state.
    pub tentative_beam_class: Option<BeamClassRef>,
    pub allowed_beam_class: Option<BeamClassRef>,
    pub previous_allowed_beam_class: Option<BeamClassRef>,

    // Operator override slots.
    pub force_beam_class: Option<BeamClassRef>,
    pub soft_permit: Option<BeamClassRef>,
    pub max_permit: Option<BeamClassRef>,
}

impl BeamDestination {
    /// Apply the override lattice and fold the final class into the
    /// software mitigation buffer. `force` and `max_permit` lower the
    /// tentative class; `soft_permit` can only lower the final answer.
    pub fn set_allowed_beam_class(&mut self, buffer: &mut [u32; 2]) {
        let Some(mut tentative) = self.tentative_beam_class else {
            return;
        };
        if let Some(force) = self.force_beam_class {
            if force.number < tentative.number {
                tentative = force;
            }
        }
        if let Some(max_permit) = self.max_permit {
            if max_permit.number < tentative.number {
                tentative = max_permit;
            }
        }
        self.tentative_beam_class = Some(tentative);
        let allowed = match self.soft_permit {
            Some(soft) if soft.number < tentative.number => soft,
            _ => tentative,
        };
        self.allowed_beam_class = Some(allowed);

        // Replicate the 4-bit class number into all eight nibbles and keep
        // only the nibbles this destination owns.
        let mut expanded = 0u32;
        for shift in (0..32).step_by(4) {
            expanded |= (allowed.number & 0xF) << shift;
        }
        buffer[0] |= self.buffer0_destination_mask & expanded;
        buffer[1] |= self.buffer1_destination_mask & expanded;
    }
}

/// (FaultState, BeamDestination, BeamClass) triple: when the state is
/// active, the destination may run no higher than the class.
#[derive(Clone, Debug)]
pub struct AllowedClass {
    pub id: u32,
    pub beam_class_id: u32,
    pub beam_destination_id: u32,

    // Link-up result.
    pub beam_class: BeamClassRef,
}

/// Suppresses a set of faults while one digital channel reads an expected
/// value.
#[derive(Clone, Debug, Default)]
pub struct IgnoreCondition {
    pub id: u32,
    pub name: String,
    pub description: String,
    /// Digital channel value that activates the condition.
    pub value: u32,
    pub digital_channel_id: u32,

    // Link-up results.
    pub fault_ids: Vec<u32>,
    pub fault_input_ids: Vec<u32>,

    // Per-cycle state.
    pub state: bool,
}

/// The full configuration, plus the per-cycle software mitigation buffer.
#[derive(Clone, Debug, Default)]
pub struct Database {
    pub name: String,
    pub info: Option<DatabaseInfo>,

    pub crates: BTreeMap<u32, Crate>,
    pub link_nodes: BTreeMap<u32, LinkNode>,
    pub application_types: BTreeMap<u32, ApplicationType>,
    pub application_cards: BTreeMap<u32, ApplicationCard>,
    pub digital_channels: BTreeMap<u32, DigitalChannel>,
    pub analog_channels: BTreeMap<u32, AnalogChannel>,
    pub faults: BTreeMap<u32, Fault>,
    pub fault_inputs: BTreeMap<u32, FaultInput>,
    pub fault_states: BTreeMap<u32, FaultState>,
    pub beam_classes: BTreeMap<u32, BeamClass>,
    pub beam_destinations: BTreeMap<u32, BeamDestination>,
    pub allowed_classes: BTreeMap<u32, AllowedClass>,
    pub ignore_conditions: BTreeMap<u32, IgnoreCondition>,

    pub lowest_beam_class: BeamClassRef,
    pub highest_beam_class: BeamClassRef,

    /// Two 32-bit words of 4-bit allowed-class nibbles, one nibble per
    /// destination, rebuilt every cycle and shipped to firmware.
    pub software_mitigation_buffer: [u32; 2],
}

impl Database {
    pub fn empty() -> Self {
        Database {
            lowest_beam_class: BeamClassRef { id: 0, number: 0 },
            highest_beam_class: BeamClassRef { id: 0, number: 0 },
            ..Default::default()
        }
    }

    pub fn beam_class_ref(&self, id: u32) -> Option<BeamClassRef> {
        self.beam_classes.get(&id).map(|c| BeamClassRef {
            id: c.id,
            number: c.number,
        })
    }

    pub fn clear_mitigation_buffer(&mut self) {
        self.software_mitigation_buffer = [0; NUM_DESTINATIONS / 8];
    }

    /// Operator force: pin a destination at or below a class. The
    /// `CLEAR_BEAM_CLASS` sentinel (or an unknown class id) clears the slot.
    pub fn force_beam_destination(&mut self, destination_id: u32, beam_class_id: u32) {
        let class = self.override_class(beam_class_id);
        if let Some(dest) = self.beam_destinations.get_mut(&destination_id) {
            dest.force_beam_class = class;
        }
    }

    /// Operator software permit for one destination.
    pub fn soft_permit_destination(&mut self, destination_id: u32, beam_class_id: u32) {
        let class = self.override_class(beam_class_id);
        if let Some(dest) = self.beam_destinations.get_mut(&destination_id) {
            dest.soft_permit = class;
        }
    }

    /// Global ceiling applied to every destination except "LASER".
    pub fn set_max_permit(&mut self, beam_class_id: u32) {
        let class = self.override_class(beam_class_id);
        for dest in self.beam_destinations.values_mut() {
            if dest.name != "LASER" {
                dest.max_permit = class;
            }
        }
    }

    fn override_class(&self, beam_class_id: u32) -> Option<BeamClassRef> {
        if beam_class_id == CLEAR_BEAM_CLASS {
            None
        } else {
            self.beam_class_ref(beam_class_id)
        }
    }

    /// Operator unlatch: latched values snap back to the live values.
    pub fn unlatch_all(&mut self) {
        for channel in self.digital_channels.values_mut() {
            channel.unlatch();
        }
        for channel in self.analog_channels.values_mut() {
            channel.unlatch();
        }
    }

    pub fn total_device_count(&self) -> usize {
        self.digital_channels.len() + self.analog_channels.len()
    }

    /// Current faulted states, one line each.
    pub fn show_faults(&self) -> String {
        let mut out = String::new();
        let mut any = false;
        for fault in self.faults.values() {
            for state_id in &fault.fault_state_ids {
                let state = &self.fault_states[state_id];
                if state.faulted {
                    if !any {
                        out.push_str("# Current faults:\n");
                        any = true;
                    }
                    let _ = writeln!(
                        out,
                        "  {}: {} (value=0x{:x}{})",
                        fault.name,
                        state.name,
                        state.value,
                        if state.ignored { ", ignored" } else { "" },
                    );
                }
            }
        }
        if !any {
            out.push_str("# No faults\n");
        }
        out
    }

    /// Allowed/tentative class per destination, in display order.
    pub fn show_beam_destinations(&self) -> String {
        let mut out = String::from(">> Beam destinations:\n");
        let mut dests: Vec<_> = self.beam_destinations.values().collect();
        dests.sort_by_key(|d| d.display_order);
        for dest in dests {
            let _ = writeln!(
                out,
                "  {}: allowed={} tentative={}",
                dest.name,
                dest.allowed_beam_class.map_or(0, |c| c.number),
                dest.tentative_beam_class.map_or(0, |c| c.number),
            );
        }
        out
    }

    /// Provenance summary for status output.
    pub fn show_info(&self) -> String {
        let mut out = format!("Database: {}\n", self.name);
        if let Some(info) = &self.info {
            let _ = writeln!(
                out,
                "  source={} date={} user={} md5={}",
                info.source, info.date, info.user, info.md5sum
            );
        }
        let _ = writeln!(
            out,
            "  {} cards, {} digital channels, {} analog channels, {} faults, {} destinations",
            self.application_cards.len(),
            self.digital_channels.len(),
            self.analog_channels.len(),
            self.faults.len(),
            self.beam_destinations.len(),
        );
        out
    }
}

impl std::fmt::Display for Crate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; slots[{}]; location[{}]; rack[{}]; elevation[{}]",
            self.id, self.num_slots, self.location, self.rack, self.elevation
        )
    }
}

impl std::fmt::Display for ApplicationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; analogChannels[{}]; digitalChannels[{}]; integrators[{}]; name[{}]",
            self.id,
            self.analog_channel_count,
            self.digital_channel_count,
            self.num_integrators,
            self.name
        )
    }
}

impl std::fmt::Display for ApplicationCard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; number[{}]; crateId[{}]; slot[{}]; online[{}]; active[{}]; bypassed[{}]; ignored[{}]",
            self.id,
            self.number,
            self.crate_id,
            self.slot_number,
            self.online,
            self.active,
            self.bypassed,
            self.ignored
        )
    }
}

impl std::fmt::Display for DigitalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; number[{}]; cardId[{}]; name[{}]; value[{}]; latched[{}]; invalid[{}]",
            self.id,
            self.number,
            self.card_id,
            self.name,
            self.value,
            self.latched_value,
            self.invalid_value_count
        )
    }
}

impl std::fmt::Display for AnalogChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; number[{}]; cardId[{}]; name[{}]; value[{:#010x}]; latched[{:#010x}]; bypassMask[{:#010x}]",
            self.id,
            self.number,
            self.card_id,
            self.name,
            self.value,
            self.latched_value,
            self.bypass_mask
        )
    }
}

impl std::fmt::Display for FaultInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; faultId[{}]; channelId[{}]; bitPosition[{}]",
            self.id, self.fault_id, self.channel_id, self.bit_position
        )
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; name[{}]; value[{:#x}]; faulted[{}]; ignored[{}]",
            self.id, self.name, self.value, self.faulted, self.ignored
        )
    }
}

impl std::fmt::Display for FaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; faultId[{}]; name[{}]; value[{:#x}]; mask[{:#x}]; default[{}]; faulted[{}]",
            self.id, self.fault_id, self.name, self.value, self.mask, self.default_state,
            self.faulted
        )
    }
}

impl std::fmt::Display for BeamClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; number[{}]; name[{}]; intWindow[{}]; minPeriod[{}]; charge[{}]",
            self.id, self.number, self.name, self.integration_window, self.min_period,
            self.total_charge
        )
    }
}

impl std::fmt::Display for BeamDestination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; name[{}]; mask[{:#06x}]; displayOrder[{}]; allowed[{}]; tentative[{}]",
            self.id,
            self.name,
            self.destination_mask,
            self.display_order,
            self.allowed_beam_class.map_or(0, |c| c.number),
            self.tentative_beam_class.map_or(0, |c| c.number)
        )
    }
}

impl std::fmt::Display for AllowedClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; beamClassId[{}]; beamDestinationId[{}]",
            self.id, self.beam_class_id, self.beam_destination_id
        )
    }
}

impl std::fmt::Display for IgnoreCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "id[{}]; name[{}]; value[{}]; digitalChannelId[{}]; state[{}]",
            self.id, self.name, self.value, self.digital_channel_id, self.state
        )
    }
}

impl Database {
    fn dump_table<T: std::fmt::Display>(
        out: &mut String,
        name: &str,
        table: &BTreeMap<u32, T>,
    ) {
        let _ = writeln!(out, "{name}:");
        for entry in table.values() {
            let _ = writeln!(out, "  {entry}");
        }
    }

    /// Full dump of every table, for the structural status endpoints.
    pub fn dump(&self) -> String {
        let mut out = format!("Name: {}\n", self.name);
        Self::dump_table(&mut out, "Crate", &self.crates);
        Self::dump_table(&mut out, "ApplicationType", &self.application_types);
        Self::dump_table(&mut out, "ApplicationCard", &self.application_cards);
        Self::dump_table(&mut out, "BeamDestination", &self.beam_destinations);
        Self::dump_table(&mut out, "BeamClass", &self.beam_classes);
        Self::dump_table(&mut out, "Fault", &self.faults);
        Self::dump_table(&mut out, "FaultInput", &self.fault_inputs);
        Self::dump_table(&mut out, "FaultState", &self.fault_states);
        Self::dump_table(&mut out, "IgnoreCondition", &self.ignore_conditions);
        Self::dump_table(&mut out, "AllowedClass", &self.allowed_classes);
        Self::dump_table(&mut out, "DigitalChannel", &self.digital_channels);
        Self::dump_table(&mut out, "AnalogChannel", &self.analog_channels);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class(number: u32) -> BeamClassRef {
        BeamClassRef { id: number + 1, number }
    }

    fn destination() -> BeamDestination {
        BeamDestination {
            id: 1,
            name: "D0".into(),
            destination_mask: 0x1,
            display_order: 0,
            buffer0_destination_mask: 0x0000_000F,
            buffer1_destination_mask: 0,
            tentative_beam_class: Some(class(5)),
            ..Default::default()
        }
    }

    #[test]
    fn soft_permit_lowers_but_never_raises() {
        let mut buffer = [0u32; 2];
        let mut dest = destination();
        dest.soft_permit = Some(class(3));
        dest.set_allowed_beam_class(&mut buffer);
        assert_eq!(dest.allowed_beam_class.unwrap().number, 3);

        let mut buffer = [0u32; 2];
        let mut dest = destination();
        dest.tentative_beam_class = Some(class(2));
        dest.soft_permit = Some(class(5));
        dest.set_allowed_beam_class(&mut buffer);
        assert_eq!(dest.allowed_beam_class.unwrap().number, 2);
    }

    #[test]
    fn force_lowers_tentative() {
        let mut buffer = [0u32; 2];
        let mut dest = destination();
        dest.force_beam_class = Some(class(1));
        dest.set_allowed_beam_class(&mut buffer);
        assert_eq!(dest.tentative_beam_class.unwrap().number, 1);
        assert_eq!(dest.allowed_beam_class.unwrap().number, 1);
    }

    #[test]
    fn mitigation_nibble_is_masked_into_buffer() {
        let mut buffer = [0u32; 2];
        let mut dest = destination();
        dest.buffer0_destination_mask = 0x0000_00F0;
        dest.set_allowed_beam_class(&mut buffer);
        assert_eq!(buffer[0], 0x0000_0050);
        assert_eq!(buffer[1], 0);
    }

    #[test]
    fn digital_latch_holds_until_unlatch() {
        let mut ch = DigitalChannel {
            fault_value: 1,
            ..Default::default()
        };
        ch.update_value(1);
        ch.update_value(0);
        assert_eq!(ch.value, 0);
        assert_eq!(ch.latched_value, 1);
        ch.unlatch();
        assert_eq!(ch.latched_value, 0);
    }

    #[test]
    fn digital_auto_reset_never_latches() {
        let mut ch = DigitalChannel {
            fault_value: 1,
            auto_reset: true,
            ..Default::default()
        };
        ch.update_value(1);
        ch.update_value(0);
        assert_eq!(ch.latched_value, ch.value);
    }

    #[test]
    fn analog_latch_accumulates_threshold_bits() {
        let mut ch = AnalogChannel::default();
        ch.update_value(0x0000_0101);
        ch.update_value(0x0000_0002);
        assert_eq!(ch.value, 0x0000_0002);
        assert_eq!(ch.latched_value, 0x0000_0103);
    }

    #[test]
    fn analog_masked_value_hides_bypassed_integrator() {
        let mut ch = AnalogChannel::default();
        ch.update_value(0x0000_0301);
        ch.bypass_mask = 0xFFFF_FF00;
        assert_eq!(ch.masked_value(), 0x0000_0300);
    }

    #[test]
    fn dump_renders_every_table() {
        let mut db = Database::empty();
        db.name = "dump-test".into();
        db.crates.insert(
            1,
            Crate {
                id: 1,
                num_slots: 6,
                location: "L2KA00".into(),
                ..Default::default()
            },
        );
        db.beam_classes.insert(
            1,
            BeamClass {
                id: 1,
                number: 0,
                name: "Class 0".into(),
                ..Default::default()
            },
        );
        let text = db.dump();
        assert!(text.contains("Name: dump-test"));
        assert!(text.contains("L2KA00"));
        assert!(text.contains("Class 0"));
        assert!(text.contains("FaultState:"));
    }

    #[test]
    fn max_permit_skips_laser() {
        let mut db = Database::empty();
        db.beam_classes.insert(
            3,
            BeamClass {
                id: 3,
                number: 2,
                ..Default::default()
            },
        );
        db.beam_destinations.insert(
            1,
            BeamDestination {
                id: 1,
                name: "LINAC".into(),
                ..Default::default()
            },
        );
        db.beam_destinations.insert(
            2,
            BeamDestination {
                id: 2,
                name: "LASER".into(),
                ..Default::default()
            },
        );
        db.set_max_permit(3);
        assert_eq!(db.beam_destinations[&1].max_permit.unwrap().number, 2);
        assert!(db.beam_destinations[&2].max_permit.is_none());
        db.set_max_permit(CLEAR_BEAM_CLASS);
        assert!(db.beam_destinations[&1].max_permit.is_none());
    }
}
