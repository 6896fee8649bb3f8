//! Shared test fixtures: a small but complete configuration database and
//! builders for raw update packets.
//!
//! The fixture database (`small_database_yaml`) models one digital card and
//! one analog card:
//!
//! - beam classes 0..=7 (ids 1..=8; id = number + 1)
//! - destinations D0 (id 1, nibble 0) and D1 (id 2, nibble 1)
//! - digital channels: number 0 feeds F1 (D0 <= 2), number 1 feeds F2
//!   (D0 <= 5, gated by the ignore condition), number 2 is the gate input,
//!   number 3 feeds F3 (D0 <= 6)
//! - one analog channel whose fault states cap D1 at class 1 (integrator 1,
//!   threshold 8) and class 3 (integrator 0, threshold 0)
//!
//! Packet builders produce full-size update buffers; "nominal" packets set
//! every configured input's was-low bit (all channels reading 0, no
//! threshold crossings).

#![allow(dead_code)]

use crate::db::{ChannelRef, Database};

pub use crate::packets::{
    nominal_packet, overlay_digital, packet_with_digital, set_analog_threshold, set_was_high,
    set_was_low, update_packet,
};

/// YAML text of the fixture database described in the module docs.
pub fn small_database_yaml() -> String {
    let mut text = String::from(
        "\
BeamClass:
",
    );
    for number in 0..8 {
        text.push_str(&format!(
            "- id: {}\n  number: {}\n  name: Class {}\n  integration_window: {}\n  min_period: 1\n  total_charge: {}\n",
            number + 1,
            number,
            number,
            91_000 + number,
            100_000 + number,
        ));
    }
    text.push_str(
        "\
BeamDestination:
- id: 1
  name: D0
  destination_mask: 1
  display_order: 0
  buffer0_destination_mask: 15
  buffer1_destination_mask: 0
- id: 2
  name: D1
  destination_mask: 2
  display_order: 1
  buffer0_destination_mask: 240
  buffer1_destination_mask: 0
Crate:
- id: 1
  num_slots: 6
  location: L2KA00
  rack: R01
  elevation: 17
ApplicationType:
- id: 1
  num_integrators: 0
  analog_channel_count: 0
  digital_channel_count: 4
  software_channel_count: 0
  name: Digital Card
- id: 2
  num_integrators: 4
  analog_channel_count: 3
  digital_channel_count: 0
  software_channel_count: 0
  name: Analog Card
ApplicationCard:
- id: 1
  number: 0
  slot_number: 2
  crate_id: 1
  type_id: 1
- id: 2
  number: 1
  slot_number: 3
  crate_id: 1
  type_id: 2
DigitalChannel:
- id: 1
  number: 0
  card_id: 1
  name: STOPPER_IN
  alarm_state: 1
  auto_reset: 0
  evaluation: 0
- id: 2
  number: 1
  card_id: 1
  name: VALVE_CLOSED
  alarm_state: 1
  auto_reset: 0
  evaluation: 0
- id: 3
  number: 2
  card_id: 1
  name: SCREEN_IN
  alarm_state: 1
  auto_reset: 0
  evaluation: 2
- id: 4
  number: 3
  card_id: 1
  name: DOOR_OPEN
  alarm_state: 1
  auto_reset: 0
  evaluation: 0
AnalogChannel:
- id: 10
  number: 0
  card_id: 2
  name: LOSS_MONITOR
  egu: counts
  offset: 0
  slope: 1
  auto_reset: 0
  evaluation: 0
Fault:
- id: 1
  name: STOPPER_FAULT
  pv: STOP:FLT
- id: 2
  name: VALVE_FAULT
  pv: VALVE:FLT
  ignore_condition_ids: [1]
- id: 3
  name: DOOR_FAULT
  pv: DOOR:FLT
- id: 4
  name: LOSS_FAULT
  pv: LOSS:FLT
FaultInput:
- id: 1
  fault_id: 1
  channel_id: 1
  bit_position: 0
- id: 2
  fault_id: 2
  channel_id: 2
  bit_position: 0
- id: 3
  fault_id: 3
  channel_id: 4
  bit_position: 0
- id: 4
  fault_id: 4
  channel_id: 10
  bit_position: 0
FaultState:
- id: 1
  fault_id: 1
  name: IN
  mask: 1
  value: 1
  mitigation_ids: [1]
- id: 2
  fault_id: 2
  name: CLOSED
  mask: 1
  value: 1
  mitigation_ids: [2]
- id: 3
  fault_id: 3
  name: OPEN
  mask: 1
  value: 1
  mitigation_ids: [3]
- id: 4
  fault_id: 4
  name: I1_T0
  mask: 256
  value: 256
  mitigation_ids: [4]
- id: 5
  fault_id: 4
  name: I0_T0
  mask: 1
  value: 1
  mitigation_ids: [5]
Mitigation:
- id: 1
  beam_class_id: 3
  beam_destination_id: 1
- id: 2
  beam_class_id: 6
  beam_destination_id: 1
- id: 3
  beam_class_id: 7
  beam_destination_id: 1
- id: 4
  beam_class_id: 2
  beam_destination_id: 2
- id: 5
  beam_class_id: 4
  beam_destination_id: 2
IgnoreCondition:
- id: 1
  name: SCREEN_GATED
  description: Suppress valve faults while the screen is inserted
  value: 1
  digital_channel_id: 3
",
    );
    text
}

/// The fixture, loaded and linked.
pub fn small_database() -> Database {
    crate::db::load_str(&small_database_yaml(), "fixture").expect("fixture database loads")
}

/// A fixture with one FAST digital channel (and one SLOW) on a single
/// card. `auto_reset` makes the fast channel invalid, for error-path tests.
pub fn fast_database_yaml(auto_reset: bool) -> String {
    let mut text = String::from("BeamClass:\n");
    for number in 0..8 {
        text.push_str(&format!(
            "- id: {}\n  number: {}\n  name: Class {}\n",
            number + 1,
            number,
            number,
        ));
    }
    text.push_str(&format!(
        "\
BeamDestination:
- id: 1
  name: D0
  destination_mask: 1
  display_order: 0
  buffer0_destination_mask: 15
  buffer1_destination_mask: 0
- id: 2
  name: D1
  destination_mask: 2
  display_order: 1
  buffer0_destination_mask: 240
  buffer1_destination_mask: 0
Crate:
- id: 1
  num_slots: 6
ApplicationType:
- id: 1
  num_integrators: 0
  analog_channel_count: 0
  digital_channel_count: 2
  software_channel_count: 0
  name: Digital Card
ApplicationCard:
- id: 1
  number: 0
  slot_number: 2
  crate_id: 1
  type_id: 1
DigitalChannel:
- id: 1
  number: 0
  card_id: 1
  name: FAST_VALVE
  alarm_state: 1
  auto_reset: {}
  evaluation: 1
- id: 2
  number: 1
  card_id: 1
  name: SLOW_VALVE
  alarm_state: 1
  auto_reset: 0
  evaluation: 0
Fault:
- id: 1
  name: FAST_VALVE_FAULT
  pv: FVALVE:FLT
- id: 2
  name: SLOW_VALVE_FAULT
  pv: SVALVE:FLT
FaultInput:
- id: 1
  fault_id: 1
  channel_id: 1
  bit_position: 0
- id: 2
  fault_id: 2
  channel_id: 2
  bit_position: 0
FaultState:
- id: 1
  fault_id: 1
  name: FAULTED
  mask: 1
  value: 1
  mitigation_ids: [1, 2]
- id: 2
  fault_id: 2
  name: FAULTED
  mask: 1
  value: 1
  mitigation_ids: [3]
Mitigation:
- id: 1
  beam_class_id: 3
  beam_destination_id: 1
- id: 2
  beam_class_id: 6
  beam_destination_id: 2
- id: 3
  beam_class_id: 7
  beam_destination_id: 1
",
        if auto_reset { 1 } else { 0 },
    ));
    text
}

/// Id of the digital channel with the given channel number.
pub fn digital_channel_id(db: &Database, number: u32) -> u32 {
    db.digital_channels
        .values()
        .find(|c| c.number == number)
        .map(|c| c.id)
        .expect("digital channel with that number")
}

/// Id of the ignore-condition gate input (channel number 2 in the fixture).
pub fn gate_channel_id(db: &Database) -> u32 {
    digital_channel_id(db, 2)
}

/// Id of the fault input reading the given digital channel.
pub fn fault_input_for_digital(db: &Database, channel_id: u32) -> u32 {
    db.fault_inputs
        .values()
        .find(|i| i.channel == Some(ChannelRef::Digital(channel_id)))
        .map(|i| i.id)
        .expect("fault input for channel")
}
