/*!
Update-packet builders.

Used by the hardware-less simulator to synthesise the 360 Hz stream and by
tests to craft specific input patterns. A "nominal" packet sets every
configured input's was-low bit: all digital channels read 0 and no analog
threshold is crossed.
*/

use crate::db::Database;
use crate::defs::{
    analog_input_bit, set_bit, was_high_bit_base, was_low_bit_base, ANALOG_INTEGRATOR_SIZE,
    UPDATE_BUFFER_SIZE_BYTES,
};

/// An all-zero update packet (every input reads "no message").
pub fn update_packet() -> Vec<u8> {
    vec![0u8; UPDATE_BUFFER_SIZE_BYTES]
}

/// Set one was-low bit of a card slice.
pub fn set_was_low(packet: &mut [u8], card_number: u32, input_bit: usize, value: bool) {
    set_bit(packet, was_low_bit_base(card_number) + input_bit, value);
}

/// Set one was-high bit of a card slice.
pub fn set_was_high(packet: &mut [u8], card_number: u32, input_bit: usize, value: bool) {
    set_bit(packet, was_high_bit_base(card_number) + input_bit, value);
}

/// A packet where every configured input reads nominal.
pub fn nominal_packet(db: &Database) -> Vec<u8> {
    let mut packet = update_packet();
    for channel in db.digital_channels.values() {
        let card_number = db.application_cards[&channel.card_id].number;
        set_was_low(&mut packet, card_number, channel.number as usize, true);
    }
    for channel in db.analog_channels.values() {
        let card_number = db.application_cards[&channel.card_id].number;
        for integrator in 0..channel.num_integrators as usize {
            for threshold in 0..ANALOG_INTEGRATOR_SIZE {
                let bit = analog_input_bit(
                    channel.num_channels_card,
                    channel.number,
                    integrator,
                    threshold,
                );
                set_was_low(&mut packet, card_number, bit, true);
            }
        }
    }
    packet
}

/// Overwrite one digital channel's bits in an existing packet: value 1 sets
/// was-high, value 0 sets was-low.
pub fn overlay_digital(db: &Database, packet: &mut [u8], channel_id: u32, value: u32) {
    let channel = &db.digital_channels[&channel_id];
    let card_number = db.application_cards[&channel.card_id].number;
    let bit = channel.number as usize;
    set_was_low(packet, card_number, bit, value == 0);
    set_was_high(packet, card_number, bit, value != 0);
}

/// A nominal packet with one digital channel forced to `value`.
pub fn packet_with_digital(db: &Database, channel_id: u32, value: u32) -> Vec<u8> {
    let mut packet = nominal_packet(db);
    overlay_digital(db, &mut packet, channel_id, value);
    packet
}

/// Mark one analog threshold comparator crossed (or recovered).
pub fn set_analog_threshold(
    db: &Database,
    packet: &mut [u8],
    channel_id: u32,
    integrator: usize,
    threshold: usize,
    crossed: bool,
) {
    let channel = &db.analog_channels[&channel_id];
    let card_number = db.application_cards[&channel.card_id].number;
    let bit = analog_input_bit(
        channel.num_channels_card,
        channel.number,
        integrator,
        threshold,
    );
    set_was_low(packet, card_number, bit, !crossed);
    set_was_high(packet, card_number, bit, crossed);
}
