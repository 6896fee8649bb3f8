/*!
Input decode: turn a raw 360 Hz update packet into channel state.

Each input reports two bits per 2.7 ms firmware tick: was-low and was-high.

| was-low | was-high | meaning                                   |
|---------|----------|-------------------------------------------|
|    0    |    0     | no packet from the card: count + faulted  |
|    0    |    1     | high (digital) / threshold crossed        |
|    1    |    0     | low / no crossing                         |
|    1    |    1     | both within one tick: treat as faulted    |

Digital channels latch the fault level until an operator unlatch (unless
auto-reset); analog channels accumulate crossed threshold bits into the
latch. Every value change is published on the history channel.

Before its channels decode, each card refreshes its online / active /
bypassed / ignored flags from the firmware timeout registers; an `active`
flip requests a firmware configuration reload at the end of the cycle.
*/

use log::trace;

use crate::bypass::BypassStatus;
use crate::db::{AnalogChannel, Database, DigitalChannel};
use crate::defs::{analog_input_bit, get_bit, was_high_bit_base, was_low_bit_base,
    ANALOG_INTEGRATOR_SIZE};
use crate::firmware::FirmwareIo;
use crate::history::History;

/// Decode one update packet into every card of the database. Returns true
/// when a firmware configuration reload was requested by a card's `active`
/// flag flipping.
pub fn update_inputs(
    db: &mut Database,
    cards: &[u32],
    packet: &[u8],
    fw: &dyn FirmwareIo,
    history: &History,
) -> bool {
    let mut reload = false;
    for &card_id in cards {
        reload |= update_card(db, card_id, packet, fw, history);
    }
    reload
}

/// Card preamble plus channel decode. See the module docs for the flag
/// semantics.
pub fn update_card(
    db: &mut Database,
    card_id: u32,
    packet: &[u8],
    fw: &dyn FirmwareIo,
    history: &History,
) -> bool {
    let number = db.application_cards[&card_id].number;
    let online = !fw.app_timeout_status(number);

    // A card counts as bypassed while any of its inputs holds a valid
    // bypass; the timeout check is suspended for the card so the missing
    // inputs do not fault it offline.
    let bypassed_now = {
        let card = &db.application_cards[&card_id];
        if card.is_digital() {
            card.digital_channel_ids.iter().any(|channel_id| {
                db.digital_channels[channel_id]
                    .fault_input_ids
                    .iter()
                    .any(|input_id| {
                        db.fault_inputs[input_id].bypass_status == BypassStatus::Valid
                    })
            })
        } else {
            card.analog_channel_ids
                .iter()
                .any(|channel_id| db.analog_channels[channel_id].bypass_mask != u32::MAX)
        }
    };

    let (digital_ids, analog_ids, card_active, reload) = {
        let card = db.application_cards.get_mut(&card_id).unwrap();
        card.online = online;

        if bypassed_now != card.bypassed {
            // Stage the timeout-enable change; the mask is written to the
            // firmware with the next configuration reload.
            fw.set_app_timeout_enable(number, !bypassed_now);
            card.bypassed = bypassed_now;
        }
        if card.ignore_requested != card.ignored {
            fw.set_app_timeout_enable(number, !card.ignore_requested);
            card.ignored = card.ignore_requested;
        }

        let old_active = card.active;
        card.active = fw.app_timeout_enable(number);
        let digital = std::mem::take(&mut card.digital_channel_ids);
        let analog = std::mem::take(&mut card.analog_channel_ids);
        (digital, analog, card.active, card.active != old_active)
    };

    for channel_id in &digital_ids {
        let channel = db.digital_channels.get_mut(channel_id).unwrap();
        channel.faulted_offline = !online;
        channel.mode_active = card_active;
        decode_digital(channel, packet, number, history);
    }
    for channel_id in &analog_ids {
        let channel = db.analog_channels.get_mut(channel_id).unwrap();
        channel.faulted_offline = !online;
        channel.mode_active = card_active;
        decode_analog(channel, packet, number, history);
    }

    let card = db.application_cards.get_mut(&card_id).unwrap();
    card.digital_channel_ids = digital_ids;
    card.analog_channel_ids = analog_ids;
    reload
}

fn decode_digital(channel: &mut DigitalChannel, packet: &[u8], card_number: u32, history: &History) {
    let bit = channel.number as usize;
    let was_low = get_bit(packet, was_low_bit_base(card_number) + bit);
    let was_high = get_bit(packet, was_high_bit_base(card_number) + bit);

    channel.previous_value = channel.value;
    channel.was_low_bit = was_low;
    channel.was_high_bit = was_high;

    let new_value = match (was_low, was_high) {
        // No message from the device in the last period: assume faulted.
        (0, 0) => {
            channel.invalid_value_count = channel.invalid_value_count.wrapping_add(1);
            channel.fault_value
        }
        // Low and high within one 2.7 ms tick: assume faulted.
        (1, 1) => channel.fault_value,
        (1, 0) => 0,
        _ => 1,
    };
    channel.value = new_value;

    if new_value == channel.fault_value {
        channel.latched_value = channel.fault_value;
    }
    if channel.auto_reset {
        channel.latched_value = channel.value;
    }

    if channel.previous_value != channel.value {
        trace!(
            "digital channel {} changed {} -> {}",
            channel.id, channel.previous_value, channel.value
        );
        history.log_device_input(channel.id, channel.previous_value, channel.value);
    }
}

fn decode_analog(channel: &mut AnalogChannel, packet: &[u8], card_number: u32, history: &History) {
    channel.previous_value = channel.value;
    let low_base = was_low_bit_base(card_number);
    let high_base = was_high_bit_base(card_number);

    let mut new_value = 0u32;
    for integrator in 0..channel.num_integrators as usize {
        for threshold in 0..ANALOG_INTEGRATOR_SIZE {
            let input_bit = analog_input_bit(
                channel.num_channels_card,
                channel.number,
                integrator,
                threshold,
            );
            let was_low = get_bit(packet, low_base + input_bit);
            let was_high = get_bit(packet, high_base + input_bit);
            let value_bit = 1u32 << (threshold + integrator * ANALOG_INTEGRATOR_SIZE);

            match (was_low, was_high) {
                (0, 0) => {
                    // No message from the card in the last period.
                    channel.invalid_value_count = channel.invalid_value_count.wrapping_add(1);
                    new_value |= value_bit;
                    channel.latched_value |= value_bit;
                }
                (1, 1) | (0, 1) => {
                    // Threshold crossed (or crossed-and-recovered within a
                    // single tick, which also counts).
                    new_value |= value_bit;
                    channel.latched_value |= value_bit;
                }
                _ => {}
            }
        }
    }
    channel.value = new_value;

    if channel.previous_value != channel.value {
        trace!(
            "analog channel {} changed {:#x} -> {:#x}",
            channel.id, channel.previous_value, channel.value
        );
        history.log_analog_device(channel.id, channel.previous_value, channel.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{FirmwareIo, SimFirmware};
    use crate::history::HistoryKind;
    use crate::test_utils;

    fn setup() -> (Database, SimFirmware, History, Vec<u32>) {
        let db = test_utils::small_database();
        let fw = SimFirmware::new();
        for card in db.application_cards.values() {
            fw.set_app_timeout_enable(card.number, true);
        }
        let cards: Vec<u32> = db.application_cards.keys().copied().collect();
        (db, fw, History::new(), cards)
    }

    #[test]
    fn nominal_packet_reads_zero() {
        let (mut db, fw, history, cards) = setup();
        let packet = test_utils::nominal_packet(&db);
        update_inputs(&mut db, &cards, &packet, &fw, &history);
        for channel in db.digital_channels.values() {
            assert_eq!(channel.value, 0);
            assert_eq!(channel.invalid_value_count, 0);
        }
        for channel in db.analog_channels.values() {
            assert_eq!(channel.value, 0);
        }
    }

    #[test]
    fn both_zero_is_invalid_and_faulted() {
        let (mut db, fw, history, cards) = setup();
        // An all-zero packet means no card reported at all.
        let packet = test_utils::update_packet();
        update_inputs(&mut db, &cards, &packet, &fw, &history);
        for channel in db.digital_channels.values() {
            assert_eq!(channel.value, channel.fault_value);
            assert_eq!(channel.invalid_value_count, 1);
        }
        for channel in db.analog_channels.values() {
            // Every configured threshold reads crossed.
            assert_ne!(channel.value, 0);
            assert!(channel.invalid_value_count > 0);
        }
    }

    #[test]
    fn both_set_is_faulted_without_invalid_count() {
        let (mut db, fw, history, cards) = setup();
        let mut packet = test_utils::nominal_packet(&db);
        let channel_id = test_utils::digital_channel_id(&db, 0);
        let (card_number, bit) = {
            let ch = &db.digital_channels[&channel_id];
            (db.application_cards[&ch.card_id].number, ch.number)
        };
        test_utils::set_was_high(&mut packet, card_number, bit as usize, true);
        update_inputs(&mut db, &cards, &packet, &fw, &history);
        let channel = &db.digital_channels[&channel_id];
        assert_eq!(channel.value, channel.fault_value);
        assert_eq!(channel.invalid_value_count, 0);
    }

    #[test]
    fn digital_latch_survives_recovery() {
        let (mut db, fw, history, cards) = setup();
        let channel_id = test_utils::digital_channel_id(&db, 0);

        let faulted = test_utils::packet_with_digital(&db, channel_id, 1);
        update_inputs(&mut db, &cards, &faulted, &fw, &history);
        assert_eq!(db.digital_channels[&channel_id].value, 1);

        let nominal = test_utils::packet_with_digital(&db, channel_id, 0);
        update_inputs(&mut db, &cards, &nominal, &fw, &history);
        let channel = &db.digital_channels[&channel_id];
        assert_eq!(channel.value, 0);
        assert_eq!(channel.latched_value, channel.fault_value);
    }

    #[test]
    fn auto_reset_channel_follows_value() {
        let (mut db, fw, history, cards) = setup();
        let channel_id = test_utils::digital_channel_id(&db, 0);
        db.digital_channels
            .get_mut(&channel_id)
            .unwrap()
            .auto_reset = true;

        let faulted = test_utils::packet_with_digital(&db, channel_id, 1);
        update_inputs(&mut db, &cards, &faulted, &fw, &history);
        let nominal = test_utils::packet_with_digital(&db, channel_id, 0);
        update_inputs(&mut db, &cards, &nominal, &fw, &history);
        let channel = &db.digital_channels[&channel_id];
        assert_eq!(channel.latched_value, channel.value);
        assert_eq!(channel.latched_value, 0);
    }

    #[test]
    fn analog_threshold_bit_maps_to_value_bit() {
        let (mut db, fw, history, cards) = setup();
        let channel_id = *db.analog_channels.keys().next().unwrap();
        let mut packet = test_utils::nominal_packet(&db);
        test_utils::set_analog_threshold(&db, &mut packet, channel_id, 1, 3, true);

        update_inputs(&mut db, &cards, &packet, &fw, &history);
        let channel = &db.analog_channels[&channel_id];
        assert_eq!(channel.value, 1 << (3 + ANALOG_INTEGRATOR_SIZE));
        assert_eq!(channel.latched_value, channel.value);

        // Recovery clears the value but the latch holds the crossing.
        let nominal = test_utils::nominal_packet(&db);
        update_inputs(&mut db, &cards, &nominal, &fw, &history);
        let channel = &db.analog_channels[&channel_id];
        assert_eq!(channel.value, 0);
        assert_eq!(channel.latched_value, 1 << (3 + ANALOG_INTEGRATOR_SIZE));
    }

    #[test]
    fn value_changes_are_published() {
        let (mut db, fw, history, cards) = setup();
        let channel_id = test_utils::digital_channel_id(&db, 0);

        let nominal = test_utils::nominal_packet(&db);
        update_inputs(&mut db, &cards, &nominal, &fw, &history);
        let _ = history.drain();

        let faulted = test_utils::packet_with_digital(&db, channel_id, 1);
        update_inputs(&mut db, &cards, &faulted, &fw, &history);
        let events: Vec<_> = history
            .drain()
            .into_iter()
            .filter(|m| m.kind == HistoryKind::DeviceInput && m.id == channel_id)
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value, 0);
        assert_eq!(events[0].new_value, 1);

        // Unchanged values stay silent.
        update_inputs(&mut db, &cards, &faulted, &fw, &history);
        assert!(history
            .drain()
            .iter()
            .all(|m| m.kind != HistoryKind::DeviceInput));
    }

    #[test]
    fn timeout_status_marks_card_offline() {
        let (mut db, fw, history, cards) = setup();
        let card_id = *db.application_cards.keys().next().unwrap();
        let number = db.application_cards[&card_id].number;
        fw.set_app_timeout_status(number, true);

        let packet = test_utils::nominal_packet(&db);
        update_inputs(&mut db, &cards, &packet, &fw, &history);
        let card = &db.application_cards[&card_id];
        assert!(!card.online);
        for channel_id in &card.digital_channel_ids {
            assert!(db.digital_channels[channel_id].faulted_offline);
        }
    }

    #[test]
    fn active_flip_requests_reload() {
        let (mut db, fw, history, cards) = setup();
        let packet = test_utils::nominal_packet(&db);
        // First cycle: cards go inactive -> active (enables were staged in
        // setup), which is a flip and requests a reload.
        assert!(update_inputs(&mut db, &cards, &packet, &fw, &history));
        // Steady state: no more flips.
        assert!(!update_inputs(&mut db, &cards, &packet, &fw, &history));

        let number = db.application_cards.values().next().unwrap().number;
        fw.set_app_timeout_enable(number, false);
        assert!(update_inputs(&mut db, &cards, &packet, &fw, &history));
    }
}
