/*!
Firmware configuration packing.

Only FAST-evaluation channels are mirrored into the per-card configuration
slices; the firmware applies their destination masks and power classes
directly at the hardware rate. A bypassed input (or an ignored analog
integrator) is written with an all-zero destination mask, which disarms the
rule without touching the rest of the card.
*/

use log::{debug, error};

use crate::db::model::*;
use crate::defs::*;
use crate::firmware::{FirmwareError, FirmwareIo};

/// Pack one card's configuration slice.
pub fn pack_card_config(db: &Database, card: &ApplicationCard) -> [u8; APP_CONFIG_BUFFER_SIZE_BYTES] {
    if card.is_digital() {
        pack_digital_config(db, card)
    } else {
        pack_analog_config(db, card)
    }
}

/// Digital layout: 64 channels x 21 bits, LSB-first:
/// power class [0..4), destination mask [4..20), expected state [20].
pub fn pack_digital_config(
    db: &Database,
    card: &ApplicationCard,
) -> [u8; APP_CONFIG_BUFFER_SIZE_BYTES] {
    let mut buf = [0u8; APP_CONFIG_BUFFER_SIZE_BYTES];

    for channel_id in &card.digital_channel_ids {
        let channel = &db.digital_channels[channel_id];
        if channel.evaluation != Evaluation::Fast {
            continue;
        }
        let channel_offset = channel.number as usize * DIGITAL_CHANNEL_CONFIG_SIZE;

        set_bit(
            &mut buf,
            channel_offset + DIGITAL_CHANNEL_EXPECTED_STATE_OFFSET,
            channel.fast_expected_state != 0,
        );

        // A valid bypass leaves the destination mask zero: no mitigation
        // from this input while it is bypassed.
        let bypassed = channel.fault_input_ids.first().is_some_and(|input_id| {
            db.fault_inputs[input_id].bypass_status == crate::bypass::BypassStatus::Valid
        });
        if !bypassed {
            for i in 0..DESTINATION_MASK_BIT_SIZE {
                set_bit(
                    &mut buf,
                    channel_offset + DIGITAL_CHANNEL_DESTINATION_MASK_OFFSET + i,
                    (channel.fast_destination_mask >> i) & 1 != 0,
                );
            }
        }

        for i in 0..POWER_CLASS_BIT_SIZE {
            set_bit(
                &mut buf,
                channel_offset + DIGITAL_CHANNEL_POWER_CLASS_OFFSET + i,
                (channel.fast_power_class >> i) & 1 != 0,
            );
        }
    }
    buf
}

/// Analog layout: 192 4-bit power classes (plane-major by integrator), then
/// 24 16-bit destination masks starting at bit 768.
pub fn pack_analog_config(
    db: &Database,
    card: &ApplicationCard,
) -> [u8; APP_CONFIG_BUFFER_SIZE_BYTES] {
    let mut buf = [0u8; APP_CONFIG_BUFFER_SIZE_BYTES];

    for channel_id in &card.analog_channel_ids {
        let channel = &db.analog_channels[channel_id];
        if channel.evaluation != Evaluation::Fast {
            continue;
        }
        let channels_per_card = channel.num_channels_card as usize;
        let number = channel.number as usize;

        for integrator in 0..channel.num_integrators as usize {
            // Power classes: one 4-bit slot per threshold comparator.
            let mut offset = number * ANALOG_INTEGRATOR_SIZE * POWER_CLASS_BIT_SIZE
                + integrator * channels_per_card * ANALOG_INTEGRATOR_SIZE * POWER_CLASS_BIT_SIZE;
            for threshold in 0..ANALOG_INTEGRATOR_SIZE {
                let class = channel.fast_power_class[threshold + integrator * ANALOG_INTEGRATOR_SIZE];
                for bit in 0..POWER_CLASS_BIT_SIZE {
                    set_bit(&mut buf, offset + bit, (class >> bit) & 1 != 0);
                }
                offset += POWER_CLASS_BIT_SIZE;
            }

            // Destination mask for this (channel, integrator). Bypassed or
            // ignored integrators are disarmed with an all-zero mask.
            let integrator_bypassed =
                (channel.bypass_mask >> (integrator * ANALOG_INTEGRATOR_SIZE)) & 0xFF == 0;
            let disarmed =
                integrator_bypassed || channel.ignored_integrator[integrator] || channel.ignored;
            let mask_offset = ANALOG_DESTINATION_MASK_BASE
                + number * DESTINATION_MASK_BIT_SIZE
                + integrator * channels_per_card * DESTINATION_MASK_BIT_SIZE;
            for bit in 0..DESTINATION_MASK_BIT_SIZE {
                let value = !disarmed && (channel.fast_destination_mask[integrator] >> bit) & 1 != 0;
                set_bit(&mut buf, mask_offset + bit, value);
            }
        }
    }
    buf
}

/// Push the whole configuration to the firmware: every card slice, the
/// application timeout mask, the per-class timing parameters, and finally
/// the switch command that flips the hardware to the new buffer.
///
/// Per-card write failures during a reload are logged and skipped (the next
/// reload retries); an error writing the shared tables aborts the switch.
pub fn write_firmware_configuration(
    db: &Database,
    fw: &dyn FirmwareIo,
    enable_timeout: bool,
) -> Result<(), FirmwareError> {
    debug!(
        "writing configuration for {} application cards",
        db.application_cards.len()
    );

    let card_ids: Vec<u32> = db.application_cards.keys().copied().collect();
    for card_id in card_ids {
        let card = &db.application_cards[&card_id];
        if !card.has_inputs {
            continue;
        }
        let slice = pack_card_config(db, card);
        let number = card.number;
        if let Err(e) = fw.write_config(number, &slice) {
            error!("config write for card {number} failed: {e}");
            continue;
        }
        if enable_timeout {
            fw.set_app_timeout_enable(number, true);
        }
    }

    if enable_timeout {
        fw.write_app_timeout_mask()?;
    }

    // Timing tables: unconfigured classes get the most restrictive window.
    let mut time = [1u32; FW_NUM_BEAM_CLASSES];
    let mut period = [0u32; FW_NUM_BEAM_CLASSES];
    let mut charge = [u32::MAX; FW_NUM_BEAM_CLASSES];
    for class in db.beam_classes.values() {
        let slot = class.number as usize;
        if slot < FW_NUM_BEAM_CLASSES {
            time[slot] = class.integration_window;
            period[slot] = class.min_period;
            charge[slot] = class.total_charge;
        }
    }
    fw.write_timing(&time, &period, &charge)?;

    fw.switch_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::get_bit;
    use crate::test_utils;

    fn bits_to_u32(buf: &[u8], base: usize, width: usize) -> u32 {
        let mut value = 0;
        for i in 0..width {
            value |= get_bit(buf, base + i) << i;
        }
        value
    }

    #[test]
    fn digital_fast_channel_is_packed() {
        let db = crate::db::load_str(&test_utils::fast_database_yaml(false), "fast").unwrap();
        let card = db
            .application_cards
            .values()
            .find(|c| c.is_digital())
            .unwrap();
        let buf = pack_digital_config(&db, card);

        let channel = db
            .digital_channels
            .values()
            .find(|c| c.evaluation == Evaluation::Fast)
            .unwrap();
        let base = channel.number as usize * DIGITAL_CHANNEL_CONFIG_SIZE;
        assert_eq!(
            bits_to_u32(&buf, base + DIGITAL_CHANNEL_POWER_CLASS_OFFSET, 4),
            channel.fast_power_class as u32
        );
        assert_eq!(
            bits_to_u32(&buf, base + DIGITAL_CHANNEL_DESTINATION_MASK_OFFSET, 16),
            channel.fast_destination_mask as u32
        );
        assert_eq!(
            get_bit(&buf, base + DIGITAL_CHANNEL_EXPECTED_STATE_OFFSET),
            channel.fast_expected_state as u32
        );
    }

    #[test]
    fn bypassed_fast_input_loses_destination_mask() {
        let mut db = crate::db::load_str(&test_utils::fast_database_yaml(false), "fast").unwrap();
        let channel_id = db
            .digital_channels
            .values()
            .find(|c| c.evaluation == Evaluation::Fast)
            .unwrap()
            .id;
        let input_id = db.digital_channels[&channel_id].fault_input_ids[0];
        db.fault_inputs.get_mut(&input_id).unwrap().bypass_status =
            crate::bypass::BypassStatus::Valid;

        let card_id = db.digital_channels[&channel_id].card_id;
        let card = db.application_cards[&card_id].clone();
        let buf = pack_digital_config(&db, &card);
        let base = db.digital_channels[&channel_id].number as usize * DIGITAL_CHANNEL_CONFIG_SIZE;
        assert_eq!(
            bits_to_u32(&buf, base + DIGITAL_CHANNEL_DESTINATION_MASK_OFFSET, 16),
            0
        );
        // Power class and expected state survive the bypass.
        assert_eq!(
            bits_to_u32(&buf, base + DIGITAL_CHANNEL_POWER_CLASS_OFFSET, 4),
            db.digital_channels[&channel_id].fast_power_class as u32
        );
    }

    #[test]
    fn analog_masks_land_in_the_mask_plane() {
        let mut db = test_utils::small_database();
        // Promote the analog channel to fast with a known configuration.
        let channel_id = *db.analog_channels.keys().next().unwrap();
        {
            let channel = db.analog_channels.get_mut(&channel_id).unwrap();
            channel.evaluation = Evaluation::Fast;
            channel.fast_destination_mask[1] = 0x0003;
            channel.fast_power_class[8] = 5;
        }
        let card_id = db.analog_channels[&channel_id].card_id;
        let card = db.application_cards[&card_id].clone();
        let buf = pack_analog_config(&db, &card);

        let channel = &db.analog_channels[&channel_id];
        let channels_per_card = channel.num_channels_card as usize;
        let number = channel.number as usize;

        // Integrator 1, threshold 0 power class slot.
        let pc_base = number * 32 + channels_per_card * 32;
        assert_eq!(bits_to_u32(&buf, pc_base, 4), 5);

        // Integrator 1 destination mask slot.
        let mask_base =
            ANALOG_DESTINATION_MASK_BASE + number * 16 + channels_per_card * 16;
        assert_eq!(bits_to_u32(&buf, mask_base, 16), 0x0003);
    }

    #[test]
    fn ignored_integrator_is_disarmed() {
        let mut db = test_utils::small_database();
        let channel_id = *db.analog_channels.keys().next().unwrap();
        {
            let channel = db.analog_channels.get_mut(&channel_id).unwrap();
            channel.evaluation = Evaluation::Fast;
            channel.fast_destination_mask[0] = 0xFFFF;
            channel.ignored_integrator[0] = true;
        }
        let card_id = db.analog_channels[&channel_id].card_id;
        let card = db.application_cards[&card_id].clone();
        let buf = pack_analog_config(&db, &card);

        let channel = &db.analog_channels[&channel_id];
        let mask_base = ANALOG_DESTINATION_MASK_BASE + channel.number as usize * 16;
        assert_eq!(bits_to_u32(&buf, mask_base, 16), 0);
    }
}
