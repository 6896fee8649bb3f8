/*!
Link-up: turn freshly decoded tables into a fully resolved graph.

Every foreign key is validated and back-reference sets are populated so the
evaluation loop never searches. The passes run in dependency order; the
first violation aborts with an error naming the offending ids and the
caller discards the half-linked database.

Also derived here: the FAST-evaluation configuration folded from the fault
states (destination-mask unions, minimum power classes, expected states,
analog integrator/threshold decode) and each fault's own evaluation mode.
*/

use std::collections::BTreeMap;

use log::debug;

use crate::db::model::*;
use crate::defs::{ANALOG_MAX_INTEGRATORS_PER_CHANNEL, NUM_APPLICATIONS, NUM_DESTINATIONS};
use crate::error::ConfigError;

pub fn resolve(db: &mut Database) -> Result<(), ConfigError> {
    find_beam_class_range(db)?;
    resolve_allowed_classes(db)?;
    resolve_analog_channels(db)?;
    resolve_fault_states(db)?;
    resolve_fault_inputs(db)?;
    check_fault_inputs(db)?;
    resolve_ignore_conditions(db)?;
    resolve_application_cards(db)?;
    resolve_beam_destinations(db)?;
    debug!(
        "link-up complete: {} faults, {} fault inputs, {} destinations",
        db.faults.len(),
        db.fault_inputs.len(),
        db.beam_destinations.len()
    );
    Ok(())
}

/// The engine needs the extremes of the beam class ordering: evaluation
/// starts every destination at the highest class and the override floor is
/// the lowest.
fn find_beam_class_range(db: &mut Database) -> Result<(), ConfigError> {
    let lowest = db
        .beam_classes
        .values()
        .min_by_key(|c| c.number)
        .ok_or(ConfigError::EmptyTable("BeamClass"))?;
    db.lowest_beam_class = BeamClassRef {
        id: lowest.id,
        number: lowest.number,
    };
    let highest = db.beam_classes.values().max_by_key(|c| c.number).unwrap();
    db.highest_beam_class = BeamClassRef {
        id: highest.id,
        number: highest.number,
    };
    Ok(())
}

fn resolve_allowed_classes(db: &mut Database) -> Result<(), ConfigError> {
    let Database {
        allowed_classes,
        beam_classes,
        beam_destinations,
        fault_states,
        ..
    } = db;

    for (id, ac) in allowed_classes.iter_mut() {
        let class = beam_classes
            .get(&ac.beam_class_id)
            .ok_or(ConfigError::BadReference {
                target: "BeamClass",
                id: ac.beam_class_id,
                referrer: "AllowedClass",
                referrer_id: *id,
            })?;
        ac.beam_class = BeamClassRef {
            id: class.id,
            number: class.number,
        };
        if !beam_destinations.contains_key(&ac.beam_destination_id) {
            return Err(ConfigError::BadReference {
                target: "BeamDestination",
                id: ac.beam_destination_id,
                referrer: "AllowedClass",
                referrer_id: *id,
            });
        }
    }

    // Each fault state collects the AllowedClasses its mitigation ids name.
    for state in fault_states.values_mut() {
        for &mitigation_id in &state.mitigation_ids {
            if !allowed_classes.contains_key(&mitigation_id) {
                return Err(ConfigError::BadReference {
                    target: "AllowedClass",
                    id: mitigation_id,
                    referrer: "FaultState",
                    referrer_id: state.id,
                });
            }
            state.allowed_class_ids.push(mitigation_id);
        }
    }
    Ok(())
}

/// Analog channels learn their card geometry (integrator count, channels
/// per card) from the card's application type.
fn resolve_analog_channels(db: &mut Database) -> Result<(), ConfigError> {
    let Database {
        analog_channels,
        application_cards,
        application_types,
        ..
    } = db;

    for channel in analog_channels.values_mut() {
        let card =
            application_cards
                .get(&channel.card_id)
                .ok_or(ConfigError::BadReference {
                    target: "ApplicationCard",
                    id: channel.card_id,
                    referrer: "AnalogChannel",
                    referrer_id: channel.id,
                })?;
        let ty = application_types
            .get(&card.application_type_id)
            .ok_or(ConfigError::BadReference {
                target: "ApplicationType",
                id: card.application_type_id,
                referrer: "ApplicationCard",
                referrer_id: card.id,
            })?;
        channel.num_integrators = ty
            .num_integrators
            .min(ANALOG_MAX_INTEGRATORS_PER_CHANNEL as u32);
        channel.num_channels_card = ty.analog_channel_count;
    }
    Ok(())
}

fn resolve_fault_states(db: &mut Database) -> Result<(), ConfigError> {
    let Database {
        fault_states,
        faults,
        ..
    } = db;

    for (state_id, state) in fault_states.iter() {
        let fault = faults
            .get_mut(&state.fault_id)
            .ok_or(ConfigError::BadReference {
                target: "Fault",
                id: state.fault_id,
                referrer: "FaultState",
                referrer_id: *state_id,
            })?;
        fault.fault_state_ids.push(*state_id);
        if state.default_state && fault.default_fault_state_id.is_none() {
            fault.default_fault_state_id = Some(*state_id);
        }
    }

    for fault in faults.values() {
        if fault.fault_state_ids.is_empty() {
            return Err(ConfigError::NoFaultStates { fault_id: fault.id });
        }
    }
    Ok(())
}

fn resolve_fault_inputs(db: &mut Database) -> Result<(), ConfigError> {
    let input_ids: Vec<u32> = db.fault_inputs.keys().copied().collect();
    // Per-channel "power class slot not written yet" flags for the analog
    // minimum fold.
    let mut power_class_fresh: BTreeMap<u32, [bool; 32]> = BTreeMap::new();

    for input_id in input_ids {
        let (fault_id, channel_id) = {
            let fi = &db.fault_inputs[&input_id];
            (fi.fault_id, fi.channel_id)
        };

        if !db.faults.contains_key(&fault_id) {
            return Err(ConfigError::BadReference {
                target: "Fault",
                id: fault_id,
                referrer: "FaultInput",
                referrer_id: input_id,
            });
        }

        let channel_ref = if db.digital_channels.contains_key(&channel_id) {
            ChannelRef::Digital(channel_id)
        } else if db.analog_channels.contains_key(&channel_id) {
            ChannelRef::Analog(channel_id)
        } else {
            return Err(ConfigError::BadReference {
                target: "Channel",
                id: channel_id,
                referrer: "FaultInput",
                referrer_id: input_id,
            });
        };

        match channel_ref {
            ChannelRef::Digital(id) => {
                let fast = db.digital_channels[&id].evaluation == Evaluation::Fast;
                {
                    let fi = db.fault_inputs.get_mut(&input_id).unwrap();
                    fi.channel = Some(channel_ref);
                    fi.fast_evaluation = fast;
                }
                db.digital_channels
                    .get_mut(&id)
                    .unwrap()
                    .fault_input_ids
                    .push(input_id);
                if fast {
                    fold_fast_digital(db, id, fault_id)?;
                }
            }
            ChannelRef::Analog(id) => {
                let fast = db.analog_channels[&id].evaluation == Evaluation::Fast;
                {
                    let fi = db.fault_inputs.get_mut(&input_id).unwrap();
                    fi.channel = Some(channel_ref);
                    fi.fast_evaluation = fast;
                }
                db.analog_channels
                    .get_mut(&id)
                    .unwrap()
                    .fault_input_ids
                    .push(input_id);
                decode_analog_states(db, id, fault_id, fast)?;
                if fast {
                    fold_fast_analog(db, id, fault_id, &mut power_class_fresh)?;
                }
            }
        }

        db.faults
            .get_mut(&fault_id)
            .unwrap()
            .fault_input_ids
            .push(input_id);
    }

    // A fault is evaluated in firmware only when every one of its inputs is.
    for fault in db.faults.values_mut() {
        if fault.fault_input_ids.is_empty() {
            return Err(ConfigError::NoFaultInputs { fault_id: fault.id });
        }
        let all_fast = {
            let inputs = &db.fault_inputs;
            fault
                .fault_input_ids
                .iter()
                .all(|id| inputs[id].fast_evaluation)
        };
        fault.evaluation = if all_fast {
            Evaluation::Fast
        } else {
            Evaluation::Slow
        };
    }

    // A fast digital channel is mirrored by a single firmware rule, so it
    // must contribute exactly one input.
    for channel in db.digital_channels.values() {
        if channel.evaluation == Evaluation::Fast && channel.fault_input_ids.len() != 1 {
            return Err(ConfigError::FastFaultInputCount {
                channel_id: channel.id,
                found: channel.fault_input_ids.len(),
            });
        }
    }

    // Back-pointer from each input to the state it signals, when unique,
    // and the channels' fault-state sets.
    let single_states: BTreeMap<u32, u32> = db
        .faults
        .values()
        .filter(|f| f.fault_state_ids.len() == 1)
        .map(|f| (f.id, f.fault_state_ids[0]))
        .collect();
    for fi in db.fault_inputs.values_mut() {
        fi.fault_state_id = single_states.get(&fi.fault_id).copied();
    }
    link_channel_fault_states(db);

    Ok(())
}

fn link_channel_fault_states(db: &mut Database) {
    let Database {
        digital_channels,
        analog_channels,
        fault_inputs,
        faults,
        ..
    } = db;
    for channel in digital_channels.values_mut() {
        for input_id in &channel.fault_input_ids {
            let fault = &faults[&fault_inputs[input_id].fault_id];
            channel.fault_state_ids.extend(&fault.fault_state_ids);
        }
    }
    for channel in analog_channels.values_mut() {
        for input_id in &channel.fault_input_ids {
            let fault = &faults[&fault_inputs[input_id].fault_id];
            channel.fault_state_ids.extend(&fault.fault_state_ids);
        }
    }
}

/// FAST digital fold: the single fault state dictates the expected input
/// level; its allowed classes give the destination mask (union) and power
/// class (minimum across destinations - the firmware applies one class to
/// the whole mask).
fn fold_fast_digital(db: &mut Database, channel_id: u32, fault_id: u32) -> Result<(), ConfigError> {
    if db.digital_channels[&channel_id].auto_reset {
        return Err(ConfigError::FastAutoReset {
            kind: "digital",
            channel_id,
        });
    }

    let state_ids = db.faults[&fault_id].fault_state_ids.clone();
    if state_ids.len() != 1 {
        return Err(ConfigError::FastFaultStateCount {
            channel_id,
            found: state_ids.len(),
        });
    }
    let state = &db.fault_states[&state_ids[0]];

    // The expected state is the opposite of the faulted level: a fault on
    // value 0 means the normal input reads 1.
    let expected: u8 = if state.value == 0 { 1 } else { 0 };
    let mut mask: u16 = 0;
    let mut power: u16 = u16::MAX;
    for ac_id in &state.allowed_class_ids {
        let ac = &db.allowed_classes[ac_id];
        let dest = &db.beam_destinations[&ac.beam_destination_id];
        mask |= dest.destination_mask;
        power = power.min(ac.beam_class.number as u16);
    }

    let channel = db.digital_channels.get_mut(&channel_id).unwrap();
    channel.fast_expected_state = expected;
    channel.fast_destination_mask = mask;
    channel.fast_power_class = if power == u16::MAX { 0 } else { power };
    Ok(())
}

/// Derive each analog fault state's integrator (first non-zero octet of its
/// value) and threshold index (first set bit). Required for FAST states;
/// slow states with a zero value simply stay unindexed.
fn decode_analog_states(
    db: &mut Database,
    _channel_id: u32,
    fault_id: u32,
    fast: bool,
) -> Result<(), ConfigError> {
    let state_ids = db.faults[&fault_id].fault_state_ids.clone();
    for state_id in state_ids {
        let state = db.fault_states.get_mut(&state_id).unwrap();
        if state.value == 0 {
            if fast {
                return Err(ConfigError::NoIntegratorBits {
                    fault_state_id: state_id,
                });
            }
            continue;
        }
        let integrator = match state.value {
            v if v & 0x0000_00FF != 0 => 0,
            v if v & 0x0000_FF00 != 0 => 1,
            v if v & 0x00FF_0000 != 0 => 2,
            _ => 3,
        };
        state.integrator = Some(integrator);
        state.threshold_index = Some(state.value.trailing_zeros() as usize);
    }
    Ok(())
}

/// FAST analog fold: per fault state, union the destination masks into the
/// state's integrator slot and keep the minimum power class per threshold
/// bit.
fn fold_fast_analog(
    db: &mut Database,
    channel_id: u32,
    fault_id: u32,
    power_class_fresh: &mut BTreeMap<u32, [bool; 32]>,
) -> Result<(), ConfigError> {
    if db.analog_channels[&channel_id].auto_reset {
        return Err(ConfigError::FastAutoReset {
            kind: "analog",
            channel_id,
        });
    }

    let fresh = power_class_fresh
        .entry(channel_id)
        .or_insert([true; 32]);

    let state_ids = db.faults[&fault_id].fault_state_ids.clone();
    for state_id in state_ids {
        let (integrator, threshold, allowed) = {
            let state = &db.fault_states[&state_id];
            (
                state.integrator.unwrap(),
                state.threshold_index.unwrap(),
                state.allowed_class_ids.clone(),
            )
        };
        for ac_id in allowed {
            let ac = &db.allowed_classes[&ac_id];
            let dest_mask = db.beam_destinations[&ac.beam_destination_id].destination_mask;
            let class = ac.beam_class.number as u16;
            let channel = db.analog_channels.get_mut(&channel_id).unwrap();
            channel.fast_destination_mask[integrator] |= dest_mask;
            if fresh[threshold] {
                channel.fast_power_class[threshold] = class;
                fresh[threshold] = false;
            } else if class < channel.fast_power_class[threshold] {
                channel.fast_power_class[threshold] = class;
            }
        }
    }
    Ok(())
}

/// Bit positions within a fault must be dense: 0..=max, each exactly once.
fn check_fault_inputs(db: &Database) -> Result<(), ConfigError> {
    for fault in db.faults.values() {
        let mut seen: BTreeMap<u32, u32> = BTreeMap::new();
        for input_id in &fault.fault_input_ids {
            let bit = db.fault_inputs[input_id].bit_position;
            *seen.entry(bit).or_insert(0) += 1;
        }
        let max_bit = seen.keys().copied().max().unwrap_or(0);
        for bit in 0..=max_bit {
            match seen.get(&bit) {
                None => {
                    return Err(ConfigError::MissingBitPosition {
                        fault_id: fault.id,
                        bit,
                    });
                }
                Some(&count) if count > 1 => {
                    return Err(ConfigError::DuplicateBitPosition {
                        fault_id: fault.id,
                        bit,
                    });
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn resolve_ignore_conditions(db: &mut Database) -> Result<(), ConfigError> {
    let fault_ids: Vec<u32> = db.faults.keys().copied().collect();
    for fault_id in fault_ids {
        let (condition_ids, input_ids) = {
            let fault = &db.faults[&fault_id];
            (
                fault.ignore_condition_ids.clone(),
                fault.fault_input_ids.clone(),
            )
        };
        for condition_id in condition_ids {
            let condition = db.ignore_conditions.get_mut(&condition_id).ok_or(
                ConfigError::BadReference {
                    target: "IgnoreCondition",
                    id: condition_id,
                    referrer: "Fault",
                    referrer_id: fault_id,
                },
            )?;
            condition.fault_ids.push(fault_id);
            condition.fault_input_ids.extend(&input_ids);
        }
    }

    for condition in db.ignore_conditions.values() {
        if !db
            .digital_channels
            .contains_key(&condition.digital_channel_id)
        {
            return Err(ConfigError::BadReference {
                target: "DigitalChannel",
                id: condition.digital_channel_id,
                referrer: "IgnoreCondition",
                referrer_id: condition.id,
            });
        }
    }
    Ok(())
}

fn resolve_application_cards(db: &mut Database) -> Result<(), ConfigError> {
    for card in db.application_cards.values() {
        if !db.crates.contains_key(&card.crate_id) {
            return Err(ConfigError::BadReference {
                target: "Crate",
                id: card.crate_id,
                referrer: "ApplicationCard",
                referrer_id: card.id,
            });
        }
        if !db.application_types.contains_key(&card.application_type_id) {
            return Err(ConfigError::BadReference {
                target: "ApplicationType",
                id: card.application_type_id,
                referrer: "ApplicationCard",
                referrer_id: card.id,
            });
        }
        if card.number >= NUM_APPLICATIONS {
            return Err(ConfigError::CardNumberOutOfRange {
                card_id: card.id,
                number: card.number,
                limit: NUM_APPLICATIONS,
            });
        }
    }

    for link_node in db.link_nodes.values() {
        if !db.crates.contains_key(&link_node.crate_id) {
            return Err(ConfigError::BadReference {
                target: "Crate",
                id: link_node.crate_id,
                referrer: "LinkNode",
                referrer_id: link_node.id,
            });
        }
    }

    let digital: Vec<(u32, u32)> = db
        .digital_channels
        .values()
        .map(|c| (c.id, c.card_id))
        .collect();
    for (channel_id, card_id) in digital {
        let card = db
            .application_cards
            .get_mut(&card_id)
            .ok_or(ConfigError::BadReference {
                target: "ApplicationCard",
                id: card_id,
                referrer: "DigitalChannel",
                referrer_id: channel_id,
            })?;
        card.digital_channel_ids.push(channel_id);
    }

    let analog: Vec<(u32, u32)> = db
        .analog_channels
        .values()
        .map(|c| (c.id, c.card_id))
        .collect();
    for (channel_id, card_id) in analog {
        let card = db
            .application_cards
            .get_mut(&card_id)
            .ok_or(ConfigError::BadReference {
                target: "ApplicationCard",
                id: card_id,
                referrer: "AnalogChannel",
                referrer_id: channel_id,
            })?;
        if !card.digital_channel_ids.is_empty() {
            return Err(ConfigError::MixedChannelTypes { card_id });
        }
        card.analog_channel_ids.push(channel_id);
    }

    for card in db.application_cards.values_mut() {
        card.has_inputs = !card.digital_channel_ids.is_empty() || !card.analog_channel_ids.is_empty();
    }
    Ok(())
}

fn resolve_beam_destinations(db: &mut Database) -> Result<(), ConfigError> {
    let lowest = db.lowest_beam_class;
    for dest in db.beam_destinations.values_mut() {
        if dest.display_order as usize >= NUM_DESTINATIONS {
            return Err(ConfigError::DisplayOrderOutOfRange {
                destination_id: dest.id,
                display_order: dest.display_order,
                limit: NUM_DESTINATIONS,
            });
        }
        dest.allowed_beam_class = Some(lowest);
        dest.previous_allowed_beam_class = Some(lowest);
    }
    Ok(())
}
