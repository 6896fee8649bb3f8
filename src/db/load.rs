/*!
YAML loading.

The configuration file is a multi-document YAML stream, one table per
document (`Crate:`, `ApplicationCard:`, `Fault:`, ...). Scalars in exported
databases are frequently quoted (`id: '42'`), so all numeric fields accept
both numbers and numeric strings.

Loading is all-or-nothing: any parse or link-up failure returns an error and
no database is produced.
*/

use std::path::Path;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::db::linkup;
use crate::db::model::*;
use crate::error::ConfigError;

/// u32 field accepting `7`, `'7'` or `"7"`.
#[derive(Clone, Copy, Debug, Default)]
struct U32(u32);

/// f32 field accepting numbers and numeric strings.
#[derive(Clone, Copy, Debug, Default)]
struct F32(f32);

/// bool field accepting booleans, 0/1 and `'True'`/`'False'` strings.
#[derive(Clone, Copy, Debug, Default)]
struct Flag(bool);

macro_rules! flex_visitor {
    ($ty:ident, $target:ty, $expecting:literal) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                struct V;
                impl<'de> Visitor<'de> for V {
                    type Value = $ty;

                    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                        f.write_str($expecting)
                    }

                    fn visit_u64<E: de::Error>(self, v: u64) -> Result<$ty, E> {
                        Ok($ty(v as $target))
                    }

                    fn visit_i64<E: de::Error>(self, v: i64) -> Result<$ty, E> {
                        Ok($ty(v as $target))
                    }

                    fn visit_f64<E: de::Error>(self, v: f64) -> Result<$ty, E> {
                        Ok($ty(v as $target))
                    }

                    fn visit_str<E: de::Error>(self, v: &str) -> Result<$ty, E> {
                        v.trim()
                            .parse::<$target>()
                            .map($ty)
                            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
                    }
                }
                d.deserialize_any(V)
            }
        }
    };
}

flex_visitor!(U32, u32, "an unsigned integer or numeric string");
flex_visitor!(F32, f32, "a number or numeric string");

impl<'de> Deserialize<'de> for Flag {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct V;
        impl<'de> Visitor<'de> for V {
            type Value = Flag;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a boolean, 0/1, or 'True'/'False'")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Flag, E> {
                Ok(Flag(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Flag, E> {
                Ok(Flag(v != 0))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Flag, E> {
                Ok(Flag(v != 0))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Flag, E> {
                match v.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "yes" => Ok(Flag(true)),
                    "false" | "0" | "no" => Ok(Flag(false)),
                    _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
                }
            }
        }
        d.deserialize_any(V)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCrate {
    id: U32,
    num_slots: U32,
    location: String,
    rack: String,
    elevation: U32,
    area: String,
    node: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawLinkNode {
    id: U32,
    location: String,
    group_link: String,
    rx_pgp: U32,
    ln_type: U32,
    lnid: U32,
    crate_id: U32,
    group_id: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDatabaseInfo {
    source: String,
    date: String,
    user: String,
    md5sum: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawApplicationType {
    id: U32,
    num_integrators: U32,
    analog_channel_count: U32,
    digital_channel_count: U32,
    software_channel_count: U32,
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawApplicationCard {
    id: U32,
    number: U32,
    slot_number: U32,
    crate_id: U32,
    #[serde(alias = "application_type_id")]
    type_id: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDigitalChannel {
    id: U32,
    number: U32,
    card_id: U32,
    name: String,
    z_name: String,
    o_name: String,
    z_location: F32,
    debounce: U32,
    alarm_state: U32,
    auto_reset: U32,
    evaluation: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAnalogChannel {
    id: U32,
    number: U32,
    card_id: U32,
    name: String,
    egu: String,
    offset: F32,
    slope: F32,
    integrator: U32,
    gain_bay: U32,
    gain_channel: U32,
    z_location: F32,
    auto_reset: U32,
    evaluation: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFault {
    id: U32,
    name: String,
    pv: String,
    ignore_condition_ids: Vec<U32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFaultInput {
    id: U32,
    fault_id: U32,
    channel_id: U32,
    bit_position: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawFaultState {
    id: U32,
    fault_id: U32,
    name: String,
    mask: U32,
    value: U32,
    #[serde(alias = "default_state")]
    default: Flag,
    mitigation_ids: Vec<U32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBeamClass {
    id: U32,
    number: U32,
    name: String,
    integration_window: U32,
    min_period: U32,
    total_charge: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawBeamDestination {
    id: U32,
    name: String,
    destination_mask: U32,
    display_order: U32,
    buffer0_destination_mask: U32,
    buffer1_destination_mask: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAllowedClass {
    id: U32,
    beam_class_id: U32,
    beam_destination_id: U32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawIgnoreCondition {
    id: U32,
    name: String,
    description: String,
    value: U32,
    digital_channel_id: U32,
}

#[derive(Debug, Default)]
struct RawTables {
    crates: Vec<RawCrate>,
    link_nodes: Vec<RawLinkNode>,
    database_info: Vec<RawDatabaseInfo>,
    application_types: Vec<RawApplicationType>,
    application_cards: Vec<RawApplicationCard>,
    digital_channels: Vec<RawDigitalChannel>,
    analog_channels: Vec<RawAnalogChannel>,
    faults: Vec<RawFault>,
    fault_inputs: Vec<RawFaultInput>,
    fault_states: Vec<RawFaultState>,
    beam_classes: Vec<RawBeamClass>,
    beam_destinations: Vec<RawBeamDestination>,
    allowed_classes: Vec<RawAllowedClass>,
    ignore_conditions: Vec<RawIgnoreCondition>,
}

impl RawTables {
    fn absorb_table(&mut self, name: &str, value: serde_yaml::Value) -> Result<(), ConfigError> {
        fn rows<T: for<'de> Deserialize<'de>>(
            value: serde_yaml::Value,
        ) -> Result<Vec<T>, ConfigError> {
            Ok(serde_yaml::from_value(value)?)
        }

        match name {
            "Crate" => self.crates.extend(rows(value)?),
            "LinkNode" => self.link_nodes.extend(rows(value)?),
            "DatabaseInfo" => self.database_info.extend(rows(value)?),
            "ApplicationType" => self.application_types.extend(rows(value)?),
            "ApplicationCard" => self.application_cards.extend(rows(value)?),
            "DigitalChannel" => self.digital_channels.extend(rows(value)?),
            "AnalogChannel" => self.analog_channels.extend(rows(value)?),
            "Fault" => self.faults.extend(rows(value)?),
            "FaultInput" => self.fault_inputs.extend(rows(value)?),
            "FaultState" => self.fault_states.extend(rows(value)?),
            "BeamClass" => self.beam_classes.extend(rows(value)?),
            "BeamDestination" => self.beam_destinations.extend(rows(value)?),
            // "Mitigation" is the sqlite-era name for the AllowedClass table.
            "AllowedClass" | "Mitigation" => self.allowed_classes.extend(rows(value)?),
            "IgnoreCondition" => self.ignore_conditions.extend(rows(value)?),
            other => return Err(ConfigError::UnknownTable(other.to_string())),
        }
        Ok(())
    }
}

/// Load a database from a file on disk.
pub fn load_file(path: impl AsRef<Path>) -> Result<Database, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load_str(&text, &path.display().to_string())
}

/// Load a database from YAML text. `name` is recorded for status output.
pub fn load_str(text: &str, name: &str) -> Result<Database, ConfigError> {
    let mut raw = RawTables::default();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)?;
        let serde_yaml::Value::Mapping(mapping) = value else {
            continue;
        };
        for (key, table) in mapping {
            let table_name = key.as_str().unwrap_or_default().to_string();
            raw.absorb_table(&table_name, table)?;
        }
    }

    let mut db = build(raw);
    db.name = name.to_string();
    linkup::resolve(&mut db)?;
    Ok(db)
}

fn build(raw: RawTables) -> Database {
    let mut db = Database::empty();

    db.info = raw.database_info.into_iter().next().map(|i| DatabaseInfo {
        source: i.source,
        date: i.date,
        user: i.user,
        md5sum: i.md5sum,
    });

    for r in raw.crates {
        db.crates.insert(
            r.id.0,
            Crate {
                id: r.id.0,
                num_slots: r.num_slots.0,
                location: r.location,
                rack: r.rack,
                elevation: r.elevation.0,
                area: r.area,
                node: r.node,
            },
        );
    }

    for r in raw.link_nodes {
        db.link_nodes.insert(
            r.id.0,
            LinkNode {
                id: r.id.0,
                location: r.location,
                group_link: r.group_link,
                rx_pgp: r.rx_pgp.0,
                ln_type: r.ln_type.0,
                ln_id: r.lnid.0,
                crate_id: r.crate_id.0,
                group_id: r.group_id.0,
            },
        );
    }

    for r in raw.application_types {
        db.application_types.insert(
            r.id.0,
            ApplicationType {
                id: r.id.0,
                num_integrators: r.num_integrators.0,
                analog_channel_count: r.analog_channel_count.0,
                digital_channel_count: r.digital_channel_count.0,
                software_channel_count: r.software_channel_count.0,
                name: r.name,
            },
        );
    }

    for r in raw.application_cards {
        db.application_cards.insert(
            r.id.0,
            ApplicationCard {
                id: r.id.0,
                number: r.number.0,
                slot_number: r.slot_number.0,
                crate_id: r.crate_id.0,
                application_type_id: r.type_id.0,
                ..Default::default()
            },
        );
    }

    for r in raw.digital_channels {
        db.digital_channels.insert(
            r.id.0,
            DigitalChannel {
                id: r.id.0,
                number: r.number.0,
                card_id: r.card_id.0,
                name: r.name,
                z_name: r.z_name,
                o_name: r.o_name,
                z_location: r.z_location.0,
                debounce: r.debounce.0,
                alarm_state: r.alarm_state.0,
                auto_reset: r.auto_reset.0 != 0,
                evaluation: Evaluation::from(r.evaluation.0),
                // The alarm level is the value that means "faulted".
                fault_value: r.alarm_state.0,
                ..Default::default()
            },
        );
    }

    for r in raw.analog_channels {
        db.analog_channels.insert(
            r.id.0,
            AnalogChannel {
                id: r.id.0,
                number: r.number.0,
                card_id: r.card_id.0,
                name: r.name,
                egu: r.egu,
                offset: r.offset.0,
                slope: r.slope.0,
                integrator: r.integrator.0,
                gain_bay: r.gain_bay.0,
                gain_channel: r.gain_channel.0,
                z_location: r.z_location.0,
                auto_reset: r.auto_reset.0 != 0,
                evaluation: Evaluation::from(r.evaluation.0),
                ..Default::default()
            },
        );
    }

    for r in raw.faults {
        db.faults.insert(
            r.id.0,
            Fault {
                id: r.id.0,
                name: r.name,
                pv: r.pv,
                ignore_condition_ids: r.ignore_condition_ids.iter().map(|v| v.0).collect(),
                ..Default::default()
            },
        );
    }

    for r in raw.fault_inputs {
        db.fault_inputs.insert(
            r.id.0,
            FaultInput {
                id: r.id.0,
                fault_id: r.fault_id.0,
                channel_id: r.channel_id.0,
                bit_position: r.bit_position.0,
                ..Default::default()
            },
        );
    }

    for r in raw.fault_states {
        db.fault_states.insert(
            r.id.0,
            FaultState {
                id: r.id.0,
                fault_id: r.fault_id.0,
                name: r.name,
                mask: r.mask.0,
                value: r.value.0,
                default_state: r.default.0,
                mitigation_ids: r.mitigation_ids.iter().map(|v| v.0).collect(),
                ..Default::default()
            },
        );
    }

    for r in raw.beam_classes {
        db.beam_classes.insert(
            r.id.0,
            BeamClass {
                id: r.id.0,
                number: r.number.0,
                name: r.name,
                integration_window: r.integration_window.0,
                min_period: r.min_period.0,
                total_charge: r.total_charge.0,
            },
        );
    }

    for r in raw.beam_destinations {
        db.beam_destinations.insert(
            r.id.0,
            BeamDestination {
                id: r.id.0,
                name: r.name,
                destination_mask: r.destination_mask.0 as u16,
                display_order: r.display_order.0 as u16,
                buffer0_destination_mask: r.buffer0_destination_mask.0,
                buffer1_destination_mask: r.buffer1_destination_mask.0,
                ..Default::default()
            },
        );
    }

    for r in raw.allowed_classes {
        db.allowed_classes.insert(
            r.id.0,
            AllowedClass {
                id: r.id.0,
                beam_class_id: r.beam_class_id.0,
                beam_destination_id: r.beam_destination_id.0,
                beam_class: BeamClassRef { id: 0, number: 0 },
            },
        );
    }

    for r in raw.ignore_conditions {
        db.ignore_conditions.insert(
            r.id.0,
            IgnoreCondition {
                id: r.id.0,
                name: r.name,
                description: r.description,
                value: r.value.0,
                digital_channel_id: r.digital_channel_id.0,
                ..Default::default()
            },
        );
    }

    db
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;

    #[test]
    fn loads_fixture_database() {
        let db = load_str(&test_utils::small_database_yaml(), "fixture").unwrap();
        assert_eq!(db.name, "fixture");
        assert_eq!(db.beam_classes.len(), 8);
        assert_eq!(db.beam_destinations.len(), 2);
        assert!(!db.faults.is_empty());
        assert!(!db.fault_inputs.is_empty());
        assert_eq!(db.lowest_beam_class.number, 0);
        assert_eq!(db.highest_beam_class.number, 7);
    }

    #[test]
    fn quoted_scalars_are_accepted() {
        let text = "\
BeamClass:
- id: '1'
  number: '0'
  name: Class 0
- id: '2'
  number: '7'
  name: Class 7
BeamDestination:
- id: '1'
  name: D0
  destination_mask: '1'
  display_order: '0'
  buffer0_destination_mask: '15'
  buffer1_destination_mask: '0'
";
        let db = load_str(text, "quoted").unwrap();
        assert_eq!(db.beam_classes[&2].number, 7);
        assert_eq!(db.beam_destinations[&1].buffer0_destination_mask, 15);
    }

    #[test]
    fn unknown_table_is_rejected() {
        let err = load_str("Bogus:\n- id: 1\n", "bad").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTable(name) if name == "Bogus"));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_file("/nonexistent/mps.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn load_file_round_trip() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(test_utils::small_database_yaml().as_bytes())
            .unwrap();
        let db = load_file(file.path()).unwrap();
        assert!(!db.application_cards.is_empty());
    }

    #[test]
    fn database_info_is_recorded() {
        let mut text = test_utils::small_database_yaml();
        text.push_str(
            "DatabaseInfo:\n- source: mps_gun_config.db\n  date: '2024-03-01'\n  user: ops\n  md5sum: abc123\n",
        );
        let db = load_str(&text, "info").unwrap();
        let info = db.info.unwrap();
        assert_eq!(info.source, "mps_gun_config.db");
        assert_eq!(info.user, "ops");
    }
}
