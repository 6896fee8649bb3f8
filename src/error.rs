/*!
Error types for configuration loading and link-up.

Configuration failures are fail-fast: the first referential violation aborts
the load with a message naming the offending ids, and no partial database is
installed. Runtime I/O problems are deliberately *not* represented here; they
are counted and tolerated by the threads that encounter them.
*/

use std::path::PathBuf;

use thiserror::Error;

/// Raised while loading or linking a configuration database. The engine
/// keeps running on its previous database when a load fails.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read database file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse database YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown YAML table `{0}`")]
    UnknownTable(String),

    #[error("database has no {0} entries")]
    EmptyTable(&'static str),

    #[error("invalid {target} id {id} referenced by {referrer} {referrer_id}")]
    BadReference {
        target: &'static str,
        id: u32,
        referrer: &'static str,
        referrer_id: u32,
    },

    #[error("application card {card_id} has digital and analog channels")]
    MixedChannelTypes { card_id: u32 },

    #[error("application card {card_id} number {number} exceeds the {limit} card slots")]
    CardNumberOutOfRange { card_id: u32, number: u32, limit: u32 },

    #[error("fast evaluation {kind} channel {channel_id} has auto reset enabled")]
    FastAutoReset { kind: &'static str, channel_id: u32 },

    #[error(
        "digital channel {channel_id} with fast evaluation must have exactly one \
         fault state, found {found}"
    )]
    FastFaultStateCount { channel_id: u32, found: usize },

    #[error(
        "digital channel {channel_id} with fast evaluation must have exactly one \
         fault input, found {found}"
    )]
    FastFaultInputCount { channel_id: u32, found: usize },

    #[error("fault {fault_id} has no fault states")]
    NoFaultStates { fault_id: u32 },

    #[error("fault {fault_id} has no fault inputs")]
    NoFaultInputs { fault_id: u32 },

    #[error("fault state {fault_state_id} has zero value, integrator cannot be derived")]
    NoIntegratorBits { fault_state_id: u32 },

    #[error("fault {fault_id} is missing an input at bit position {bit}")]
    MissingBitPosition { fault_id: u32, bit: u32 },

    #[error("fault {fault_id} has more than one input at bit position {bit}")]
    DuplicateBitPosition { fault_id: u32, bit: u32 },

    #[error("beam destination {destination_id} display order {display_order} exceeds {limit}")]
    DisplayOrderOutOfRange {
        destination_id: u32,
        display_order: u16,
        limit: usize,
    },

    #[error("no {kind} found for bypass {bypass_id} (device id {device_id})")]
    MissingChannelForBypass {
        kind: &'static str,
        bypass_id: u32,
        device_id: u32,
    },

    #[error("no bypass assigned for fault inputs {fault_inputs:?}, analog channels {analog_channels:?}")]
    UnassignedBypass {
        fault_inputs: Vec<u32>,
        analog_channels: Vec<u32>,
    },

    #[error("bypass requested for unknown {kind} {device_id}")]
    UnknownBypassDevice { kind: &'static str, device_id: u32 },

    #[error("initial firmware configuration write failed: {0}")]
    FirmwareWrite(String),
}
