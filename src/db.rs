/*!
Configuration database: entity model, YAML loading, link-up and firmware
configuration packing.

The database is relational in the source document: every entity has a unique
32-bit id, and references between tables are by id. `load` decodes the raw
tables, `linkup` resolves every reference (failing fast on the first
violation) and populates back-reference sets, and `fwconfig` packs the
per-card fast-evaluation rules that are pushed down to the firmware.

Ownership: the evaluation thread owns the `Database` value outright. All
per-cycle scalar state (channel values, latches, fault flags, beam class
slots) lives directly in the entity structs and is only ever touched from
that thread; other threads communicate through queues and snapshots.
*/

pub mod fwconfig;
pub mod linkup;
pub mod load;
pub mod model;

pub use load::{load_file, load_str};
pub use model::*;
