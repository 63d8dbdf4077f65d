//! Domain layer: replication primitives, entities, errors and ports.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod value_objects;
