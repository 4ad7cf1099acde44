//! Domain layer: models, ports, index names, and error taxonomy.

pub mod errors;
pub mod indices;
pub mod models;
pub mod ports;
