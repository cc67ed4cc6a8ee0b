//! Domain layer: upstream records, served rows and shared enumerations.

pub mod entities;
pub mod rows;
pub mod types;
