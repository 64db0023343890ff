//! Modbus TCP data acquisition for an energy storage plant.
//!
//! The plant controller and the devices behind it (inverters, AC and DC
//! chargers) are polled over Modbus TCP in three cadence tiers, and the
//! decoded readings are published as one merged snapshot.

pub mod config;
pub mod error;
pub mod modbus;
pub mod models;
pub mod poller;
pub mod registers;

// Re-export the types a consumer of the crate touches directly
pub use config::Config;
pub use error::{Error, Result};
pub use models::{Availability, PollSnapshot, Topology, Value};
pub use poller::coordinator::PollCoordinator;
pub use registers::RegisterSet;
