//! Background services

pub mod expiry;
pub mod scheduler;

pub use expiry::{ExpirySweeper, ExpirySweeperConfig, ExpirySweeperHandle};
pub use scheduler::{Cadence, Scheduler};
