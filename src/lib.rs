#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

// Must come first so the logging macros are visible to the other modules.
#[macro_use]
mod fmt;

pub mod config;
pub mod gps;
pub mod link;
pub mod sensor;
pub mod state;
pub mod telemetry;
pub mod vario;
