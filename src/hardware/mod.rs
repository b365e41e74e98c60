//! Simulated station hardware.

pub mod mock;
