//! # Trackteur Library
//!
//! Firmware core of a cellular GPS tracker.
//!
//! This library drives a SIMCom-family modem over AT commands (power
//! sequencing, network bring-up, one TCP socket) and keeps position reports
//! in a power-loss safe store-and-forward log until an OsmAnd-style server
//! has accepted them.

pub mod board;
pub mod config;
pub mod error;
pub mod fix;
pub mod modem;
pub mod serial;
pub mod storage;
pub mod telemetry;
pub mod tracker;

pub use error::{Result, TrackerError};
pub use fix::Fix;
pub use tracker::Tracker;
