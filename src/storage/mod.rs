//! # Storage Module
//!
//! Persistent store-and-forward log of position reports.
//!
//! This module handles:
//! - Sector-addressed block access ([`block`])
//! - The metadata and record byte layout ([`record`])
//! - Boot recovery, append with sector reclaim, and resend ([`log`])
//!
//! The on-card layout is fixed so a card written by an earlier run stays
//! readable.

pub mod block;
pub mod log;
pub mod record;

pub use block::{BlockDevice, FileBlockDevice, SECTOR_SIZE};
pub use log::{AppendOutcome, PersistentLog, ResendOutcome};
pub use record::Marker;
