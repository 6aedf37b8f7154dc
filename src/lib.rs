//! hostdiff -- forensic host differencing for incident response.
//!
//! Baseline a known-good host, collect the same data from a fleet through a
//! remote command-execution service, and diff each host against the baseline
//! to surface unexpected listening ports, cron entries and the like.

pub mod analysis;
pub mod collect;
pub mod config;
pub mod error;
pub mod flows;
pub mod logging;
pub mod plugins;
pub mod storage;

pub use error::{Error, Result};
