//! UMTS connection manager.
//!
//! Discovers a cellular modem on the USB bus, binds a device configuration
//! profile, unlocks and configures the modem over its AT control channel,
//! then dials through pppd and supervises the data session, mirroring
//! carrier and signal information into the UCI config store.

pub mod cli;
pub mod config;
pub mod dial;
pub mod error;
pub mod modem;
pub mod pppd;
pub mod profile;
pub mod program;
pub mod session;
pub mod signals;
pub mod test_utils;
pub mod tty;

pub use error::{Error, Result};
