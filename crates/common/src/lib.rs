//! Common utilities for the USB bridge
//!
//! This crate provides functionality shared between the bridge library, its
//! binary, and the test suites: the host event channel that carries OS
//! notifications into the bridge, logging setup, error handling, and test
//! helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{HostEvent, HostEventReceiver, HostEventSender, create_event_channel};
pub use error::{Error, Result};
pub use logging::setup_logging;
