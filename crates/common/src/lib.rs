//! Common utilities for usbip-client
//!
//! This crate provides functionality shared by the client library, its
//! binary and the test suites: error handling, logging setup, and test
//! utilities including a scripted loopback USB/IP server.

pub mod error;
pub mod logging;
pub mod test_utils;

pub use error::{Error, Result};
pub use logging::setup_logging;
