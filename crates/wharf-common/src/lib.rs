//! Wharf Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Wharf workspace members.
//!
//! # Overview
//!
//! - **Logging**: one place to configure `tracing` output for every binary
//! - **Checksums**: content hashing used for staged objects
//!
//! # Example
//!
//! ```no_run
//! use wharf_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod logging;
