// SPDX-License-Identifier: Apache-2.0
//
// Cinder — core types and error definitions shared across all crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::EnvironmentOptions;
pub use error::{CinderError, Result};
pub use types::*;
