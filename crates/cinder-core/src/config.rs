// SPDX-License-Identifier: Apache-2.0
//
// Environment creation options.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options controlling how a secure environment is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentOptions {
    /// Caller-chosen name, recorded in the non-secret metadata record.
    pub name: String,
    /// Fail every outbound network call made through the environment's
    /// I/O capability while it is active.
    pub block_network: bool,
    /// Restrict filesystem access through the I/O capability to the
    /// allow-list (storage root, scratch directory, working directory).
    pub restrict_filesystem: bool,
    /// Suppress core dumps and probe for attached debuggers at creation.
    pub protect_memory: bool,
    /// Overwrite passes for secure deletion (ones, random…, zeros).
    pub overwrite_passes: u32,
    /// Additionally try to install a pid-scoped host-firewall rule as
    /// defense-in-depth. Needs privileges and a dedicated cgroup; when
    /// either is missing the failure is logged and process-level
    /// blocking stands alone.
    pub layer_host_firewall: bool,
    /// Extra paths reachable while the environment is active, on top of
    /// the storage root and the process working directory.
    pub extra_allowed_paths: Vec<PathBuf>,
}

impl EnvironmentOptions {
    /// Options with everything enabled, under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self {
            name: "secure-env".to_owned(),
            block_network: true,
            restrict_filesystem: true,
            protect_memory: true,
            overwrite_passes: 3,
            layer_host_firewall: false,
            extra_allowed_paths: Vec::new(),
        }
    }
}
