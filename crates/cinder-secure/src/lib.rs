// SPDX-License-Identifier: Apache-2.0
//
// cinder-secure — the ephemeral secure processing environment.
//
// Sensitive third-party data (social-media exports, email archives,
// financial records) is decrypted and analyzed inside an environment
// that encrypts everything at rest under an in-memory-only key, blocks
// outbound network I/O, restricts filesystem access to an allow-list,
// and destroys every trace on teardown — including the crash path.
//
// This is a best-effort, defense-in-depth layer for a single-user
// local tool, not a kernel sandbox and not a hardware key vault.

pub mod destruction;
pub mod isolation;
pub mod manager;
pub mod medium;
pub mod sanitize;
pub mod scrub;
pub mod shutdown;
pub mod store;

// PUBLIC API: the surface consumed by the UI, service clients, and CLI.
pub use destruction::{verify_deletion, DestructionEngine};
pub use isolation::{IsolationGuard, ScopedIo};
pub use manager::{EnvContext, SecureEnvironment, SecureEnvironmentManager};
pub use sanitize::sanitize_key;
pub use scrub::{SecretBytes, SecretRecord, SecretString};
pub use store::EncryptedTempStore;

#[cfg(test)]
pub(crate) mod test_support {
    /// Serializes tests that touch process-wide state (the isolation
    /// slot, the shutdown registry) so they cannot race each other.
    pub static GLOBAL_STATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    pub fn lock() -> std::sync::MutexGuard<'static, ()> {
        GLOBAL_STATE.lock().unwrap_or_else(|p| p.into_inner())
    }
}
