// SPDX-License-Identifier: Apache-2.0
//
// Memory scrubbing — deterministic zeroing of secret buffers and
// records, plus best-effort anti-forensics (core-dump suppression,
// debugger detection).
//
// Secrets get a deterministic owner: `SecretBytes` / `SecretString`
// zero their contents at scope exit via `zeroize`, so destruction does
// not depend on allocator or runtime timing. Explicit `zero` / `clear`
// cover the cases where a secret must die before its owner does.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use zeroize::{Zeroize, Zeroizing};

/// A byte buffer that zeroes itself when dropped.
///
/// The preferred owner for key material and decrypted plaintext held in
/// memory: scope exit is the scrub point, no registration needed.
pub type SecretBytes = Zeroizing<Vec<u8>>;

/// A string that zeroes itself when dropped (passwords, tokens).
pub type SecretString = Zeroizing<String>;

/// Overwrite a mutable byte buffer with zeros in place.
///
/// The write is performed through `zeroize`, which guarantees it is not
/// elided by the optimizer.
pub fn zero(buf: &mut [u8]) {
    buf.zeroize();
}

/// One field of a [`SecretRecord`].
#[derive(Debug)]
pub enum SecretValue {
    Text(SecretString),
    Bytes(SecretBytes),
    Nested(SecretRecord),
}

/// A structured bundle of secrets (for example a credential set:
/// username, password, OAuth tokens) that can be cleared as a unit.
///
/// `clear` zeroes every text and byte field recursively and removes the
/// fields, leaving an empty record; dropping the record un-cleared still
/// zeroes everything through the `Zeroizing` field owners.
#[derive(Debug, Default)]
pub struct SecretRecord {
    fields: BTreeMap<String, SecretValue>,
}

impl SecretRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(
            name.into(),
            SecretValue::Text(Zeroizing::new(value.into())),
        );
    }

    pub fn insert_bytes(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.fields
            .insert(name.into(), SecretValue::Bytes(Zeroizing::new(value)));
    }

    pub fn insert_nested(&mut self, name: impl Into<String>, value: SecretRecord) {
        self.fields.insert(name.into(), SecretValue::Nested(value));
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(SecretValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(SecretValue::Bytes(b)) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Zero every field recursively, then remove all fields.
    pub fn clear(&mut self) {
        for (_, value) in self.fields.iter_mut() {
            match value {
                SecretValue::Text(s) => s.zeroize(),
                SecretValue::Bytes(b) => b.zeroize(),
                SecretValue::Nested(r) => r.clear(),
            }
        }
        self.fields.clear();
    }
}

/// Ask the OS not to write core dumps for this process.
///
/// Best-effort: on Linux this sets `RLIMIT_CORE` to zero and clears the
/// dumpable flag; elsewhere only the rlimit (unix) or nothing (other
/// platforms) is applied. Returns whether suppression took effect;
/// failure is logged, never fatal.
pub fn suppress_core_dumps() -> bool {
    #[cfg(unix)]
    {
        let limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: setrlimit with a valid rlimit struct has no memory
        // preconditions; failure is reported through the return value.
        let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
        if rc != 0 {
            warn!(
                errno = std::io::Error::last_os_error().raw_os_error(),
                "failed to zero RLIMIT_CORE; core dumps may contain secrets"
            );
            return false;
        }

        #[cfg(target_os = "linux")]
        {
            // SAFETY: prctl(PR_SET_DUMPABLE) takes scalar arguments only.
            let rc = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) };
            if rc != 0 {
                warn!("PR_SET_DUMPABLE failed; relying on RLIMIT_CORE only");
            }
        }

        debug!("core dumps suppressed");
        true
    }
    #[cfg(not(unix))]
    {
        warn!("core-dump suppression not implemented on this platform");
        false
    }
}

/// Best-effort check for an attached debugger.
///
/// On Linux this reads `TracerPid` from `/proc/self/status`. A `true`
/// result means a tracer is attached and secrets may be observable; the
/// caller decides what to do with that. Errors are treated as "no
/// debugger detected" and logged.
pub fn detect_debugger() -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => {
                for line in status.lines() {
                    if let Some(rest) = line.strip_prefix("TracerPid:") {
                        let traced = rest.trim().parse::<i32>().map(|pid| pid != 0);
                        if let Ok(true) = traced {
                            warn!("debugger attached (TracerPid non-zero)");
                            return true;
                        }
                        return false;
                    }
                }
                false
            }
            Err(e) => {
                warn!("could not read /proc/self/status: {e}");
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        debug!("debugger detection not implemented on this platform");
        false
    }
}
