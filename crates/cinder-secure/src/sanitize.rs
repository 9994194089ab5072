// SPDX-License-Identifier: Apache-2.0
//
// Key sanitization — maps arbitrary caller-chosen identifiers onto safe
// single-segment filenames under the environment's storage root.
//
// The function is pure and total: every input string produces a valid
// filename, so it can be tested exhaustively without touching storage.

use sha2::{Digest, Sha256};

/// Keys longer than this (in bytes, after stripping) are replaced by a
/// content hash so filenames stay within filesystem limits.
const MAX_KEY_LEN: usize = 128;

/// Sanitize a caller-chosen item key into a safe filename.
///
/// Path separators, parent-directory references, NUL bytes, and other
/// control characters are stripped. Keys that strip down to nothing, to
/// dot-only names, or that exceed [`MAX_KEY_LEN`] are replaced with the
/// SHA-256 hex digest of the *original* key, so distinct keys stay
/// distinct.
pub fn sanitize_key(key: &str) -> String {
    let stripped: String = key
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '\0') && !c.is_control())
        .collect();

    // Collapse parent-directory references left after separator stripping.
    let stripped = stripped.replace("..", "");

    let degenerate = stripped.is_empty() || stripped.chars().all(|c| c == '.');
    if degenerate || stripped.len() > MAX_KEY_LEN {
        return hash_key(key);
    }

    stripped
}

/// SHA-256 hex digest of a key, used as its filename surrogate.
///
/// Also the escape hatch for callers with their own reserved names:
/// the digest is always a plain 64-char hex string.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
