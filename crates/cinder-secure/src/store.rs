// SPDX-License-Identifier: Apache-2.0
//
// Encrypted temporary store — AES-256-GCM keyed blobs under an
// in-memory-only environment key.
//
// On-disk layout per item: `nonce(12) ‖ tag(16) ‖ ciphertext`, written
// atomically (temp file + rename inside the storage root). A fresh
// random nonce is generated per store call; the key never leaves
// process memory and is zeroed on destroy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cinder_core::{CinderError, Result, StoreMetadata};
use dashmap::DashMap;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::destruction::DestructionEngine;
use crate::sanitize::{hash_key, sanitize_key};
use crate::scrub::SecretBytes;

/// Non-secret diagnostic record written at initialization.
pub const METADATA_FILE: &str = ".cinder-meta.json";

/// AES-GCM tag length in bytes.
const TAG_LEN: usize = 16;

/// Map an item key to its on-disk filename.
///
/// Sanitized keys that land on the metadata record or the atomic-write
/// temp prefix would collide with store internals (clobbering metadata,
/// or hiding the item from `list`); those fall back to the hash
/// surrogate like degenerate keys do.
fn item_filename(key: &str) -> String {
    let name = sanitize_key(key);
    if name == METADATA_FILE || name.starts_with(".tmp-") {
        return hash_key(key);
    }
    name
}

/// Key + lifecycle flag, guarded together so teardown can zero the key
/// while excluding all other operations.
struct Inner {
    key: Zeroizing<[u8; 32]>,
    destroyed: bool,
}

/// At-rest-encrypted keyed blob storage for one secure environment.
pub struct EncryptedTempStore {
    root: PathBuf,
    name: String,
    inner: RwLock<Inner>,
    /// Serializes operations on the same item key; distinct keys run
    /// concurrently.
    item_locks: DashMap<String, Arc<Mutex<()>>>,
    engine: DestructionEngine,
    rng: SystemRandom,
}

impl EncryptedTempStore {
    /// Build a store rooted at `root` with a fresh random 256-bit key.
    ///
    /// The key exists only in this struct's memory and is zeroed by
    /// [`destroy`](Self::destroy) or on drop.
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>, engine: DestructionEngine) -> Result<Self> {
        let rng = SystemRandom::new();
        let mut key = Zeroizing::new([0u8; 32]);
        rng.fill(&mut *key)
            .map_err(|_| CinderError::Crypto("CSPRNG failure generating environment key".into()))?;

        Ok(Self {
            root: root.into(),
            name: name.into(),
            inner: RwLock::new(Inner {
                key,
                destroyed: false,
            }),
            item_locks: DashMap::new(),
            engine,
            rng,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the storage root and write the non-secret metadata record.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let meta = StoreMetadata {
            created: chrono::Utc::now(),
            name: self.name.clone(),
            platform: std::env::consts::OS.to_owned(),
        };
        let json = serde_json::to_vec_pretty(&meta)?;
        tokio::fs::write(self.root.join(METADATA_FILE), json).await?;

        info!("storage root initialized");
        Ok(())
    }

    /// Encrypt `data` under the environment key and persist it as
    /// `sanitize(key)`. Returns the ciphertext location.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn store(&self, key: &str, data: &[u8]) -> Result<PathBuf> {
        let inner = self.inner.read().await;
        if inner.destroyed {
            return Err(CinderError::AlreadyDestroyed);
        }

        let filename = item_filename(key);
        let lock = self.item_lock(&filename);
        let _guard = lock.lock().await;

        // Fresh nonce per item — nonce reuse under one key voids the
        // AEAD guarantees.
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CinderError::Crypto("CSPRNG failure generating nonce".into()))?;

        let sealing_key = self.aead_key(&inner.key)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut ciphertext = data.to_vec();
        let tag = sealing_key
            .seal_in_place_separate_tag(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|_| CinderError::Crypto("AEAD seal failed".into()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag.as_ref());
        blob.extend_from_slice(&ciphertext);

        let path = self.root.join(&filename);
        self.write_atomic(&path, &blob).await?;

        debug!(file = %path.display(), "item stored");
        Ok(path)
    }

    /// Read, authenticate, and decrypt the item stored under `key`.
    ///
    /// Fails with [`CinderError::NotFound`] when the key is absent and
    /// [`CinderError::Integrity`] when the tag check fails (tampering
    /// or corruption) — corrupted plaintext is never returned.
    #[instrument(skip(self))]
    pub async fn retrieve(&self, key: &str) -> Result<SecretBytes> {
        let inner = self.inner.read().await;
        if inner.destroyed {
            return Err(CinderError::AlreadyDestroyed);
        }

        let filename = item_filename(key);
        let lock = self.item_lock(&filename);
        let _guard = lock.lock().await;

        let path = self.root.join(&filename);
        let blob = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CinderError::NotFound(key.to_owned()));
            }
            Err(e) => return Err(e.into()),
        };

        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(CinderError::MalformedCiphertext(blob.len()));
        }

        let (nonce_bytes, rest) = blob.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        // ring expects ciphertext ‖ tag contiguously.
        let mut sealed = Zeroizing::new(Vec::with_capacity(ciphertext.len() + TAG_LEN));
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let opening_key = self.aead_key(&inner.key)?;
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CinderError::MalformedCiphertext(blob.len()))?;

        let plaintext_len = opening_key
            .open_in_place(nonce, Aad::empty(), &mut sealed[..])
            .map_err(|_| CinderError::Integrity {
                key: key.to_owned(),
            })?
            .len();

        sealed.truncate(plaintext_len);
        debug!(len = plaintext_len, "item retrieved");
        Ok(sealed)
    }

    /// Securely delete the item stored under `key`.
    ///
    /// An already-absent key is treated as success — the desired state
    /// (no ciphertext on disk) already holds.
    #[instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> Result<()> {
        let inner = self.inner.read().await;
        if inner.destroyed {
            return Err(CinderError::AlreadyDestroyed);
        }

        let filename = item_filename(key);
        let lock = self.item_lock(&filename);
        let _guard = lock.lock().await;

        let path = self.root.join(&filename);
        if tokio::fs::symlink_metadata(&path).await.is_err() {
            debug!("item already absent");
            return Ok(());
        }

        self.engine.secure_delete_file(&path).await
    }

    /// All stored item keys (sanitized form), metadata excluded.
    pub async fn list(&self) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        if inner.destroyed {
            return Err(CinderError::AlreadyDestroyed);
        }

        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METADATA_FILE || name.starts_with(".tmp-") {
                continue;
            }
            keys.push(name);
        }
        Ok(keys)
    }

    /// Recursively destroy the storage root, then zero the key.
    ///
    /// Idempotent: a second call is a no-op success. Even when the
    /// directory destruction fails, the key is zeroed and the store is
    /// locked out so no further plaintext can be produced.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.destroyed {
            debug!("store already destroyed");
            return Ok(());
        }

        let result = if tokio::fs::symlink_metadata(&self.root).await.is_ok() {
            self.engine.secure_delete_directory(&self.root).await
        } else {
            Ok(())
        };

        // Lock out first, scrub second: even a failed disk destruction
        // must not leave a usable key behind.
        inner.destroyed = true;
        crate::scrub::zero(&mut *inner.key);

        match &result {
            Ok(()) => info!("store destroyed"),
            Err(e) => warn!("store destruction incomplete: {e}"),
        }
        result
    }

    /// Whether teardown has completed and the in-memory key material
    /// reads back as all-zero. Used by the manager's scrub-memory
    /// verification step.
    pub async fn key_scrubbed(&self) -> bool {
        let inner = self.inner.read().await;
        inner.destroyed && inner.key.iter().all(|&b| b == 0)
    }

    /// Synchronous best-effort destruction for the crash path. Never
    /// panics; the async state lock is bypassed deliberately because
    /// the process is going down.
    pub fn emergency_destroy(&self) -> usize {
        self.engine.emergency_delete(&self.root)
    }

    // -- internals ---------------------------------------------------

    fn item_lock(&self, filename: &str) -> Arc<Mutex<()>> {
        self.item_locks
            .entry(filename.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn aead_key(&self, key: &[u8; 32]) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| CinderError::Crypto("invalid AEAD key length".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    /// Write within the storage root, then rename into place, so a
    /// concurrent reader never observes a torn item.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(format!(".tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
