// SPDX-License-Identifier: Apache-2.0
//
// Secure environment manager — orchestrates isolation, encrypted
// storage, destruction, and memory scrubbing into one lifecycle:
// create → store/retrieve/execute → destroy.
//
// Teardown ordering is fixed: restore isolation, destroy storage,
// verify memory scrubbing — and every step runs even if an earlier one
// failed, with the outcomes aggregated into a report the caller can
// show the user. `destroy()` itself never fails.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinder_core::{
    CinderError, DestructionReport, DestructionStep, EnvironmentId, EnvironmentOptions,
    EnvironmentState, Result,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::destruction::DestructionEngine;
use crate::isolation::{IsolationGuard, ScopedIo};
use crate::scrub::{self, SecretBytes};
use crate::shutdown::{coordinator, EmergencyCleanup};
use crate::store::EncryptedTempStore;

/// Creates secure environments under a base directory (the system temp
/// directory by default).
#[derive(Debug, Clone)]
pub struct SecureEnvironmentManager {
    base_dir: PathBuf,
}

impl Default for SecureEnvironmentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SecureEnvironmentManager {
    pub fn new() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
        }
    }

    /// Place environment roots under `dir` instead of the system temp
    /// directory.
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: dir.into(),
        }
    }

    /// Build and initialize a secure environment.
    ///
    /// Isolation is engaged *before* storage is created, so even the
    /// environment's own directory setup already runs constrained.
    /// Fails with [`CinderError::ConcurrentIsolationConflict`] when an
    /// isolating environment is already active in this process.
    #[instrument(skip(self, options), fields(name = %options.name))]
    pub async fn create(&self, options: EnvironmentOptions) -> Result<SecureEnvironment> {
        let id = EnvironmentId::new();

        if options.protect_memory {
            scrub::suppress_core_dumps();
            if scrub::detect_debugger() {
                warn!(%id, "debugger attached while creating a secure environment");
            }
        }

        let base_dir = self.base_dir.join(format!("cinder-{id}"));
        let store_root = base_dir.join("store");
        let scratch_dir = base_dir.join("scratch");

        // Allow-list: the environment's own tree, the process working
        // directory, and whatever the caller explicitly opened up.
        let mut allowed = vec![base_dir.clone()];
        if let Ok(cwd) = std::env::current_dir() {
            allowed.push(cwd);
        }
        allowed.extend(options.extra_allowed_paths.iter().cloned());

        let isolating = options.block_network || options.restrict_filesystem;
        let (guard, io) = if isolating {
            let mut guard = IsolationGuard::new(
                options.block_network,
                options.restrict_filesystem,
                options.layer_host_firewall,
            );
            guard.initialize(&allowed)?;
            guard.engage()?;
            let io = guard.scoped_io();
            (Some(guard), io)
        } else {
            (None, ScopedIo::unrestricted())
        };

        let engine = DestructionEngine::new(options.overwrite_passes);
        let store = EncryptedTempStore::new(&store_root, &options.name, engine.clone())?;

        let setup = async {
            tokio::fs::create_dir_all(&scratch_dir).await?;
            store.initialize().await
        };
        if let Err(e) = setup.await {
            // Unwind isolation before surfacing the failure; restore()
            // never fails even after partial setup.
            if let Some(mut g) = guard {
                g.restore();
            }
            let _ = std::fs::remove_dir_all(&base_dir);
            return Err(e);
        }

        let inner = Arc::new(EnvironmentInner {
            id,
            base_dir,
            scratch_dir,
            state: RwLock::new(EnvironmentState::Active),
            destroying: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            store,
            guard: std::sync::Mutex::new(guard),
            io,
            engine,
        });

        let cleanup: Arc<dyn EmergencyCleanup> = inner.clone();
        coordinator().register(Arc::downgrade(&cleanup));

        info!(%id, "secure environment active");
        Ok(SecureEnvironment { inner })
    }
}

struct EnvironmentInner {
    id: EnvironmentId,
    base_dir: PathBuf,
    scratch_dir: PathBuf,
    state: RwLock<EnvironmentState>,
    /// Fast-fail flags so new operations reject immediately instead of
    /// queueing behind the destroy write lock.
    destroying: AtomicBool,
    destroyed: AtomicBool,
    store: EncryptedTempStore,
    guard: std::sync::Mutex<Option<IsolationGuard>>,
    io: ScopedIo,
    engine: DestructionEngine,
}

impl EnvironmentInner {
    fn check_open(&self) -> Result<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(CinderError::AlreadyDestroyed)
        } else if self.destroying.load(Ordering::Acquire) {
            Err(CinderError::Destroying)
        } else {
            Ok(())
        }
    }
}

impl EmergencyCleanup for EnvironmentInner {
    fn environment_id(&self) -> EnvironmentId {
        self.id
    }

    fn emergency_destroy(&self) -> usize {
        self.destroying.store(true, Ordering::Release);

        // Release the process-wide isolation slot: after an on-demand
        // cleanup the process lives on and must be able to create new
        // isolating environments.
        {
            let mut guard = self.guard.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(mut g) = guard.take() {
                g.restore();
            }
        }

        let removed = self.engine.emergency_delete(&self.base_dir);
        self.destroyed.store(true, Ordering::Release);
        removed
    }
}

/// Handle to one live secure environment. Cloning shares the same
/// environment; the last clone dropping does **not** destroy it —
/// destruction is explicit (or signal-driven).
#[derive(Clone)]
pub struct SecureEnvironment {
    inner: Arc<EnvironmentInner>,
}

/// Key material and store contents stay out of debug output.
impl std::fmt::Debug for SecureEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureEnvironment")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl SecureEnvironment {
    pub fn id(&self) -> EnvironmentId {
        self.inner.id
    }

    /// Directory for non-secret scratch output, inside the allow-list.
    pub fn scratch_dir(&self) -> &Path {
        &self.inner.scratch_dir
    }

    /// The restricted I/O capability for code running inside the
    /// environment.
    pub fn io(&self) -> ScopedIo {
        self.inner.io.clone()
    }

    pub async fn state(&self) -> EnvironmentState {
        *self.inner.state.read().await
    }

    /// Encrypt and store `data` under `key`; returns the ciphertext
    /// location.
    pub async fn store_data(&self, key: &str, data: &[u8]) -> Result<PathBuf> {
        self.inner.check_open()?;
        let _state = self.inner.state.read().await;
        self.inner.store.store(key, data).await
    }

    /// Decrypt and return the data stored under `key`.
    pub async fn retrieve_data(&self, key: &str) -> Result<SecretBytes> {
        self.inner.check_open()?;
        let _state = self.inner.state.read().await;
        self.inner.store.retrieve(key).await
    }

    /// Securely delete the item stored under `key`.
    pub async fn remove_data(&self, key: &str) -> Result<()> {
        self.inner.check_open()?;
        let _state = self.inner.state.read().await;
        self.inner.store.remove(key).await
    }

    /// All stored keys.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        self.inner.check_open()?;
        let _state = self.inner.state.read().await;
        self.inner.store.list().await
    }

    /// Run an analysis function inside the environment.
    ///
    /// `f` receives an [`EnvContext`] with the store and the restricted
    /// I/O capability; its result or error is propagated unchanged. No
    /// internal timeout is imposed — a long-running `f` blocks
    /// `destroy` until it returns.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(EnvContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.check_open()?;
        let _state = self.inner.state.read().await;

        let ctx = EnvContext {
            inner: Arc::clone(&self.inner),
        };
        f(ctx).await
    }

    /// Tear the environment down: restore isolation, destroy storage,
    /// verify memory scrubbing.
    ///
    /// Never fails — every step is attempted and its outcome recorded
    /// in the returned report. The environment always ends in
    /// `Destroyed`, even when a step reports an error; callers should
    /// check [`DestructionReport::fully_destroyed`] and alert the user
    /// if destruction may be incomplete.
    #[instrument(skip(self), fields(id = %self.inner.id))]
    pub async fn destroy(&self) -> DestructionReport {
        let inner = &self.inner;
        let mut report = DestructionReport::new(inner.id);

        // Reject new operations immediately, then wait for in-flight
        // ones to drain via the write lock.
        inner.destroying.store(true, Ordering::Release);
        let mut state = inner.state.write().await;
        if *state == EnvironmentState::Destroyed {
            debug!("environment already destroyed");
            return report;
        }
        *state = EnvironmentState::Destroying;

        // Step 1: restore isolation. Infallible by contract.
        {
            let mut guard = inner.guard.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(mut g) = guard.take() {
                g.restore();
            }
            report.steps.push(DestructionStep::ok("restore-isolation"));
        }

        // Step 2: destroy encrypted storage.
        match inner.store.destroy().await {
            Ok(()) => report.steps.push(DestructionStep::ok("destroy-store")),
            Err(e) => report.steps.push(DestructionStep::failed("destroy-store", e)),
        }

        // Step 3: destroy the scratch tree and the environment root.
        let scratch_result = async {
            if tokio::fs::symlink_metadata(&inner.scratch_dir).await.is_ok() {
                inner.engine.secure_delete_directory(&inner.scratch_dir).await?;
            }
            if tokio::fs::symlink_metadata(&inner.base_dir).await.is_ok() {
                tokio::fs::remove_dir(&inner.base_dir).await?;
            }
            Ok::<(), CinderError>(())
        }
        .await;
        match scratch_result {
            Ok(()) => report.steps.push(DestructionStep::ok("destroy-scratch")),
            Err(e) => report.steps.push(DestructionStep::failed("destroy-scratch", e)),
        }

        // Step 4: verify the key material was scrubbed.
        if inner.store.key_scrubbed().await {
            report.steps.push(DestructionStep::ok("scrub-memory"));
        } else {
            report.steps.push(DestructionStep::failed(
                "scrub-memory",
                "environment key still resident in memory",
            ));
        }

        *state = EnvironmentState::Destroyed;
        inner.destroyed.store(true, Ordering::Release);
        coordinator().unregister(inner.id);

        if report.fully_destroyed() {
            info!("environment destroyed");
        } else {
            warn!(failures = ?report.failures(), "environment destruction incomplete");
        }
        report
    }
}

/// What an analysis function sees while running inside an environment:
/// the encrypted store and the restricted I/O capability, nothing
/// else.
pub struct EnvContext {
    inner: Arc<EnvironmentInner>,
}

impl EnvContext {
    pub fn io(&self) -> ScopedIo {
        self.inner.io.clone()
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.inner.scratch_dir
    }

    pub async fn store(&self, key: &str, data: &[u8]) -> Result<PathBuf> {
        self.inner.store.store(key, data).await
    }

    pub async fn retrieve(&self, key: &str) -> Result<SecretBytes> {
        self.inner.store.retrieve(key).await
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.inner.store.remove(key).await
    }
}
