// SPDX-License-Identifier: Apache-2.0
//
// Process-wide shutdown coordinator.
//
// One coordinator per process, lazily created by the environment
// manager. It tracks every live environment through a weak reference
// and, on a termination signal, runs each one's synchronous best-effort
// destruction so a crash during analysis does not leave recoverable
// plaintext on disk. The cleanup path never panics and never blocks on
// the async lock hierarchy.

use std::sync::{Mutex, OnceLock, Weak};

use cinder_core::EnvironmentId;
use tracing::{debug, info, warn};

/// Implemented by anything the coordinator must clean up on abrupt
/// termination. The implementation must be synchronous, panic-free,
/// and safe to call at any point in the owner's lifecycle.
pub trait EmergencyCleanup: Send + Sync {
    fn environment_id(&self) -> EnvironmentId;

    /// Best-effort synchronous destruction. Returns the number of
    /// filesystem entries removed.
    fn emergency_destroy(&self) -> usize;
}

/// Registry of live environments plus the signal listener task.
pub struct ShutdownCoordinator {
    environments: Mutex<Vec<Weak<dyn EmergencyCleanup>>>,
    listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

static COORDINATOR: OnceLock<ShutdownCoordinator> = OnceLock::new();

/// The process-wide coordinator.
pub fn coordinator() -> &'static ShutdownCoordinator {
    COORDINATOR.get_or_init(|| ShutdownCoordinator {
        environments: Mutex::new(Vec::new()),
        listener: Mutex::new(None),
    })
}

impl ShutdownCoordinator {
    /// Track a live environment. Also installs the signal listener the
    /// first time it is called from within a tokio runtime.
    pub fn register(&'static self, env: Weak<dyn EmergencyCleanup>) {
        {
            let mut envs = self.environments.lock().unwrap_or_else(|p| p.into_inner());
            envs.retain(|w| w.upgrade().is_some());
            envs.push(env);
            debug!(live = envs.len(), "environment registered for shutdown cleanup");
        }
        self.install_listener();
    }

    /// Forget an environment that was destroyed in an orderly way.
    pub fn unregister(&self, id: EnvironmentId) {
        let mut envs = self.environments.lock().unwrap_or_else(|p| p.into_inner());
        envs.retain(|w| match w.upgrade() {
            Some(env) => env.environment_id() != id,
            None => false,
        });
    }

    /// Number of environments that would be cleaned up right now.
    pub fn live_environments(&self) -> usize {
        let mut envs = self.environments.lock().unwrap_or_else(|p| p.into_inner());
        envs.retain(|w| w.upgrade().is_some());
        envs.len()
    }

    /// Run every live environment's best-effort destruction, in
    /// registration order. Never panics; returns how many environments
    /// were cleaned.
    pub fn run_emergency_cleanup(&self) -> usize {
        let envs: Vec<_> = {
            let mut guard = self.environments.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };

        let mut cleaned = 0usize;
        for weak in envs {
            if let Some(env) = weak.upgrade() {
                let id = env.environment_id();
                let removed = env.emergency_destroy();
                info!(%id, removed, "emergency destruction ran");
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Spawn the signal listener. Termination signals trigger emergency
    /// cleanup and then re-raise the default exit.
    ///
    /// The listener task dies with the runtime it was spawned on, so a
    /// finished task is re-armed on the next registration from a live
    /// runtime.
    fn install_listener(&'static self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No runtime yet; the next register() from async context
            // retries.
            warn!("no tokio runtime; shutdown listener deferred");
            return;
        };

        let mut slot = self.listener.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        *slot = Some(handle.spawn(async move {
            let coordinator = coordinator();

            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut term = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("cannot install SIGTERM handler: {e}");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received; destroying live environments");
                        coordinator.run_emergency_cleanup();
                        std::process::exit(130);
                    }
                    _ = term.recv() => {
                        info!("SIGTERM received; destroying live environments");
                        coordinator.run_emergency_cleanup();
                        std::process::exit(143);
                    }
                }
            }
            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("ctrl-c received; destroying live environments");
                    coordinator.run_emergency_cleanup();
                    std::process::exit(130);
                }
            }
        }));

        debug!("shutdown signal listener installed");
    }

    #[cfg(test)]
    fn listener_running(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}
