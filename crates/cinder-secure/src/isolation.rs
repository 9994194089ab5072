// SPDX-License-Identifier: Apache-2.0
//
// Isolation guard — network blocking and filesystem allow-listing for
// the lifetime of a secure environment.
//
// Instead of replacing process-wide I/O entry points, the guard issues
// a `ScopedIo` capability: code running inside the environment performs
// all its I/O through the capability and never sees an unrestricted
// handle, while code outside the environment is untouched. The
// process-wide invariant that at most one guard is blocking at a time
// is kept, so overlapping isolating environments fail fast instead of
// fighting over shared state.
//
// The boundary is soft: the target deployment is a
// single-user desktop tool without elevated privileges, so kernel
// sandboxing (seccomp, namespaces) is out of scope. Callers must treat
// it as defense-in-depth, not containment of hostile code.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinder_core::{CinderError, Result};
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Process-wide slot: set while some guard is in the `Blocking` state.
static GUARD_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Guard lifecycle. Transitions are one-directional; a restored guard
/// is spent and a fresh instance is needed to block again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Uninitialized,
    Blocking,
    Restored,
}

/// Enforcement policy shared between the guard and every `ScopedIo`
/// handle it issued. Restoring the guard flips `enforcing` off, which
/// reverts all outstanding handles to pass-through at once.
struct IoPolicy {
    allowed: Vec<PathBuf>,
    block_network: bool,
    restrict_fs: bool,
    enforcing: AtomicBool,
}

impl IoPolicy {
    fn path_allowed(&self, path: &Path) -> bool {
        if !self.restrict_fs || !self.enforcing.load(Ordering::Acquire) {
            return true;
        }
        let normalized = normalize_path(path);
        self.allowed.iter().any(|root| normalized.starts_with(root))
    }

    fn network_blocked(&self) -> bool {
        self.block_network && self.enforcing.load(Ordering::Acquire)
    }
}

/// Blocks outbound network I/O and restricts filesystem access to an
/// allow-list while a secure environment is active.
pub struct IsolationGuard {
    state: GuardState,
    policy: Arc<IoPolicy>,
    holds_slot: bool,
    /// Set when a host-firewall rule was successfully layered and must
    /// be withdrawn on restore.
    firewall: Option<firewall::FirewallLayer>,
    layer_host_firewall: bool,
}

impl IsolationGuard {
    /// An uninitialized guard. `layer_host_firewall` additionally
    /// attempts a pid-scoped host-firewall rule as defense-in-depth;
    /// it needs privileges and degrades to a logged warning without
    /// them.
    pub fn new(block_network: bool, restrict_fs: bool, layer_host_firewall: bool) -> Self {
        Self {
            state: GuardState::Uninitialized,
            policy: Arc::new(IoPolicy {
                allowed: Vec::new(),
                block_network,
                restrict_fs,
                enforcing: AtomicBool::new(false),
            }),
            holds_slot: false,
            firewall: None,
            layer_host_firewall,
        }
    }

    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Capture the allow-listed path set and claim the process-wide
    /// isolation slot.
    ///
    /// Fails with [`CinderError::ConcurrentIsolationConflict`] when
    /// another guard is already blocking.
    #[instrument(skip_all, fields(paths = allowed_paths.len()))]
    pub fn initialize(&mut self, allowed_paths: &[PathBuf]) -> Result<()> {
        if self.state != GuardState::Uninitialized || self.holds_slot {
            return Err(CinderError::InvalidGuardState(match self.state {
                GuardState::Restored => "restored",
                _ => "already initialized",
            }));
        }

        if GUARD_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(CinderError::ConcurrentIsolationConflict);
        }
        self.holds_slot = true;

        let allowed: Vec<PathBuf> = allowed_paths.iter().map(|p| normalize_path(p)).collect();
        debug!(?allowed, "allow-list captured");

        // Rebuild the shared policy with the captured list; no handles
        // exist yet, so swapping the Arc is safe.
        self.policy = Arc::new(IoPolicy {
            allowed,
            block_network: self.policy.block_network,
            restrict_fs: self.policy.restrict_fs,
            enforcing: AtomicBool::new(false),
        });

        Ok(())
    }

    /// Start enforcing: outbound network calls through the capability
    /// fail synchronously, filesystem access outside the allow-list is
    /// rejected. Optionally layers the host firewall.
    #[instrument(skip(self))]
    pub fn engage(&mut self) -> Result<()> {
        match self.state {
            GuardState::Uninitialized if !self.holds_slot => {
                // initialize() was never run (or failed before claiming
                // the slot); nothing to enforce with.
                return Err(CinderError::InvalidGuardState("not initialized"));
            }
            GuardState::Restored => return Err(CinderError::InvalidGuardState("restored")),
            GuardState::Blocking => return Ok(()),
            GuardState::Uninitialized => {}
        }

        self.policy.enforcing.store(true, Ordering::Release);
        self.state = GuardState::Blocking;

        if self.policy.block_network && self.layer_host_firewall {
            match firewall::layer(std::process::id()) {
                Ok(layer) => {
                    info!("host-firewall layer installed");
                    self.firewall = Some(layer);
                }
                Err(reason) => {
                    // Best-effort: capability-level blocking stands on
                    // its own.
                    warn!("host-firewall layering degraded: {reason}");
                }
            }
        }

        info!(
            network_blocked = self.policy.block_network,
            fs_restricted = self.policy.restrict_fs,
            "isolation engaged"
        );
        Ok(())
    }

    /// The I/O capability to hand to code running inside the
    /// environment.
    pub fn scoped_io(&self) -> ScopedIo {
        ScopedIo {
            policy: Arc::clone(&self.policy),
        }
    }

    /// Reverse both interceptions and release the process-wide slot.
    ///
    /// Safe to call in any state, including after a partially failed
    /// `initialize`; it never fails.
    #[instrument(skip(self))]
    pub fn restore(&mut self) {
        self.policy.enforcing.store(false, Ordering::Release);

        if let Some(layer) = self.firewall.take() {
            layer.withdraw();
        }

        if self.holds_slot {
            GUARD_ACTIVE.store(false, Ordering::Release);
            self.holds_slot = false;
        }

        self.state = GuardState::Restored;
        info!("isolation restored");
    }
}

impl Drop for IsolationGuard {
    fn drop(&mut self) {
        // A leaked slot would wedge every future environment.
        if self.holds_slot {
            self.restore();
        }
    }
}

/// Restricted I/O handle given to code running inside a secure
/// environment.
///
/// Every filesystem operation normalizes its path lexically (so `..`
/// traversal cannot escape) and checks it against the allow-list;
/// every network operation fails synchronously while blocking is
/// active. Cloning shares the same policy.
#[derive(Clone)]
pub struct ScopedIo {
    policy: Arc<IoPolicy>,
}

impl ScopedIo {
    /// A pass-through capability for environments created without
    /// network blocking or filesystem restriction.
    pub fn unrestricted() -> Self {
        Self {
            policy: Arc::new(IoPolicy {
                allowed: Vec::new(),
                block_network: false,
                restrict_fs: false,
                enforcing: AtomicBool::new(false),
            }),
        }
    }

    /// Open an outbound TCP connection — fails with
    /// [`CinderError::NetworkBlocked`] before any bytes leave the
    /// process while the environment blocks networking.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        if self.policy.network_blocked() {
            return Err(CinderError::NetworkBlocked(addr.to_owned()));
        }
        Ok(TcpStream::connect(addr).await?)
    }

    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = self.check(path.as_ref())?;
        Ok(tokio::fs::read(path).await?)
    }

    pub async fn write(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.check(path.as_ref())?;
        Ok(tokio::fs::write(path, data).await?)
    }

    pub async fn append(&self, path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
        let path = self.check(path.as_ref())?;
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data).await?;
        Ok(file.flush().await?)
    }

    pub async fn delete(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = self.check(path.as_ref())?;
        Ok(tokio::fs::remove_file(path).await?)
    }

    pub async fn create_dir_all(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = self.check(path.as_ref())?;
        Ok(tokio::fs::create_dir_all(path).await?)
    }

    pub async fn metadata(&self, path: impl AsRef<Path>) -> Result<std::fs::Metadata> {
        let path = self.check(path.as_ref())?;
        Ok(tokio::fs::metadata(path).await?)
    }

    /// Whether `path` would be admitted by the current policy.
    pub fn is_allowed(&self, path: impl AsRef<Path>) -> bool {
        self.policy.path_allowed(path.as_ref())
    }

    fn check(&self, path: &Path) -> Result<PathBuf> {
        if self.policy.path_allowed(path) {
            Ok(path.to_path_buf())
        } else {
            Err(CinderError::PathNotAllowed(path.to_path_buf()))
        }
    }
}

/// Lexical path normalization: absolutize against the working
/// directory and resolve `.`/`..` components without touching the
/// filesystem, so traversal is defeated even for paths that do not
/// exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

mod firewall {
    //! Best-effort host-firewall layering, scoped as tightly as the
    //! platform allows. Unavailable backends report why, and the
    //! caller logs the degradation.

    /// A successfully installed firewall rule, withdrawn on restore.
    pub struct FirewallLayer {
        #[cfg(target_os = "linux")]
        table: String,
    }

    impl FirewallLayer {
        pub fn withdraw(self) {
            #[cfg(target_os = "linux")]
            {
                let status = std::process::Command::new("nft")
                    .args(["delete", "table", "inet", &self.table])
                    .status();
                if !matches!(status, Ok(s) if s.success()) {
                    tracing::warn!(table = %self.table, "failed to withdraw firewall layer");
                }
            }
        }
    }

    #[cfg(target_os = "linux")]
    pub fn layer(pid: u32) -> Result<FirewallLayer, String> {
        // A dedicated nft table per environment keeps withdrawal exact.
        // Scoping the drop rule to this process requires a dedicated
        // cgroup; without one we refuse rather than install a rule that
        // would catch unrelated traffic.
        let cgroup = std::fs::read_to_string("/proc/self/cgroup")
            .map_err(|e| format!("cannot read /proc/self/cgroup: {e}"))?;
        let path = cgroup
            .lines()
            .find_map(|l| l.rsplit(':').next())
            .unwrap_or("/")
            .trim()
            .to_owned();
        if path == "/" || path.is_empty() {
            return Err("process not in a dedicated cgroup; refusing broad firewall rule".into());
        }

        let table = format!("cinder_{pid}");
        let script = format!(
            "add table inet {table}\n\
             add chain inet {table} output {{ type filter hook output priority 0; }}\n\
             add rule inet {table} output socket cgroupv2 level 2 \"{}\" drop\n",
            path.trim_start_matches('/')
        );

        let run = std::process::Command::new("nft")
            .args(["-f", "-"])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .and_then(|mut child| {
                use std::io::Write;
                if let Some(stdin) = child.stdin.as_mut() {
                    stdin.write_all(script.as_bytes())?;
                }
                child.wait()
            });

        match run {
            Ok(status) if status.success() => Ok(FirewallLayer { table }),
            Ok(status) => Err(format!("nft exited with {status} (missing privileges?)")),
            Err(e) => Err(format!("could not run nft: {e}")),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn layer(_pid: u32) -> Result<FirewallLayer, String> {
        Err("no pid-scoped firewall backend on this platform".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::test_support;

    fn blocking_guard(allowed: &[PathBuf]) -> IsolationGuard {
        let mut guard = IsolationGuard::new(true, true, false);
        guard.initialize(allowed).expect("initialize");
        guard.engage().expect("engage");
        guard
    }

    #[test]
    fn normalize_resolves_traversal() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_path(Path::new("/a/../../..")), PathBuf::from("/"));
    }

    #[test]
    fn normalize_absolutizes_relative_paths() {
        assert!(normalize_path(Path::new("relative/file")).is_absolute());
    }

    #[tokio::test]
    async fn allowed_paths_pass_through() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        let mut guard = blocking_guard(&[dir.path().to_path_buf()]);

        let io = guard.scoped_io();
        let inside = dir.path().join("notes.txt");
        io.write(&inside, b"scratch data").await.expect("write");
        io.append(&inside, b", more").await.expect("append");
        assert_eq!(io.read(&inside).await.expect("read"), b"scratch data, more");
        io.delete(&inside).await.expect("delete");

        guard.restore();
    }

    #[tokio::test]
    async fn outside_paths_are_rejected_even_via_traversal() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        let mut guard = blocking_guard(&[dir.path().to_path_buf()]);
        let io = guard.scoped_io();

        let outside = Path::new("/etc/hostname");
        let err = io.read(outside).await.expect_err("outside allow-list");
        assert!(matches!(err, CinderError::PathNotAllowed(_)));

        // `..` escape from inside the allow-list.
        let sneaky = dir.path().join("sub/../../../../etc/passwd");
        let err = io.read(&sneaky).await.expect_err("traversal");
        assert!(matches!(err, CinderError::PathNotAllowed(_)));

        guard.restore();
    }

    #[tokio::test]
    async fn network_is_blocked_synchronously() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");

        // Loopback listener that must observe zero connections.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();

        let mut guard = blocking_guard(&[dir.path().to_path_buf()]);
        let io = guard.scoped_io();

        let err = io.connect(&addr).await.expect_err("blocked");
        assert!(matches!(err, CinderError::NetworkBlocked(_)));

        let no_conn =
            tokio::time::timeout(std::time::Duration::from_millis(50), listener.accept()).await;
        assert!(no_conn.is_err(), "no bytes may leave the process");

        guard.restore();

        // After restore the capability passes through again.
        let reconnect = io.connect(&addr).await;
        assert!(reconnect.is_ok(), "restore must reverse the interception");
    }

    #[test]
    fn second_blocking_guard_conflicts() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        let allowed = [dir.path().to_path_buf()];

        let mut first = IsolationGuard::new(true, true, false);
        first.initialize(&allowed).expect("first guard");

        let mut second = IsolationGuard::new(true, true, false);
        let err = second.initialize(&allowed).expect_err("slot taken");
        assert!(matches!(err, CinderError::ConcurrentIsolationConflict));

        first.restore();

        // Slot released: a fresh guard may now claim it.
        let mut third = IsolationGuard::new(true, true, false);
        third.initialize(&allowed).expect("slot free again");
        third.restore();
    }

    #[test]
    fn restore_is_safe_after_partial_initialize() {
        let _serial = test_support::lock();
        let mut guard = IsolationGuard::new(true, true, false);
        // Never initialized — restore must still be a clean no-op.
        guard.restore();
        assert_eq!(guard.state(), GuardState::Restored);
    }

    #[test]
    fn restored_guard_cannot_block_again() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        let mut guard = blocking_guard(&[dir.path().to_path_buf()]);
        guard.restore();

        assert!(guard.engage().is_err(), "one-directional state machine");
    }

    #[test]
    fn lifecycle_misuse_reports_guard_state() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        let allowed = [dir.path().to_path_buf()];

        // Engage before initialize.
        let mut unready = IsolationGuard::new(true, true, false);
        assert!(matches!(
            unready.engage(),
            Err(CinderError::InvalidGuardState("not initialized"))
        ));

        // Double initialize.
        let mut guard = IsolationGuard::new(true, true, false);
        guard.initialize(&allowed).expect("initialize");
        assert!(matches!(
            guard.initialize(&allowed),
            Err(CinderError::InvalidGuardState(_))
        ));

        // Anything after restore.
        guard.restore();
        assert!(matches!(
            guard.engage(),
            Err(CinderError::InvalidGuardState("restored"))
        ));
        assert!(matches!(
            guard.initialize(&allowed),
            Err(CinderError::InvalidGuardState("restored"))
        ));
    }

    #[test]
    fn dropped_guard_releases_the_slot() {
        let _serial = test_support::lock();
        let dir = tempdir().expect("tempdir");
        {
            let _guard = blocking_guard(&[dir.path().to_path_buf()]);
            // Dropped without restore.
        }
        let mut next = IsolationGuard::new(true, true, false);
        next.initialize(&[dir.path().to_path_buf()])
            .expect("drop released the slot");
        next.restore();
    }
}
