// SPDX-License-Identifier: Apache-2.0
//
// Destruction engine — multi-pass overwrite and unlink so that plaintext
// is unrecoverable by ordinary means.
//
// Overwrite schedule: pass 1 writes all-ones, the final pass all-zeros,
// intermediate passes CSPRNG bytes. Every pass is fsynced before the
// next one starts, and a file is only unlinked after all passes have
// succeeded — unlinking un-overwritten data would defeat the purpose.
//
// On unix, an available `shred` binary is preferred as the OS-native
// primitive; the manual schedule is the portable fallback. Both paths
// end with the path absent.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use cinder_core::{CinderError, DeletionReport, Result};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::medium;

/// Overwrite chunk size. 64 KiB keeps the random-fill buffer small
/// while still saturating sequential write bandwidth.
const CHUNK_SIZE: usize = 64 * 1024;

/// Secure file/directory destruction.
#[derive(Debug, Clone)]
pub struct DestructionEngine {
    /// Total overwrite passes per file (ones, random…, zeros).
    passes: u32,
    /// Whether to shell out to a native secure-erase tool when present.
    prefer_native: bool,
}

impl Default for DestructionEngine {
    fn default() -> Self {
        Self::new(3)
    }
}

impl DestructionEngine {
    /// Engine performing `passes` overwrite passes (minimum 1).
    pub fn new(passes: u32) -> Self {
        Self {
            passes: passes.max(1),
            prefer_native: true,
        }
    }

    /// Engine that always uses the manual overwrite schedule, even when
    /// a native tool is available. Used by tests that inspect overwrite
    /// behavior, and by callers that need the exact pattern sequence.
    pub fn manual_only(passes: u32) -> Self {
        Self {
            passes: passes.max(1),
            prefer_native: false,
        }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    /// Overwrite `path` with the full pass schedule and unlink it.
    ///
    /// Fails with [`CinderError::NotAFile`] if `path` is not a regular
    /// file. A failed overwrite pass is retried once; a second failure
    /// aborts the deletion with the file still in place.
    #[instrument(skip(self), fields(path = %path.as_ref().display(), passes = self.passes))]
    pub async fn secure_delete_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let meta = tokio::fs::symlink_metadata(path).await?;
        if !meta.is_file() {
            return Err(CinderError::NotAFile(path.to_path_buf()));
        }

        if self.prefer_native && native_erase_available() {
            match self.native_erase(path).await {
                Ok(()) => {
                    debug!("native secure erase complete");
                    return Ok(());
                }
                Err(e) => {
                    warn!("native secure erase failed ({e}); falling back to manual overwrite");
                }
            }
        }

        self.overwrite_and_unlink(path, meta.len()).await
    }

    /// Recursively destroy every file under `path`, then remove the
    /// now-empty directories bottom-up.
    #[instrument(skip(self), fields(path = %path.as_ref().display()))]
    pub async fn secure_delete_directory(&self, path: impl AsRef<Path>) -> Result<()> {
        let root = path.as_ref().to_path_buf();

        let (files, mut dirs) = collect_tree(&root).await?;
        debug!(files = files.len(), dirs = dirs.len(), "destroying tree");

        for file in &files {
            self.secure_delete_file(file).await?;
        }

        // Children before parents.
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            tokio::fs::remove_dir(&dir).await?;
        }
        tokio::fs::remove_dir(&root).await?;

        info!(files = files.len(), "directory securely destroyed");
        Ok(())
    }

    /// Confirm that `path` no longer exists, annotated with the
    /// advisory storage-medium classification.
    pub fn verify_deletion(&self, path: impl AsRef<Path>) -> DeletionReport {
        verify_deletion(path)
    }

    /// Synchronous, best-effort destruction for the crash path.
    ///
    /// Single zero-fill, then unlink, for every file under `path`
    /// (which may be a file or directory). Never panics; errors are
    /// swallowed after a best effort so a signal handler can always run
    /// this to completion. Returns how many fs entries it removed.
    pub fn emergency_delete(&self, path: &Path) -> usize {
        emergency_delete_sync(path)
    }

    // -- internals ---------------------------------------------------

    /// Delete through the platform's secure-erase tool.
    #[cfg(unix)]
    async fn native_erase(&self, path: &Path) -> Result<()> {
        // shred's -n counts only the random passes; -z appends the
        // final zero pass, -u unlinks.
        let random_passes = self.passes.saturating_sub(1).max(1);
        let status = tokio::process::Command::new("shred")
            .arg("-n")
            .arg(random_passes.to_string())
            .arg("-z")
            .arg("-u")
            .arg(path)
            .status()
            .await?;

        if !status.success() {
            return Err(CinderError::PlatformUnsupported(format!(
                "shred exited with {status} for {}",
                path.display()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn native_erase(&self, path: &Path) -> Result<()> {
        let _ = path;
        Err(CinderError::PlatformUnsupported(
            "no native secure-erase tool on this platform".to_owned(),
        ))
    }

    /// The manual schedule: ones, random…, zeros, fsync between passes,
    /// unlink last.
    async fn overwrite_and_unlink(&self, path: &Path, len: u64) -> Result<()> {
        let mut file = OpenOptions::new().write(true).open(path).await?;

        for pass in 0..self.passes {
            let pattern = self.pattern_for(pass);
            if let Err(first) = overwrite_pass(&mut file, len, &pattern).await {
                warn!(pass, "overwrite pass failed ({first}); retrying once");
                if let Err(second) = overwrite_pass(&mut file, len, &pattern).await {
                    // Abort with the file intact rather than unlink
                    // data that was never overwritten.
                    return Err(CinderError::Io(second));
                }
            }
            file.sync_all().await?;
            debug!(pass, "overwrite pass flushed");
        }

        drop(file);
        tokio::fs::remove_file(path).await?;
        debug!("file unlinked");
        Ok(())
    }

    /// Byte pattern for a given pass index.
    fn pattern_for(&self, pass: u32) -> PassPattern {
        if pass + 1 == self.passes {
            PassPattern::Fill(0x00)
        } else if pass == 0 && self.passes > 1 {
            PassPattern::Fill(0xFF)
        } else {
            PassPattern::Random
        }
    }
}

enum PassPattern {
    Fill(u8),
    Random,
}

/// Write one full pass over `len` bytes of `file`.
async fn overwrite_pass(
    file: &mut File,
    len: u64,
    pattern: &PassPattern,
) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(0)).await?;

    let rng = SystemRandom::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut remaining = len;

    while remaining > 0 {
        let n = remaining.min(CHUNK_SIZE as u64) as usize;
        match pattern {
            PassPattern::Fill(byte) => chunk[..n].fill(*byte),
            PassPattern::Random => rng
                .fill(&mut chunk[..n])
                .map_err(|_| std::io::Error::other("CSPRNG failure during overwrite"))?,
        }
        file.write_all(&chunk[..n]).await?;
        remaining -= n as u64;
    }

    file.flush().await
}

/// Collect all files and subdirectories under `root` (excluding `root`
/// itself).
async fn collect_tree(root: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            let path = entry.path();
            if meta.is_dir() {
                dirs.push(path.clone());
                pending.push(path);
            } else {
                // Symlinks are unlinked without overwrite; overwriting
                // through a link would destroy the target instead.
                files.push(path);
            }
        }
    }

    Ok((files, dirs))
}

/// Confirm that `path` no longer exists and classify the medium it
/// lived on.
pub fn verify_deletion(path: impl AsRef<Path>) -> DeletionReport {
    let path = path.as_ref();
    let exists = std::fs::symlink_metadata(path).is_ok();

    // Classify against the nearest existing ancestor so deleted paths
    // still get a medium annotation.
    let probe = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    let (medium, mut notes) = medium::classify(probe);

    if exists {
        notes.push("path still exists; deletion incomplete".to_owned());
    }

    DeletionReport {
        path: path.to_path_buf(),
        exists,
        medium,
        notes,
    }
}

/// Best-effort synchronous destruction used by the crash path.
///
/// Zero-fills and unlinks whatever it can reach; every error is
/// swallowed. Must stay panic-free: it runs from the process shutdown
/// coordinator.
fn emergency_delete_sync(path: &Path) -> usize {
    use std::io::{Seek, Write};

    let mut removed = 0usize;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return removed; // already gone counts as done
    };

    if meta.is_file() {
        if let Ok(mut f) = std::fs::OpenOptions::new().write(true).open(path) {
            let len = meta.len();
            let chunk = [0u8; 8192];
            let mut left = len;
            let _ = f.seek(SeekFrom::Start(0));
            while left > 0 {
                let n = left.min(chunk.len() as u64) as usize;
                if f.write_all(&chunk[..n]).is_err() {
                    break;
                }
                left -= n as u64;
            }
            let _ = f.sync_all();
        }
        if std::fs::remove_file(path).is_ok() {
            removed += 1;
        }
    } else if meta.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                removed += emergency_delete_sync(&entry.path());
            }
        }
        if std::fs::remove_dir(path).is_ok() {
            removed += 1;
        }
    } else if std::fs::remove_file(path).is_ok() {
        // Symlink or other special file: unlink only.
        removed += 1;
    }

    removed
}

/// Whether a native secure-erase tool is on PATH.
fn native_erase_available() -> bool {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static AVAILABLE: OnceLock<bool> = OnceLock::new();
        *AVAILABLE.get_or_init(|| {
            std::env::var_os("PATH")
                .map(|paths| {
                    std::env::split_paths(&paths).any(|dir| dir.join("shred").is_file())
                })
                .unwrap_or(false)
        })
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn delete_file_removes_it() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("export.json");
        tokio::fs::write(&path, b"PLAINTEXT-MARKER-1234")
            .await
            .expect("write");

        let engine = DestructionEngine::new(3);
        engine.secure_delete_file(&path).await.expect("delete");

        let report = engine.verify_deletion(&path);
        assert!(!report.exists);
    }

    #[tokio::test]
    async fn delete_rejects_directories() {
        let dir = tempdir().expect("tempdir");
        let engine = DestructionEngine::new(3);
        let err = engine
            .secure_delete_file(dir.path())
            .await
            .expect_err("directories are not files");
        assert!(matches!(err, CinderError::NotAFile(_)));
    }

    #[tokio::test]
    async fn delete_missing_file_is_io_error() {
        let dir = tempdir().expect("tempdir");
        let engine = DestructionEngine::new(3);
        let err = engine
            .secure_delete_file(dir.path().join("never-existed"))
            .await
            .expect_err("missing file");
        assert!(matches!(err, CinderError::Io(_)));
    }

    #[tokio::test]
    async fn delete_directory_walks_the_tree() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("store");
        tokio::fs::create_dir_all(root.join("nested/deeper"))
            .await
            .expect("mkdirs");
        for (name, body) in [
            ("top.bin", &b"aaaa"[..]),
            ("nested/mid.bin", b"bbbb"),
            ("nested/deeper/leaf.bin", b"cccc"),
        ] {
            tokio::fs::write(root.join(name), body).await.expect("write");
        }

        let engine = DestructionEngine::new(2);
        engine
            .secure_delete_directory(&root)
            .await
            .expect("destroy tree");

        assert!(!root.exists());
    }

    /// The overwrite must actually replace file content. Unlinking
    /// cannot be observed from outside, so run one pass through the
    /// helper directly and confirm the plaintext pattern is gone.
    #[tokio::test]
    async fn overwrite_pass_replaces_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("victim.bin");
        let marker = b"SECRET-SSN-123-45-6789".repeat(100);
        tokio::fs::write(&path, &marker).await.expect("write");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .expect("open");
        overwrite_pass(&mut file, marker.len() as u64, &PassPattern::Fill(0xFF))
            .await
            .expect("pass");
        file.sync_all().await.expect("sync");
        drop(file);

        let now = tokio::fs::read(&path).await.expect("read back");
        assert_eq!(now.len(), marker.len());
        assert!(now.iter().all(|&b| b == 0xFF));
    }

    #[tokio::test]
    async fn manual_engine_converges_on_absence() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("manual.bin");
        tokio::fs::write(&path, vec![0x5Au8; 200_000])
            .await
            .expect("write");

        let engine = DestructionEngine::manual_only(3);
        engine.secure_delete_file(&path).await.expect("delete");
        assert!(!path.exists());
    }

    #[test]
    fn emergency_delete_clears_whole_tree_without_async() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("crash-root");
        std::fs::create_dir_all(root.join("a/b")).expect("mkdirs");
        std::fs::write(root.join("a/secret.bin"), b"live plaintext").expect("write");
        std::fs::write(root.join("a/b/more.bin"), b"more plaintext").expect("write");

        let engine = DestructionEngine::new(3);
        let removed = engine.emergency_delete(&root);
        assert!(removed >= 4, "files + dirs should be removed, got {removed}");
        assert!(!root.exists());
    }

    #[test]
    fn emergency_delete_of_missing_path_is_quiet() {
        let engine = DestructionEngine::new(3);
        assert_eq!(engine.emergency_delete(Path::new("/no/such/cinder/path")), 0);
    }

    #[test]
    fn verify_reports_surviving_paths() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("still-here.bin");
        std::fs::write(&path, b"x").expect("write");

        let report = verify_deletion(&path);
        assert!(report.exists);
        assert!(report.notes.iter().any(|n| n.contains("still exists")));
    }

    #[test]
    fn pattern_schedule_is_ones_random_zeros() {
        let engine = DestructionEngine::new(3);
        assert!(matches!(engine.pattern_for(0), PassPattern::Fill(0xFF)));
        assert!(matches!(engine.pattern_for(1), PassPattern::Random));
        assert!(matches!(engine.pattern_for(2), PassPattern::Fill(0x00)));

        // Single pass degenerates to a zero fill.
        let one = DestructionEngine::new(1);
        assert!(matches!(one.pattern_for(0), PassPattern::Fill(0x00)));
    }
}
