//! Mount state and mount plumbing.
//!
//! Two concerns live here:
//!
//! 1. [`MountStates`] — the per-volume exclusive lock plus reference count
//!    that serializes concurrent mount/unmount of the *same* volume. The lock
//!    and the refcount are one `Mutex<u32>`: holding the guard is holding the
//!    volume's mount lock, so the count and the physically-mounted fact are
//!    always updated atomically with respect to each other.
//! 2. [`MountOps`] — the narrow seam over filesystem formatting, probing and
//!    raw mount/unmount syscalls. Drivers call through this trait so tests
//!    can inject a fake; [`SysMountOps`] is the real implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use nix::mount::{MntFlags, MsFlags};
use tokio::process::Command;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Per-volume mount state
// ---------------------------------------------------------------------------

/// Guard over a volume's mount state: the exclusive lock plus mutable access
/// to the refcount. Dropping it releases the lock.
pub type MountGuard = OwnedMutexGuard<u32>;

/// Lazily-populated map of per-volume mount state, keyed by the volume's
/// mount key.
///
/// State is created on first use and lives for the process lifetime; a zero
/// refcount with no physical mount is indistinguishable from "never mounted",
/// which is exactly the semantics the drivers need.
#[derive(Default)]
pub struct MountStates {
    states: DashMap<String, Arc<Mutex<u32>>>,
}

impl MountStates {
    /// Create an empty state map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the exclusive mount lock for `key`, waiting for any in-flight
    /// mount/unmount of the same volume to finish.
    pub async fn lock(&self, key: &str) -> MountGuard {
        let state = self
            .states
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        state.lock_owned().await
    }

    /// Current refcount for `key`, for inspection only. Waits for any
    /// in-flight operation on the volume.
    pub async fn refcount(&self, key: &str) -> u32 {
        *self.lock(key).await
    }
}

// ---------------------------------------------------------------------------
// Mount option resolution
// ---------------------------------------------------------------------------

/// Translate generic mount-option strings into `mount(2)` flags plus a
/// residual data string of filesystem-specific options.
///
/// Unrecognized options are not an error: they are passed through to the
/// filesystem in the data string (e.g. `discard` for ext4).
pub fn resolve_mount_options(options: &[&str]) -> (MsFlags, String) {
    let table: HashMap<&str, MsFlags> = HashMap::from([
        ("ro", MsFlags::MS_RDONLY),
        ("nosuid", MsFlags::MS_NOSUID),
        ("nodev", MsFlags::MS_NODEV),
        ("noexec", MsFlags::MS_NOEXEC),
        ("sync", MsFlags::MS_SYNCHRONOUS),
        ("dirsync", MsFlags::MS_DIRSYNC),
        ("noatime", MsFlags::MS_NOATIME),
        ("nodiratime", MsFlags::MS_NODIRATIME),
        ("relatime", MsFlags::MS_RELATIME),
        ("strictatime", MsFlags::MS_STRICTATIME),
        ("mand", MsFlags::MS_MANDLOCK),
    ]);

    let mut flags = MsFlags::empty();
    let mut data: Vec<&str> = Vec::new();

    for opt in options {
        let opt = opt.trim();
        if opt.is_empty() || opt == "defaults" || opt == "rw" {
            continue;
        }
        match table.get(opt) {
            Some(flag) => flags |= *flag,
            None => data.push(opt),
        }
    }

    (flags, data.join(","))
}

// ---------------------------------------------------------------------------
// Mount operations seam
// ---------------------------------------------------------------------------

/// Narrow interface over formatting, probing, and mount/unmount syscalls.
///
/// The internals of `mkfs`/`blkid`/`mount(2)` are external collaborators of
/// the storage core; drivers only consume this surface.
#[async_trait]
pub trait MountOps: Send + Sync {
    /// Whether `path` is currently a mount point.
    async fn is_mountpoint(&self, path: &Path) -> bool;

    /// Mount `device` at `target`.
    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> Result<(), StorageError>;

    /// Unmount `target` with force-detach semantics.
    async fn unmount(&self, target: &Path) -> Result<(), StorageError>;

    /// Create a filesystem of type `fstype` on `device`.
    async fn make_filesystem(&self, device: &Path, fstype: &str) -> Result<(), StorageError>;

    /// Probe the filesystem type present on `device`.
    async fn probe_filesystem(&self, device: &Path) -> Result<String, StorageError>;

    /// Relocate a trailing GPT backup header to the true end of `device`,
    /// after the device was created larger than the image written to it.
    async fn move_gpt_backup_header(&self, device: &Path) -> Result<(), StorageError>;
}

/// [`MountOps`] implementation using the host kernel and standard tools.
#[derive(Debug, Default)]
pub struct SysMountOps;

impl SysMountOps {
    async fn run_tool(program: &str, args: &[&str]) -> Result<String, StorageError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| StorageError::Internal(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(StorageError::Internal(format!(
                "{program} {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl MountOps for SysMountOps {
    async fn is_mountpoint(&self, path: &Path) -> bool {
        let contents = match tokio::fs::read_to_string("/proc/self/mounts").await {
            Ok(c) => c,
            Err(_) => return false,
        };
        let path = path.to_string_lossy();
        // Format: <device> <mountpoint> <fstype> <options> <dump> <pass>
        contents
            .lines()
            .any(|line| line.split_whitespace().nth(1) == Some(path.as_ref()))
    }

    async fn mount(
        &self,
        device: &Path,
        target: &Path,
        fstype: &str,
        flags: MsFlags,
        data: &str,
    ) -> Result<(), StorageError> {
        let data = if data.is_empty() { None } else { Some(data) };
        nix::mount::mount(Some(device), target, Some(fstype), flags, data).map_err(|e| {
            StorageError::MountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        debug!(device = %device.display(), target = %target.display(), fstype, "mounted");
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), StorageError> {
        nix::mount::umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
            StorageError::UnmountFailed {
                path: target.display().to_string(),
                reason: e.to_string(),
            }
        })?;

        debug!(target = %target.display(), "unmounted");
        Ok(())
    }

    async fn make_filesystem(&self, device: &Path, fstype: &str) -> Result<(), StorageError> {
        let device = device.display().to_string();
        // Force flags so a stale signature on a reused device does not stall
        // the non-interactive daemon.
        let args: Vec<&str> = match fstype {
            "ext4" => vec!["-F", device.as_str()],
            "xfs" | "btrfs" => vec!["-f", device.as_str()],
            _ => vec![device.as_str()],
        };
        Self::run_tool(&format!("mkfs.{fstype}"), &args).await?;
        Ok(())
    }

    async fn probe_filesystem(&self, device: &Path) -> Result<String, StorageError> {
        let device = device.display().to_string();
        let out = Self::run_tool("blkid", &["-o", "value", "-s", "TYPE", &device]).await?;
        let fstype = out.trim();
        if fstype.is_empty() {
            return Err(StorageError::Internal(format!(
                "no filesystem detected on {device}"
            )));
        }
        Ok(fstype.to_owned())
    }

    async fn move_gpt_backup_header(&self, device: &Path) -> Result<(), StorageError> {
        let device = device.display().to_string();
        Self::run_tool("sgdisk", &["--move-second-header", &device]).await?;
        Ok(())
    }
}
