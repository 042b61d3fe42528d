//! Core storage types: volumes, content types, and driver capabilities.
//!
//! These types form the backend-independent data model shared by the driver
//! contract and the backend implementations. A [`Volume`] is a canonical
//! description of one unit of storage; everything backend-specific (device
//! paths, remote object names) is derived from it by the driver that owns the
//! pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Volume config key holding the requested size, e.g. `"10GiB"`.
pub const CONFIG_SIZE: &str = "size";

/// Volume config key selecting the filesystem for filesystem-content volumes.
pub const CONFIG_BLOCK_FILESYSTEM: &str = "block.filesystem";

/// Volume config key holding comma-separated mount options.
pub const CONFIG_BLOCK_MOUNT_OPTIONS: &str = "block.mount_options";

/// Default size for new volumes when the config does not specify one.
pub const DEFAULT_VOLUME_SIZE: &str = "10GiB";

/// Default filesystem for filesystem-content volumes.
pub const DEFAULT_BLOCK_FILESYSTEM: &str = "ext4";

/// Default mount options for filesystem-content volumes.
pub const DEFAULT_BLOCK_MOUNT_OPTIONS: &str = "discard";

/// Size of the filesystem companion volume paired with every virtual-machine
/// block volume. It holds the VM's config/state files, not its root disk.
pub const DEFAULT_VM_BLOCK_FILESYSTEM_SIZE: &str = "100MiB";

// ---------------------------------------------------------------------------
// Volume and content types
// ---------------------------------------------------------------------------

/// The kind of workload a volume backs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VolumeType {
    /// A container's root filesystem.
    Container,
    /// A virtual machine's root disk.
    VirtualMachine,
    /// A cached image.
    Image,
    /// A user-defined volume.
    Custom,
    /// An object-storage bucket.
    Bucket,
}

impl VolumeType {
    /// On-disk directory name under the pool's mount root.
    pub fn dir(&self) -> &'static str {
        match self {
            Self::Container => "containers",
            Self::VirtualMachine => "virtual-machines",
            Self::Image => "images",
            Self::Custom => "custom",
            Self::Bucket => "buckets",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// What a volume contains: a mountable filesystem or a raw block device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContentType {
    /// A formatted, mountable filesystem.
    Filesystem,
    /// A raw block device consumed directly (e.g. by a VM).
    Block,
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Canonical, backend-independent description of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name, unique within its project.
    pub name: String,
    /// Owning project.
    pub project: String,
    /// Workload kind.
    pub vol_type: VolumeType,
    /// Filesystem or raw block content.
    pub content_type: ContentType,
    /// Name of the owning storage pool.
    pub pool: String,
    /// String-keyed configuration (size, filesystem, mount options).
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Volume {
    /// Create a new volume description.
    pub fn new(
        name: impl Into<String>,
        project: impl Into<String>,
        vol_type: VolumeType,
        content_type: ContentType,
        pool: impl Into<String>,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            vol_type,
            content_type,
            pool: pool.into(),
            config,
        }
    }

    /// Project-qualified name, used for on-disk paths and lock keys.
    pub fn qualified_name(&self) -> String {
        format!("{}_{}", self.project, self.name)
    }

    /// Key identifying this volume in the per-pool mount-state map.
    pub fn mount_key(&self) -> String {
        format!("{}/{}/{}", self.pool, self.vol_type.dir(), self.qualified_name())
    }

    /// The volume's mount path under the daemon's storage root.
    pub fn mount_path(&self, storage_root: &Path) -> PathBuf {
        storage_root
            .join(&self.pool)
            .join(self.vol_type.dir())
            .join(self.qualified_name())
    }

    /// Configured size string, falling back to the default.
    pub fn config_size(&self) -> &str {
        match self.config.get(CONFIG_SIZE) {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_VOLUME_SIZE,
        }
    }

    /// Configured filesystem, falling back to the default.
    pub fn config_block_filesystem(&self) -> &str {
        match self.config.get(CONFIG_BLOCK_FILESYSTEM) {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_BLOCK_FILESYSTEM,
        }
    }

    /// Whether the filesystem type was set explicitly. When it was not, mount
    /// falls back to probing the device.
    pub fn has_explicit_filesystem(&self) -> bool {
        self.config
            .get(CONFIG_BLOCK_FILESYSTEM)
            .is_some_and(|s| !s.is_empty())
    }

    /// Configured mount options, falling back to the default.
    pub fn config_block_mount_options(&self) -> &str {
        match self.config.get(CONFIG_BLOCK_MOUNT_OPTIONS) {
            Some(s) if !s.is_empty() => s,
            _ => DEFAULT_BLOCK_MOUNT_OPTIONS,
        }
    }

    /// Whether this is a virtual machine's raw block volume.
    pub fn is_vm_block(&self) -> bool {
        self.vol_type == VolumeType::VirtualMachine && self.content_type == ContentType::Block
    }

    /// Derive the filesystem-content companion volume paired with a VM block
    /// volume.
    ///
    /// The companion carries the VM's config filesystem and shares the
    /// parent's create/delete lifecycle. It is always [`ContentType::Filesystem`],
    /// so deriving a companion from a companion is impossible and the
    /// one-level recursion in the drivers terminates. Returns `None` when the
    /// volume is not a VM block volume.
    pub fn vm_block_filesystem_volume(&self) -> Option<Volume> {
        if !self.is_vm_block() {
            return None;
        }

        let mut config = HashMap::new();
        config.insert(CONFIG_SIZE.to_owned(), DEFAULT_VM_BLOCK_FILESYSTEM_SIZE.to_owned());
        if let Some(fs) = self.config.get(CONFIG_BLOCK_FILESYSTEM) {
            config.insert(CONFIG_BLOCK_FILESYSTEM.to_owned(), fs.clone());
        }

        Some(Volume {
            name: format!("{}.fs", self.name),
            project: self.project.clone(),
            vol_type: self.vol_type,
            content_type: ContentType::Filesystem,
            pool: self.pool.clone(),
            config,
        })
    }
}

// ---------------------------------------------------------------------------
// Driver capabilities
// ---------------------------------------------------------------------------

/// Static capability flags reported by a driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Driver kind, e.g. `"linstor"`.
    pub name: String,
    /// Backend version string, when known.
    pub version: String,
    /// Volume types the driver can provision.
    pub volume_types: Vec<VolumeType>,
    /// Default size of the VM filesystem companion volume.
    pub default_vm_block_filesystem_size: String,
    /// Whether the storage lives on a remote system.
    pub remote: bool,
    /// Whether one volume may be used from several nodes concurrently.
    pub volume_multi_node: bool,
    /// Whether volumes are backed by block devices.
    pub block_backing: bool,
    /// Whether object-storage buckets are supported.
    pub buckets: bool,
    /// Whether direct I/O is supported on volume devices.
    pub direct_io: bool,
    /// Whether io_uring is supported on volume devices.
    pub io_uring: bool,
    /// Whether inode numbers are preserved across copies.
    pub preserves_inodes: bool,
    /// Whether the pool keeps a mounted root filesystem.
    pub mounted_root: bool,
}

/// Pool space usage, reported by `get_resources` on backends that support
/// usage accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoolResources {
    /// Total pool space in bytes.
    pub space_total: u64,
    /// Used pool space in bytes.
    pub space_used: u64,
}

// ---------------------------------------------------------------------------
// Size parsing
// ---------------------------------------------------------------------------

/// Parse a human-readable byte size string such as `"1GiB"`, `"512MB"` or
/// `"4096"` (bare integers are bytes) into a byte count.
pub fn parse_byte_size(value: &str) -> Result<u64, StorageError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(StorageError::internal("empty size string"));
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, suffix) = value.split_at(split);

    let number: u64 = digits
        .parse()
        .map_err(|e| StorageError::Internal(format!("invalid size {value:?}: {e}")))?;

    let multiplier: u64 = match suffix.trim() {
        "" | "B" => 1,
        "kB" | "KB" => 1000,
        "MB" => 1000u64.pow(2),
        "GB" => 1000u64.pow(3),
        "TB" => 1000u64.pow(4),
        "KiB" => 1024,
        "MiB" => 1024u64.pow(2),
        "GiB" => 1024u64.pow(3),
        "TiB" => 1024u64.pow(4),
        other => {
            return Err(StorageError::Internal(format!(
                "invalid size {value:?}: unknown unit {other:?}"
            )));
        }
    };

    number
        .checked_mul(multiplier)
        .ok_or_else(|| StorageError::Internal(format!("size {value:?} overflows")))
}
