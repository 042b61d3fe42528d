//! The storage-driver contract.
//!
//! [`Driver`] is the operation set every storage backend implements, at pool
//! and volume granularity; it is the object an orchestrator programs against.
//! One driver instance manages one storage pool for the daemon's lifetime.
//! Backends are selected by driver-kind string through [`new_driver`].
//!
//! Pool-level operations are serialized per pool by the orchestrator; volume
//! mount/unmount may be called concurrently and is serialized per volume by
//! the driver itself. No operation spawns background work or retries on its
//! own; remote calls inherit the caller's cancellation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::linstor::LinstorDriver;
use crate::client::ResourceMapper;
use crate::error::StorageError;
use crate::mount::{MountOps, SysMountOps};
use crate::types::{DriverInfo, PoolResources, Volume};

/// Callback that fills a freshly created volume with initial content.
///
/// It runs with exclusive access to the volume: the driver performs a scoped
/// mount around the call and tears it down afterwards. The first argument is
/// the volume's mount path; the second is the backing device path for
/// block-content volumes.
pub struct VolumeFiller {
    /// The fill function.
    pub fill: Box<dyn FnOnce(&Path, Option<&Path>) -> Result<(), StorageError> + Send>,
}

impl VolumeFiller {
    /// Wrap a fill function.
    pub fn new<F>(fill: F) -> Self
    where
        F: FnOnce(&Path, Option<&Path>) -> Result<(), StorageError> + Send + 'static,
    {
        Self { fill: Box::new(fill) }
    }
}

/// Everything needed to instantiate a driver for one pool.
pub struct DriverSetup {
    /// Storage pool name.
    pub pool_name: String,
    /// Name of the local node, as known to the remote controller.
    pub node_name: String,
    /// Root directory under which pool mount paths are derived.
    pub storage_root: PathBuf,
    /// Initial pool configuration.
    pub config: HashMap<String, String>,
    /// Remote controller adapter, for backends that need one.
    pub remote: Option<Arc<dyn ResourceMapper>>,
    /// Mount/format/probe seam; defaults to the host implementation.
    pub mount_ops: Arc<dyn MountOps>,
}

impl DriverSetup {
    /// Setup with host mount operations and no remote controller.
    pub fn new(
        pool_name: impl Into<String>,
        node_name: impl Into<String>,
        storage_root: impl Into<PathBuf>,
        config: HashMap<String, String>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            node_name: node_name.into(),
            storage_root: storage_root.into(),
            config,
            remote: None,
            mount_ops: Arc::new(SysMountOps),
        }
    }

    /// Attach a remote controller adapter.
    pub fn with_remote(mut self, remote: Arc<dyn ResourceMapper>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Replace the mount-operations seam.
    pub fn with_mount_ops(mut self, ops: Arc<dyn MountOps>) -> Self {
        self.mount_ops = ops;
        self
    }
}

/// The pluggable storage-driver contract.
///
/// Unless documented otherwise, every operation is independent and callable
/// any number of times.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name of the storage pool this instance manages.
    fn name(&self) -> &str;

    /// Static capability flags of this backend.
    fn info(&self) -> DriverInfo;

    /// One-time initialization: capability checks such as verifying a
    /// required kernel module version. Idempotent; a no-op once loaded.
    async fn load(&self) -> Result<(), StorageError>;

    /// Check all configuration keys against the backend's allow-list of
    /// validators. Fails naming the offending key; never has side effects.
    fn validate(&self, config: &HashMap<String, String>) -> Result<(), StorageError>;

    /// Apply defaults for any unset recognized pool config key.
    fn fill_config(&self) -> Result<(), StorageError>;

    /// Create the pool's backing storage, or adopt it read-only if it already
    /// exists. Transactional: partial creation is rolled back before the
    /// error returns.
    async fn create(&self) -> Result<(), StorageError>;

    /// Destroy the pool's backing storage. Idempotent; backing storage this
    /// instance does not own is left intact.
    async fn delete(&self) -> Result<(), StorageError>;

    /// Mount the pool. Returns whether the call changed state.
    async fn mount(&self) -> Result<bool, StorageError>;

    /// Unmount the pool. Returns whether the call changed state.
    async fn unmount(&self) -> Result<bool, StorageError>;

    /// Apply a pool configuration change.
    async fn update(&self, changed_config: &HashMap<String, String>) -> Result<(), StorageError>;

    /// Pool usage accounting.
    async fn get_resources(&self) -> Result<PoolResources, StorageError>;

    /// Apply defaults for any unset recognized volume config key.
    fn fill_volume_config(&self, vol: &mut Volume) -> Result<(), StorageError>;

    /// Validate the volume's config keys; optionally strip unknown keys.
    fn validate_volume(
        &self,
        vol: &mut Volume,
        remove_unknown_keys: bool,
    ) -> Result<(), StorageError>;

    /// Create an empty volume, optionally filling it via `filler`.
    /// Transactional: any failure rolls back every completed step.
    async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<VolumeFiller>,
    ) -> Result<(), StorageError>;

    /// Delete a volume. Idempotent: a missing volume is logged, not an error.
    async fn delete_volume(&self, vol: &Volume) -> Result<(), StorageError>;

    /// Whether the volume exists on the backend. Absence is `Ok(false)`,
    /// never an error.
    async fn has_volume(&self, vol: &Volume) -> Result<bool, StorageError>;

    /// Location of the volume's backing block device, for volume kinds that
    /// expose one.
    async fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf, StorageError>;

    /// Names of the volumes in this pool.
    async fn list_volumes(&self) -> Result<Vec<String>, StorageError>;

    /// Mount a volume and increment its reference count. Call
    /// [`Driver::unmount_volume`] when done with the volume.
    async fn mount_volume(&self, vol: &Volume) -> Result<(), StorageError>;

    /// Decrement the volume's reference count and, at zero, physically
    /// unmount it. Returns whether this call performed the physical unmount;
    /// fails with [`StorageError::InUse`] while other callers still hold the
    /// volume. `keep_block_dev` keeps the backing device mapped on backends
    /// that deactivate devices on unmount.
    async fn unmount_volume(&self, vol: &Volume, keep_block_dev: bool)
    -> Result<bool, StorageError>;
}

/// Driver kinds known to this build.
pub fn supported_drivers() -> &'static [&'static str] {
    &["linstor"]
}

/// Instantiate the driver registered for `kind`.
pub fn new_driver(kind: &str, setup: DriverSetup) -> Result<Box<dyn Driver>, StorageError> {
    match kind {
        "linstor" => Ok(Box::new(LinstorDriver::new(setup)?)),
        _ => Err(StorageError::validation(
            "driver",
            format!("unknown storage driver {kind:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_kind_fails_validation() {
        let setup = DriverSetup::new("pool1", "node1", "/tmp", HashMap::new());
        let Err(err) = new_driver("cephfs", setup) else {
            panic!("unknown driver kind must be rejected");
        };
        assert!(matches!(err, StorageError::Validation { ref key, .. } if key == "driver"));
    }

    #[test]
    fn linstor_is_registered() {
        assert!(supported_drivers().contains(&"linstor"));
    }
}
