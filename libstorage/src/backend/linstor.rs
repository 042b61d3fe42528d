//! LINSTOR storage backend.
//!
//! LINSTOR is an SDS solution that orchestrates the creation and life cycle
//! management of DRBD resources. The driver maps storage concepts onto the
//! controller's object model as follows:
//!
//! | Storage concept | LINSTOR concept     |
//! |-----------------|---------------------|
//! | Storage pool    | Resource group      |
//! | Volume          | Resource definition |
//!
//! Each resource definition holds exactly one volume (index 0). DRBD
//! replicates with an active/passive paradigm, so a volume is never used from
//! several nodes concurrently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::client::{ResourceGroup, ResourceMapper, SelectFilter};
use crate::driver::{Driver, DriverSetup, VolumeFiller};
use crate::error::StorageError;
use crate::mount::{MountOps, MountStates, resolve_mount_options};
use crate::revert::Reverter;
use crate::types::{
    self, ContentType, DEFAULT_VM_BLOCK_FILESYSTEM_SIZE, DriverInfo, PoolResources, Volume,
    VolumeType,
};

/// Config key naming the backing resource group.
pub const RESOURCE_GROUP_NAME_KEY: &str = "linstor.resource_group.name";

/// Config key for the resource group's replica placement count.
pub const RESOURCE_GROUP_PLACE_COUNT_KEY: &str = "linstor.resource_group.place_count";

/// Config key for the controller-side storage pool replicas are placed on.
pub const RESOURCE_GROUP_STORAGE_POOL_KEY: &str = "linstor.resource_group.storage_pool";

/// Internal marker recording whether this instance created (and therefore
/// owns destructive rights over) its resource group. Not exposed to users.
pub const POOL_PRISTINE_KEY: &str = "volatile.pool.pristine";

/// Default resource group name.
pub const DEFAULT_RESOURCE_GROUP_NAME: &str = "incus";

/// Default resource group place count.
pub const DEFAULT_RESOURCE_GROUP_PLACE_COUNT: &str = "2";

/// Where the DRBD kernel module reports its version.
const DRBD_VERSION_PATH: &str = "/sys/module/drbd/version";

/// Minimum DRBD major version the driver requires.
const DRBD_MIN_MAJOR: u64 = 9;

/// Storage driver backed by a remote LINSTOR controller.
///
/// One instance manages one storage pool. All mutable state (the pool config
/// map, the loaded flag, the per-volume mount states) is owned by the
/// instance, so unrelated pools of the same driver kind never interfere.
pub struct LinstorDriver {
    pool: String,
    node_name: String,
    storage_root: PathBuf,
    config: RwLock<HashMap<String, String>>,
    remote: Arc<dyn ResourceMapper>,
    ops: Arc<dyn MountOps>,
    mounts: MountStates,
    loaded: tokio::sync::Mutex<bool>,
    drbd_version_path: PathBuf,
}

impl LinstorDriver {
    /// Create a driver instance for one pool.
    pub fn new(setup: DriverSetup) -> Result<Self, StorageError> {
        let remote = setup.remote.ok_or_else(|| {
            StorageError::BackendUnavailable(
                "linstor driver requires a remote controller client".into(),
            )
        })?;

        Ok(Self {
            pool: setup.pool_name,
            node_name: setup.node_name,
            storage_root: setup.storage_root,
            config: RwLock::new(setup.config),
            remote,
            ops: setup.mount_ops,
            mounts: MountStates::new(),
            loaded: tokio::sync::Mutex::new(false),
            drbd_version_path: PathBuf::from(DRBD_VERSION_PATH),
        })
    }

    fn cfg(&self, key: &str) -> Option<String> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_cfg(&self, key: &str, value: impl Into<String>) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.into());
    }

    fn unset_cfg(&self, key: &str) {
        self.config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn resource_group_name(&self) -> String {
        self.cfg(RESOURCE_GROUP_NAME_KEY)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_RESOURCE_GROUP_NAME.to_owned())
    }

    /// Derived resource-definition name for a volume. The format is part of
    /// the on-wire compatibility contract and must not change.
    fn resource_definition_name(&self, vol: &Volume) -> String {
        format!("{}-{}", self.resource_group_name(), vol.name)
    }

    fn pool_mount_path(&self) -> PathBuf {
        self.storage_root.join(&self.pool)
    }

    fn is_pristine(&self) -> bool {
        self.cfg(POOL_PRISTINE_KEY).as_deref() == Some("true")
    }

    /// DRBD version of the currently loaded kernel module. The module is
    /// loaded by the satellite service, not by us.
    async fn drbd_version(&self) -> Result<semver::Version, StorageError> {
        let raw = tokio::fs::read_to_string(&self.drbd_version_path)
            .await
            .map_err(|_| {
                StorageError::BackendUnavailable(
                    "could not determine DRBD module version: module not loaded".into(),
                )
            })?;

        semver::Version::parse(raw.trim()).map_err(|e| {
            StorageError::BackendUnavailable(format!(
                "could not determine DRBD module version: {e}"
            ))
        })
    }

    /// Activate the volume's resource on this node so its device exists
    /// locally. Idempotent on the controller side.
    async fn make_volume_available(&self, vol: &Volume) -> Result<(), StorageError> {
        let definition = self.resource_definition_name(vol);
        self.remote
            .make_available(&definition, &self.node_name)
            .await
            .map_err(|e| {
                StorageError::Remote(format!(
                    "could not make {definition} available on {}: {e}",
                    self.node_name
                ))
            })
    }

    /// Resolve the volume's backing device path, preferring the local node
    /// among the nodes holding the resource.
    async fn device_path(&self, vol: &Volume) -> Result<PathBuf, StorageError> {
        let definition = self.resource_definition_name(vol);
        let storage_pool = self.cfg(RESOURCE_GROUP_STORAGE_POOL_KEY);

        let nodes = self
            .remote
            .list_nodes(&definition, storage_pool.as_deref())
            .await?;

        let node = if nodes.iter().any(|n| n == &self.node_name) {
            self.node_name.clone()
        } else {
            nodes.first().cloned().ok_or_else(|| {
                StorageError::NotFound(format!("node holding resource definition {definition}"))
            })?
        };

        // Each resource definition holds exactly one volume in this design.
        self.remote.volume_device_path(&definition, &node, 0).await
    }

    async fn create_inner(&self, revert: &mut Reverter) -> Result<(), StorageError> {
        let group_name = self.resource_group_name();

        match self.remote.get_resource_group(&group_name).await? {
            None => {
                debug!(group = group_name, "resource group does not exist, creating one");

                let place_count = self
                    .cfg(RESOURCE_GROUP_PLACE_COUNT_KEY)
                    .unwrap_or_default()
                    .parse::<u32>()
                    .map_err(|e| {
                        StorageError::validation(
                            RESOURCE_GROUP_PLACE_COUNT_KEY,
                            format!("must be an unsigned integer: {e}"),
                        )
                    })?;

                let group = ResourceGroup {
                    name: group_name.clone(),
                    description: "Resource group managed by the storage daemon".to_owned(),
                    select_filter: SelectFilter {
                        place_count,
                        storage_pool: self.cfg(RESOURCE_GROUP_STORAGE_POOL_KEY),
                    },
                };
                self.remote.create_resource_group(&group).await?;

                let remote = self.remote.clone();
                let name = group_name.clone();
                revert.add(move || async move {
                    if let Err(e) = remote.delete_resource_group(&name).await {
                        warn!(group = name, error = %e, "rollback failed to delete resource group");
                    }
                });

                // This instance created the group and owns destructive
                // rights over it.
                self.set_cfg(POOL_PRISTINE_KEY, "true");
            }
            Some(group) => {
                debug!(group = group_name, "resource group already exists, adopting it");

                // Adopt read-only: mirror the remote placement policy into
                // the local config and leave the pristine marker unset. The
                // remote value wins even when it is absent, so a stale local
                // selector cannot keep filtering node lookups.
                self.set_cfg(
                    RESOURCE_GROUP_PLACE_COUNT_KEY,
                    group.select_filter.place_count.to_string(),
                );
                match group.select_filter.storage_pool {
                    Some(storage_pool) => {
                        self.set_cfg(RESOURCE_GROUP_STORAGE_POOL_KEY, storage_pool);
                    }
                    None => self.unset_cfg(RESOURCE_GROUP_STORAGE_POOL_KEY),
                }
            }
        }

        Ok(())
    }

    async fn create_volume_inner(
        &self,
        vol: &Volume,
        filler: Option<VolumeFiller>,
        revert: &mut Reverter,
    ) -> Result<(), StorageError> {
        if vol.content_type == ContentType::Filesystem {
            let mount_path = vol.mount_path(&self.storage_root);
            tokio::fs::create_dir_all(&mount_path)
                .await
                .map_err(|e| StorageError::MountFailed {
                    path: mount_path.display().to_string(),
                    reason: format!("create mount directory: {e}"),
                })?;

            revert.add(move || async move {
                let _ = tokio::fs::remove_dir(&mount_path).await;
            });
        }

        // The controller sizes volumes in KiB.
        let size_kib = types::parse_byte_size(vol.config_size())? / 1024;

        let definition = self.resource_definition_name(vol);
        self.remote
            .spawn_resource_definition(&self.resource_group_name(), &definition, &[size_kib])
            .await
            .map_err(|e| {
                StorageError::Remote(format!("unable to spawn from resource group: {e}"))
            })?;
        debug!(definition, size_kib, "spawned resource definition for volume");

        // From here on the remote definition must not survive a failure.
        {
            let remote = self.remote.clone();
            let name = definition.clone();
            revert.add(move || async move {
                if let Err(e) = remote.delete_resource_definition(&name).await {
                    warn!(definition = name, error = %e, "rollback failed to delete resource definition");
                }
            });
        }

        self.make_volume_available(vol).await.map_err(|e| {
            StorageError::Remote(format!(
                "could not make volume available for filesystem creation: {e}"
            ))
        })?;
        let dev_path = self.device_path(vol).await?;

        if vol.content_type == ContentType::Filesystem {
            self.ops
                .make_filesystem(&dev_path, vol.config_block_filesystem())
                .await?;
        }

        // For VMs, also create the filesystem companion volume.
        if let Some(fs_vol) = vol.vm_block_filesystem_volume() {
            self.create_volume(&fs_vol, None).await?;

            let remote = self.remote.clone();
            let fs_definition = self.resource_definition_name(&fs_vol);
            let fs_mount_path = fs_vol.mount_path(&self.storage_root);
            revert.add(move || async move {
                if let Err(e) = remote.delete_resource_definition(&fs_definition).await {
                    warn!(definition = fs_definition, error = %e, "rollback failed to delete companion volume");
                }
                let _ = tokio::fs::remove_dir(&fs_mount_path).await;
            });
        }

        if let Some(filler) = filler {
            self.run_filler(vol, filler).await?;
        }

        Ok(())
    }

    /// Run the filler with exclusive access to the volume: mount it, invoke
    /// the callback, and tear the mount down again.
    async fn run_filler(&self, vol: &Volume, filler: VolumeFiller) -> Result<(), StorageError> {
        self.mount_volume(vol).await?;

        let result = async {
            let mount_path = vol.mount_path(&self.storage_root);

            let dev_path = if vol.content_type == ContentType::Block {
                Some(self.get_volume_disk_path(vol).await?)
            } else {
                None
            };

            (filler.fill)(&mount_path, dev_path.as_deref())?;

            // The device is larger than the image the filler wrote; put the
            // GPT backup header back at the true end of the disk.
            if vol.is_vm_block() {
                if let Some(dev) = dev_path.as_deref() {
                    self.ops.move_gpt_backup_header(dev).await?;
                }
            }

            Ok(())
        }
        .await;

        if let Err(e) = self.unmount_volume(vol, false).await {
            warn!(volume = vol.qualified_name(), error = %e, "failed to tear down scoped mount after filling");
        }

        result
    }
}

#[async_trait]
impl Driver for LinstorDriver {
    fn name(&self) -> &str {
        &self.pool
    }

    fn info(&self) -> DriverInfo {
        DriverInfo {
            name: "linstor".to_owned(),
            version: String::new(),
            volume_types: vec![
                VolumeType::Custom,
                VolumeType::Image,
                VolumeType::Container,
                VolumeType::VirtualMachine,
            ],
            default_vm_block_filesystem_size: DEFAULT_VM_BLOCK_FILESYSTEM_SIZE.to_owned(),
            remote: true,
            // DRBD uses an active/passive replication paradigm, so the same
            // volume cannot be used concurrently on multiple nodes.
            volume_multi_node: false,
            block_backing: true,
            buckets: false,
            direct_io: true,
            io_uring: true,
            preserves_inodes: false,
            mounted_root: false,
        }
    }

    async fn load(&self) -> Result<(), StorageError> {
        let mut loaded = self.loaded.lock().await;
        if *loaded {
            return Ok(());
        }

        // The DRBD module should already be loaded by the satellite service.
        let version = self.drbd_version().await?;
        if version.major < DRBD_MIN_MAJOR {
            return Err(StorageError::BackendUnavailable(format!(
                "LINSTOR requires DRBD version {DRBD_MIN_MAJOR}.0 to be loaded, got: {version}"
            )));
        }

        *loaded = true;
        info!(drbd = %version, "linstor driver loaded");
        Ok(())
    }

    fn validate(&self, config: &HashMap<String, String>) -> Result<(), StorageError> {
        for (key, value) in config {
            match key.as_str() {
                RESOURCE_GROUP_NAME_KEY
                | RESOURCE_GROUP_STORAGE_POOL_KEY
                | POOL_PRISTINE_KEY => {}
                RESOURCE_GROUP_PLACE_COUNT_KEY => {
                    value.parse::<u32>().map_err(|e| {
                        StorageError::validation(key, format!("must be an unsigned integer: {e}"))
                    })?;
                }
                _ => {
                    return Err(StorageError::validation(key, "unknown configuration key"));
                }
            }
        }
        Ok(())
    }

    fn fill_config(&self) -> Result<(), StorageError> {
        if self.cfg(RESOURCE_GROUP_NAME_KEY).unwrap_or_default().is_empty() {
            self.set_cfg(RESOURCE_GROUP_NAME_KEY, DEFAULT_RESOURCE_GROUP_NAME);
        }
        if self
            .cfg(RESOURCE_GROUP_PLACE_COUNT_KEY)
            .unwrap_or_default()
            .is_empty()
        {
            self.set_cfg(
                RESOURCE_GROUP_PLACE_COUNT_KEY,
                DEFAULT_RESOURCE_GROUP_PLACE_COUNT,
            );
        }
        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool))]
    async fn create(&self) -> Result<(), StorageError> {
        debug!("creating linstor storage pool");
        self.fill_config()?;

        let mut revert = Reverter::new();
        match self.create_inner(&mut revert).await {
            Ok(()) => {
                revert.success();
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(pool = %self.pool))]
    async fn delete(&self) -> Result<(), StorageError> {
        debug!("deleting linstor storage pool");

        let group_name = self.resource_group_name();
        match self.remote.get_resource_group(&group_name).await? {
            None => {
                warn!(group = group_name, "resource group does not exist");
            }
            Some(_) => {
                // Only remove the group when this instance owns it.
                if self.is_pristine() {
                    self.remote.delete_resource_group(&group_name).await?;
                    debug!(group = group_name, "deleted resource group");
                } else {
                    debug!(
                        group = group_name,
                        "resource group is not owned by this pool, skipping delete"
                    );
                }
            }
        }

        // Wipe everything under the pool's mount directory.
        let mount_path = self.pool_mount_path();
        if tokio::fs::metadata(&mount_path).await.is_ok() {
            tokio::fs::remove_dir_all(&mount_path)
                .await
                .map_err(|e| {
                    StorageError::Internal(format!(
                        "failed to wipe {}: {e}",
                        mount_path.display()
                    ))
                })?;
        }

        Ok(())
    }

    async fn mount(&self) -> Result<bool, StorageError> {
        // No pool-wide mount concept for this backend.
        Ok(true)
    }

    async fn unmount(&self) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn update(&self, _changed_config: &HashMap<String, String>) -> Result<(), StorageError> {
        Err(StorageError::NotSupported)
    }

    async fn get_resources(&self) -> Result<PoolResources, StorageError> {
        // Usage accounting is not implemented by this backend.
        Err(StorageError::NotSupported)
    }

    fn fill_volume_config(&self, _vol: &mut Volume) -> Result<(), StorageError> {
        // No volume-level keys beyond the generic ones.
        Ok(())
    }

    fn validate_volume(
        &self,
        _vol: &mut Volume,
        _remove_unknown_keys: bool,
    ) -> Result<(), StorageError> {
        Ok(())
    }

    #[instrument(skip(self, filler), fields(volume = %vol.qualified_name()))]
    async fn create_volume(
        &self,
        vol: &Volume,
        filler: Option<VolumeFiller>,
    ) -> Result<(), StorageError> {
        debug!("creating a new linstor volume");

        let mut revert = Reverter::new();
        match self.create_volume_inner(vol, filler, &mut revert).await {
            Ok(()) => {
                revert.success();
                Ok(())
            }
            Err(e) => {
                revert.fail().await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(volume = %vol.qualified_name()))]
    async fn delete_volume(&self, vol: &Volume) -> Result<(), StorageError> {
        debug!("deleting linstor volume");

        let exists = self
            .has_volume(vol)
            .await
            .map_err(|e| StorageError::Remote(format!("unable to check if volume exists: {e}")))?;

        if !exists {
            warn!("resource definition does not exist");
        } else {
            let definition = self.resource_definition_name(vol);
            self.remote
                .delete_resource_definition(&definition)
                .await
                .map_err(|e| {
                    StorageError::Remote(format!("unable to delete the resource definition: {e}"))
                })?;
        }

        // For VMs, also delete the filesystem companion volume, with the
        // same idempotence rule applied independently.
        if let Some(fs_vol) = vol.vm_block_filesystem_volume() {
            self.delete_volume(&fs_vol).await?;
        }

        if vol.content_type == ContentType::Filesystem {
            let mount_path = vol.mount_path(&self.storage_root);
            if tokio::fs::metadata(&mount_path).await.is_ok() {
                let _ = tokio::fs::remove_dir_all(&mount_path).await;
            }
        }

        Ok(())
    }

    async fn has_volume(&self, vol: &Volume) -> Result<bool, StorageError> {
        let definition = self.resource_definition_name(vol);
        Ok(self
            .remote
            .get_resource_definition(&definition)
            .await?
            .is_some())
    }

    async fn get_volume_disk_path(&self, vol: &Volume) -> Result<PathBuf, StorageError> {
        let custom_block =
            vol.vol_type == VolumeType::Custom && vol.content_type == ContentType::Block;
        if vol.is_vm_block() || custom_block {
            return self.device_path(vol).await;
        }

        Err(StorageError::NotSupported)
    }

    async fn list_volumes(&self) -> Result<Vec<String>, StorageError> {
        let group_name = self.resource_group_name();
        let prefix = format!("{group_name}-");

        let definitions = self.remote.list_resource_definitions().await?;
        Ok(definitions
            .into_iter()
            .filter(|d| d.resource_group_name == group_name)
            .filter_map(|d| d.name.strip_prefix(&prefix).map(str::to_owned))
            .collect())
    }

    #[instrument(skip(self), fields(volume = %vol.qualified_name()))]
    async fn mount_volume(&self, vol: &Volume) -> Result<(), StorageError> {
        debug!("mounting volume");
        let mut refcount = self.mounts.lock(&vol.mount_key()).await;

        self.make_volume_available(vol).await?;
        let dev_path = self.device_path(vol).await?;
        debug!(device = %dev_path.display(), "volume is available on node");

        match vol.content_type {
            ContentType::Filesystem => {
                let mount_path = vol.mount_path(&self.storage_root);
                if !self.ops.is_mountpoint(&mount_path).await {
                    tokio::fs::create_dir_all(&mount_path).await.map_err(|e| {
                        StorageError::MountFailed {
                            path: mount_path.display().to_string(),
                            reason: format!("create mount directory: {e}"),
                        }
                    })?;

                    let fstype = if vol.has_explicit_filesystem() {
                        vol.config_block_filesystem().to_owned()
                    } else {
                        self.ops.probe_filesystem(&dev_path).await?
                    };

                    let options: Vec<&str> =
                        vol.config_block_mount_options().split(',').collect();
                    let (flags, data) = resolve_mount_options(&options);

                    self.ops
                        .mount(&dev_path, &mount_path, &fstype, flags, &data)
                        .await?;
                    debug!(path = %mount_path.display(), fstype, "mounted linstor volume");
                }
            }
            ContentType::Block => {
                // For VMs, mount the filesystem companion volume.
                if let Some(fs_vol) = vol.vm_block_filesystem_volume() {
                    self.mount_volume(&fs_vol).await?;
                }
            }
        }

        // From here on it is up to the caller to call unmount_volume().
        *refcount += 1;
        debug!(refcount = *refcount, "volume mounted");
        Ok(())
    }

    #[instrument(skip(self), fields(volume = %vol.qualified_name()))]
    async fn unmount_volume(
        &self,
        vol: &Volume,
        keep_block_dev: bool,
    ) -> Result<bool, StorageError> {
        let mut refcount = self.mounts.lock(&vol.mount_key()).await;
        *refcount = refcount.saturating_sub(1);

        let mut our_unmount = false;
        let mount_path = vol.mount_path(&self.storage_root);

        if vol.content_type == ContentType::Filesystem
            && self.ops.is_mountpoint(&mount_path).await
        {
            if *refcount > 0 {
                debug!(refcount = *refcount, "skipping unmount as volume is in use");
                return Err(StorageError::InUse(vol.qualified_name()));
            }

            self.ops.unmount(&mount_path).await?;
            debug!(path = %mount_path.display(), keep_block_dev, "unmounted linstor volume");

            // This backend has no device deactivation step, so there is
            // nothing for keep_block_dev to keep.
            our_unmount = true;
        } else if vol.content_type == ContentType::Block {
            // For VMs, unmount the filesystem companion volume.
            if let Some(fs_vol) = vol.vm_block_filesystem_volume() {
                our_unmount = self.unmount_volume(&fs_vol, false).await?;
            }
        }

        Ok(our_unmount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ResourceDefinition;
    use nix::mount::MsFlags;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeRemote {
        groups: StdMutex<HashMap<String, ResourceGroup>>,
        definitions: StdMutex<HashMap<String, ResourceDefinition>>,
        sizes: StdMutex<HashMap<String, Vec<u64>>>,
    }

    #[async_trait]
    impl ResourceMapper for FakeRemote {
        async fn get_resource_group(
            &self,
            name: &str,
        ) -> Result<Option<ResourceGroup>, StorageError> {
            Ok(self.groups.lock().unwrap().get(name).cloned())
        }

        async fn create_resource_group(&self, group: &ResourceGroup) -> Result<(), StorageError> {
            self.groups
                .lock()
                .unwrap()
                .insert(group.name.clone(), group.clone());
            Ok(())
        }

        async fn delete_resource_group(&self, name: &str) -> Result<(), StorageError> {
            self.groups
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(format!("resource group {name}")))
        }

        async fn spawn_resource_definition(
            &self,
            group: &str,
            definition: &str,
            volume_sizes_kib: &[u64],
        ) -> Result<(), StorageError> {
            let mut definitions = self.definitions.lock().unwrap();
            if definitions.contains_key(definition) {
                return Err(StorageError::Remote(format!(
                    "resource definition {definition} already exists"
                )));
            }
            definitions.insert(
                definition.to_owned(),
                ResourceDefinition {
                    name: definition.to_owned(),
                    resource_group_name: group.to_owned(),
                },
            );
            self.sizes
                .lock()
                .unwrap()
                .insert(definition.to_owned(), volume_sizes_kib.to_vec());
            Ok(())
        }

        async fn get_resource_definition(
            &self,
            name: &str,
        ) -> Result<Option<ResourceDefinition>, StorageError> {
            Ok(self.definitions.lock().unwrap().get(name).cloned())
        }

        async fn list_resource_definitions(
            &self,
        ) -> Result<Vec<ResourceDefinition>, StorageError> {
            Ok(self.definitions.lock().unwrap().values().cloned().collect())
        }

        async fn delete_resource_definition(&self, name: &str) -> Result<(), StorageError> {
            self.sizes.lock().unwrap().remove(name);
            self.definitions
                .lock()
                .unwrap()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(format!("resource definition {name}")))
        }

        async fn make_available(&self, definition: &str, _node: &str) -> Result<(), StorageError> {
            if !self.definitions.lock().unwrap().contains_key(definition) {
                return Err(StorageError::NotFound(format!(
                    "resource definition {definition}"
                )));
            }
            Ok(())
        }

        async fn list_nodes(
            &self,
            definition: &str,
            _storage_pool: Option<&str>,
        ) -> Result<Vec<String>, StorageError> {
            if self.definitions.lock().unwrap().contains_key(definition) {
                Ok(vec!["node1".to_owned(), "node2".to_owned()])
            } else {
                Ok(Vec::new())
            }
        }

        async fn volume_device_path(
            &self,
            definition: &str,
            _node: &str,
            volume_index: u32,
        ) -> Result<PathBuf, StorageError> {
            Ok(PathBuf::from(format!(
                "/dev/drbd/by-res/{definition}/{volume_index}"
            )))
        }
    }

    #[derive(Default)]
    struct FakeMountOps {
        mounted: StdMutex<HashSet<PathBuf>>,
        formatted: StdMutex<Vec<(PathBuf, String)>>,
        physical_mounts: AtomicUsize,
        fail_mkfs: AtomicBool,
    }

    #[async_trait]
    impl MountOps for FakeMountOps {
        async fn is_mountpoint(&self, path: &Path) -> bool {
            self.mounted.lock().unwrap().contains(path)
        }

        async fn mount(
            &self,
            _device: &Path,
            target: &Path,
            _fstype: &str,
            _flags: MsFlags,
            _data: &str,
        ) -> Result<(), StorageError> {
            self.mounted.lock().unwrap().insert(target.to_path_buf());
            self.physical_mounts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<(), StorageError> {
            self.mounted.lock().unwrap().remove(target);
            Ok(())
        }

        async fn make_filesystem(
            &self,
            device: &Path,
            fstype: &str,
        ) -> Result<(), StorageError> {
            if self.fail_mkfs.load(Ordering::SeqCst) {
                return Err(StorageError::Internal("mkfs failed".into()));
            }
            self.formatted
                .lock()
                .unwrap()
                .push((device.to_path_buf(), fstype.to_owned()));
            Ok(())
        }

        async fn probe_filesystem(&self, _device: &Path) -> Result<String, StorageError> {
            Ok("ext4".to_owned())
        }

        async fn move_gpt_backup_header(&self, _device: &Path) -> Result<(), StorageError> {
            Ok(())
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        remote: Arc<FakeRemote>,
        ops: Arc<FakeMountOps>,
        driver: LinstorDriver,
    }

    fn harness_with_config(config: HashMap<String, String>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let remote = Arc::new(FakeRemote::default());
        let ops = Arc::new(FakeMountOps::default());

        let setup = DriverSetup::new("pool1", "node1", &root, config)
            .with_remote(remote.clone())
            .with_mount_ops(ops.clone());

        Harness {
            _tmp: tmp,
            root,
            remote,
            ops,
            driver: LinstorDriver::new(setup).unwrap(),
        }
    }

    fn harness() -> Harness {
        harness_with_config(HashMap::new())
    }

    fn fs_volume(name: &str, size: &str) -> Volume {
        let mut config = HashMap::new();
        config.insert(types::CONFIG_SIZE.to_owned(), size.to_owned());
        Volume::new(
            name,
            "default",
            VolumeType::Custom,
            ContentType::Filesystem,
            "pool1",
            config,
        )
    }

    fn vm_block_volume(name: &str, size: &str) -> Volume {
        let mut config = HashMap::new();
        config.insert(types::CONFIG_SIZE.to_owned(), size.to_owned());
        Volume::new(
            name,
            "default",
            VolumeType::VirtualMachine,
            ContentType::Block,
            "pool1",
            config,
        )
    }

    // -- load --------------------------------------------------------------

    #[tokio::test]
    async fn load_accepts_drbd_9() {
        let mut h = harness();
        let version_file = h.root.join("drbd_version");
        std::fs::write(&version_file, "9.2.8\n").unwrap();
        h.driver.drbd_version_path = version_file;

        h.driver.load().await.unwrap();
        // Idempotent.
        h.driver.load().await.unwrap();
    }

    #[tokio::test]
    async fn load_rejects_old_drbd() {
        let mut h = harness();
        let version_file = h.root.join("drbd_version");
        std::fs::write(&version_file, "8.4.11").unwrap();
        h.driver.drbd_version_path = version_file;

        let err = h.driver.load().await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn load_rejects_missing_module() {
        let mut h = harness();
        h.driver.drbd_version_path = h.root.join("missing");

        let err = h.driver.load().await.unwrap_err();
        assert!(matches!(err, StorageError::BackendUnavailable(_)));
    }

    // -- config ------------------------------------------------------------

    #[test]
    fn validate_accepts_known_keys() {
        let h = harness();
        let config = HashMap::from([
            (RESOURCE_GROUP_NAME_KEY.to_owned(), "incus".to_owned()),
            (RESOURCE_GROUP_PLACE_COUNT_KEY.to_owned(), "3".to_owned()),
            (RESOURCE_GROUP_STORAGE_POOL_KEY.to_owned(), "thin".to_owned()),
        ]);
        h.driver.validate(&config).unwrap();
    }

    #[test]
    fn validate_names_offending_key() {
        let h = harness();

        let config = HashMap::from([("zfs.pool_name".to_owned(), "x".to_owned())]);
        let err = h.driver.validate(&config).unwrap_err();
        assert!(matches!(err, StorageError::Validation { ref key, .. } if key == "zfs.pool_name"));

        let config =
            HashMap::from([(RESOURCE_GROUP_PLACE_COUNT_KEY.to_owned(), "many".to_owned())]);
        let err = h.driver.validate(&config).unwrap_err();
        assert!(
            matches!(err, StorageError::Validation { ref key, .. } if key == RESOURCE_GROUP_PLACE_COUNT_KEY)
        );
    }

    #[test]
    fn fill_config_applies_defaults() {
        let h = harness();
        h.driver.fill_config().unwrap();
        assert_eq!(h.driver.resource_group_name(), "incus");
        assert_eq!(
            h.driver.cfg(RESOURCE_GROUP_PLACE_COUNT_KEY).as_deref(),
            Some("2")
        );
    }

    // -- pool lifecycle ----------------------------------------------------

    #[tokio::test]
    async fn create_fresh_pool_marks_pristine_and_delete_removes_group() {
        let h = harness();

        h.driver.create().await.unwrap();
        assert!(h.remote.groups.lock().unwrap().contains_key("incus"));
        assert!(h.driver.is_pristine());

        h.driver.delete().await.unwrap();
        assert!(h.remote.groups.lock().unwrap().is_empty());

        // Deleting twice never errors.
        h.driver.delete().await.unwrap();
    }

    #[tokio::test]
    async fn create_adopts_existing_group_and_delete_leaves_it() {
        let h = harness();
        h.remote
            .groups
            .lock()
            .unwrap()
            .insert(
                "incus".to_owned(),
                ResourceGroup {
                    name: "incus".to_owned(),
                    description: String::new(),
                    select_filter: SelectFilter {
                        place_count: 3,
                        storage_pool: Some("thinpool".to_owned()),
                    },
                },
            );

        h.driver.create().await.unwrap();

        // Remote placement policy is mirrored into the local config.
        assert_eq!(
            h.driver.cfg(RESOURCE_GROUP_PLACE_COUNT_KEY).as_deref(),
            Some("3")
        );
        assert_eq!(
            h.driver.cfg(RESOURCE_GROUP_STORAGE_POOL_KEY).as_deref(),
            Some("thinpool")
        );
        assert!(!h.driver.is_pristine());

        // The group is borrowed, so delete leaves it intact.
        h.driver.delete().await.unwrap();
        assert!(h.remote.groups.lock().unwrap().contains_key("incus"));
    }

    #[tokio::test]
    async fn adoption_clears_stale_storage_pool_selector() {
        let h = harness_with_config(HashMap::from([(
            RESOURCE_GROUP_STORAGE_POOL_KEY.to_owned(),
            "poolA".to_owned(),
        )]));

        // The remote group exists but carries no storage-pool selector.
        h.remote.groups.lock().unwrap().insert(
            "incus".to_owned(),
            ResourceGroup {
                name: "incus".to_owned(),
                description: String::new(),
                select_filter: SelectFilter {
                    place_count: 2,
                    storage_pool: None,
                },
            },
        );

        h.driver.create().await.unwrap();

        // The stale local selector must not survive adoption, or it would
        // keep filtering node lookups against a pool the group ignores.
        assert_eq!(h.driver.cfg(RESOURCE_GROUP_STORAGE_POOL_KEY), None);
    }

    #[tokio::test]
    async fn pool_delete_wipes_mount_directory() {
        let h = harness();
        h.driver.create().await.unwrap();

        let pool_path = h.driver.pool_mount_path();
        std::fs::create_dir_all(pool_path.join("custom/default_v1")).unwrap();

        h.driver.delete().await.unwrap();
        assert!(!pool_path.exists());
    }

    // -- volume lifecycle --------------------------------------------------

    #[tokio::test]
    async fn create_filesystem_volume_spawns_definition_in_kib() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        assert_eq!(
            h.remote.sizes.lock().unwrap().get("incus-v1"),
            Some(&vec![1_048_576])
        );
        assert!(h.driver.has_volume(&vol).await.unwrap());

        // The device was formatted with the default filesystem.
        let formatted = h.ops.formatted.lock().unwrap();
        assert_eq!(formatted.len(), 1);
        assert_eq!(formatted[0].1, "ext4");

        // The mount directory exists but nothing is mounted yet.
        assert!(vol.mount_path(&h.root).is_dir());
        assert!(h.ops.mounted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_creation_leaves_no_orphans() {
        let h = harness();
        h.driver.create().await.unwrap();
        h.ops.fail_mkfs.store(true, Ordering::SeqCst);

        let vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap_err();

        // The revert stack removed both the remote definition and the local
        // mount directory.
        assert!(!h.driver.has_volume(&vol).await.unwrap());
        assert!(h.remote.definitions.lock().unwrap().is_empty());
        assert!(!vol.mount_path(&h.root).exists());
    }

    #[tokio::test]
    async fn vm_block_volume_gets_filesystem_companion() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = vm_block_volume("vm1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        let definitions = h.remote.definitions.lock().unwrap();
        assert!(definitions.contains_key("incus-vm1"));
        assert!(definitions.contains_key("incus-vm1.fs"));
        drop(definitions);

        // The companion is sized by the default VM filesystem size, in KiB.
        assert_eq!(
            h.remote.sizes.lock().unwrap().get("incus-vm1.fs"),
            Some(&vec![102_400])
        );

        // Exactly one device was formatted: the companion's. The block
        // parent stays raw.
        assert_eq!(h.ops.formatted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleting_vm_block_volume_deletes_companion() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = vm_block_volume("vm1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();
        h.driver.delete_volume(&vol).await.unwrap();

        assert!(h.remote.definitions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_missing_volume_is_not_an_error() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("ghost", "1GiB");
        assert!(!h.driver.has_volume(&vol).await.unwrap());
        h.driver.delete_volume(&vol).await.unwrap();
    }

    #[tokio::test]
    async fn list_volumes_filters_on_resource_group() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        // A definition owned by an unrelated group must not show up.
        h.remote.definitions.lock().unwrap().insert(
            "other-v9".to_owned(),
            ResourceDefinition {
                name: "other-v9".to_owned(),
                resource_group_name: "other".to_owned(),
            },
        );

        assert_eq!(h.driver.list_volumes().await.unwrap(), vec!["v1"]);
    }

    // -- mount / unmount ---------------------------------------------------

    #[tokio::test]
    async fn mount_refcounts_and_unmount_reports_in_use() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        // Two mounts: one physical mount, refcount 2.
        h.driver.mount_volume(&vol).await.unwrap();
        h.driver.mount_volume(&vol).await.unwrap();
        assert_eq!(h.ops.physical_mounts.load(Ordering::SeqCst), 1);
        assert_eq!(h.driver.mounts.refcount(&vol.mount_key()).await, 2);

        // First unmount: still held elsewhere, nothing detached.
        let err = h.driver.unmount_volume(&vol, false).await.unwrap_err();
        assert!(matches!(err, StorageError::InUse(_)));
        assert!(h.ops.is_mountpoint(&vol.mount_path(&h.root)).await);
        assert_eq!(h.driver.mounts.refcount(&vol.mount_key()).await, 1);

        // Second unmount: refcount reaches zero, physical unmount happens.
        assert!(h.driver.unmount_volume(&vol, false).await.unwrap());
        assert!(!h.ops.is_mountpoint(&vol.mount_path(&h.root)).await);
        assert_eq!(h.driver.mounts.refcount(&vol.mount_key()).await, 0);

        // Unmounting an unmounted volume changes nothing.
        assert!(!h.driver.unmount_volume(&vol, false).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_mounts_share_one_physical_mount() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        // Two racing mount calls serialize on the volume's mount lock: one
        // performs the physical mount, the other only takes a reference.
        let driver = Arc::new(h.driver);
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let driver = driver.clone();
                let vol = vol.clone();
                tokio::spawn(async move { driver.mount_volume(&vol).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(h.ops.physical_mounts.load(Ordering::SeqCst), 1);
        assert_eq!(driver.mounts.refcount(&vol.mount_key()).await, 2);
        assert!(h.ops.is_mountpoint(&vol.mount_path(&h.root)).await);
    }

    #[tokio::test]
    async fn mounting_vm_block_volume_mounts_companion() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = vm_block_volume("vm1", "1GiB");
        h.driver.create_volume(&vol, None).await.unwrap();

        h.driver.mount_volume(&vol).await.unwrap();

        let fs_vol = vol.vm_block_filesystem_volume().unwrap();
        assert!(h.ops.is_mountpoint(&fs_vol.mount_path(&h.root)).await);
        assert_eq!(h.driver.mounts.refcount(&vol.mount_key()).await, 1);
        assert_eq!(h.driver.mounts.refcount(&fs_vol.mount_key()).await, 1);

        // Unmount recurses into the companion.
        assert!(h.driver.unmount_volume(&vol, false).await.unwrap());
        assert!(!h.ops.is_mountpoint(&fs_vol.mount_path(&h.root)).await);
    }

    #[tokio::test]
    async fn filler_runs_under_scoped_mount() {
        let h = harness();
        h.driver.create().await.unwrap();

        let vol = fs_volume("v1", "1GiB");
        let seen: Arc<StdMutex<Option<PathBuf>>> = Arc::new(StdMutex::new(None));
        let seen_in_filler = seen.clone();

        let filler = VolumeFiller::new(move |mount_path, dev_path| {
            assert!(dev_path.is_none());
            *seen_in_filler.lock().unwrap() = Some(mount_path.to_path_buf());
            Ok(())
        });

        h.driver.create_volume(&vol, Some(filler)).await.unwrap();

        assert_eq!(
            seen.lock().unwrap().as_deref(),
            Some(vol.mount_path(&h.root).as_path())
        );

        // The scoped mount was torn down after filling.
        assert!(!h.ops.is_mountpoint(&vol.mount_path(&h.root)).await);
        assert_eq!(h.driver.mounts.refcount(&vol.mount_key()).await, 0);
    }

    // -- misc contract surface ---------------------------------------------

    #[tokio::test]
    async fn disk_path_only_for_vm_and_custom_block() {
        let h = harness();
        h.driver.create().await.unwrap();

        let fs_vol = fs_volume("v1", "1GiB");
        h.driver.create_volume(&fs_vol, None).await.unwrap();
        let err = h.driver.get_volume_disk_path(&fs_vol).await.unwrap_err();
        assert!(matches!(err, StorageError::NotSupported));

        let vm = vm_block_volume("vm1", "1GiB");
        h.driver.create_volume(&vm, None).await.unwrap();
        let path = h.driver.get_volume_disk_path(&vm).await.unwrap();
        assert_eq!(path, PathBuf::from("/dev/drbd/by-res/incus-vm1/0"));
    }

    #[tokio::test]
    async fn unsupported_operations() {
        let h = harness();
        assert!(matches!(
            h.driver.update(&HashMap::new()).await.unwrap_err(),
            StorageError::NotSupported
        ));
        assert!(matches!(
            h.driver.get_resources().await.unwrap_err(),
            StorageError::NotSupported
        ));

        // Pool mount/unmount trivially succeed.
        assert!(h.driver.mount().await.unwrap());
        assert!(h.driver.unmount().await.unwrap());
    }

    #[test]
    fn info_reports_active_passive_remote_backend() {
        let h = harness();
        let info = h.driver.info();
        assert_eq!(info.name, "linstor");
        assert!(info.remote);
        assert!(!info.volume_multi_node);
        assert!(info.block_backing);
        assert!(info.volume_types.contains(&VolumeType::VirtualMachine));
    }
}
