//! Resource-Mapping Client for the remote SDS controller.
//!
//! [`ResourceMapper`] is the adapter surface the reference backend programs
//! against: generic "create N KiB of storage" calls expressed in the remote
//! controller's object model (resource group → resource definition → per-node
//! volume). [`LinstorClient`] implements it over the LINSTOR controller's
//! HTTP REST API, optionally with TLS server verification and mutual TLS.
//!
//! "Not found" is a distinguished condition on this surface: the get
//! operations return `Ok(None)` so callers answering existence questions
//! never have to dissect an error.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// Wire model
// ---------------------------------------------------------------------------

/// Placement policy of a resource group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectFilter {
    /// Number of diskful replicas to place.
    #[serde(default)]
    pub place_count: u32,
    /// Controller-side storage pool the replicas are placed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<String>,
}

/// A named pool of placement policy from which volumes are spawned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Resource group name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Placement policy.
    #[serde(default)]
    pub select_filter: SelectFilter,
}

/// One volume's identity and size, independent of which node hosts it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefinition {
    /// Resource definition name.
    pub name: String,
    /// Name of the resource group this definition was spawned from.
    #[serde(default)]
    pub resource_group_name: String,
}

#[derive(Serialize)]
struct SpawnRequest<'a> {
    resource_definition_name: &'a str,
    volume_sizes: &'a [u64],
}

#[derive(Serialize)]
struct MakeAvailableRequest {
    diskful: bool,
}

#[derive(Deserialize)]
struct Resource {
    node_name: String,
}

#[derive(Deserialize)]
struct VolumeDetail {
    #[serde(default)]
    device_path: Option<String>,
}

#[derive(Deserialize)]
struct ControllerVersion {
    #[serde(default)]
    version: String,
}

// ---------------------------------------------------------------------------
// Mapper trait
// ---------------------------------------------------------------------------

/// Adapter from generic storage requests to the remote controller's object
/// model. Sizes are in KiB, matching the controller's unit.
#[async_trait]
pub trait ResourceMapper: Send + Sync {
    /// Fetch a resource group; `Ok(None)` when it does not exist.
    async fn get_resource_group(&self, name: &str)
    -> Result<Option<ResourceGroup>, StorageError>;

    /// Create a new resource group.
    async fn create_resource_group(&self, group: &ResourceGroup) -> Result<(), StorageError>;

    /// Delete a resource group.
    async fn delete_resource_group(&self, name: &str) -> Result<(), StorageError>;

    /// Spawn a resource definition of the given per-volume sizes from a
    /// resource group.
    async fn spawn_resource_definition(
        &self,
        group: &str,
        definition: &str,
        volume_sizes_kib: &[u64],
    ) -> Result<(), StorageError>;

    /// Fetch a resource definition; `Ok(None)` when it does not exist.
    async fn get_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<ResourceDefinition>, StorageError>;

    /// List all resource definitions known to the controller.
    async fn list_resource_definitions(&self) -> Result<Vec<ResourceDefinition>, StorageError>;

    /// Delete a resource definition.
    async fn delete_resource_definition(&self, name: &str) -> Result<(), StorageError>;

    /// Ensure the resource definition is usable on `node` (activate a
    /// replica, diskless if necessary).
    async fn make_available(&self, definition: &str, node: &str) -> Result<(), StorageError>;

    /// List the nodes currently holding `definition`, optionally restricted
    /// to a controller-side storage pool.
    async fn list_nodes(
        &self,
        definition: &str,
        storage_pool: Option<&str>,
    ) -> Result<Vec<String>, StorageError>;

    /// Resolve the local device path of one volume of `definition` on `node`.
    async fn volume_device_path(
        &self,
        definition: &str,
        node: &str,
        volume_index: u32,
    ) -> Result<PathBuf, StorageError>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// [`ResourceMapper`] implementation over the LINSTOR controller REST API.
#[derive(Debug)]
pub struct LinstorClient {
    base_url: reqwest::Url,
    http: reqwest::Client,
}

impl LinstorClient {
    /// Connect to the controller at `controller_url`.
    ///
    /// * `ca_cert_pem` — optional CA certificate used to verify the server
    /// * `client_cert_pem` / `client_key_pem` — optional client pair for
    ///   mutual TLS; both must be given together
    ///
    /// The connection is verified by fetching the controller version, which
    /// also surfaces authentication problems at pool-setup time instead of on
    /// the first volume operation.
    pub async fn connect(
        controller_url: &str,
        ca_cert_pem: Option<&str>,
        client_cert_pem: Option<&str>,
        client_key_pem: Option<&str>,
    ) -> Result<Self, StorageError> {
        let client = Self::new(controller_url, ca_cert_pem, client_cert_pem, client_key_pem)?;

        let version: ControllerVersion = client
            .get_required("v1/controller/version")
            .await
            .map_err(|e| {
                StorageError::BackendUnavailable(format!(
                    "controller at {controller_url} is unreachable: {e}"
                ))
            })?;
        info!(controller = controller_url, version = %version.version, "connected to controller");

        Ok(client)
    }

    /// Build a client without probing the controller.
    pub fn new(
        controller_url: &str,
        ca_cert_pem: Option<&str>,
        client_cert_pem: Option<&str>,
        client_key_pem: Option<&str>,
    ) -> Result<Self, StorageError> {
        let mut base_url = reqwest::Url::parse(controller_url).map_err(|e| {
            StorageError::BackendUnavailable(format!("invalid controller URL {controller_url:?}: {e}"))
        })?;

        // Url::join resolves relative to the last `/`, so a base like
        // `https://host/linstor` would lose its path prefix without this.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut builder = reqwest::Client::builder();

        if let Some(ca) = ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(ca.as_bytes())
                .map_err(|e| StorageError::BackendUnavailable(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }

        match (client_cert_pem, client_key_pem) {
            (Some(cert), Some(key)) => {
                let mut pem = Vec::with_capacity(cert.len() + key.len() + 1);
                pem.extend_from_slice(cert.as_bytes());
                pem.push(b'\n');
                pem.extend_from_slice(key.as_bytes());
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    StorageError::BackendUnavailable(format!("invalid client certificate pair: {e}"))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::BackendUnavailable(
                    "client certificate and key must be provided together".into(),
                ));
            }
        }

        let http = builder
            .build()
            .map_err(|e| StorageError::BackendUnavailable(format!("HTTP client setup failed: {e}")))?;

        Ok(Self { base_url, http })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url, StorageError> {
        self.base_url
            .join(path)
            .map_err(|e| StorageError::Internal(format!("bad request path {path:?}: {e}")))
    }

    /// Reject non-2xx responses, carrying the controller's body text for
    /// diagnosis.
    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StorageError::Remote(format!(
            "controller returned {status}: {}",
            body.trim()
        )))
    }

    /// GET that distinguishes 404 as `Ok(None)`.
    async fn get_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StorageError> {
        let resp = self
            .http
            .get(self.url(path)?)
            .send()
            .await
            .map_err(StorageError::remote)?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!(path, "controller object not found");
            return Ok(None);
        }

        let resp = Self::check(resp).await?;
        resp.json().await.map(Some).map_err(StorageError::remote)
    }

    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T, StorageError> {
        self.get_opt(path)
            .await?
            .ok_or_else(|| StorageError::NotFound(path.to_owned()))
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<(), StorageError> {
        let resp = self
            .http
            .post(self.url(path)?)
            .json(body)
            .send()
            .await
            .map_err(StorageError::remote)?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let resp = self
            .http
            .delete(self.url(path)?)
            .send()
            .await
            .map_err(StorageError::remote)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(path.to_owned()));
        }
        Self::check(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl ResourceMapper for LinstorClient {
    async fn get_resource_group(
        &self,
        name: &str,
    ) -> Result<Option<ResourceGroup>, StorageError> {
        self.get_opt(&format!("v1/resource-groups/{name}")).await
    }

    async fn create_resource_group(&self, group: &ResourceGroup) -> Result<(), StorageError> {
        self.post_json("v1/resource-groups", group).await
    }

    async fn delete_resource_group(&self, name: &str) -> Result<(), StorageError> {
        self.delete(&format!("v1/resource-groups/{name}")).await
    }

    async fn spawn_resource_definition(
        &self,
        group: &str,
        definition: &str,
        volume_sizes_kib: &[u64],
    ) -> Result<(), StorageError> {
        self.post_json(
            &format!("v1/resource-groups/{group}/spawn"),
            &SpawnRequest {
                resource_definition_name: definition,
                volume_sizes: volume_sizes_kib,
            },
        )
        .await
    }

    async fn get_resource_definition(
        &self,
        name: &str,
    ) -> Result<Option<ResourceDefinition>, StorageError> {
        self.get_opt(&format!("v1/resource-definitions/{name}")).await
    }

    async fn list_resource_definitions(&self) -> Result<Vec<ResourceDefinition>, StorageError> {
        self.get_required("v1/resource-definitions").await
    }

    async fn delete_resource_definition(&self, name: &str) -> Result<(), StorageError> {
        self.delete(&format!("v1/resource-definitions/{name}")).await
    }

    async fn make_available(&self, definition: &str, node: &str) -> Result<(), StorageError> {
        self.post_json(
            &format!("v1/resource-definitions/{definition}/resources/{node}/make-available"),
            &MakeAvailableRequest { diskful: false },
        )
        .await
    }

    async fn list_nodes(
        &self,
        definition: &str,
        storage_pool: Option<&str>,
    ) -> Result<Vec<String>, StorageError> {
        let mut path = format!("v1/resource-definitions/{definition}/resources");
        if let Some(pool) = storage_pool {
            path.push_str(&format!("?storage_pools={pool}"));
        }

        let resources: Vec<Resource> = self.get_opt(&path).await?.unwrap_or_default();
        Ok(resources.into_iter().map(|r| r.node_name).collect())
    }

    async fn volume_device_path(
        &self,
        definition: &str,
        node: &str,
        volume_index: u32,
    ) -> Result<PathBuf, StorageError> {
        let detail: VolumeDetail = self
            .get_required(&format!(
                "v1/resource-definitions/{definition}/resources/{node}/volumes/{volume_index}"
            ))
            .await?;

        let path = detail.device_path.ok_or_else(|| {
            StorageError::Remote(format!(
                "no device path reported for {definition} volume {volume_index} on {node}"
            ))
        })?;
        Ok(PathBuf::from(path))
    }
}
