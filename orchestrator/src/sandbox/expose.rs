//! Port exposure by container recreation.
//!
//! The runtime cannot add host-port bindings to a running container, so
//! exposing a port means: allocate, stop, remove, recreate with the merged
//! binding set and the data volume attached, then wait for the agent to
//! re-register. Expose calls are serialized per sandbox.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::SandboxLive;
use crate::container::{container_name, ContainerSpec};
use crate::error::{Error, Result};
use crate::sandbox::SandboxManager;

const AGENT_RECONNECT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposeResponse {
    pub host_port: u16,
    pub url: String,
    /// Whether the agent re-registered within the wait window. An
    /// observable, not a failure: the mapping is live either way.
    pub agent_reconnected: bool,
}

impl SandboxManager {
    /// Expose `container_port` on a stable host port. Idempotent: an
    /// existing mapping is returned without touching the container.
    pub async fn expose(&self, sandbox_id: Uuid, container_port: u16) -> Result<ExposeResponse> {
        let lock = self.expose_locks.entry(sandbox_id).or_default().clone();
        let _guard = lock.lock().await;

        let live = self
            .cache
            .get_live(sandbox_id)
            .await?
            .ok_or_else(|| Error::NotFound("sandbox not found".into()))?;

        if let Some(host_port) = self.ports.lookup(sandbox_id, container_port).await? {
            return Ok(ExposeResponse {
                host_port,
                url: self.config.exposed_url(host_port),
                agent_reconnected: self.hub.agent_connected(sandbox_id).await,
            });
        }

        let host_port = self
            .ports
            .allocate(sandbox_id, container_port, live.ttl_secs())
            .await?;

        let container_id = self.recreate_with_ports(&live).await?;
        if let Err(e) = self.cache.set_live_container(sandbox_id, &container_id).await {
            warn!(sandbox_id = %sandbox_id, "live record container-id update failed: {e}");
        }

        let agent_reconnected = self.hub.wait_for_agent(sandbox_id, AGENT_RECONNECT_WAIT).await;

        info!(
            sandbox_id = %sandbox_id,
            container_port,
            host_port,
            agent_reconnected,
            "port exposed"
        );
        Ok(ExposeResponse {
            host_port,
            url: self.config.exposed_url(host_port),
            agent_reconnected,
        })
    }

    /// Replace the sandbox container with one carrying every allocated port
    /// binding plus the data volume. Environment, labels and workdir are
    /// carried over from the running container so the agent token survives;
    /// resource limits are recomputed from the tier, which composed them in
    /// the first place.
    ///
    /// Once the old container is stopped, any failure leaves the sandbox
    /// without a usable container: surfaced as ExposeFailed, caller
    /// destroys.
    async fn recreate_with_ports(&self, live: &SandboxLive) -> Result<String> {
        let name = container_name(live.sandbox_id);

        let volume = self.containers.ensure_data_volume(live.sandbox_id).await?;
        let inspect = self
            .containers
            .inspect(&name)
            .await?
            .ok_or_else(|| Error::ExposeFailed("sandbox container is missing".into()))?;
        let captured = inspect.config.unwrap_or_default();

        // The allocator has already recorded the new mapping, so the hash
        // holds the full merged set.
        let port_bindings = self.ports.snapshot(live.sandbox_id).await?;

        self.containers
            .stop_and_remove(&name)
            .await
            .map_err(|e| Error::ExposeFailed(e.to_string()))?;

        let spec = ContainerSpec {
            sandbox_id: live.sandbox_id,
            image: captured.image.unwrap_or_else(|| live.image.clone()),
            env: captured.env.unwrap_or_default(),
            tier: live.tier,
            port_bindings,
            data_volume: Some(volume),
            labels: captured.labels.unwrap_or_default(),
            working_dir: captured.working_dir.unwrap_or_else(|| "/app".to_string()),
        };

        self.containers
            .create_and_start(&spec)
            .await
            .map_err(|e| Error::ExposeFailed(e.to_string()))
    }
}
