//! Background sweeps: expired sandboxes, orphaned containers and volumes,
//! stale port allocations. Every sweep is idempotent and keeps going past
//! per-item failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared_types::Tier;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{Cache, PORTS_KEY_PATTERN};
use crate::container::{container_name, ContainerManager};
use crate::db::{Db, SandboxRow, SandboxStatus};
use crate::ports::PortAllocator;
use crate::rpc::RpcHub;

/// Containers younger than this are skipped by the orphan sweep: a sandbox
/// mid-create has a container before it has a live record.
fn orphan_grace() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

pub struct Reaper {
    db: Db,
    cache: Cache,
    containers: ContainerManager,
    ports: PortAllocator,
    hub: Arc<RpcHub>,
    interval: Duration,
}

fn tier_of(row: &SandboxRow) -> Tier {
    row.metadata
        .get("tier")
        .and_then(|v| v.as_str())
        .and_then(Tier::parse)
        .unwrap_or_default()
}

impl Reaper {
    pub fn new(
        db: Db,
        cache: Cache,
        containers: ContainerManager,
        ports: PortAllocator,
        hub: Arc<RpcHub>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            cache,
            containers,
            ports,
            hub,
            interval,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // first tick is immediate; skip it
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    /// One full pass over all three sweeps.
    pub async fn sweep(&self) {
        if let Err(e) = self.sweep_expired().await {
            warn!("expired-sandbox sweep failed: {e}");
        }
        if let Err(e) = self.sweep_orphan_containers().await {
            warn!("orphan-container sweep failed: {e}");
        }
        if let Err(e) = self.sweep_orphan_ports().await {
            warn!("orphan-port sweep failed: {e}");
        }
    }

    /// Flip sandboxes past their tier lifetime to `expired` and reclaim
    /// their resources.
    async fn sweep_expired(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        let shortest_lifetime =
            chrono::Duration::hours(Tier::Free.limits().lifetime_hours as i64);
        let candidates = self.db.list_active_older_than(now - shortest_lifetime).await?;

        for row in candidates {
            let lifetime = chrono::Duration::hours(tier_of(&row).limits().lifetime_hours as i64);
            if now - row.created_at <= lifetime {
                continue;
            }
            info!(sandbox_id = %row.id, "sandbox lifetime elapsed, expiring");
            self.reclaim(row.id).await;
            match self.db.update_sandbox_status(row.id, SandboxStatus::Expired).await {
                Ok(_) => {}
                Err(e) => warn!(sandbox_id = %row.id, "failed to mark sandbox expired: {e}"),
            }
        }
        Ok(())
    }

    async fn reclaim(&self, sandbox_id: Uuid) {
        self.hub.close_sandbox(sandbox_id).await;
        if let Err(e) = self
            .containers
            .stop_and_remove(&container_name(sandbox_id))
            .await
        {
            warn!(sandbox_id = %sandbox_id, "container removal failed: {e}");
        }
        if let Err(e) = self.ports.release_all(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "port release failed: {e}");
        }
        if let Err(e) = self.containers.remove_data_volume(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "volume removal failed: {e}");
        }
        if let Err(e) = self.cache.del_live(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "live record purge failed: {e}");
        }
    }

    /// Remove labelled containers whose live record no longer exists.
    async fn sweep_orphan_containers(&self) -> crate::error::Result<()> {
        let now = Utc::now();
        for container in self.containers.list_labelled().await? {
            let Some(sandbox_id) = container.sandbox_id else {
                warn!(container_id = %container.container_id, "sandbox label is unparseable, skipping");
                continue;
            };
            if container
                .created
                .is_some_and(|created| now - created < orphan_grace())
            {
                continue;
            }
            if self.cache.get_live(sandbox_id).await?.is_some() {
                continue;
            }

            info!(sandbox_id = %sandbox_id, "reclaiming orphaned container");
            if let Err(e) = self.containers.stop_and_remove(&container.container_id).await {
                warn!(sandbox_id = %sandbox_id, "orphan container removal failed: {e}");
            }
            if let Err(e) = self.containers.remove_data_volume(sandbox_id).await {
                warn!(sandbox_id = %sandbox_id, "orphan volume removal failed: {e}");
            }
        }
        Ok(())
    }

    /// Release port allocations whose sandbox live record is gone.
    async fn sweep_orphan_ports(&self) -> crate::error::Result<()> {
        for key in self.cache.scan_keys(PORTS_KEY_PATTERN).await? {
            let Some(sandbox_id) = Cache::sandbox_id_from_ports_key(&key) else {
                continue;
            };
            if self.cache.get_live(sandbox_id).await?.is_some() {
                continue;
            }
            info!(sandbox_id = %sandbox_id, "releasing orphaned port allocations");
            if let Err(e) = self.ports.release_all(sandbox_id).await {
                warn!(sandbox_id = %sandbox_id, "orphan port release failed: {e}");
            }
        }
        Ok(())
    }
}
