//! Sandbox lifecycle orchestration: create, destroy, status, ports, stats.
//!
//! Owns the live record and the container resource; the expose and execute
//! flows live in the sibling modules and extend this manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use shared_types::{PortMapping, ResourceLimits, Tier};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{AgentTokenKind, AuthGate, KeyIdentity};
use crate::cache::{Cache, SandboxLive};
use crate::config::Config;
use crate::container::{container_name, ContainerManager, ContainerSpec, ContainerStats};
use crate::db::{Db, SandboxRow, SandboxStatus};
use crate::error::{Error, Result};
use crate::ports::PortAllocator;
use crate::quota::QuotaManager;
use crate::rpc::RpcHub;

pub mod execute;
pub mod expose;

#[derive(Clone)]
pub struct SandboxManager {
    pub(crate) db: Db,
    pub(crate) cache: Cache,
    pub(crate) containers: ContainerManager,
    pub(crate) ports: PortAllocator,
    pub(crate) hub: Arc<RpcHub>,
    pub(crate) auth: AuthGate,
    pub(crate) quota: QuotaManager,
    pub(crate) config: Arc<Config>,
    /// Serializes expose recreations per sandbox.
    pub(crate) expose_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    pub sandbox_id: Uuid,
    pub agent_url: String,
    pub tier: Tier,
    pub resource_limits: ResourceLimits,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub sandbox_id: Uuid,
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub container_status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub resource: &'static str,
    pub level: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub stats: ContainerStats,
    pub resource_limits: ResourceLimits,
    pub violations: Vec<Violation>,
    pub recommendations: Vec<&'static str>,
    pub tier: Tier,
}

impl SandboxManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Db,
        cache: Cache,
        containers: ContainerManager,
        ports: PortAllocator,
        hub: Arc<RpcHub>,
        auth: AuthGate,
        quota: QuotaManager,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            cache,
            containers,
            ports,
            hub,
            auth,
            quota,
            config,
            expose_locks: Arc::new(DashMap::new()),
        }
    }

    /// Load a sandbox row and verify the caller owns it.
    pub async fn get_owned(&self, sandbox_id: Uuid, user_id: Uuid) -> Result<SandboxRow> {
        let row = self
            .db
            .get_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| Error::NotFound("sandbox not found".into()))?;
        self.auth.authorize_sandbox(&row, user_id)?;
        Ok(row)
    }

    /// Provision a sandbox: admission check, agent token, container, then
    /// the persistent row and the live record. Any failure after container
    /// creation tears the container back down.
    pub async fn create(
        &self,
        identity: &KeyIdentity,
        tier: Tier,
        allow_unauthenticated: bool,
    ) -> Result<CreateResponse> {
        let sandbox_id = Uuid::new_v4();

        self.quota
            .check_admission(identity.user_id, identity.credential_id, tier)
            .await?;

        let agent_token = self.auth.mint_agent_token(
            sandbox_id,
            AgentTokenKind::Agent,
            Some(identity.user_id),
            Some(tier),
        )?;

        let spec = ContainerSpec::for_new_sandbox(
            sandbox_id,
            tier,
            &self.config.agent_image,
            &self.config.ws_base(),
            &agent_token,
        );
        // create_and_start cleans up after its own failures
        let container_id = self.containers.create_and_start(&spec).await?;

        let created_at = Utc::now();
        let limits = tier.limits();
        let expires_at = created_at + chrono::Duration::hours(limits.lifetime_hours as i64);
        let metadata = serde_json::json!({ "tier": tier });

        if let Err(e) = self
            .db
            .insert_sandbox(sandbox_id, identity.user_id, identity.credential_id, &metadata)
            .await
        {
            self.abort_create(sandbox_id).await;
            return Err(e);
        }

        let live = SandboxLive {
            sandbox_id,
            user_id: identity.user_id,
            credential_id: identity.credential_id,
            container_id,
            tier,
            image: self.config.agent_image.clone(),
            resource_limits: ResourceLimits::for_tier(tier),
            created_at,
            expires_at,
            allow_unauthenticated,
        };
        if let Err(e) = self.cache.put_live(&live).await {
            self.abort_create(sandbox_id).await;
            self.db
                .update_sandbox_status(sandbox_id, SandboxStatus::Destroyed)
                .await
                .ok();
            return Err(e);
        }

        info!(sandbox_id = %sandbox_id, tier = %tier, "sandbox created");
        Ok(CreateResponse {
            sandbox_id,
            agent_url: self.config.agent_url(&sandbox_id.to_string()),
            tier,
            resource_limits: live.resource_limits,
            expires_at,
        })
    }

    async fn abort_create(&self, sandbox_id: Uuid) {
        if let Err(e) = self.containers.stop_and_remove(&container_name(sandbox_id)).await {
            warn!(sandbox_id = %sandbox_id, "cleanup of partially created container failed: {e}");
        }
    }

    /// Tear a sandbox down. Every step short of the status flip tolerates
    /// resources that are already gone; the flip itself must land.
    pub async fn destroy(&self, sandbox_id: Uuid) -> Result<()> {
        let row = self
            .db
            .get_sandbox(sandbox_id)
            .await?
            .ok_or_else(|| Error::NotFound("sandbox not found".into()))?;
        if !row.is_active() {
            return Err(Error::NotFound("sandbox not found".into()));
        }

        self.hub.close_sandbox(sandbox_id).await;

        let name = container_name(sandbox_id);
        if let Err(e) = self.containers.stop_and_remove(&name).await {
            warn!(sandbox_id = %sandbox_id, "container teardown failed: {e}");
        }
        if let Err(e) = self.ports.release_all(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "port release failed: {e}");
        }
        if let Err(e) = self.containers.remove_data_volume(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "data volume removal failed: {e}");
        }

        // Purge the live record before the status flip: a live key must
        // never outlive an active row.
        if let Err(e) = self.cache.del_live(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "live record purge failed: {e}");
        }

        let updated = self
            .db
            .update_sandbox_status(sandbox_id, SandboxStatus::Destroyed)
            .await?;
        if !updated {
            // A concurrent destroy or the reaper won the transition.
            return Err(Error::NotFound("sandbox not found".into()));
        }
        self.expose_locks.remove(&sandbox_id);

        info!(sandbox_id = %sandbox_id, "sandbox destroyed");
        Ok(())
    }

    pub async fn status(&self, row: &SandboxRow) -> Result<StatusResponse> {
        let container_status = match self.cache.get_live(row.id).await? {
            Some(_) => self
                .containers
                .inspect(&container_name(row.id))
                .await?
                .and_then(|i| i.state)
                .and_then(|s| s.status)
                .map(|s| s.to_string()),
            None => None,
        };

        Ok(StatusResponse {
            sandbox_id: row.id,
            connected: self.hub.agent_connected(row.id).await,
            created_at: row.created_at,
            status: row.status.clone(),
            container_status,
        })
    }

    pub async fn list_ports(&self, row: &SandboxRow) -> Result<Vec<PortMapping>> {
        if !row.is_active() {
            return Err(Error::NotFound("sandbox not found".into()));
        }
        let mut ports: Vec<PortMapping> = self
            .ports
            .snapshot(row.id)
            .await?
            .into_iter()
            .map(|(container_port, host_port)| PortMapping {
                container_port,
                host_port,
                url: self.config.exposed_url(host_port),
            })
            .collect();
        ports.sort_by_key(|p| p.container_port);
        Ok(ports)
    }

    pub async fn stats(&self, row: &SandboxRow) -> Result<StatsResponse> {
        if !row.is_active() {
            return Err(Error::NotFound("sandbox not found".into()));
        }
        let live = self
            .cache
            .get_live(row.id)
            .await?
            .ok_or_else(|| Error::NotFound("sandbox not found".into()))?;

        let stats = self.containers.point_stats(&container_name(row.id)).await?;

        Ok(StatsResponse {
            stats,
            resource_limits: live.resource_limits,
            violations: violations_for(&stats),
            recommendations: recommendations_for(&stats),
            tier: live.tier,
        })
    }
}

const HIGH_NETWORK_BYTES: u64 = 100 * 1024 * 1024;

/// Threshold violations, worst first.
pub fn violations_for(stats: &ContainerStats) -> Vec<Violation> {
    let mut out = Vec::new();
    if stats.memory_percent > 95.0 {
        out.push(Violation {
            resource: "memory",
            level: "critical",
            message: format!("memory at {:.1}% of limit", stats.memory_percent),
        });
    } else if stats.memory_percent > 90.0 {
        out.push(Violation {
            resource: "memory",
            level: "warning",
            message: format!("memory at {:.1}% of limit", stats.memory_percent),
        });
    }
    if stats.cpu_percent > 90.0 {
        out.push(Violation {
            resource: "cpu",
            level: "warning",
            message: format!("cpu at {:.1}%", stats.cpu_percent),
        });
    }
    out
}

pub fn recommendations_for(stats: &ContainerStats) -> Vec<&'static str> {
    let mut out = Vec::new();
    if stats.memory_percent > 80.0 {
        out.push("consider increasing the memory limit");
    } else if stats.memory_percent < 20.0 {
        out.push("consider decreasing the memory limit");
    }
    if stats.cpu_percent > 80.0 {
        out.push("cpu contention: consider a higher tier");
    }
    if stats.rx_bytes + stats.tx_bytes > HIGH_NETWORK_BYTES {
        out.push("high network usage");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(memory_percent: f64, cpu_percent: f64, net: u64) -> ContainerStats {
        ContainerStats {
            memory_usage_bytes: 0,
            memory_limit_bytes: 0,
            memory_percent,
            cpu_percent,
            rx_bytes: net / 2,
            tx_bytes: net - net / 2,
        }
    }

    #[test]
    fn violations_escalate_with_memory_pressure() {
        assert!(violations_for(&stats(50.0, 50.0, 0)).is_empty());

        let warn = violations_for(&stats(92.0, 0.0, 0));
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].level, "warning");

        let critical = violations_for(&stats(97.0, 95.0, 0));
        assert_eq!(critical.len(), 2);
        assert_eq!(critical[0].resource, "memory");
        assert_eq!(critical[0].level, "critical");
        assert_eq!(critical[1].resource, "cpu");
        assert_eq!(critical[1].level, "warning");
    }

    #[test]
    fn recommendations_cover_both_extremes() {
        let low = recommendations_for(&stats(10.0, 10.0, 0));
        assert_eq!(low, vec!["consider decreasing the memory limit"]);

        let high = recommendations_for(&stats(85.0, 85.0, 200 * 1024 * 1024));
        assert!(high.contains(&"consider increasing the memory limit"));
        assert!(high.contains(&"cpu contention: consider a higher tier"));
        assert!(high.contains(&"high network usage"));

        assert!(recommendations_for(&stats(50.0, 50.0, 0)).is_empty());
    }
}
