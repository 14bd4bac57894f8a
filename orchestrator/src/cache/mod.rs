//! Ephemeral store: redis-backed TTL key/value, hashes, counters, and the
//! set-if-absent primitive the port allocator builds on.
//!
//! Key schema:
//! - `sandbox:live:<id>`  — JSON [`SandboxLive`], TTL = tier lifetime
//! - `sandbox:ports:<id>` — hash, container port → host port
//! - `port:<p>`           — JSON [`PortAllocation`], owner of host port p
//! - `ports:next`         — rolling allocation counter

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use shared_types::{ResourceLimits, Tier};
use uuid::Uuid;

use crate::error::Result;

/// The request-time projection of a sandbox. Exists only while the
/// persistent row is `active`; expires with the tier lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxLive {
    pub sandbox_id: Uuid,
    pub user_id: Uuid,
    pub credential_id: Uuid,
    pub container_id: String,
    pub tier: Tier,
    pub image: String,
    pub resource_limits: ResourceLimits,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub allow_unauthenticated: bool,
}

impl SandboxLive {
    /// Seconds until expiry, clamped to at least one so a write close to
    /// the deadline still lands with a TTL redis accepts.
    pub fn ttl_secs(&self) -> u64 {
        (self.expires_at - Utc::now()).num_seconds().max(1) as u64
    }
}

/// Ownership record for one allocated host port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocation {
    pub sandbox_id: Uuid,
    pub container_port: u16,
    pub allocated_at: DateTime<Utc>,
}

fn live_key(sandbox_id: Uuid) -> String {
    format!("sandbox:live:{sandbox_id}")
}

fn ports_key(sandbox_id: Uuid) -> String {
    format!("sandbox:ports:{sandbox_id}")
}

fn port_key(host_port: u16) -> String {
    format!("port:{host_port}")
}

pub const PORTS_KEY_PATTERN: &str = "sandbox:ports:*";
const COUNTER_KEY: &str = "ports:next";

#[derive(Clone)]
pub struct Cache {
    manager: ConnectionManager,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // SandboxLive records
    // ------------------------------------------------------------------

    pub async fn put_live(&self, live: &SandboxLive) -> Result<()> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(live).map_err(anyhow::Error::from)?;
        let _: () = conn
            .set_ex(live_key(live.sandbox_id), json, live.ttl_secs())
            .await?;
        Ok(())
    }

    pub async fn get_live(&self, sandbox_id: Uuid) -> Result<Option<SandboxLive>> {
        let mut conn = self.manager.clone();
        let json: Option<String> = conn.get(live_key(sandbox_id)).await?;
        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    pub async fn del_live(&self, sandbox_id: Uuid) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(live_key(sandbox_id)).await?;
        Ok(())
    }

    /// Swap the container id on a live record, keeping its expiry.
    pub async fn set_live_container(&self, sandbox_id: Uuid, container_id: &str) -> Result<()> {
        if let Some(mut live) = self.get_live(sandbox_id).await? {
            live.container_id = container_id.to_string();
            self.put_live(&live).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Port allocations
    // ------------------------------------------------------------------

    /// Atomically advance the rolling port counter.
    pub async fn next_port_counter(&self) -> Result<u64> {
        let mut conn = self.manager.clone();
        let n: i64 = conn.incr(COUNTER_KEY, 1).await?;
        Ok(n as u64)
    }

    /// Claim host port `p` for an allocation record. Returns false when the
    /// port is already held. SET NX EX keeps claim and TTL one round trip.
    pub async fn claim_port(
        &self,
        host_port: u16,
        alloc: &PortAllocation,
        ttl_secs: u64,
    ) -> Result<bool> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(alloc).map_err(anyhow::Error::from)?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(port_key(host_port))
            .arg(json)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn get_port_allocation(&self, host_port: u16) -> Result<Option<PortAllocation>> {
        let mut conn = self.manager.clone();
        let json: Option<String> = conn.get(port_key(host_port)).await?;
        Ok(json.and_then(|j| serde_json::from_str(&j).ok()))
    }

    pub async fn del_port_allocation(&self, host_port: u16) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(port_key(host_port)).await?;
        Ok(())
    }

    /// Record container→host in the sandbox's exposed-ports hash.
    pub async fn put_port_mapping(
        &self,
        sandbox_id: Uuid,
        container_port: u16,
        host_port: u16,
        ttl_secs: u64,
    ) -> Result<()> {
        let mut conn = self.manager.clone();
        let key = ports_key(sandbox_id);
        let _: () = conn
            .hset(&key, container_port.to_string(), host_port.to_string())
            .await?;
        let _: () = conn.expire(&key, ttl_secs as i64).await?;
        Ok(())
    }

    pub async fn get_port_mapping(
        &self,
        sandbox_id: Uuid,
        container_port: u16,
    ) -> Result<Option<u16>> {
        let mut conn = self.manager.clone();
        let host: Option<String> = conn
            .hget(ports_key(sandbox_id), container_port.to_string())
            .await?;
        Ok(host.and_then(|h| h.parse().ok()))
    }

    pub async fn del_port_mapping(&self, sandbox_id: Uuid, container_port: u16) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .hdel(ports_key(sandbox_id), container_port.to_string())
            .await?;
        Ok(())
    }

    /// Full exposed-ports map for a sandbox, container port → host port.
    pub async fn port_mappings(&self, sandbox_id: Uuid) -> Result<HashMap<u16, u16>> {
        let mut conn = self.manager.clone();
        let raw: HashMap<String, String> = conn.hgetall(ports_key(sandbox_id)).await?;
        Ok(raw
            .into_iter()
            .filter_map(|(c, h)| Some((c.parse().ok()?, h.parse().ok()?)))
            .collect())
    }

    pub async fn del_ports_hash(&self, sandbox_id: Uuid) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(ports_key(sandbox_id)).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scans (reaper)
    // ------------------------------------------------------------------

    /// All keys matching `pattern`. SCAN-based, safe on live instances.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Sandbox id carried in a `sandbox:ports:<id>` key, if well-formed.
    pub fn sandbox_id_from_ports_key(key: &str) -> Option<Uuid> {
        key.strip_prefix("sandbox:ports:")
            .and_then(|id| id.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_key_parses_back_to_sandbox_id() {
        let id = Uuid::new_v4();
        let key = ports_key(id);
        assert_eq!(Cache::sandbox_id_from_ports_key(&key), Some(id));
        assert_eq!(Cache::sandbox_id_from_ports_key("port:30001"), None);
        assert_eq!(
            Cache::sandbox_id_from_ports_key("sandbox:ports:not-a-uuid"),
            None
        );
    }

    #[test]
    fn live_record_roundtrips_through_json() {
        let live = SandboxLive {
            sandbox_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            credential_id: Uuid::new_v4(),
            container_id: "c1".into(),
            tier: Tier::Free,
            image: "insien/sandbox-agent:latest".into(),
            resource_limits: ResourceLimits::for_tier(Tier::Free),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            allow_unauthenticated: false,
        };
        let json = serde_json::to_string(&live).unwrap();
        let back: SandboxLive = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sandbox_id, live.sandbox_id);
        assert_eq!(back.tier, Tier::Free);
        assert!(live.ttl_secs() > 0);
    }
}
