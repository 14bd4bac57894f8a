//! Types shared between the orchestrator and the processes on the far side of
//! its WebSocket fabric:
//! - in-container agents (exec/read/write inside the sandbox)
//! - SDK clients
//!
//! Serializable with serde for JSON over WebSocket/HTTP.

use serde::{Deserialize, Serialize};

// ============================================================================
// Tiers
// ============================================================================

/// Sandbox tier. Closed set; controls resource caps and lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            "enterprise" => Some(Tier::Enterprise),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Default caps for this tier. The orchestrator may override
    /// `max_sandboxes` from its environment.
    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                max_sandboxes: 2,
                memory_mb: 512,
                cpu_shares: 512,
                lifetime_hours: 1,
            },
            Tier::Pro => TierLimits {
                max_sandboxes: 10,
                memory_mb: 2048,
                cpu_shares: 1024,
                lifetime_hours: 24,
            },
            Tier::Enterprise => TierLimits {
                max_sandboxes: 50,
                memory_mb: 8192,
                cpu_shares: 2048,
                lifetime_hours: 168,
            },
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-tier caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierLimits {
    pub max_sandboxes: i64,
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub lifetime_hours: u64,
}

/// Resource limits applied to one sandbox container, as reported to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_shares: u64,
    pub storage_mb: u64,
}

impl ResourceLimits {
    pub fn for_tier(tier: Tier) -> Self {
        let limits = tier.limits();
        Self {
            memory_mb: limits.memory_mb,
            cpu_shares: limits.cpu_shares,
            // Storage tracks memory: the workdir tmpfs is sized to the
            // memory cap so a runaway build cannot fill the host disk.
            storage_mb: limits.memory_mb,
        }
    }
}

// ============================================================================
// RPC wire envelope
// ============================================================================

/// The routable head of every RPC frame, in both directions.
///
/// The orchestrator never inspects a frame beyond these two fields; payloads
/// are forwarded byte-for-byte between client and agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHead {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl FrameHead {
    /// Extract the head from a raw frame. `None` when `id` or `type` is
    /// missing or not a string.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<FrameHead>(raw).ok()
    }
}

/// Error envelope returned to a client in place of an agent reply.
pub fn error_frame(id: &str, error: &str) -> String {
    serde_json::json!({ "id": id, "type": "error", "error": error }).to_string()
}

// ============================================================================
// WebSocket close codes
// ============================================================================

/// Close code for authentication/authorization failures and agent
/// replacement (RFC 6455 policy violation).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Close code for unrecognized WebSocket paths (RFC 6455 unsupported data).
pub const CLOSE_UNSUPPORTED: u16 = 1003;

// ============================================================================
// Port mappings
// ============================================================================

/// One exposed port, container side and host side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: u16,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_roundtrip() {
        for tier in [Tier::Free, Tier::Pro, Tier::Enterprise] {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
            let json = serde_json::to_string(&tier).unwrap();
            assert_eq!(json, format!("\"{}\"", tier.as_str()));
        }
        assert_eq!(Tier::parse("platinum"), None);
    }

    #[test]
    fn tier_limits_scale_upward() {
        let free = Tier::Free.limits();
        let pro = Tier::Pro.limits();
        let enterprise = Tier::Enterprise.limits();
        assert!(free.memory_mb < pro.memory_mb);
        assert!(pro.memory_mb < enterprise.memory_mb);
        assert!(free.max_sandboxes < pro.max_sandboxes);
        assert!(free.lifetime_hours < enterprise.lifetime_hours);
    }

    #[test]
    fn frame_head_requires_id_and_type() {
        let head = FrameHead::parse(r#"{"id":"1","type":"exec","cmd":"ls"}"#).unwrap();
        assert_eq!(head.id, "1");
        assert_eq!(head.kind, "exec");

        assert!(FrameHead::parse(r#"{"type":"exec"}"#).is_none());
        assert!(FrameHead::parse(r#"{"id":"1"}"#).is_none());
        assert!(FrameHead::parse("not json").is_none());
    }

    #[test]
    fn error_frame_echoes_id() {
        let frame = error_frame("42", "agent not connected");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["id"], "42");
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"], "agent not connected");
    }

    #[test]
    fn resource_limits_serialize_camel_case() {
        let limits = ResourceLimits::for_tier(Tier::Free);
        let json = serde_json::to_value(&limits).unwrap();
        assert!(json.get("memoryMb").is_some());
        assert!(json.get("cpuShares").is_some());
    }
}
