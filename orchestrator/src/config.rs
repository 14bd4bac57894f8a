use std::time::Duration;

use shared_types::Tier;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP + WebSocket listener binds
    pub port: u16,
    /// Host name advertised in agent/expose URLs
    pub orchestrator_host: String,
    /// Port advertised for WebSocket URLs (usually = `port`, differs behind a proxy)
    pub ws_port: u16,
    /// Postgres connection string
    pub database_url: String,
    /// Redis connection string
    pub redis_url: String,
    /// Shared secret for user and agent JWTs
    pub jwt_secret: String,
    /// Image run inside every sandbox container
    pub agent_image: String,
    /// First host port the allocator may hand out
    pub port_range_start: u16,
    /// One past the last host port the allocator may hand out
    pub port_range_end: u16,
    /// How long a container may take to reach "running"
    pub container_startup_timeout: Duration,
    /// Reaper sweep interval
    pub cleanup_interval: Duration,
    /// Active-sandbox cap per API key, all tiers
    pub max_sandboxes_per_key: i64,
    /// Active-sandbox cap across the whole node
    pub max_sandboxes_global: i64,
    /// Per-tier overrides for max active sandboxes per user
    pub tier_max_sandboxes: [(Tier, i64); 3],
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_parse("PORT", 4000)?,
            orchestrator_host: env_str("ORCHESTRATOR_HOST", "localhost"),
            ws_port: env_parse("WS_PORT", 4000)?,
            database_url: env_required("DATABASE_URL")?,
            redis_url: env_required("REDIS_URL")?,
            jwt_secret: env_required("JWT_SECRET")?,
            agent_image: env_str("AGENT_IMAGE", "insien/sandbox-agent:latest"),
            port_range_start: env_parse("PORT_RANGE_START", 30000)?,
            port_range_end: env_parse("PORT_RANGE_END", 40000)?,
            container_startup_timeout: Duration::from_secs(env_parse(
                "CONTAINER_STARTUP_TIMEOUT",
                60,
            )?),
            cleanup_interval: Duration::from_secs(
                60 * env_parse("CLEANUP_INTERVAL_MINUTES", 15)?,
            ),
            max_sandboxes_per_key: env_parse("MAX_SANDBOXES_PER_KEY", 10)?,
            max_sandboxes_global: env_parse("MAX_SANDBOXES_GLOBAL", 100)?,
            tier_max_sandboxes: [
                (
                    Tier::Free,
                    env_parse("FREE_MAX_SANDBOXES", Tier::Free.limits().max_sandboxes)?,
                ),
                (
                    Tier::Pro,
                    env_parse("PRO_MAX_SANDBOXES", Tier::Pro.limits().max_sandboxes)?,
                ),
                (
                    Tier::Enterprise,
                    env_parse(
                        "ENTERPRISE_MAX_SANDBOXES",
                        Tier::Enterprise.limits().max_sandboxes,
                    )?,
                ),
            ],
        })
    }

    /// Active-sandbox cap for one user at the given tier.
    pub fn max_sandboxes_for(&self, tier: Tier) -> i64 {
        self.tier_max_sandboxes
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, cap)| *cap)
            .unwrap_or_else(|| tier.limits().max_sandboxes)
    }

    /// Base WebSocket URL, as injected into containers.
    pub fn ws_base(&self) -> String {
        format!("ws://{}:{}", self.orchestrator_host, self.ws_port)
    }

    /// Agent WebSocket URL for a sandbox.
    pub fn agent_url(&self, sandbox_id: &str) -> String {
        format!("{}/agent/{}", self.ws_base(), sandbox_id)
    }

    /// Public URL for an exposed host port.
    pub fn exposed_url(&self, host_port: u16) -> String {
        format!("http://{}:{}", self.orchestrator_host, host_port)
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{key} must be set"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 4000,
            orchestrator_host: "localhost".into(),
            ws_port: 4000,
            database_url: "postgres://localhost/test".into(),
            redis_url: "redis://localhost".into(),
            jwt_secret: "secret".into(),
            agent_image: "insien/sandbox-agent:latest".into(),
            port_range_start: 30000,
            port_range_end: 40000,
            container_startup_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(900),
            max_sandboxes_per_key: 10,
            max_sandboxes_global: 100,
            tier_max_sandboxes: [(Tier::Free, 2), (Tier::Pro, 10), (Tier::Enterprise, 50)],
        }
    }

    #[test]
    fn tier_caps_resolve_from_overrides() {
        let config = test_config();
        assert_eq!(config.max_sandboxes_for(Tier::Free), 2);
        assert_eq!(config.max_sandboxes_for(Tier::Enterprise), 50);
    }

    #[test]
    fn urls_embed_host_and_port() {
        let config = test_config();
        assert_eq!(config.agent_url("s1"), "ws://localhost:4000/agent/s1");
        assert_eq!(config.exposed_url(30001), "http://localhost:30001");
    }
}
