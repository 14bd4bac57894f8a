//! Container runtime driver: spec composition, lifecycle, stats, volumes.
//!
//! Containers are always addressed by their stable name `sandbox-<id>` so a
//! recreated container keeps the same handle while its runtime id changes.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HostConfig, PortBinding, ResourcesUlimits,
};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use shared_types::Tier;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const LABEL_SANDBOX_ID: &str = "insien.sandbox.id";
pub const LABEL_SANDBOX_TIER: &str = "insien.sandbox.tier";
pub const LABEL_SANDBOX_CREATED: &str = "insien.sandbox.created";

const WORKDIR: &str = "/app";
const DATA_MOUNT: &str = "/app/data";
const STARTUP_POLL: Duration = Duration::from_millis(500);
const STOP_WAIT_POLLS: u32 = 10;
const STOP_WAIT_POLL: Duration = Duration::from_millis(500);
const STOP_GRACE_SECS: i64 = 5;
const LOG_TAIL_LINES: &str = "20";

const MIB: i64 = 1024 * 1024;
const CPU_PERIOD: i64 = 100_000;

pub fn container_name(sandbox_id: Uuid) -> String {
    format!("sandbox-{sandbox_id}")
}

pub fn volume_name(sandbox_id: Uuid) -> String {
    format!("sandbox-data-{sandbox_id}")
}

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub sandbox_id: Uuid,
    pub image: String,
    pub env: Vec<String>,
    pub tier: Tier,
    /// container port → host port
    pub port_bindings: HashMap<u16, u16>,
    /// Volume bound read-write at `/app/data` when present.
    pub data_volume: Option<String>,
    pub labels: HashMap<String, String>,
    pub working_dir: String,
}

impl ContainerSpec {
    /// Spec for a fresh sandbox: agent env injected, no ports, no volume.
    pub fn for_new_sandbox(
        sandbox_id: Uuid,
        tier: Tier,
        image: &str,
        orchestrator_url: &str,
        agent_token: &str,
    ) -> Self {
        let limits = tier.limits();
        Self {
            sandbox_id,
            image: image.to_string(),
            env: vec![
                format!("ORCHESTRATOR_URL={orchestrator_url}"),
                format!("AGENT_TOKEN={agent_token}"),
                format!("SANDBOX_ID={sandbox_id}"),
                format!("SANDBOX_TIER={tier}"),
                format!("SANDBOX_MEMORY_MB={}", limits.memory_mb),
                format!("SANDBOX_CPU_SHARES={}", limits.cpu_shares),
            ],
            tier,
            port_bindings: HashMap::new(),
            data_volume: None,
            labels: HashMap::from([
                (LABEL_SANDBOX_ID.to_string(), sandbox_id.to_string()),
                (LABEL_SANDBOX_TIER.to_string(), tier.to_string()),
                (
                    LABEL_SANDBOX_CREATED.to_string(),
                    Utc::now().to_rfc3339(),
                ),
            ]),
            working_dir: WORKDIR.to_string(),
        }
    }

    fn to_config(&self) -> Config<String> {
        let limits = self.tier.limits();
        let memory = limits.memory_mb as i64 * MIB;
        let cpu_quota = CPU_PERIOD * limits.cpu_shares as i64 / 1024;

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = self
            .port_bindings
            .iter()
            .map(|(container, host)| {
                (
                    format!("{container}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(host.to_string()),
                    }]),
                )
            })
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = self
            .port_bindings
            .keys()
            .map(|container| (format!("{container}/tcp"), HashMap::new()))
            .collect();

        let host_config = HostConfig {
            memory: Some(memory),
            // swap = memory disables swap entirely
            memory_swap: Some(memory),
            memory_reservation: Some(memory / 2),
            cpu_shares: Some(limits.cpu_shares as i64),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some(cpu_quota),
            pids_limit: Some(256),
            privileged: Some(false),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(HashMap::from([
                ("/tmp".to_string(), "rw,noexec,nosuid,size=64m".to_string()),
                (
                    "/var/tmp".to_string(),
                    "rw,noexec,nosuid,size=16m".to_string(),
                ),
                // The workdir stays exec: compilers and interpreters write
                // and run artifacts here. Sized to the tier's storage cap.
                (
                    WORKDIR.to_string(),
                    format!("rw,exec,nosuid,size={}m", limits.memory_mb),
                ),
            ])),
            ulimits: Some(vec![
                ResourcesUlimits {
                    name: Some("nofile".to_string()),
                    soft: Some(1024),
                    hard: Some(2048),
                },
                ResourcesUlimits {
                    name: Some("nproc".to_string()),
                    soft: Some(128),
                    hard: Some(256),
                },
            ]),
            dns: Some(vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]),
            shm_size: Some(64 * MIB),
            binds: self
                .data_volume
                .as_ref()
                .map(|volume| vec![format!("{volume}:{DATA_MOUNT}:rw")]),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };

        Config {
            image: Some(self.image.clone()),
            env: Some(self.env.clone()),
            labels: Some(self.labels.clone()),
            working_dir: Some(self.working_dir.clone()),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

/// A container carrying our sandbox label, as seen by the runtime.
#[derive(Debug, Clone)]
pub struct LabelledContainer {
    pub container_id: String,
    pub sandbox_id: Option<Uuid>,
    pub created: Option<DateTime<Utc>>,
}

/// Point-in-time usage snapshot for one container.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

pub fn cpu_percent(cpu_delta: u64, system_delta: u64, online_cpus: u64) -> f64 {
    if system_delta == 0 {
        return 0.0;
    }
    cpu_delta as f64 / system_delta as f64 * online_cpus as f64 * 100.0
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// 404 the container is gone, 304 already stopped, 409 removal in progress.
fn is_already_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 304 | 409,
            ..
        }
    )
}

#[derive(Clone)]
pub struct ContainerManager {
    docker: Docker,
    startup_timeout: Duration,
}

impl ContainerManager {
    pub fn new(docker: Docker, startup_timeout: Duration) -> Self {
        Self {
            docker,
            startup_timeout,
        }
    }

    pub async fn connect(startup_timeout: Duration) -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(Self::new(docker, startup_timeout))
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        debug!(image, "pulling image");
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }

    /// Create and start a container, then wait for the runtime to report it
    /// running. An early exit or a missed deadline tears the container back
    /// down and surfaces the tail of its logs.
    pub async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let name = container_name(spec.sandbox_id);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                spec.to_config(),
            )
            .await?;

        if let Err(e) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.stop_and_remove(&name).await.ok();
            return Err(e.into());
        }

        self.wait_for_running(&name).await?;
        Ok(created.id)
    }

    async fn wait_for_running(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.startup_timeout;
        loop {
            let inspect = self.docker.inspect_container(name, None::<InspectContainerOptions>).await?;
            let state = inspect.state.as_ref();
            let status = state.and_then(|s| s.status);

            match status {
                Some(ContainerStateStatusEnum::RUNNING) => return Ok(()),
                Some(ContainerStateStatusEnum::EXITED) | Some(ContainerStateStatusEnum::DEAD) => {
                    let exit_code = state.and_then(|s| s.exit_code).unwrap_or(-1);
                    let tail_logs = self.tail_logs(name).await.unwrap_or_default();
                    self.stop_and_remove(name).await.ok();
                    return Err(Error::ContainerStartupFailed {
                        exit_code,
                        status: status.map(|s| s.to_string()).unwrap_or_default(),
                        tail_logs,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                self.stop_and_remove(name).await.ok();
                return Err(Error::ContainerStartupFailed {
                    exit_code: -1,
                    status: "startup timeout".to_string(),
                    tail_logs: String::new(),
                });
            }
            sleep(STARTUP_POLL).await;
        }
    }

    /// Last few log lines, both streams interleaved.
    pub async fn tail_logs(&self, name: &str) -> Result<String> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: LOG_TAIL_LINES.to_string(),
                ..Default::default()
            }),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&String::from_utf8_lossy(&log.into_bytes())),
                Err(e) => {
                    warn!("log read failed: {e}");
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Stop (5 s grace), wait until the runtime reports not-running, then
    /// force-remove. Every step tolerates a container that is already gone.
    pub async fn stop_and_remove(&self, name: &str) -> Result<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => {}
            Err(e) if is_already_gone(&e) => {}
            Err(e) => return Err(e.into()),
        }

        for _ in 0..STOP_WAIT_POLLS {
            match self
                .docker
                .inspect_container(name, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => {
                    let running = inspect
                        .state
                        .as_ref()
                        .and_then(|s| s.running)
                        .unwrap_or(false);
                    if !running {
                        break;
                    }
                }
                Err(e) if is_not_found(&e) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            sleep(STOP_WAIT_POLL).await;
        }

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn inspect(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(inspect)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// One usage sample. The daemon includes the previous CPU snapshot in
    /// the same reply, which is what the percentage math needs.
    pub async fn point_stats(&self, name: &str) -> Result<ContainerStats> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| Error::NotFound("container stats unavailable".into()))??;

        let memory_usage = stats.memory_stats.usage.unwrap_or(0);
        let memory_limit = stats.memory_stats.limit.unwrap_or(0);

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);

        let (rx_bytes, tx_bytes) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            memory_usage_bytes: memory_usage,
            memory_limit_bytes: memory_limit,
            memory_percent: memory_percent(memory_usage, memory_limit),
            cpu_percent: cpu_percent(cpu_delta, system_delta, online_cpus),
            rx_bytes,
            tx_bytes,
        })
    }

    /// All containers carrying the sandbox label, running or not.
    pub async fn list_labelled(&self) -> Result<Vec<LabelledContainer>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters: HashMap::from([(
                    "label".to_string(),
                    vec![LABEL_SANDBOX_ID.to_string()],
                )]),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let labels = c.labels.unwrap_or_default();
                LabelledContainer {
                    container_id: c.id.unwrap_or_default(),
                    sandbox_id: labels
                        .get(LABEL_SANDBOX_ID)
                        .and_then(|v| v.parse().ok()),
                    created: labels
                        .get(LABEL_SANDBOX_CREATED)
                        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                        .map(|t| t.with_timezone(&Utc)),
                }
            })
            .collect())
    }

    pub async fn ensure_data_volume(&self, sandbox_id: Uuid) -> Result<String> {
        let name = volume_name(sandbox_id);
        match self.docker.inspect_volume(&name).await {
            Ok(_) => Ok(name),
            Err(e) if is_not_found(&e) => {
                self.docker
                    .create_volume(CreateVolumeOptions {
                        name: name.clone(),
                        labels: HashMap::from([(
                            LABEL_SANDBOX_ID.to_string(),
                            sandbox_id.to_string(),
                        )]),
                        ..Default::default()
                    })
                    .await?;
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_data_volume(&self, sandbox_id: Uuid) -> Result<()> {
        match self
            .docker
            .remove_volume(
                &volume_name(sandbox_id),
                Some(RemoveVolumeOptions { force: true }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable_per_sandbox() {
        let id = Uuid::new_v4();
        assert_eq!(container_name(id), format!("sandbox-{id}"));
        assert_eq!(volume_name(id), format!("sandbox-data-{id}"));
    }

    #[test]
    fn spec_injects_agent_environment() {
        let id = Uuid::new_v4();
        let spec = ContainerSpec::for_new_sandbox(
            id,
            Tier::Free,
            "insien/sandbox-agent:latest",
            "ws://localhost:4000",
            "token123",
        );
        assert!(spec.env.iter().any(|e| e == &format!("SANDBOX_ID={id}")));
        assert!(spec.env.iter().any(|e| e == "AGENT_TOKEN=token123"));
        assert!(spec.env.iter().any(|e| e == "SANDBOX_TIER=free"));
        assert_eq!(spec.labels.get(LABEL_SANDBOX_ID).unwrap(), &id.to_string());
    }

    #[test]
    fn config_applies_tier_limits_and_hardening() {
        let spec = ContainerSpec::for_new_sandbox(
            Uuid::new_v4(),
            Tier::Free,
            "img",
            "ws://localhost",
            "t",
        );
        let config = spec.to_config();
        let host = config.host_config.unwrap();

        assert_eq!(host.memory, Some(512 * MIB));
        assert_eq!(host.memory_swap, host.memory);
        assert_eq!(host.memory_reservation, Some(256 * MIB));
        assert_eq!(host.cpu_shares, Some(512));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.privileged, Some(false));
        assert!(host
            .security_opt
            .unwrap()
            .contains(&"no-new-privileges".to_string()));
        assert!(host.tmpfs.unwrap().contains_key("/tmp"));
        assert!(host.port_bindings.is_none());
    }

    #[test]
    fn config_merges_port_bindings_and_volume() {
        let mut spec = ContainerSpec::for_new_sandbox(
            Uuid::new_v4(),
            Tier::Pro,
            "img",
            "ws://localhost",
            "t",
        );
        spec.port_bindings.insert(3000, 30001);
        spec.port_bindings.insert(8080, 30002);
        spec.data_volume = Some("sandbox-data-test".to_string());

        let config = spec.to_config();
        let host = config.host_config.unwrap();
        let bindings = host.port_bindings.unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(
            bindings["3000/tcp"].as_ref().unwrap()[0].host_port,
            Some("30001".to_string())
        );
        assert_eq!(
            host.binds.unwrap()[0],
            "sandbox-data-test:/app/data:rw".to_string()
        );
        assert_eq!(config.exposed_ports.unwrap().len(), 2);
    }

    #[test]
    fn percent_math_handles_zero_denominators() {
        assert_eq!(memory_percent(100, 0), 0.0);
        assert_eq!(cpu_percent(50, 0, 4), 0.0);
        assert!((memory_percent(256, 512) - 50.0).abs() < f64::EPSILON);
        assert!((cpu_percent(500, 1000, 2) - 100.0).abs() < f64::EPSILON);
    }
}
