//! Docker driver implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::connection::{ConnectionSlot, HypervisorConnection};
use crate::error::{HypervisorError, Result};
use crate::io::{ExecOutput, HostIo};
use crate::traits::Hypervisor;
use crate::types::*;

/// Port the docker daemons of an nfio deployment listen on.
pub const DEFAULT_DOCKER_PORT: u16 = 4444;

/// Docker driver settings.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// docker binary path
    pub binary: String,
    /// Remote API port used when no explicit endpoint is given
    pub port: u16,
    /// DNS servers handed to every container
    pub dns: Vec<String>,
    /// Run containers privileged
    pub privileged: bool,
    /// Pull the image before creating the container
    pub pull_images: bool,
    /// Extra time granted to `docker stop` beyond its own grace period
    pub stop_margin: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            port: DEFAULT_DOCKER_PORT,
            dns: vec!["8.8.8.8".to_string()],
            privileged: true,
            pull_images: false,
            stop_margin: Duration::from_secs(5),
        }
    }
}

/// Container engine hypervisor driver.
pub struct DockerDriver {
    params: ConnectionParams,
    config: DockerConfig,
    io: Arc<dyn HostIo>,
    connection: ConnectionSlot,
}

/// Subset of `docker inspect` `.State`.
#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Status", default)]
    status: String,
}

/// Subset of `docker inspect` `.NetworkSettings`.
#[derive(Debug, Deserialize)]
struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(rename = "Networks", default)]
    networks: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Deserialize)]
struct EndpointSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl DockerDriver {
    /// Create a driver for the daemon described by `params`. Not connected yet.
    pub fn new(params: ConnectionParams, config: DockerConfig, io: Arc<dyn HostIo>) -> Self {
        Self {
            params,
            config,
            io,
            connection: ConnectionSlot::new(),
        }
    }

    /// Daemon endpoint passed to `docker -H`.
    pub fn endpoint(&self) -> String {
        self.params
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("tcp://{}:{}", self.params.host, self.config.port))
    }

    /// Run `docker -H <endpoint> <args>`; failing to spawn is reported as a
    /// failure of `op`.
    async fn docker(&self, op: LifecycleOp, vnf: &VnfSpec, args: &[&str]) -> Result<ExecOutput> {
        let endpoint = self.connection.endpoint().await?;
        let mut argv = vec!["-H".to_string(), endpoint];
        argv.extend(args.iter().map(|a| a.to_string()));

        self.io
            .execute(&self.config.binary, &argv)
            .await
            .map_err(|e| HypervisorError::failed(op, &vnf.name, e))
    }

    /// Like [`Self::docker`] but a non-zero exit is a failure of `op` too.
    async fn docker_ok(&self, op: LifecycleOp, vnf: &VnfSpec, args: &[&str]) -> Result<ExecOutput> {
        let output = self.docker(op, vnf, args).await?;
        if !output.success() {
            return Err(HypervisorError::failed(op, &vnf.name, output.diagnostics()));
        }
        Ok(output)
    }

    /// Map a docker container status to a lifecycle state.
    fn state_from_docker(status: &str) -> VnfState {
        match status {
            "created" => VnfState::Created,
            "running" | "restarting" => VnfState::Running,
            "paused" => VnfState::Paused,
            "exited" | "dead" | "removing" => VnfState::Stopped,
            _ => VnfState::Inconsistent,
        }
    }

    fn is_missing(output: &ExecOutput) -> bool {
        output.stderr.contains("No such")
    }

    /// Query the container state through the inspect API.
    async fn inspect_state(&self, op: LifecycleOp, vnf: &VnfSpec) -> Result<VnfState> {
        let name = vnf.qualified_name();
        let output = self
            .docker(op, vnf, &["inspect", "--format", "{{json .State}}", &name])
            .await?;

        if !output.success() {
            if Self::is_missing(&output) {
                return Ok(VnfState::Absent);
            }
            return Err(HypervisorError::failed(op, &vnf.name, output.diagnostics()));
        }

        let state: ContainerState = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            HypervisorError::failed(op, &vnf.name, format!("unexpected inspect output: {}", e))
        })?;

        let mapped = Self::state_from_docker(&state.status);
        debug!(vnf = %vnf.name, status = %state.status, state = %mapped, "Container state");
        Ok(mapped)
    }

    /// Require the container to exist and be in one of `allowed`.
    async fn require_state(
        &self,
        op: LifecycleOp,
        vnf: &VnfSpec,
        allowed: &[VnfState],
    ) -> Result<VnfState> {
        let state = self.inspect_state(op, vnf).await?;
        if state == VnfState::Absent {
            return Err(HypervisorError::NotFound(vnf.name.clone()));
        }
        if !allowed.is_empty() && !allowed.contains(&state) {
            return Err(HypervisorError::NotRunning {
                vnf: vnf.name.clone(),
                state,
            });
        }
        Ok(state)
    }

    async fn handshake(&self, endpoint: &str) -> Result<String> {
        let args = [
            "-H".to_string(),
            endpoint.to_string(),
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];

        let output = self
            .io
            .execute(&self.config.binary, &args)
            .await
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        if !output.success() {
            return Err(HypervisorError::ConnectionFailed(format!(
                "{}: {}",
                endpoint,
                output.diagnostics()
            )));
        }

        Ok(output.stdout.trim().to_string())
    }
}

#[async_trait]
impl Hypervisor for DockerDriver {
    fn kind(&self) -> &str {
        DOCKER_BACKEND
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        let endpoint = self.endpoint();
        self.connection
            .open(DOCKER_BACKEND, &endpoint, || self.handshake(&endpoint))
            .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection.close().await;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connection.is_open().await
    }

    async fn connection(&self) -> Option<HypervisorConnection> {
        self.connection.current().await
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name, image = %vnf.image))]
    async fn create(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        info!("Creating container");

        if self.config.pull_images {
            self.docker_ok(LifecycleOp::Create, vnf, &["pull", &vnf.image]).await?;
        }

        let name = vnf.qualified_name();
        let mut args: Vec<&str> = vec!["create", "--name", name.as_str(), "--hostname", vnf.host.as_str()];
        if self.config.privileged {
            args.push("--privileged");
        }
        for server in &self.config.dns {
            args.push("--dns");
            args.push(server.as_str());
        }
        args.push(vnf.image.as_str());

        let output = self.docker_ok(LifecycleOp::Create, vnf, &args).await?;
        let container_id = output.stdout.trim().to_string();

        info!(container_id = %container_id, "Container created");
        Ok(container_id)
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn start(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Starting container");

        self.require_state(LifecycleOp::Start, vnf, &[]).await?;
        self.docker_ok(LifecycleOp::Start, vnf, &["start", &vnf.qualified_name()]).await?;

        info!("Container started");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn restart(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Restarting container");

        self.require_state(LifecycleOp::Restart, vnf, &[]).await?;
        let grace = self.params.stop_timeout.as_secs().to_string();
        self.docker_ok(
            LifecycleOp::Restart,
            vnf,
            &["restart", "-t", &grace, &vnf.qualified_name()],
        )
        .await?;

        info!("Container restarted");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn stop(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!(timeout_secs = self.params.stop_timeout.as_secs(), "Stopping container gracefully");

        self.require_state(LifecycleOp::Stop, vnf, &[VnfState::Running]).await?;

        let name = vnf.qualified_name();
        let grace = self.params.stop_timeout.as_secs().to_string();
        let bound = self.params.stop_timeout + self.config.stop_margin;

        let graceful = tokio::time::timeout(
            bound,
            self.docker(LifecycleOp::Stop, vnf, &["stop", "-t", &grace, &name]),
        )
        .await;

        let reason = match graceful {
            Ok(Ok(output)) if output.success() => {
                info!("Container stopped");
                return Ok(());
            }
            Ok(Ok(output)) => output.diagnostics(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no exit after {:?}", bound),
        };

        warn!(reason = %reason, "Graceful stop failed, killing container");

        let killed = self.docker(LifecycleOp::Stop, vnf, &["kill", &name]).await?;
        if !killed.success() {
            return Err(HypervisorError::failed(
                LifecycleOp::Stop,
                &vnf.name,
                format!("graceful stop: {}; kill: {}", reason, killed.diagnostics()),
            ));
        }

        info!("Container killed");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn pause(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Pause, vnf, &[VnfState::Running]).await?;
        self.docker_ok(LifecycleOp::Pause, vnf, &["pause", &vnf.qualified_name()]).await?;
        info!("Container paused");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn unpause(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Unpause, vnf, &[VnfState::Paused]).await?;
        self.docker_ok(LifecycleOp::Unpause, vnf, &["unpause", &vnf.qualified_name()]).await?;
        info!("Container unpaused");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn destroy(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Destroying container");

        self.require_state(LifecycleOp::Destroy, vnf, &[]).await?;

        let output = self
            .docker(LifecycleOp::Destroy, vnf, &["rm", "-f", &vnf.qualified_name()])
            .await?;
        if !output.success() {
            if Self::is_missing(&output) {
                return Err(HypervisorError::NotFound(vnf.name.clone()));
            }
            return Err(HypervisorError::failed(LifecycleOp::Destroy, &vnf.name, output.diagnostics()));
        }

        info!("Container destroyed");
        Ok(())
    }

    #[instrument(skip(self, vnf, command), fields(vnf = %vnf.name))]
    async fn execute_command(&self, vnf: &VnfSpec, command: &str) -> Result<ExecOutput> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Execute, vnf, &[VnfState::Running]).await?;

        debug!(command = %command, "Executing command in container");
        let name = vnf.qualified_name();
        let output = self
            .docker(LifecycleOp::Execute, vnf, &["exec", &name, "/bin/bash", "-c", command])
            .await
            .map_err(|e| HypervisorError::CommandFailed {
                vnf: vnf.name.clone(),
                exit_code: None,
                stdout: String::new(),
                stderr: e.to_string(),
            })?;

        if !output.success() {
            return Err(HypervisorError::CommandFailed {
                vnf: vnf.name.clone(),
                exit_code: Some(output.exit_code),
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    async fn status(&self, vnf: &VnfSpec) -> Result<VnfState> {
        vnf.validate()?;
        self.inspect_state(LifecycleOp::Status, vnf).await
    }

    async fn backend_id(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        let output = self
            .docker(LifecycleOp::Status, vnf, &["inspect", "--format", "{{.Id}}", &vnf.qualified_name()])
            .await?;
        if !output.success() {
            if Self::is_missing(&output) {
                return Err(HypervisorError::NotFound(vnf.name.clone()));
            }
            return Err(HypervisorError::failed(LifecycleOp::Status, &vnf.name, output.diagnostics()));
        }
        Ok(output.stdout.trim().to_string())
    }

    async fn ip_address(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        let output = self
            .docker(
                LifecycleOp::Status,
                vnf,
                &["inspect", "--format", "{{json .NetworkSettings}}", &vnf.qualified_name()],
            )
            .await?;
        if !output.success() {
            if Self::is_missing(&output) {
                return Err(HypervisorError::NotFound(vnf.name.clone()));
            }
            return Err(HypervisorError::failed(LifecycleOp::Status, &vnf.name, output.diagnostics()));
        }

        let settings: NetworkSettings = serde_json::from_str(output.stdout.trim()).map_err(|e| {
            HypervisorError::failed(LifecycleOp::Status, &vnf.name, format!("unexpected inspect output: {}", e))
        })?;

        if !settings.ip_address.is_empty() {
            return Ok(settings.ip_address);
        }

        settings
            .networks
            .values()
            .map(|n| n.ip_address.clone())
            .find(|ip| !ip.is_empty())
            .ok_or_else(|| HypervisorError::failed(LifecycleOp::Status, &vnf.name, "container has no IP address"))
    }
}
