//! Libvirt driver implementation.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::connection::{ConnectionSlot, HypervisorConnection};
use crate::error::{HypervisorError, Result};
use crate::io::{ExecOutput, HostIo};
use crate::traits::Hypervisor;
use crate::types::*;
use crate::xml::{render_template, DomainXmlBuilder};

/// Libvirt driver settings.
#[derive(Debug, Clone)]
pub struct LibvirtConfig {
    /// virsh binary path
    pub binary: String,
    /// Connection URI; `{host}` is replaced by the target host
    pub uri_template: String,
    /// Directory domain definitions are staged in before `virsh define`
    pub staging_dir: PathBuf,
    /// Memory of generated domains
    pub memory_mib: u64,
    /// vCPUs of generated domains
    pub vcpus: u32,
    /// Libvirt network generated domains are attached to
    pub network: String,
    /// Interval between domain state polls
    pub poll_interval: Duration,
    /// Upper bound for an in-guest command
    pub exec_timeout: Duration,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            binary: "virsh".to_string(),
            uri_template: "qemu+ssh://{host}/system".to_string(),
            staging_dir: PathBuf::from("/var/lib/nfio/domains"),
            memory_mib: 1024,
            vcpus: 1,
            network: "default".to_string(),
            poll_interval: Duration::from_millis(500),
            exec_timeout: Duration::from_secs(30),
        }
    }
}

/// Libvirt/QEMU hypervisor driver.
pub struct LibvirtDriver {
    params: ConnectionParams,
    config: LibvirtConfig,
    io: Arc<dyn HostIo>,
    connection: ConnectionSlot,
}

/// `{"return": ...}` envelope of guest agent replies.
#[derive(Debug, Deserialize)]
struct AgentReply<T> {
    #[serde(rename = "return")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct ExecStarted {
    pid: i64,
}

#[derive(Debug, Deserialize)]
struct ExecStatus {
    exited: bool,
    #[serde(default)]
    exitcode: Option<i32>,
    #[serde(rename = "out-data", default)]
    out_data: Option<String>,
    #[serde(rename = "err-data", default)]
    err_data: Option<String>,
}

impl LibvirtDriver {
    /// Create a driver for the libvirt daemon described by `params`. Not connected yet.
    pub fn new(params: ConnectionParams, config: LibvirtConfig, io: Arc<dyn HostIo>) -> Self {
        Self {
            params,
            config,
            io,
            connection: ConnectionSlot::new(),
        }
    }

    /// Connection URI passed to `virsh -c`.
    pub fn uri(&self) -> String {
        self.params
            .endpoint
            .clone()
            .unwrap_or_else(|| self.config.uri_template.replace("{host}", &self.params.host))
    }

    /// Run `virsh -c <uri> <args>`; failing to spawn is reported as a
    /// failure of `op`.
    async fn virsh(&self, op: LifecycleOp, vnf: &VnfSpec, args: &[&str]) -> Result<ExecOutput> {
        let uri = self.connection.endpoint().await?;
        let mut argv = vec!["-c".to_string(), uri];
        argv.extend(args.iter().map(|a| a.to_string()));

        self.io
            .execute(&self.config.binary, &argv)
            .await
            .map_err(|e| HypervisorError::failed(op, &vnf.name, e))
    }

    /// Like [`Self::virsh`] but a non-zero exit is a failure of `op` too.
    async fn virsh_ok(&self, op: LifecycleOp, vnf: &VnfSpec, args: &[&str]) -> Result<ExecOutput> {
        let output = self.virsh(op, vnf, args).await?;
        if !output.success() {
            if Self::is_missing(&output) {
                return Err(HypervisorError::NotFound(vnf.name.clone()));
            }
            return Err(HypervisorError::failed(op, &vnf.name, output.diagnostics()));
        }
        Ok(output)
    }

    fn is_missing(output: &ExecOutput) -> bool {
        output.stderr.contains("failed to get domain") || output.stderr.contains("Domain not found")
    }

    /// Map `virsh domstate --reason` output to a lifecycle state.
    ///
    /// A domain that was defined but never started reports `shut off (unknown)`.
    fn state_from_libvirt(domstate: &str) -> VnfState {
        let domstate = domstate.trim();
        if domstate.starts_with("running")
            || domstate.starts_with("in shutdown")
            || domstate.starts_with("blocked")
            || domstate.starts_with("idle")
        {
            VnfState::Running
        } else if domstate.starts_with("paused") || domstate.starts_with("pmsuspended") {
            VnfState::Paused
        } else if domstate.starts_with("shut off (unknown)") {
            VnfState::Created
        } else if domstate.starts_with("shut off") || domstate.starts_with("crashed") {
            VnfState::Stopped
        } else {
            VnfState::Inconsistent
        }
    }

    async fn domain_state(&self, op: LifecycleOp, vnf: &VnfSpec) -> Result<VnfState> {
        let output = self
            .virsh(op, vnf, &["domstate", "--reason", &vnf.qualified_name()])
            .await?;

        if !output.success() {
            if Self::is_missing(&output) {
                return Ok(VnfState::Absent);
            }
            return Err(HypervisorError::failed(op, &vnf.name, output.diagnostics()));
        }

        let state = Self::state_from_libvirt(&output.stdout);
        debug!(vnf = %vnf.name, domstate = %output.stdout.trim(), state = %state, "Domain state");
        Ok(state)
    }

    /// Require the domain to exist and be in one of `allowed`.
    async fn require_state(
        &self,
        op: LifecycleOp,
        vnf: &VnfSpec,
        allowed: &[VnfState],
    ) -> Result<VnfState> {
        let state = self.domain_state(op, vnf).await?;
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

    /// Domain XML for a VNF: a rendered template for `*.xml` images, a
    /// generated single-disk domain otherwise.
    async fn domain_xml(&self, vnf: &VnfSpec, uuid: &str) -> Result<String> {
        let name = vnf.qualified_name();

        if vnf.image.ends_with(".xml") {
            let raw = self
                .io
                .read_file(std::path::Path::new(&vnf.image))
                .await
                .map_err(|e| HypervisorError::failed(LifecycleOp::Create, &vnf.name, e))?;
            let template = String::from_utf8(raw).map_err(|e| {
                HypervisorError::failed(LifecycleOp::Create, &vnf.name, format!("template is not UTF-8: {}", e))
            })?;
            return Ok(render_template(&template, &name, uuid));
        }

        Ok(DomainXmlBuilder::new(&name, uuid, &vnf.image)
            .memory_mib(self.config.memory_mib)
            .vcpus(self.config.vcpus)
            .network(&self.config.network)
            .build())
    }

    /// Send a guest agent command and decode the `return` payload.
    async fn agent_command<T: serde::de::DeserializeOwned>(
        &self,
        vnf: &VnfSpec,
        payload: &serde_json::Value,
    ) -> Result<T> {
        let payload = payload.to_string();
        let output = self
            .virsh(LifecycleOp::Execute, vnf, &["qemu-agent-command", &vnf.qualified_name(), &payload])
            .await
            .map_err(|e| command_failed(vnf, None, e.to_string()))?;

        if !output.success() {
            return Err(command_failed(vnf, None, output.diagnostics()));
        }

        let reply: AgentReply<T> = serde_json::from_str(output.stdout.trim())
            .map_err(|e| command_failed(vnf, None, format!("unexpected guest agent reply: {}", e)))?;
        Ok(reply.value)
    }

    async fn poll_exec(&self, vnf: &VnfSpec, pid: i64) -> Result<ExecStatus> {
        let request = serde_json::json!({
            "execute": "guest-exec-status",
            "arguments": { "pid": pid },
        });

        loop {
            let status: ExecStatus = self.agent_command(vnf, &request).await?;
            if status.exited {
                return Ok(status);
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn wait_for_shutoff(&self, vnf: &VnfSpec) -> Result<()> {
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            if self.domain_state(LifecycleOp::Stop, vnf).await? == VnfState::Stopped {
                return Ok(());
            }
        }
    }

    async fn handshake(&self, uri: &str) -> Result<String> {
        let args = ["-c".to_string(), uri.to_string(), "version".to_string()];

        let output = self
            .io
            .execute(&self.config.binary, &args)
            .await
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        if !output.success() {
            return Err(HypervisorError::ConnectionFailed(format!(
                "{}: {}",
                uri,
                output.diagnostics()
            )));
        }

        let version = output
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("Running hypervisor:"))
            .or_else(|| output.stdout.lines().next())
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(version)
    }
}

fn command_failed(vnf: &VnfSpec, exit_code: Option<i32>, stderr: impl Into<String>) -> HypervisorError {
    HypervisorError::CommandFailed {
        vnf: vnf.name.clone(),
        exit_code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

fn decode_agent_data(data: Option<String>) -> String {
    data.and_then(|d| STANDARD.decode(d).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[async_trait]
impl Hypervisor for LibvirtDriver {
    fn kind(&self) -> &str {
        LIBVIRT_BACKEND
    }

    #[instrument(skip(self))]
    async fn connect(&self) -> Result<()> {
        let uri = self.uri();
        info!(host = %self.params.host, uri = %uri, "Connecting to libvirt");
        self.connection
            .open(LIBVIRT_BACKEND, &uri, || self.handshake(&uri))
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
        info!("Defining domain");

        if self.domain_state(LifecycleOp::Create, vnf).await?.exists() {
            return Err(HypervisorError::failed(
                LifecycleOp::Create,
                &vnf.name,
                "domain is already defined",
            ));
        }

        let name = vnf.qualified_name();
        let uuid = Uuid::new_v4().to_string();
        let xml = self.domain_xml(vnf, &uuid).await?;

        let path = self.config.staging_dir.join(format!("{}.xml", name));
        self.io
            .stage_file(&path, xml.as_bytes())
            .await
            .map_err(|e| HypervisorError::failed(LifecycleOp::Create, &vnf.name, e))?;

        let path = path.to_string_lossy().into_owned();
        self.virsh_ok(LifecycleOp::Create, vnf, &["define", &path]).await?;

        // Templates may carry a fixed UUID, so ask libvirt for the real one.
        let domain_uuid = match self.virsh_ok(LifecycleOp::Create, vnf, &["domuuid", &name]).await {
            Ok(output) => output.stdout.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Domain defined but unreadable, undefining");
                return match self.virsh_ok(LifecycleOp::Create, vnf, &["undefine", &name]).await {
                    Ok(_) => Err(HypervisorError::failed(LifecycleOp::Create, &vnf.name, e)),
                    Err(rollback) => Err(HypervisorError::InconsistentState {
                        op: LifecycleOp::Create,
                        vnf: vnf.name.clone(),
                        cause: e.to_string(),
                        rollback: rollback.to_string(),
                    }),
                };
            }
        };

        info!(domain_uuid = %domain_uuid, "Domain defined");
        Ok(domain_uuid)
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn start(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Starting domain");

        match self.require_state(LifecycleOp::Start, vnf, &[]).await? {
            VnfState::Running => {
                debug!("Domain already running");
                return Ok(());
            }
            VnfState::Created | VnfState::Stopped => {}
            from => {
                return Err(HypervisorError::InvalidTransition {
                    vnf: vnf.name.clone(),
                    from,
                    op: LifecycleOp::Start,
                })
            }
        }

        self.virsh_ok(LifecycleOp::Start, vnf, &["start", &vnf.qualified_name()]).await?;

        info!("Domain started");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn restart(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Rebooting domain");

        let name = vnf.qualified_name();
        match self.require_state(LifecycleOp::Restart, vnf, &[]).await? {
            VnfState::Running => {
                self.virsh_ok(LifecycleOp::Restart, vnf, &["reboot", &name]).await?;
            }
            VnfState::Created | VnfState::Stopped => {
                self.virsh_ok(LifecycleOp::Restart, vnf, &["start", &name]).await?;
            }
            from => {
                return Err(HypervisorError::InvalidTransition {
                    vnf: vnf.name.clone(),
                    from,
                    op: LifecycleOp::Restart,
                })
            }
        }

        info!("Domain rebooted");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn stop(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!(timeout_secs = self.params.stop_timeout.as_secs(), "Stopping domain gracefully");

        self.require_state(LifecycleOp::Stop, vnf, &[VnfState::Running]).await?;
        let name = vnf.qualified_name();

        let shutdown = self.virsh(LifecycleOp::Stop, vnf, &["shutdown", &name]).await?;
        if shutdown.success() {
            match tokio::time::timeout(self.params.stop_timeout, self.wait_for_shutoff(vnf)).await {
                Ok(Ok(())) => {
                    info!("Domain stopped gracefully");
                    return Ok(());
                }
                Ok(Err(e)) => warn!(error = %e, "Lost track of domain during shutdown"),
                Err(_) => warn!("Graceful shutdown timed out"),
            }
        } else {
            warn!(error = %shutdown.diagnostics(), "Guest rejected ACPI shutdown");
        }

        info!("Force stopping domain");
        self.virsh_ok(LifecycleOp::Stop, vnf, &["destroy", &name]).await?;

        info!("Domain force stopped");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn pause(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Pause, vnf, &[VnfState::Running]).await?;
        self.virsh_ok(LifecycleOp::Pause, vnf, &["suspend", &vnf.qualified_name()]).await?;
        info!("Domain paused");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn unpause(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Unpause, vnf, &[VnfState::Paused]).await?;
        self.virsh_ok(LifecycleOp::Unpause, vnf, &["resume", &vnf.qualified_name()]).await?;
        info!("Domain resumed");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn destroy(&self, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        info!("Destroying domain");

        let state = self.require_state(LifecycleOp::Destroy, vnf, &[]).await?;
        let name = vnf.qualified_name();

        let powered_off = matches!(state, VnfState::Running | VnfState::Paused);
        if powered_off {
            self.virsh_ok(LifecycleOp::Destroy, vnf, &["destroy", &name]).await?;
            debug!("Domain powered off");
        }

        if let Err(e) = self.virsh_ok(LifecycleOp::Destroy, vnf, &["undefine", &name]).await {
            if powered_off {
                error!(error = %e, "Domain powered off but still defined");
                return Err(HypervisorError::InconsistentState {
                    op: LifecycleOp::Destroy,
                    vnf: vnf.name.clone(),
                    cause: e.to_string(),
                    rollback: "domain was powered off and cannot be restored".to_string(),
                });
            }
            return Err(e);
        }

        info!("Domain destroyed");
        Ok(())
    }

    #[instrument(skip(self, vnf, command), fields(vnf = %vnf.name))]
    async fn execute_command(&self, vnf: &VnfSpec, command: &str) -> Result<ExecOutput> {
        vnf.validate()?;
        self.require_state(LifecycleOp::Execute, vnf, &[VnfState::Running]).await?;

        debug!(command = %command, "Executing command through guest agent");
        let request = serde_json::json!({
            "execute": "guest-exec",
            "arguments": {
                "path": "/bin/bash",
                "arg": ["-c", command],
                "capture-output": true,
            },
        });
        let started: ExecStarted = self.agent_command(vnf, &request).await?;

        let status = tokio::time::timeout(self.config.exec_timeout, self.poll_exec(vnf, started.pid))
            .await
            .map_err(|_| {
                command_failed(vnf, None, format!("no exit after {:?}", self.config.exec_timeout))
            })??;

        let output = ExecOutput {
            exit_code: status.exitcode.unwrap_or(-1),
            stdout: decode_agent_data(status.out_data),
            stderr: decode_agent_data(status.err_data),
        };

        if !output.success() {
            return Err(HypervisorError::CommandFailed {
                vnf: vnf.name.clone(),
                exit_code: status.exitcode,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    async fn status(&self, vnf: &VnfSpec) -> Result<VnfState> {
        vnf.validate()?;
        self.domain_state(LifecycleOp::Status, vnf).await
    }

    async fn backend_id(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        let output = self
            .virsh_ok(LifecycleOp::Status, vnf, &["domuuid", &vnf.qualified_name()])
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn ip_address(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        let output = self
            .virsh_ok(LifecycleOp::Status, vnf, &["domifaddr", &vnf.qualified_name()])
            .await?;

        // " vnet0  52:54:00:aa:bb:cc  ipv4  192.168.122.45/24"
        output
            .stdout
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>())
            .find(|cols| cols.len() >= 4 && cols[2] == "ipv4")
            .and_then(|cols| cols[3].split('/').next().map(str::to_string))
            .ok_or_else(|| HypervisorError::failed(LifecycleOp::Status, &vnf.name, "domain has no IPv4 address"))
    }
}
