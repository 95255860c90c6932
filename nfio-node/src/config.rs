//! Configuration management for the node binary.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nfio_hypervisor::{
    DockerConfig, DriverRegistry, Hypervisor, LibvirtConfig, MockBackend, VnfSpec,
    DEFAULT_DOCKER_PORT, DOCKER_BACKEND, MOCK_BACKEND,
};

use crate::cli::Args;
use crate::operations::OperationSettings;

/// Configuration file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/nfio/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selection and shared driver settings
    pub hypervisor: HypervisorConfig,
    /// Docker driver settings
    pub docker: DockerSettings,
    /// Libvirt driver settings
    pub libvirt: LibvirtSettings,
    /// VNF descriptors managed by this node
    pub vnfs: Vec<VnfEntry>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from YAML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)
            .with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Defaults with CLI overrides, used when no config file exists.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref backend) = args.backend {
            self.hypervisor.backend = backend.clone();
        }

        if let Some(secs) = args.stop_timeout {
            self.hypervisor.stop_timeout_secs = secs;
        }

        if args.dev {
            self.hypervisor.backend = MOCK_BACKEND.to_string();
            for entry in &mut self.vnfs {
                entry.backend = Some(MOCK_BACKEND.to_string());
            }
        }

        self
    }

    /// Descriptor of a configured VNF. Entries without a backend use the
    /// configured default backend.
    pub fn vnf(&self, name: &str) -> Result<VnfSpec> {
        self.vnfs
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.to_spec(&self.hypervisor.backend))
            .ok_or_else(|| anyhow::anyhow!("VNF '{}' is not defined in the configuration", name))
    }

    /// Descriptors of every configured VNF, in file order.
    pub fn all_vnfs(&self) -> Vec<VnfSpec> {
        self.vnfs
            .iter()
            .map(|entry| entry.to_spec(&self.hypervisor.backend))
            .collect()
    }

    /// Settings handed to the orchestrator.
    pub fn operation_settings(&self) -> OperationSettings {
        OperationSettings {
            stop_timeout: Duration::from_secs(self.hypervisor.stop_timeout_secs),
            endpoints: self.hypervisor.endpoints.clone(),
        }
    }

    /// Driver registry for this configuration. The mock backend replaces all
    /// real drivers.
    pub fn registry(&self) -> DriverRegistry {
        if self.hypervisor.backend == MOCK_BACKEND {
            let backend = Arc::new(MockBackend::new());
            return DriverRegistry::new().register(MOCK_BACKEND, move |_, _| {
                Ok(backend.clone() as Arc<dyn Hypervisor>)
            });
        }

        DriverRegistry::with_defaults(self.docker.to_driver_config(), self.libvirt.to_driver_config())
    }
}

/// Hypervisor backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Default backend kind for descriptors that do not name one
    pub backend: String,
    /// Grace period for graceful stops, in seconds
    pub stop_timeout_secs: u64,
    /// Endpoint overrides keyed by backend kind (docker socket, libvirt URI)
    pub endpoints: HashMap<String, String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            backend: DOCKER_BACKEND.to_string(),
            stop_timeout_secs: 10,
            endpoints: HashMap::new(),
        }
    }
}

/// Docker driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerSettings {
    /// docker binary path
    pub binary: String,
    /// Remote API port on every host
    pub port: u16,
    /// DNS servers for containers
    pub dns: Vec<String>,
    /// Run containers privileged
    pub privileged: bool,
    /// Pull images before creating containers
    pub pull_images: bool,
    /// Extra seconds granted to `docker stop`
    pub stop_margin_secs: u64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            port: DEFAULT_DOCKER_PORT,
            dns: vec!["8.8.8.8".to_string()],
            privileged: true,
            pull_images: false,
            stop_margin_secs: 5,
        }
    }
}

impl DockerSettings {
    pub fn to_driver_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.binary.clone(),
            port: self.port,
            dns: self.dns.clone(),
            privileged: self.privileged,
            pull_images: self.pull_images,
            stop_margin: Duration::from_secs(self.stop_margin_secs),
        }
    }
}

/// Libvirt driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibvirtSettings {
    /// virsh binary path
    pub binary: String,
    /// Connection URI template (`{host}` is substituted)
    pub uri_template: String,
    /// Where domain definitions are staged
    pub staging_dir: PathBuf,
    /// Memory of generated domains in MiB
    pub memory_mib: u64,
    /// vCPUs of generated domains
    pub vcpus: u32,
    /// Libvirt network for generated domains
    pub network: String,
    /// Domain state poll interval in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound for in-guest commands, in seconds
    pub exec_timeout_secs: u64,
}

impl Default for LibvirtSettings {
    fn default() -> Self {
        let defaults = LibvirtConfig::default();
        Self {
            binary: defaults.binary,
            uri_template: defaults.uri_template,
            staging_dir: defaults.staging_dir,
            memory_mib: defaults.memory_mib,
            vcpus: defaults.vcpus,
            network: defaults.network,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            exec_timeout_secs: defaults.exec_timeout.as_secs(),
        }
    }
}

impl LibvirtSettings {
    pub fn to_driver_config(&self) -> LibvirtConfig {
        LibvirtConfig {
            binary: self.binary.clone(),
            uri_template: self.uri_template.clone(),
            staging_dir: self.staging_dir.clone(),
            memory_mib: self.memory_mib,
            vcpus: self.vcpus,
            network: self.network.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
        }
    }
}

/// A VNF descriptor as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct VnfEntry {
    pub name: String,
    pub image: String,
    pub host: String,
    /// Backend kind; defaults to `hypervisor.backend`
    #[serde(default)]
    pub backend: Option<String>,
    /// Owning user
    #[serde(default)]
    pub owner: Option<String>,
}

impl VnfEntry {
    pub fn to_spec(&self, default_backend: &str) -> VnfSpec {
        let mut spec = VnfSpec::new(&self.name, &self.image, &self.host)
            .with_backend(self.backend.as_deref().unwrap_or(default_backend));
        if let Some(ref owner) = self.owner {
            spec = spec.with_owner(owner);
        }
        spec
    }
}
