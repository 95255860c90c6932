//! Type definitions for VNF descriptors, lifecycle states and connections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{HypervisorError, Result};

// =============================================================================
// BACKEND KINDS
// =============================================================================

/// Container engine backend (Docker remote API).
pub const DOCKER_BACKEND: &str = "docker";

/// Libvirt/QEMU backend.
pub const LIBVIRT_BACKEND: &str = "libvirt";

/// In-memory backend for tests and development.
pub const MOCK_BACKEND: &str = "mock";

/// Default grace period before a graceful stop escalates to a forced one.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// VNF DESCRIPTOR
// =============================================================================

/// Descriptor of a managed VNF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VnfSpec {
    /// Unique instance name
    pub name: String,
    /// Image reference (container image, disk image or domain template)
    pub image: String,
    /// Host the VNF runs on
    pub host: String,
    /// Backend kind identifier (e.g. "docker", "libvirt")
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Owning user; prefixes the backend-visible name when set
    #[serde(default)]
    pub owner: Option<String>,
}

fn default_backend() -> String {
    DOCKER_BACKEND.to_string()
}

impl VnfSpec {
    /// Create a new descriptor for the default (docker) backend.
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            host: host.into(),
            backend: default_backend(),
            owner: None,
        }
    }

    /// Set the backend kind.
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    /// Set the owning user.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Check that name, image and host are set, in that order.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (VnfField::Name, &self.name),
            (VnfField::Image, &self.image),
            (VnfField::Host, &self.host),
        ];
        for (field, value) in checks {
            if value.trim().is_empty() {
                return Err(HypervisorError::ConfigInvalid { field });
            }
        }
        Ok(())
    }

    /// Name of the VNF as seen by the backend (`<owner>-<name>`).
    pub fn qualified_name(&self) -> String {
        match self.owner.as_deref() {
            Some(owner) if !owner.is_empty() => format!("{}-{}", owner, self.name),
            _ => self.name.clone(),
        }
    }
}

/// Required descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnfField {
    Name,
    Image,
    Host,
}

impl fmt::Display for VnfField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Name => "name",
            Self::Image => "image",
            Self::Host => "host",
        };
        f.write_str(s)
    }
}

// =============================================================================
// LIFECYCLE
// =============================================================================

/// Lifecycle state of a VNF.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VnfState {
    #[default]
    Absent,
    Created,
    Running,
    Paused,
    Stopped,
    /// Tracked state does not match the backend after a partial failure.
    Inconsistent,
}

impl VnfState {
    /// Lowercase name used in logs and CLI output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Inconsistent => "inconsistent",
        }
    }

    /// True if backend resources are expected to exist.
    pub fn exists(&self) -> bool {
        !matches!(self, Self::Absent)
    }
}

impl fmt::Display for VnfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations of the lifecycle contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleOp {
    Create,
    Deploy,
    Start,
    Restart,
    Stop,
    Pause,
    Unpause,
    Destroy,
    Execute,
    Status,
}

impl LifecycleOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Deploy => "deploy",
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Unpause => "unpause",
            Self::Destroy => "destroy",
            Self::Execute => "execute",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for LifecycleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CONNECTIONS
// =============================================================================

/// Parameters used to open a hypervisor connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    /// Host running the backend
    pub host: String,
    /// Explicit endpoint (docker socket, libvirt URI); derived from `host` if unset
    pub endpoint: Option<String>,
    /// Grace period for graceful stop/shutdown
    pub stop_timeout: Duration,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            endpoint: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Override the endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the graceful stop timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}
