//! Core hypervisor abstraction trait.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::connection::HypervisorConnection;
use crate::error::{HypervisorError, Result};
use crate::io::ExecOutput;
use crate::types::*;

/// Core hypervisor abstraction trait.
///
/// This trait defines the lifecycle contract every backend driver satisfies,
/// whether the VNF is an ephemeral container or a persistent VM domain.
///
/// Contract shared by all implementations:
/// - every operation validates the descriptor before touching the backend;
/// - every backend operation on a disconnected driver fails with
///   [`HypervisorError::ConnectionFailed`];
/// - an operation that fails after mutating backend state attempts a
///   best-effort rollback and reports [`HypervisorError::InconsistentState`]
///   if the rollback fails too.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Backend kind identifier (e.g. "docker").
    fn kind(&self) -> &str;

    /// Open the connection to the backend. No-op if already connected.
    async fn connect(&self) -> Result<()>;

    /// Release the connection. No-op if not connected.
    async fn disconnect(&self) -> Result<()>;

    /// Check whether the connection is open.
    async fn is_connected(&self) -> bool;

    /// Current connection details.
    async fn connection(&self) -> Option<HypervisorConnection>;

    // =========================================================================
    // VNF Lifecycle
    // =========================================================================

    /// Allocate backend resources for the VNF without starting it.
    ///
    /// Returns the backend identifier (container ID, domain UUID).
    async fn create(&self, vnf: &VnfSpec) -> Result<String>;

    /// Start a created or stopped VNF.
    async fn start(&self, vnf: &VnfSpec) -> Result<()>;

    /// Restart a VNF.
    async fn restart(&self, vnf: &VnfSpec) -> Result<()>;

    /// Stop a running VNF gracefully, escalating to a forced stop after the
    /// connection's stop timeout.
    async fn stop(&self, vnf: &VnfSpec) -> Result<()>;

    /// Pause (freeze) a running VNF.
    async fn pause(&self, vnf: &VnfSpec) -> Result<()>;

    /// Resume a paused VNF.
    async fn unpause(&self, vnf: &VnfSpec) -> Result<()>;

    /// Tear down all backend resources of the VNF.
    async fn destroy(&self, vnf: &VnfSpec) -> Result<()>;

    /// Run a shell command inside the running VNF.
    async fn execute_command(&self, vnf: &VnfSpec, command: &str) -> Result<ExecOutput>;

    // =========================================================================
    // VNF Status
    // =========================================================================

    /// Current state as reported by the backend (`Absent` if unknown to it).
    async fn status(&self, vnf: &VnfSpec) -> Result<VnfState>;

    /// Backend identifier of an existing VNF.
    async fn backend_id(&self, vnf: &VnfSpec) -> Result<String>;

    /// IP address of the VNF.
    async fn ip_address(&self, vnf: &VnfSpec) -> Result<String>;

    // =========================================================================
    // Composite
    // =========================================================================

    /// Create and start the VNF in one call.
    ///
    /// If the start fails, the created resources are destroyed again. A
    /// successful rollback yields a plain deploy failure; a failed rollback
    /// yields [`HypervisorError::InconsistentState`] carrying both causes.
    async fn deploy(&self, vnf: &VnfSpec) -> Result<String> {
        vnf.validate()?;
        info!(vnf = %vnf.name, backend = %self.kind(), "Deploying VNF");

        let backend_id = match self.create(vnf).await {
            Ok(id) => id,
            Err(e) if e.is_configuration() || e.requires_inspection() => return Err(e),
            Err(e @ HypervisorError::ConnectionFailed(_)) => return Err(e),
            Err(e) => {
                warn!(vnf = %vnf.name, error = %e, "Create failed during deploy");
                return Err(HypervisorError::failed(LifecycleOp::Deploy, &vnf.name, e));
            }
        };

        if let Err(start_err) = self.start(vnf).await {
            warn!(vnf = %vnf.name, error = %start_err, backend_id = %backend_id, "Start failed during deploy, rolling back");

            return match self.destroy(vnf).await {
                Ok(()) => {
                    info!(vnf = %vnf.name, "Rollback succeeded, nothing left behind");
                    Err(HypervisorError::failed(LifecycleOp::Deploy, &vnf.name, start_err))
                }
                Err(rollback_err) => {
                    error!(
                        vnf = %vnf.name,
                        error = %start_err,
                        rollback_error = %rollback_err,
                        "Rollback failed, VNF is in an inconsistent state"
                    );
                    Err(HypervisorError::InconsistentState {
                        op: LifecycleOp::Deploy,
                        vnf: vnf.name.clone(),
                        cause: start_err.to_string(),
                        rollback: rollback_err.to_string(),
                    })
                }
            };
        }

        info!(vnf = %vnf.name, backend_id = %backend_id, "VNF deployed");
        Ok(backend_id)
    }
}
