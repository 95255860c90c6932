//! Error types for the hypervisor abstraction layer.
//!
//! Two families share one enum:
//! - **configuration** errors are raised before any backend interaction and
//!   are always safe to retry once the input is fixed;
//! - **operational** errors come from a backend (or from a rejected lifecycle
//!   transition) and name the operation that failed.
//!
//! [`HypervisorError::InconsistentState`] is the distinguished variant for
//! operations that left backend-visible resources behind without reaching the
//! intended end state. It must be inspected (or destroyed) before a retry.

use thiserror::Error;

use crate::types::{LifecycleOp, VnfField, VnfState};

/// Errors that can occur during hypervisor operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HypervisorError {
    /// A required VNF field is empty.
    #[error("Invalid VNF configuration: {field} is missing")]
    ConfigInvalid {
        field: VnfField,
    },

    /// No driver is registered for the requested backend kind.
    #[error("No hypervisor driver registered for backend '{0}'")]
    UnknownBackend(String),

    /// Failed to connect to (or talk to) the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// The VNF does not exist on the backend (or is not tracked).
    #[error("VNF not found: {0}")]
    NotFound(String),

    /// The VNF is not in the state the operation requires.
    #[error("VNF {vnf} is not running (state: {state})")]
    NotRunning {
        vnf: String,
        state: VnfState,
    },

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("Cannot {op} VNF {vnf} from state {from}")]
    InvalidTransition {
        vnf: String,
        from: VnfState,
        op: LifecycleOp,
    },

    /// The backend rejected a lifecycle operation. Nothing was left behind.
    #[error("Failed to {op} VNF {vnf}: {cause}")]
    OperationFailed {
        op: LifecycleOp,
        vnf: String,
        cause: String,
    },

    /// The operation failed after mutating backend state and the rollback
    /// did not restore it.
    #[error("Failed to {op} VNF {vnf}, state is inconsistent: {cause} (rollback: {rollback})")]
    InconsistentState {
        op: LifecycleOp,
        vnf: String,
        cause: String,
        rollback: String,
    },

    /// A command executed inside the VNF failed.
    #[error("Command failed in VNF {vnf} (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        vnf: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl HypervisorError {
    /// Shorthand for [`HypervisorError::OperationFailed`].
    pub fn failed(op: LifecycleOp, vnf: impl Into<String>, cause: impl ToString) -> Self {
        Self::OperationFailed {
            op,
            vnf: vnf.into(),
            cause: cause.to_string(),
        }
    }

    /// True for errors raised before any backend interaction.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigInvalid { .. } | Self::UnknownBackend(_))
    }

    /// True when backend resources may exist that do not match the tracked
    /// state. Such VNFs need inspection or a destroy before any retry.
    pub fn requires_inspection(&self) -> bool {
        matches!(self, Self::InconsistentState { .. })
    }

    /// Numeric error code, compatible with the codes reported by the
    /// nf.io tooling (701..716). Kinds without a historical code map to 700.
    pub fn code(&self) -> u16 {
        match self {
            Self::ConnectionFailed(_) => 701,
            Self::NotFound(_) => 702,
            Self::CommandFailed { .. } => 703,
            Self::OperationFailed { op, .. } => match op {
                LifecycleOp::Create => 704,
                LifecycleOp::Deploy => 705,
                LifecycleOp::Destroy => 706,
                LifecycleOp::Start => 707,
                LifecycleOp::Restart => 708,
                LifecycleOp::Stop => 709,
                LifecycleOp::Pause => 710,
                LifecycleOp::Unpause => 711,
                LifecycleOp::Execute => 703,
                LifecycleOp::Status => 702,
            },
            Self::InconsistentState { .. } => 712,
            Self::ConfigInvalid { field } => match field {
                VnfField::Image => 713,
                VnfField::Host => 714,
                VnfField::Name => 715,
            },
            Self::NotRunning { .. } => 716,
            Self::UnknownBackend(_) | Self::InvalidTransition { .. } => 700,
        }
    }
}

/// Result type alias for hypervisor operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
