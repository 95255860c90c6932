//! VNF lifecycle orchestration.
//!
//! [`VnfOperations`] is the name-level API over the hypervisor drivers. It
//! keeps one [`VnfRecord`] per tracked VNF and enforces the lifecycle state
//! machine before any driver call:
//!
//! ```text
//! absent  --create-->  created  --start-->  running  --stop-->  stopped
//! running --pause-->   paused   --unpause-->  running
//! created|running|paused|stopped|inconsistent --destroy--> absent
//! stopped --start--> running          running|stopped --restart--> running
//! ```
//!
//! Operations on the same name are serialized by a per-name async mutex held
//! for the whole operation; distinct names proceed in parallel. A record's
//! state only changes after the driver reports success, except for
//! [`HypervisorError::InconsistentState`], which moves the record to
//! `inconsistent` until it is destroyed.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use nfio_hypervisor::{
    ConnectionParams, ExecOutput, Hypervisor, HypervisorError, HypervisorFactory, LifecycleOp,
    VnfField, VnfSpec, VnfState, DEFAULT_STOP_TIMEOUT,
};

// =============================================================================
// ERRORS
// =============================================================================

/// A failed lifecycle request, carrying the VNF and the requested action.
///
/// The underlying [`HypervisorError`] is never altered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{action} of VNF '{vnf}' failed: {source}")]
pub struct OperationError {
    pub vnf: String,
    pub action: LifecycleOp,
    #[source]
    pub source: HypervisorError,
}

impl OperationError {
    pub fn new(vnf: impl Into<String>, action: LifecycleOp, source: HypervisorError) -> Self {
        Self {
            vnf: vnf.into(),
            action,
            source,
        }
    }

    /// The underlying failure kind.
    pub fn kind(&self) -> &HypervisorError {
        &self.source
    }

    /// Numeric error code of the underlying failure.
    pub fn code(&self) -> u16 {
        self.source.code()
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

// =============================================================================
// RECORDS
// =============================================================================

/// A tracked VNF.
#[derive(Debug, Clone, Serialize)]
pub struct VnfRecord {
    pub spec: VnfSpec,
    pub state: VnfState,
    /// Container ID or domain UUID, once known
    pub backend_id: Option<String>,
    /// Time of the last committed transition
    pub updated_at: DateTime<Utc>,
}

impl VnfRecord {
    fn new(spec: VnfSpec, state: VnfState, backend_id: Option<String>) -> Self {
        Self {
            spec,
            state,
            backend_id,
            updated_at: Utc::now(),
        }
    }
}

/// Guest network counters read from inside a running VNF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestStat {
    RxBytes,
    TxBytes,
    PktDrops,
}

impl GuestStat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RxBytes => "rx_bytes",
            Self::TxBytes => "tx_bytes",
            Self::PktDrops => "pkt_drops",
        }
    }

    /// Shell pipeline printing the counter for `eth0`.
    pub fn command(&self) -> &'static str {
        match self {
            Self::RxBytes => "ifconfig eth0 | grep -Eo 'RX bytes:[0-9]+' | cut -d':' -f 2",
            Self::TxBytes => "ifconfig eth0 | grep -Eo 'TX bytes:[0-9]+' | cut -d':' -f 2",
            Self::PktDrops => "ifconfig eth0 | grep -Eo 'RX .* dropped:[0-9]+' | cut -d':' -f 4",
        }
    }
}

impl fmt::Display for GuestStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuestStat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rx_bytes" => Ok(Self::RxBytes),
            "tx_bytes" => Ok(Self::TxBytes),
            "pkt_drops" => Ok(Self::PktDrops),
            other => Err(format!(
                "unknown statistic '{}' (expected rx_bytes, tx_bytes or pkt_drops)",
                other
            )),
        }
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

/// Settings applied to every driver connection.
#[derive(Debug, Clone)]
pub struct OperationSettings {
    /// Grace period for graceful stops
    pub stop_timeout: Duration,
    /// Endpoint overrides keyed by backend kind
    pub endpoints: HashMap<String, String>,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            endpoints: HashMap::new(),
        }
    }
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one VNF name.
///
/// The lock table entry of a name is removed when its last holder or waiter
/// goes away.
struct NameGuard<'a> {
    table: &'a LockTable,
    name: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    held: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        self.held.take();

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the table, one here.
        let idle = table
            .get(&self.name)
            .map_or(false, |entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if idle {
            table.remove(&self.name);
        }
    }
}

/// Name-level VNF lifecycle engine.
pub struct VnfOperations {
    factory: Arc<HypervisorFactory>,
    settings: OperationSettings,
    records: RwLock<HashMap<String, VnfRecord>>,
    locks: LockTable,
}

impl VnfOperations {
    pub fn new(factory: Arc<HypervisorFactory>, settings: OperationSettings) -> Self {
        Self {
            factory,
            settings,
            records: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Bookkeeping
    // -------------------------------------------------------------------------

    fn check_name(name: &str, action: LifecycleOp) -> Result<()> {
        if name.trim().is_empty() {
            return Err(OperationError::new(
                name,
                action,
                HypervisorError::ConfigInvalid { field: VnfField::Name },
            ));
        }
        Ok(())
    }

    /// Wait for exclusive use of `name`.
    async fn lock_name(&self, name: &str, action: LifecycleOp) -> Result<NameGuard<'_>> {
        Self::check_name(name, action)?;

        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(name.to_string()).or_default().clone()
        };
        let mut guard = NameGuard {
            table: &self.locks,
            name: name.to_string(),
            lock,
            held: None,
        };
        guard.held = Some(guard.lock.clone().lock_owned().await);
        Ok(guard)
    }

    /// Number of names with a live lock table entry.
    #[cfg(test)]
    fn locked_names(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn tracked(&self, name: &str) -> Option<VnfRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(name).cloned()
    }

    fn require(&self, name: &str, action: LifecycleOp) -> Result<VnfRecord> {
        Self::check_name(name, action)?;
        self.tracked(name).ok_or_else(|| {
            OperationError::new(name, action, HypervisorError::NotFound(name.to_string()))
        })
    }

    /// Store the new state of a VNF, keeping the known backend ID unless a
    /// new one is given.
    fn commit(&self, spec: &VnfSpec, state: VnfState, backend_id: Option<String>) -> VnfRecord {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());

        let backend_id = backend_id.or_else(|| records.get(&spec.name).and_then(|r| r.backend_id.clone()));
        let record = VnfRecord::new(spec.clone(), state, backend_id);
        records.insert(spec.name.clone(), record.clone());
        debug!(vnf = %spec.name, state = %state, "VNF state committed");
        record
    }

    /// Stop tracking a VNF.
    fn forget(&self, name: &str) {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        if records.remove(name).is_some() {
            debug!(vnf = %name, "VNF record dropped");
        }
    }

    /// Wrap a driver failure, moving the VNF to `inconsistent` when the
    /// backend was left half-changed.
    fn fail(&self, spec: &VnfSpec, action: LifecycleOp, source: HypervisorError) -> OperationError {
        if source.requires_inspection() {
            error!(vnf = %spec.name, action = %action, error = %source, "VNF left in an inconsistent state");
            self.commit(spec, VnfState::Inconsistent, None);
        } else {
            warn!(vnf = %spec.name, action = %action, error = %source, "VNF operation failed");
        }
        OperationError::new(&spec.name, action, source)
    }

    async fn driver(&self, spec: &VnfSpec, action: LifecycleOp) -> Result<Arc<dyn Hypervisor>> {
        let mut params = ConnectionParams::new(&spec.host).with_stop_timeout(self.settings.stop_timeout);
        if let Some(endpoint) = self.settings.endpoints.get(&spec.backend) {
            params = params.with_endpoint(endpoint);
        }

        self.factory
            .get_driver(&spec.backend, &params)
            .await
            .map_err(|e| OperationError::new(&spec.name, action, e))
    }

    /// Target state of `op` from `from`, or the rejection.
    fn check_transition(
        name: &str,
        from: VnfState,
        op: LifecycleOp,
    ) -> std::result::Result<VnfState, HypervisorError> {
        use VnfState::*;

        match (op, from) {
            (LifecycleOp::Start, Created | Stopped) => Ok(Running),
            (LifecycleOp::Restart, Running | Stopped) => Ok(Running),
            (LifecycleOp::Stop, Running) => Ok(Stopped),
            (LifecycleOp::Pause, Running) => Ok(Paused),
            (LifecycleOp::Unpause, Paused) => Ok(Running),
            (LifecycleOp::Destroy, Created | Running | Paused | Stopped | Inconsistent) => Ok(Absent),
            (LifecycleOp::Stop | LifecycleOp::Pause | LifecycleOp::Unpause, state) => {
                Err(HypervisorError::NotRunning {
                    vnf: name.to_string(),
                    state,
                })
            }
            (op, from) => Err(HypervisorError::InvalidTransition {
                vnf: name.to_string(),
                from,
                op,
            }),
        }
    }

    /// A rejected start or unpause inside a deploy is a deploy failure.
    fn deploy_failure(name: &str, source: HypervisorError) -> HypervisorError {
        match source {
            e @ HypervisorError::OperationFailed { .. } => HypervisorError::failed(LifecycleOp::Deploy, name, e),
            other => other,
        }
    }

    /// Run a name-level transition under the name lock.
    async fn transition(&self, name: &str, op: LifecycleOp) -> Result<()> {
        let _guard = self.lock_name(name, op).await?;

        let record = self.require(name, op)?;
        let target = Self::check_transition(name, record.state, op)
            .map_err(|e| OperationError::new(name, op, e))?;

        let spec = record.spec;
        let driver = self.driver(&spec, op).await?;

        let outcome = match op {
            LifecycleOp::Start => driver.start(&spec).await,
            LifecycleOp::Restart => driver.restart(&spec).await,
            LifecycleOp::Stop => driver.stop(&spec).await,
            LifecycleOp::Pause => driver.pause(&spec).await,
            LifecycleOp::Unpause => driver.unpause(&spec).await,
            LifecycleOp::Destroy => match driver.destroy(&spec).await {
                // Nothing was left to repair.
                Err(HypervisorError::NotFound(_)) if record.state == VnfState::Inconsistent => Ok(()),
                other => other,
            },
            other => Err(HypervisorError::InvalidTransition {
                vnf: name.to_string(),
                from: record.state,
                op: other,
            }),
        };

        match outcome {
            Ok(()) => {
                info!(vnf = %name, from = %record.state, to = %target, "VNF transitioned");
                if target == VnfState::Absent {
                    self.forget(name);
                } else {
                    self.commit(&spec, target, None);
                }
                Ok(())
            }
            Err(e) => Err(self.fail(&spec, op, e)),
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Allocate backend resources for a new VNF.
    #[instrument(skip(self, spec), fields(vnf = %spec.name, backend = %spec.backend))]
    pub async fn create(&self, spec: VnfSpec) -> Result<VnfRecord> {
        spec.validate()
            .map_err(|e| OperationError::new(&spec.name, LifecycleOp::Create, e))?;

        let _guard = self.lock_name(&spec.name, LifecycleOp::Create).await?;

        if let Some(existing) = self.tracked(&spec.name) {
            return Err(OperationError::new(
                &spec.name,
                LifecycleOp::Create,
                HypervisorError::InvalidTransition {
                    vnf: spec.name.clone(),
                    from: existing.state,
                    op: LifecycleOp::Create,
                },
            ));
        }

        let driver = self.driver(&spec, LifecycleOp::Create).await?;
        match driver.create(&spec).await {
            Ok(backend_id) => {
                info!(backend_id = %backend_id, "VNF created");
                Ok(self.commit(&spec, VnfState::Created, Some(backend_id)))
            }
            Err(e) => Err(self.fail(&spec, LifecycleOp::Create, e)),
        }
    }

    /// Bring a VNF to `running` from wherever it is.
    #[instrument(skip(self, spec), fields(vnf = %spec.name, backend = %spec.backend))]
    pub async fn deploy(&self, spec: VnfSpec) -> Result<VnfRecord> {
        spec.validate()
            .map_err(|e| OperationError::new(&spec.name, LifecycleOp::Deploy, e))?;

        let _guard = self.lock_name(&spec.name, LifecycleOp::Deploy).await?;

        let (spec, from) = match self.tracked(&spec.name) {
            Some(record) => (record.spec, record.state),
            None => (spec, VnfState::Absent),
        };

        let outcome = match from {
            VnfState::Running => {
                debug!("VNF already running");
                return self.require(&spec.name, LifecycleOp::Deploy);
            }
            VnfState::Inconsistent => {
                return Err(OperationError::new(
                    &spec.name,
                    LifecycleOp::Deploy,
                    HypervisorError::InvalidTransition {
                        vnf: spec.name.clone(),
                        from,
                        op: LifecycleOp::Deploy,
                    },
                ));
            }
            VnfState::Absent => {
                let driver = self.driver(&spec, LifecycleOp::Deploy).await?;
                driver.deploy(&spec).await.map(Some)
            }
            VnfState::Created | VnfState::Stopped => {
                let driver = self.driver(&spec, LifecycleOp::Deploy).await?;
                driver
                    .start(&spec)
                    .await
                    .map(|_| None)
                    .map_err(|e| Self::deploy_failure(&spec.name, e))
            }
            VnfState::Paused => {
                let driver = self.driver(&spec, LifecycleOp::Deploy).await?;
                driver
                    .unpause(&spec)
                    .await
                    .map(|_| None)
                    .map_err(|e| Self::deploy_failure(&spec.name, e))
            }
        };

        match outcome {
            Ok(backend_id) => {
                info!(from = %from, "VNF deployed");
                Ok(self.commit(&spec, VnfState::Running, backend_id))
            }
            Err(e) => Err(self.fail(&spec, LifecycleOp::Deploy, e)),
        }
    }

    #[instrument(skip(self))]
    pub async fn start(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Start).await
    }

    #[instrument(skip(self))]
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Restart).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Stop).await
    }

    #[instrument(skip(self))]
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Pause).await
    }

    #[instrument(skip(self))]
    pub async fn unpause(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Unpause).await
    }

    /// Tear down a VNF. Also the only way out of `inconsistent`.
    #[instrument(skip(self))]
    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.transition(name, LifecycleOp::Destroy).await
    }

    /// Run a shell command inside a running VNF.
    #[instrument(skip(self, command))]
    pub async fn execute_command(&self, name: &str, command: &str) -> Result<ExecOutput> {
        let _guard = self.lock_name(name, LifecycleOp::Execute).await?;

        let record = self.require(name, LifecycleOp::Execute)?;
        if record.state != VnfState::Running {
            return Err(OperationError::new(
                name,
                LifecycleOp::Execute,
                HypervisorError::NotRunning {
                    vnf: name.to_string(),
                    state: record.state,
                },
            ));
        }

        let driver = self.driver(&record.spec, LifecycleOp::Execute).await?;
        driver
            .execute_command(&record.spec, command)
            .await
            .map_err(|e| self.fail(&record.spec, LifecycleOp::Execute, e))
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Track a VNF that already exists on its backend.
    #[instrument(skip(self, spec), fields(vnf = %spec.name, backend = %spec.backend))]
    pub async fn adopt(&self, spec: VnfSpec) -> Result<VnfRecord> {
        spec.validate()
            .map_err(|e| OperationError::new(&spec.name, LifecycleOp::Status, e))?;

        let _guard = self.lock_name(&spec.name, LifecycleOp::Status).await?;

        let driver = self.driver(&spec, LifecycleOp::Status).await?;
        let state = driver
            .status(&spec)
            .await
            .map_err(|e| OperationError::new(&spec.name, LifecycleOp::Status, e))?;

        if let Some(existing) = self.tracked(&spec.name) {
            if existing.state == VnfState::Inconsistent {
                warn!(backend = %state, "VNF is inconsistent, keeping it until destroyed");
                return Ok(existing);
            }
        }

        if !state.exists() {
            return Err(OperationError::new(
                &spec.name,
                LifecycleOp::Status,
                HypervisorError::NotFound(spec.name.clone()),
            ));
        }

        let backend_id = driver.backend_id(&spec).await.ok();
        info!(state = %state, "VNF adopted");
        Ok(self.commit(&spec, state, backend_id))
    }

    /// Re-read the state of a tracked VNF from its backend. An inconsistent
    /// VNF keeps its state until it is destroyed.
    #[instrument(skip(self))]
    pub async fn refresh(&self, name: &str) -> Result<VnfState> {
        let _guard = self.lock_name(name, LifecycleOp::Status).await?;

        let record = self.require(name, LifecycleOp::Status)?;
        let driver = self.driver(&record.spec, LifecycleOp::Status).await?;
        let state = driver
            .status(&record.spec)
            .await
            .map_err(|e| OperationError::new(name, LifecycleOp::Status, e))?;

        if record.state == VnfState::Inconsistent {
            warn!(backend = %state, "VNF is inconsistent, keeping it until destroyed");
            return Ok(record.state);
        }

        if state != record.state {
            warn!(tracked = %record.state, backend = %state, "VNF state drifted");
        }
        if state.exists() {
            self.commit(&record.spec, state, None);
        } else {
            self.forget(name);
        }
        Ok(state)
    }

    /// Tracked state of a VNF.
    pub fn state(&self, name: &str) -> Result<VnfState> {
        self.require(name, LifecycleOp::Status).map(|r| r.state)
    }

    pub fn record(&self, name: &str) -> Result<VnfRecord> {
        self.require(name, LifecycleOp::Status)
    }

    /// All tracked VNFs, sorted by name.
    pub fn list(&self) -> Vec<VnfRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<VnfRecord> = records.values().cloned().collect();
        list.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        list
    }

    /// IP address of a tracked VNF.
    #[instrument(skip(self))]
    pub async fn ip_address(&self, name: &str) -> Result<String> {
        let _guard = self.lock_name(name, LifecycleOp::Status).await?;

        let record = self.require(name, LifecycleOp::Status)?;
        let driver = self.driver(&record.spec, LifecycleOp::Status).await?;
        driver
            .ip_address(&record.spec)
            .await
            .map_err(|e| OperationError::new(name, LifecycleOp::Status, e))
    }

    /// Read a guest network counter.
    #[instrument(skip(self))]
    pub async fn guest_stats(&self, name: &str, stat: GuestStat) -> Result<u64> {
        let output = self.execute_command(name, stat.command()).await?;
        let value = output.stdout.trim();

        value.parse::<u64>().map_err(|_| {
            OperationError::new(
                name,
                LifecycleOp::Execute,
                HypervisorError::CommandFailed {
                    vnf: name.to_string(),
                    exit_code: Some(output.exit_code),
                    stdout: output.stdout.clone(),
                    stderr: format!("{} is not a counter value", stat),
                },
            )
        })
    }

    // -------------------------------------------------------------------------
    // Chains and teardown
    // -------------------------------------------------------------------------

    /// Deploy every VNF of a chain. Each element gets its own outcome.
    #[instrument(skip(self, specs), fields(len = specs.len()))]
    pub async fn deploy_chain(&self, specs: Vec<VnfSpec>) -> Vec<(String, Result<VnfRecord>)> {
        let outcomes = join_all(specs.into_iter().map(|spec| async move {
            let name = spec.name.clone();
            (name, self.deploy(spec).await)
        }))
        .await;

        let failed = outcomes.iter().filter(|(_, r)| r.is_err()).count();
        if failed > 0 {
            warn!(failed, "Chain deployed partially");
        } else {
            info!("Chain deployed");
        }
        outcomes
    }

    /// Release every driver connection.
    pub async fn shutdown(&self) {
        info!("Releasing hypervisor connections");
        self.factory.disconnect_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfio_hypervisor::{DriverRegistry, MockBackend, ScriptedIo, MOCK_BACKEND};

    #[test]
    fn test_transition_table() {
        use VnfState::*;

        assert_eq!(VnfOperations::check_transition("fw", Created, LifecycleOp::Start), Ok(Running));
        assert_eq!(VnfOperations::check_transition("fw", Stopped, LifecycleOp::Restart), Ok(Running));
        assert_eq!(VnfOperations::check_transition("fw", Inconsistent, LifecycleOp::Destroy), Ok(Absent));
        assert!(matches!(
            VnfOperations::check_transition("fw", Created, LifecycleOp::Pause),
            Err(HypervisorError::NotRunning { state: Created, .. })
        ));
        assert!(matches!(
            VnfOperations::check_transition("fw", Running, LifecycleOp::Unpause),
            Err(HypervisorError::NotRunning { state: Running, .. })
        ));
        assert!(matches!(
            VnfOperations::check_transition("fw", Created, LifecycleOp::Restart),
            Err(HypervisorError::InvalidTransition { from: Created, op: LifecycleOp::Restart, .. })
        ));
        assert!(matches!(
            VnfOperations::check_transition("fw", Inconsistent, LifecycleOp::Start),
            Err(HypervisorError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_guest_stat_parse() {
        assert_eq!("rx_bytes".parse::<GuestStat>(), Ok(GuestStat::RxBytes));
        assert_eq!("pkt_drops".parse::<GuestStat>(), Ok(GuestStat::PktDrops));
        assert!("cpu".parse::<GuestStat>().is_err());
        assert!(GuestStat::TxBytes.command().contains("TX bytes"));
    }

    #[test]
    fn test_operation_error_keeps_source() {
        let err = OperationError::new("fw", LifecycleOp::Stop, HypervisorError::NotFound("fw".into()));
        assert_eq!(err.code(), 702);
        assert_eq!(err.kind(), &HypervisorError::NotFound("fw".into()));
        assert_eq!(err.to_string(), "stop of VNF 'fw' failed: VNF not found: fw");
    }

    fn ops() -> VnfOperations {
        let backend = Arc::new(MockBackend::new());
        let registry = DriverRegistry::new().register(MOCK_BACKEND, move |_, _| {
            Ok(backend.clone() as Arc<dyn Hypervisor>)
        });
        let factory = HypervisorFactory::new(registry, Arc::new(ScriptedIo::new()));
        VnfOperations::new(Arc::new(factory), OperationSettings::default())
    }

    #[tokio::test]
    async fn test_lock_entries_released() {
        let ops = ops();
        let spec = VnfSpec::new("fw", "nfio/fw", "10.0.0.1").with_backend(MOCK_BACKEND);

        ops.create(spec).await.unwrap();
        assert_eq!(ops.locked_names(), 0);
        ops.destroy("fw").await.unwrap();
        assert!(ops.stop("nope").await.is_err());
        assert!(ops.refresh("nope").await.is_err());

        assert_eq!(ops.locked_names(), 0);
    }

    #[tokio::test]
    async fn test_lock_entry_kept_while_waiting() {
        let ops = ops();

        let held = ops.lock_name("fw", LifecycleOp::Start).await.unwrap();
        let waiter = ops.lock_name("fw", LifecycleOp::Stop);
        tokio::pin!(waiter);
        assert!(futures::poll!(waiter.as_mut()).is_pending());

        drop(held);
        assert_eq!(ops.locked_names(), 1);
        let second = waiter.await.unwrap();
        drop(second);
        assert_eq!(ops.locked_names(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let ops = ops();

        let held = ops.lock_name("fw", LifecycleOp::Start).await.unwrap();
        {
            let waiter = ops.lock_name("fw", LifecycleOp::Stop);
            tokio::pin!(waiter);
            assert!(futures::poll!(waiter.as_mut()).is_pending());
        }
        drop(held);
        assert_eq!(ops.locked_names(), 0);
    }
}
