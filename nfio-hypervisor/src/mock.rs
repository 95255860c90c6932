//! Mock hypervisor backend and scripted host I/O for testing and development.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument};

use crate::connection::{ConnectionSlot, HypervisorConnection};
use crate::error::{HypervisorError, Result};
use crate::io::{ExecOutput, HostIo, HostIoError};
use crate::traits::Hypervisor;
use crate::types::*;

// =============================================================================
// MOCK BACKEND
// =============================================================================

/// Mock hypervisor backend.
///
/// This backend simulates VNF operations in memory without requiring
/// an actual hypervisor. Useful for:
/// - Unit and integration testing (call counters, injected failures)
/// - Development without docker or libvirt installed (`--dev`)
pub struct MockBackend {
    connection: ConnectionSlot,
    vnfs: RwLock<HashMap<String, MockVnf>>,
    calls: Mutex<HashMap<LifecycleOp, usize>>,
    failures: RwLock<HashSet<LifecycleOp>>,
    fail_connect: AtomicBool,
    connects: AtomicU64,
    command_output: RwLock<String>,
    next_id: AtomicU64,
}

struct MockVnf {
    id: String,
    state: VnfState,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            connection: ConnectionSlot::new(),
            vnfs: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            failures: RwLock::new(HashSet::new()),
            fail_connect: AtomicBool::new(false),
            connects: AtomicU64::new(0),
            command_output: RwLock::new(String::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make every subsequent `op` fail on the backend.
    pub fn fail_on(&self, op: LifecycleOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(op);
        }
    }

    /// Stop injecting failures for `op`.
    pub fn clear_failure(&self, op: LifecycleOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.remove(&op);
        }
    }

    /// Make `connect` fail.
    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Set the stdout returned by `execute_command`.
    pub fn set_command_output(&self, output: impl Into<String>) {
        if let Ok(mut current) = self.command_output.write() {
            *current = output.into();
        }
    }

    /// Number of backend calls made for `op`.
    pub fn calls(&self, op: LifecycleOp) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Number of backend calls made for all operations.
    pub fn total_calls(&self) -> usize {
        self.calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// State the backend holds for `name` (by qualified name).
    pub fn backend_state(&self, name: &str) -> VnfState {
        self.vnfs
            .read()
            .ok()
            .and_then(|vnfs| vnfs.get(name).map(|v| v.state))
            .unwrap_or(VnfState::Absent)
    }

    /// Validate, require a connection and count the call.
    async fn enter(&self, op: LifecycleOp, vnf: &VnfSpec) -> Result<()> {
        vnf.validate()?;
        self.connection.endpoint().await?;
        let mut calls = self.calls.lock().map_err(|_| {
            HypervisorError::ConnectionFailed("Lock poisoned".to_string())
        })?;
        *calls.entry(op).or_insert(0) += 1;
        Ok(())
    }

    fn injected(&self, op: LifecycleOp, vnf: &VnfSpec) -> Result<()> {
        let failing = self
            .failures
            .read()
            .map(|f| f.contains(&op))
            .unwrap_or(false);
        if failing {
            debug!(op = %op, vnf = %vnf.name, "Injected failure");
            return Err(HypervisorError::failed(op, &vnf.name, "injected failure"));
        }
        Ok(())
    }

    /// Apply `f` to the backend entry of `vnf`.
    fn with_vnf<T>(
        &self,
        vnf: &VnfSpec,
        f: impl FnOnce(&mut MockVnf) -> Result<T>,
    ) -> Result<T> {
        let mut vnfs = self.vnfs.write().map_err(|_| {
            HypervisorError::ConnectionFailed("Lock poisoned".to_string())
        })?;
        let entry = vnfs
            .get_mut(&vnf.qualified_name())
            .ok_or_else(|| HypervisorError::NotFound(vnf.name.clone()))?;
        f(entry)
    }

    /// Move `vnf` from one of `from` to `to`, failing with `NotRunning` otherwise.
    fn transition(
        &self,
        op: LifecycleOp,
        vnf: &VnfSpec,
        from: &[VnfState],
        to: VnfState,
    ) -> Result<()> {
        self.with_vnf(vnf, |entry| {
            if !from.contains(&entry.state) {
                return Err(HypervisorError::NotRunning {
                    vnf: vnf.name.clone(),
                    state: entry.state,
                });
            }
            self.injected(op, vnf)?;
            entry.state = to;
            Ok(())
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    fn kind(&self) -> &str {
        MOCK_BACKEND
    }

    async fn connect(&self) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(HypervisorError::ConnectionFailed(
                "mock connection refused".to_string(),
            ));
        }
        self.connection
            .open(MOCK_BACKEND, "mock://", || async { Ok("1.0.0".to_string()) })
            .await?;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
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

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn create(&self, vnf: &VnfSpec) -> Result<String> {
        self.enter(LifecycleOp::Create, vnf).await?;
        self.injected(LifecycleOp::Create, vnf)?;

        let mut vnfs = self.vnfs.write().map_err(|_| {
            HypervisorError::ConnectionFailed("Lock poisoned".to_string())
        })?;

        let name = vnf.qualified_name();
        if vnfs.contains_key(&name) {
            return Err(HypervisorError::failed(
                LifecycleOp::Create,
                &vnf.name,
                format!("{} already exists", name),
            ));
        }

        let id = format!("mock-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        vnfs.insert(name, MockVnf {
            id: id.clone(),
            state: VnfState::Created,
        });

        info!(backend_id = %id, "Mock VNF created");
        Ok(id)
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn start(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Start, vnf).await?;
        self.with_vnf(vnf, |entry| {
            if entry.state == VnfState::Running {
                return Err(HypervisorError::failed(
                    LifecycleOp::Start,
                    &vnf.name,
                    "already running",
                ));
            }
            self.injected(LifecycleOp::Start, vnf)?;
            entry.state = VnfState::Running;
            Ok(())
        })?;
        info!("Mock VNF started");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn restart(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Restart, vnf).await?;
        self.with_vnf(vnf, |entry| {
            self.injected(LifecycleOp::Restart, vnf)?;
            entry.state = VnfState::Running;
            Ok(())
        })?;
        info!("Mock VNF restarted");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn stop(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Stop, vnf).await?;
        self.transition(LifecycleOp::Stop, vnf, &[VnfState::Running], VnfState::Stopped)?;
        info!("Mock VNF stopped");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn pause(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Pause, vnf).await?;
        self.transition(LifecycleOp::Pause, vnf, &[VnfState::Running], VnfState::Paused)?;
        info!("Mock VNF paused");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn unpause(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Unpause, vnf).await?;
        self.transition(LifecycleOp::Unpause, vnf, &[VnfState::Paused], VnfState::Running)?;
        info!("Mock VNF unpaused");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn destroy(&self, vnf: &VnfSpec) -> Result<()> {
        self.enter(LifecycleOp::Destroy, vnf).await?;

        let mut vnfs = self.vnfs.write().map_err(|_| {
            HypervisorError::ConnectionFailed("Lock poisoned".to_string())
        })?;

        let name = vnf.qualified_name();
        if !vnfs.contains_key(&name) {
            return Err(HypervisorError::NotFound(vnf.name.clone()));
        }
        self.injected(LifecycleOp::Destroy, vnf)?;
        vnfs.remove(&name);

        info!("Mock VNF destroyed");
        Ok(())
    }

    #[instrument(skip(self, vnf), fields(vnf = %vnf.name))]
    async fn execute_command(&self, vnf: &VnfSpec, command: &str) -> Result<ExecOutput> {
        self.enter(LifecycleOp::Execute, vnf).await?;
        let state = self.with_vnf(vnf, |entry| Ok(entry.state))?;
        if state != VnfState::Running {
            return Err(HypervisorError::NotRunning {
                vnf: vnf.name.clone(),
                state,
            });
        }

        if self.injected(LifecycleOp::Execute, vnf).is_err() {
            return Err(HypervisorError::CommandFailed {
                vnf: vnf.name.clone(),
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("{}: command failed", command),
            });
        }

        let stdout = self
            .command_output
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        debug!(command = %command, "Mock command executed");
        Ok(ExecOutput::ok(stdout))
    }

    async fn status(&self, vnf: &VnfSpec) -> Result<VnfState> {
        self.enter(LifecycleOp::Status, vnf).await?;
        Ok(self.backend_state(&vnf.qualified_name()))
    }

    async fn backend_id(&self, vnf: &VnfSpec) -> Result<String> {
        self.enter(LifecycleOp::Status, vnf).await?;
        self.with_vnf(vnf, |entry| Ok(entry.id.clone()))
    }

    async fn ip_address(&self, vnf: &VnfSpec) -> Result<String> {
        self.enter(LifecycleOp::Status, vnf).await?;
        self.with_vnf(vnf, |_| Ok("172.17.0.2".to_string()))
    }
}

// =============================================================================
// SCRIPTED HOST I/O
// =============================================================================

/// [`HostIo`] that answers commands from a script and records every call.
///
/// Rules match when their pattern is a substring of the command line
/// (`command arg1 arg2 ...`). One-shot rules are consumed in registration
/// order and take precedence; among persistent rules the latest registered
/// wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedIo {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
}

struct Rule {
    pattern: String,
    reply: Reply,
    once: bool,
    used: bool,
}

#[derive(Clone)]
enum Reply {
    Output(ExecOutput),
    SpawnError,
}

impl ScriptedIo {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, pattern: &str, reply: Reply, once: bool) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                pattern: pattern.to_string(),
                reply,
                once,
                used: false,
            });
        }
    }

    /// Answer every command containing `pattern` with `output`.
    pub fn on(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push(pattern, Reply::Output(output), false);
        self
    }

    /// Answer the next command containing `pattern` with `output`.
    pub fn once(&self, pattern: &str, output: ExecOutput) -> &Self {
        self.push(pattern, Reply::Output(output), true);
        self
    }

    /// Fail to spawn every command containing `pattern`.
    pub fn spawn_error(&self, pattern: &str) -> &Self {
        self.push(pattern, Reply::SpawnError, false);
        self
    }

    /// Pre-populate a file readable through `read_file`.
    pub fn put_file(&self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.into(), content.into());
        }
    }

    /// Content of a staged file.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .lock()
            .ok()
            .and_then(|files| files.get(path.as_ref()).cloned())
    }

    /// All command lines executed so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of executed command lines containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    fn reply_for(&self, line: &str) -> Reply {
        let Ok(mut rules) = self.rules.lock() else {
            return Reply::Output(ExecOutput::default());
        };

        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.once && !r.used && line.contains(&r.pattern))
        {
            rule.used = true;
            return rule.reply.clone();
        }

        rules
            .iter()
            .rev()
            .find(|r| !r.once && line.contains(&r.pattern))
            .map(|r| r.reply.clone())
            .unwrap_or(Reply::Output(ExecOutput::default()))
    }
}

#[async_trait]
impl HostIo for ScriptedIo {
    async fn execute(&self, command: &str, args: &[String]) -> std::result::Result<ExecOutput, HostIoError> {
        let line = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(line.clone());
        }

        match self.reply_for(&line) {
            Reply::Output(output) => Ok(output),
            Reply::SpawnError => Err(HostIoError::Spawn {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
            }),
        }
    }

    async fn stage_file(&self, path: &Path, content: &[u8]) -> std::result::Result<(), HostIoError> {
        self.put_file(path, content.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &Path) -> std::result::Result<Vec<u8>, HostIoError> {
        self.file(path).ok_or_else(|| HostIoError::Read {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such scripted file"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> VnfSpec {
        VnfSpec::new(name, "nfio/fw", "10.0.0.1").with_backend(MOCK_BACKEND)
    }

    async fn connected() -> MockBackend {
        let backend = MockBackend::new();
        backend.connect().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_vnf_lifecycle() {
        let backend = connected().await;
        let vnf = spec("lifecycle-test");

        // Create
        let id = backend.create(&vnf).await.unwrap();
        assert!(id.starts_with("mock-"));
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Created);

        // Start
        backend.start(&vnf).await.unwrap();
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Running);

        // Pause
        backend.pause(&vnf).await.unwrap();
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Paused);

        // Unpause
        backend.unpause(&vnf).await.unwrap();
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Running);

        // Stop
        backend.stop(&vnf).await.unwrap();
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Stopped);

        // Destroy
        backend.destroy(&vnf).await.unwrap();
        assert_eq!(backend.status(&vnf).await.unwrap(), VnfState::Absent);
        assert!(matches!(
            backend.destroy(&vnf).await,
            Err(HypervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_makes_no_calls() {
        let backend = connected().await;
        let err = backend.create(&VnfSpec::new("fw", "", "10.0.0.1")).await.unwrap_err();
        assert_eq!(err, HypervisorError::ConfigInvalid { field: VnfField::Image });
        assert_eq!(backend.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let backend = MockBackend::new();
        let err = backend.create(&spec("fw")).await.unwrap_err();
        assert!(matches!(err, HypervisorError::ConnectionFailed(_)));
    }

    #[tokio::test]
    async fn test_deploy_rollback() {
        let backend = connected().await;
        let vnf = spec("fw");

        backend.fail_on(LifecycleOp::Start);
        let err = backend.deploy(&vnf).await.unwrap_err();
        assert!(matches!(err, HypervisorError::OperationFailed { op: LifecycleOp::Deploy, .. }));
        assert_eq!(backend.backend_state("fw"), VnfState::Absent);

        backend.fail_on(LifecycleOp::Destroy);
        let err = backend.deploy(&vnf).await.unwrap_err();
        assert!(err.requires_inspection());
        assert_eq!(backend.backend_state("fw"), VnfState::Created);
    }

    #[tokio::test]
    async fn test_scripted_io_rules() {
        let io = ScriptedIo::new();
        io.on("domstate", ExecOutput::ok("shut off"))
            .once("domstate", ExecOutput::ok("running"));

        let args = vec!["domstate".to_string(), "fw".to_string()];
        assert_eq!(io.execute("virsh", &args).await.unwrap().stdout, "running");
        assert_eq!(io.execute("virsh", &args).await.unwrap().stdout, "shut off");
        assert_eq!(io.count("domstate fw"), 2);

        io.spawn_error("docker");
        assert!(io.execute("docker", &[]).await.is_err());
    }
}
