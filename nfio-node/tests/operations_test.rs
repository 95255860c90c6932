//! Integration tests for the VNF lifecycle engine.
//!
//! These tests drive `VnfOperations` against a shared mock backend injected
//! through a custom driver registry.

use std::sync::Arc;

use nfio_hypervisor::{
    DockerConfig, DriverRegistry, ExecOutput, Hypervisor, HypervisorError, HypervisorFactory,
    LibvirtConfig, LifecycleOp, MockBackend, ScriptedIo, VnfField, VnfSpec, VnfState,
    DOCKER_BACKEND, MOCK_BACKEND,
};
use nfio_node::{GuestStat, OperationSettings, VnfOperations};

fn setup() -> (Arc<VnfOperations>, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let shared = backend.clone();
    let registry = DriverRegistry::new().register(MOCK_BACKEND, move |_, _| {
        Ok(shared.clone() as Arc<dyn Hypervisor>)
    });
    let factory = HypervisorFactory::new(registry, Arc::new(ScriptedIo::new()));
    let ops = VnfOperations::new(Arc::new(factory), OperationSettings::default());
    (Arc::new(ops), backend)
}

fn spec(name: &str) -> VnfSpec {
    VnfSpec::new(name, "nfio/fw", "10.0.0.1").with_backend(MOCK_BACKEND)
}

/// Empty descriptor fields are rejected before any backend interaction.
#[tokio::test]
async fn test_invalid_descriptor_touches_nothing() {
    let (ops, backend) = setup();

    let cases = [
        (VnfSpec::new("", "nfio/fw", "10.0.0.1"), VnfField::Name),
        (VnfSpec::new("fw", "", "10.0.0.1"), VnfField::Image),
        (VnfSpec::new("fw", "nfio/fw", ""), VnfField::Host),
    ];
    for (vnf, field) in cases {
        let vnf = vnf.with_backend(MOCK_BACKEND);
        let err = ops.create(vnf.clone()).await.unwrap_err();
        assert_eq!(err.kind(), &HypervisorError::ConfigInvalid { field });
        let err = ops.deploy(vnf).await.unwrap_err();
        assert_eq!(err.kind(), &HypervisorError::ConfigInvalid { field });
    }


    for err in [
        ops.stop("").await.unwrap_err(),
        ops.pause("").await.unwrap_err(),
        ops.destroy("").await.unwrap_err(),
        ops.execute_command(" ", "true").await.unwrap_err(),
        ops.refresh("").await.unwrap_err(),
    ] {
        assert_eq!(err.kind(), &HypervisorError::ConfigInvalid { field: VnfField::Name });
        assert_eq!(err.code(), 715);
    }
    assert!(ops.state("").unwrap_err().kind().is_configuration());

    assert_eq!(backend.total_calls(), 0);
    assert_eq!(backend.connect_count(), 0);
}

/// create then destroy leaves nothing behind; a second destroy is not-found.
#[tokio::test]
async fn test_create_destroy() {
    let (ops, backend) = setup();

    let record = ops.create(spec("fw")).await.unwrap();
    assert_eq!(record.state, VnfState::Created);
    assert_eq!(record.backend_id.as_deref(), Some("mock-0001"));
    assert_eq!(backend.backend_state("fw"), VnfState::Created);

    ops.destroy("fw").await.unwrap();
    assert_eq!(backend.backend_state("fw"), VnfState::Absent);
    assert!(ops.state("fw").is_err());

    let err = ops.destroy("fw").await.unwrap_err();
    assert_eq!(err.kind(), &HypervisorError::NotFound("fw".into()));
    assert_eq!(err.action, LifecycleOp::Destroy);
}

/// create on a tracked VNF is an invalid transition.
#[tokio::test]
async fn test_create_twice() {
    let (ops, backend) = setup();

    ops.create(spec("fw")).await.unwrap();
    let err = ops.create(spec("fw")).await.unwrap_err();
    assert!(matches!(
        err.kind(),
        HypervisorError::InvalidTransition { from: VnfState::Created, op: LifecycleOp::Create, .. }
    ));
    assert_eq!(backend.calls(LifecycleOp::Create), 1);
}

/// pause is only accepted from running and never reaches the backend otherwise.
#[tokio::test]
async fn test_pause_requires_running() {
    let (ops, backend) = setup();

    let err = ops.pause("fw").await.unwrap_err();
    assert_eq!(err.kind(), &HypervisorError::NotFound("fw".into()));

    ops.create(spec("fw")).await.unwrap();
    let err = ops.pause("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::NotRunning { state: VnfState::Created, .. }));

    ops.start("fw").await.unwrap();
    ops.stop("fw").await.unwrap();
    let err = ops.pause("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::NotRunning { state: VnfState::Stopped, .. }));

    assert_eq!(backend.calls(LifecycleOp::Pause), 0);
}

/// Full lifecycle through every transition.
#[tokio::test]
async fn test_lifecycle() {
    let (ops, backend) = setup();

    ops.create(spec("fw")).await.unwrap();
    ops.start("fw").await.unwrap();
    ops.pause("fw").await.unwrap();
    assert_eq!(ops.state("fw").unwrap(), VnfState::Paused);
    ops.unpause("fw").await.unwrap();
    ops.restart("fw").await.unwrap();
    ops.stop("fw").await.unwrap();
    ops.restart("fw").await.unwrap();
    assert_eq!(ops.state("fw").unwrap(), VnfState::Running);
    assert_eq!(backend.backend_state("fw"), VnfState::Running);

    let err = ops.unpause("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::NotRunning { .. }));

    ops.destroy("fw").await.unwrap();
    assert!(ops.list().is_empty());
}

/// A repeated stop is rejected and leaves the state alone.
#[tokio::test]
async fn test_repeated_stop() {
    let (ops, backend) = setup();

    ops.deploy(spec("fw")).await.unwrap();
    ops.stop("fw").await.unwrap();

    let err = ops.stop("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::NotRunning { state: VnfState::Stopped, .. }));
    assert_eq!(ops.state("fw").unwrap(), VnfState::Stopped);
    assert_eq!(backend.calls(LifecycleOp::Stop), 1);
}

/// A backend rejection leaves the tracked state unchanged.
#[tokio::test]
async fn test_backend_failure_keeps_state() {
    let (ops, backend) = setup();

    ops.deploy(spec("fw")).await.unwrap();
    backend.fail_on(LifecycleOp::Stop);

    let err = ops.stop("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::OperationFailed { op: LifecycleOp::Stop, .. }));
    assert_eq!(err.code(), 709);
    assert_eq!(ops.state("fw").unwrap(), VnfState::Running);
}

/// Start fails and the rollback fails too: the VNF is inconsistent until destroyed.
#[tokio::test]
async fn test_deploy_inconsistent() {
    let (ops, backend) = setup();
    backend.fail_on(LifecycleOp::Start);
    backend.fail_on(LifecycleOp::Destroy);

    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(err.kind().requires_inspection());
    assert_eq!(err.code(), 712);
    assert_eq!(ops.state("fw").unwrap(), VnfState::Inconsistent);

    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::InvalidTransition { from: VnfState::Inconsistent, .. }));
    let err = ops.start("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::InvalidTransition { .. }));

    backend.clear_failure(LifecycleOp::Destroy);
    ops.destroy("fw").await.unwrap();
    assert!(ops.state("fw").is_err());
    assert_eq!(backend.backend_state("fw"), VnfState::Absent);
}

/// Re-reading backend state does not clear an inconsistent VNF.
#[tokio::test]
async fn test_inconsistent_survives_adopt_and_refresh() {
    let (ops, backend) = setup();
    backend.fail_on(LifecycleOp::Start);
    backend.fail_on(LifecycleOp::Destroy);

    ops.deploy(spec("fw")).await.unwrap_err();
    assert_eq!(backend.backend_state("fw"), VnfState::Created);

    let record = ops.adopt(spec("fw")).await.unwrap();
    assert_eq!(record.state, VnfState::Inconsistent);
    assert_eq!(ops.refresh("fw").await.unwrap(), VnfState::Inconsistent);

    backend.clear_failure(LifecycleOp::Start);
    let err = ops.start("fw").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::InvalidTransition { from: VnfState::Inconsistent, .. }));
    assert_eq!(ops.state("fw").unwrap(), VnfState::Inconsistent);
    assert_eq!(backend.backend_state("fw"), VnfState::Created);
}

/// A tracked VNF whose start or unpause fails during deploy reports a deploy failure.
#[tokio::test]
async fn test_deploy_of_tracked_vnf_reports_deploy_code() {
    let (ops, backend) = setup();

    ops.create(spec("fw")).await.unwrap();
    backend.fail_on(LifecycleOp::Start);
    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::OperationFailed { op: LifecycleOp::Deploy, .. }));
    assert_eq!(err.code(), 705);
    assert_eq!(ops.state("fw").unwrap(), VnfState::Created);

    backend.clear_failure(LifecycleOp::Start);
    ops.deploy(spec("fw")).await.unwrap();
    ops.pause("fw").await.unwrap();
    backend.fail_on(LifecycleOp::Unpause);
    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert_eq!(err.code(), 705);
    assert_eq!(ops.state("fw").unwrap(), VnfState::Paused);
}

/// Start fails but the rollback succeeds: plain deploy error, nothing tracked.
#[tokio::test]
async fn test_deploy_rolled_back() {
    let (ops, backend) = setup();
    backend.fail_on(LifecycleOp::Start);

    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::OperationFailed { op: LifecycleOp::Deploy, .. }));
    assert!(ops.state("fw").is_err());
    assert_eq!(backend.backend_state("fw"), VnfState::Absent);
}

/// Create failing during deploy is a plain deploy error.
#[tokio::test]
async fn test_deploy_create_failure() {
    let (ops, backend) = setup();
    backend.fail_on(LifecycleOp::Create);

    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::OperationFailed { op: LifecycleOp::Deploy, .. }));
    assert_eq!(err.code(), 705);
    assert!(ops.state("fw").is_err());
    assert_eq!(backend.calls(LifecycleOp::Start), 0);
}

/// deploy brings a VNF to running from every resting state.
#[tokio::test]
async fn test_deploy_from_each_state() {
    let (ops, backend) = setup();

    ops.create(spec("fw")).await.unwrap();
    ops.deploy(spec("fw")).await.unwrap();
    assert_eq!(ops.state("fw").unwrap(), VnfState::Running);

    ops.pause("fw").await.unwrap();
    ops.deploy(spec("fw")).await.unwrap();
    assert_eq!(backend.calls(LifecycleOp::Unpause), 1);

    let starts = backend.calls(LifecycleOp::Start);
    let record = ops.deploy(spec("fw")).await.unwrap();
    assert_eq!(record.state, VnfState::Running);
    assert_eq!(backend.calls(LifecycleOp::Start), starts);

    ops.stop("fw").await.unwrap();
    ops.deploy(spec("fw")).await.unwrap();
    assert_eq!(backend.backend_state("fw"), VnfState::Running);
}

/// Concurrent create/destroy on one name end in a state the backend agrees with.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_same_name() {
    let (ops, backend) = setup();

    let mut handles = Vec::new();
    for i in 0..20 {
        let ops = ops.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let _ = ops.create(spec("fw")).await;
            } else {
                let _ = ops.destroy("fw").await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let tracked = ops.state("fw").unwrap_or(VnfState::Absent);
    assert_eq!(tracked, backend.backend_state("fw"));
}

/// Distinct names proceed independently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_names() {
    let (ops, backend) = setup();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let ops = ops.clone();
            tokio::spawn(async move { ops.deploy(spec(&format!("vnf{}", i))).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(ops.list().len(), 8);
    assert_eq!(backend.calls(LifecycleOp::Create), 8);
}

/// Unregistered backends fail before any connection attempt.
#[tokio::test]
async fn test_unknown_backend() {
    let (ops, backend) = setup();

    let err = ops.create(spec("fw").with_backend("xen")).await.unwrap_err();
    assert_eq!(err.kind(), &HypervisorError::UnknownBackend("xen".into()));
    assert!(err.kind().is_configuration());
    assert_eq!(backend.connect_count(), 0);
}

/// A refused connection surfaces as a connection error.
#[tokio::test]
async fn test_connection_refused() {
    let (ops, backend) = setup();
    backend.fail_connect(true);

    let err = ops.deploy(spec("fw")).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::ConnectionFailed(_)));
    assert_eq!(err.code(), 701);
}

/// Commands run only in running VNFs; counters are parsed from stdout.
#[tokio::test]
async fn test_execute_and_guest_stats() {
    let (ops, backend) = setup();

    ops.create(spec("fw")).await.unwrap();
    let err = ops.execute_command("fw", "uptime").await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::NotRunning { .. }));
    assert_eq!(backend.calls(LifecycleOp::Execute), 0);

    ops.start("fw").await.unwrap();
    backend.set_command_output("123456\n");
    assert_eq!(ops.guest_stats("fw", GuestStat::RxBytes).await.unwrap(), 123456);

    backend.set_command_output("eth0: no such device");
    let err = ops.guest_stats("fw", GuestStat::PktDrops).await.unwrap_err();
    assert!(matches!(err.kind(), HypervisorError::CommandFailed { .. }));

    backend.fail_on(LifecycleOp::Execute);
    let err = ops.execute_command("fw", "false").await.unwrap_err();
    assert_eq!(err.code(), 703);
}

/// Existing backend VNFs can be adopted and refreshed.
#[tokio::test]
async fn test_adopt_and_refresh() {
    let (ops, backend) = setup();

    backend.connect().await.unwrap();
    backend.create(&spec("fw")).await.unwrap();
    backend.start(&spec("fw")).await.unwrap();

    let record = ops.adopt(spec("fw")).await.unwrap();
    assert_eq!(record.state, VnfState::Running);
    assert_eq!(record.backend_id.as_deref(), Some("mock-0001"));
    assert_eq!(ops.ip_address("fw").await.unwrap(), "172.17.0.2");

    backend.pause(&spec("fw")).await.unwrap();
    assert_eq!(ops.refresh("fw").await.unwrap(), VnfState::Paused);
    assert_eq!(ops.state("fw").unwrap(), VnfState::Paused);

    backend.destroy(&spec("fw")).await.unwrap();
    assert_eq!(ops.refresh("fw").await.unwrap(), VnfState::Absent);
    assert!(ops.state("fw").is_err());

    let err = ops.adopt(spec("nat")).await.unwrap_err();
    assert_eq!(err.kind(), &HypervisorError::NotFound("nat".into()));
}

/// Each chain element gets its own outcome.
#[tokio::test]
async fn test_deploy_chain() {
    let (ops, _backend) = setup();

    let chain = vec![
        spec("fw"),
        VnfSpec::new("dpi", "", "10.0.0.1").with_backend(MOCK_BACKEND),
        spec("nat"),
    ];
    let outcomes = ops.deploy_chain(chain).await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].1.is_ok());
    assert!(matches!(
        outcomes[1].1.as_ref().unwrap_err().kind(),
        HypervisorError::ConfigInvalid { field: VnfField::Image }
    ));
    assert_eq!(outcomes[2].0, "nat");
    assert_eq!(ops.list().len(), 2);
}

/// The docker driver runs behind the orchestrator through scripted host I/O,
/// and reconnects after shutdown.
#[tokio::test]
async fn test_docker_through_orchestrator() {
    let io = Arc::new(ScriptedIo::new());
    io.on("version", ExecOutput::ok("24.0.7"))
        .on(" create ", ExecOutput::ok("3f2a9c"))
        .once("inspect", ExecOutput::ok(r#"{"Status":"created"}"#))
        .on("inspect", ExecOutput::ok(r#"{"Status":"running"}"#));

    let registry = DriverRegistry::with_defaults(DockerConfig::default(), LibvirtConfig::default());
    let factory = HypervisorFactory::new(registry, io.clone());
    let ops = VnfOperations::new(Arc::new(factory), OperationSettings::default());

    let vnf = VnfSpec::new("fw", "nfio/fw", "10.0.0.1").with_backend(DOCKER_BACKEND);
    let record = ops.deploy(vnf).await.unwrap();
    assert_eq!(record.backend_id.as_deref(), Some("3f2a9c"));

    ops.pause("fw").await.unwrap();
    assert_eq!(io.count("pause fw"), 1);

    ops.shutdown().await;
    assert_eq!(ops.refresh("fw").await.unwrap(), VnfState::Running);
    assert_eq!(io.count("version"), 2);
}
