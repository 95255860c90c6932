//! Driver registry and connected-driver cache.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               HypervisorFactory              │
//! │  - caches one connected driver per           │
//! │    (backend kind, host, endpoint)            │
//! └──────────────────────┬───────────────────────┘
//!                        │ lookup(kind)
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │                DriverRegistry                │
//! │   "docker" ─► DockerDriver                   │
//! │   "libvirt" ─► LibvirtDriver                 │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The registry is built once at startup and never mutated afterwards, so
//! lookups need no locking. Additional backends are added with
//! [`DriverRegistry::register`] without touching this module.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::docker::{DockerConfig, DockerDriver};
use crate::error::{HypervisorError, Result};
use crate::io::HostIo;
use crate::libvirt::{LibvirtConfig, LibvirtDriver};
use crate::traits::Hypervisor;
use crate::types::*;

/// Builds an unconnected driver for the given connection parameters.
pub type DriverConstructor =
    Arc<dyn Fn(&ConnectionParams, Arc<dyn HostIo>) -> Result<Arc<dyn Hypervisor>> + Send + Sync>;

/// Mapping from backend kind to driver constructor.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    constructors: HashMap<String, DriverConstructor>,
}

impl DriverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the docker and libvirt drivers.
    pub fn with_defaults(docker: DockerConfig, libvirt: LibvirtConfig) -> Self {
        Self::new()
            .register(DOCKER_BACKEND, move |params, io| {
                Ok(Arc::new(DockerDriver::new(params.clone(), docker.clone(), io)) as Arc<dyn Hypervisor>)
            })
            .register(LIBVIRT_BACKEND, move |params, io| {
                Ok(Arc::new(LibvirtDriver::new(params.clone(), libvirt.clone(), io)) as Arc<dyn Hypervisor>)
            })
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(mut self, kind: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&ConnectionParams, Arc<dyn HostIo>) -> Result<Arc<dyn Hypervisor>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind.into(), Arc::new(constructor));
        self
    }

    /// Constructor registered for `kind`.
    pub fn lookup(&self, kind: &str) -> Result<DriverConstructor> {
        self.constructors
            .get(kind)
            .cloned()
            .ok_or_else(|| HypervisorError::UnknownBackend(kind.to_string()))
    }

    /// Registered backend kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Cache key of a driver instance: backend kind, host and endpoint override.
type DriverKey = (String, String, Option<String>);

/// Connection cell of one driver key. Empty until a connect succeeds.
type DriverCell = Arc<Mutex<Option<Arc<dyn Hypervisor>>>>;

/// Hands out connected drivers, one per (backend kind, host, endpoint).
///
/// Each key has its own cell, so a slow connect only holds back callers of
/// the same key. The stop timeout of the first caller sticks to the cached
/// driver.
pub struct HypervisorFactory {
    registry: Arc<DriverRegistry>,
    io: Arc<dyn HostIo>,
    instances: Mutex<HashMap<DriverKey, DriverCell>>,
}

impl HypervisorFactory {
    pub fn new(registry: DriverRegistry, io: Arc<dyn HostIo>) -> Self {
        Self {
            registry: Arc::new(registry),
            io,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    async fn cell(&self, key: DriverKey) -> DriverCell {
        let mut instances = self.instances.lock().await;
        instances.entry(key).or_default().clone()
    }

    /// Connected driver for `kind` on `params.host`.
    ///
    /// Unknown kinds fail before any connection attempt. A driver whose
    /// connect fails is not cached, so the next call retries.
    #[instrument(skip(self, params), fields(host = %params.host))]
    pub async fn get_driver(&self, kind: &str, params: &ConnectionParams) -> Result<Arc<dyn Hypervisor>> {
        let constructor = self.registry.lookup(kind)?;
        let key = (kind.to_string(), params.host.clone(), params.endpoint.clone());

        let cell = self.cell(key).await;
        let mut slot = cell.lock().await;

        if let Some(driver) = slot.as_ref() {
            if driver.is_connected().await {
                return Ok(driver.clone());
            }
            debug!("Cached driver lost its connection, reconnecting");
            driver.connect().await?;
            return Ok(driver.clone());
        }

        let driver = constructor(params, self.io.clone())?;
        driver.connect().await?;

        info!(backend = %kind, "Hypervisor driver connected");
        *slot = Some(driver.clone());
        Ok(driver)
    }

    /// Number of cached drivers.
    pub async fn cached(&self) -> usize {
        let cells: Vec<DriverCell> = self.instances.lock().await.values().cloned().collect();
        let mut count = 0;
        for cell in cells {
            if cell.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Disconnect and drop every cached driver.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.instances.lock().await.drain().collect();
        for ((kind, host, _), cell) in drained {
            let Some(driver) = cell.lock().await.take() else {
                continue;
            };
            if let Err(e) = driver.disconnect().await {
                warn!(backend = %kind, host = %host, error = %e, "Failed to disconnect driver");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBackend, ScriptedIo};
    use crate::io::{ExecOutput, HostIoError};
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;

    /// Scripted I/O whose commands against one host hang for a while.
    struct SlowHostIo {
        inner: ScriptedIo,
        slow_host: String,
        delay: Duration,
    }

    #[async_trait]
    impl HostIo for SlowHostIo {
        async fn execute(&self, command: &str, args: &[String]) -> std::result::Result<ExecOutput, HostIoError> {
            if args.iter().any(|arg| arg.contains(&self.slow_host)) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.execute(command, args).await
        }

        async fn stage_file(&self, path: &Path, content: &[u8]) -> std::result::Result<(), HostIoError> {
            self.inner.stage_file(path, content).await
        }

        async fn read_file(&self, path: &Path) -> std::result::Result<Vec<u8>, HostIoError> {
            self.inner.read_file(path).await
        }
    }

    fn mock_registry(backend: Arc<MockBackend>) -> DriverRegistry {
        DriverRegistry::new().register(MOCK_BACKEND, move |_, _| Ok(backend.clone() as Arc<dyn Hypervisor>))
    }

    #[tokio::test]
    async fn test_unknown_backend_fails_before_connect() {
        let io = Arc::new(ScriptedIo::new());
        let factory = HypervisorFactory::new(
            DriverRegistry::with_defaults(DockerConfig::default(), LibvirtConfig::default()),
            io.clone(),
        );

        let err = factory
            .get_driver("xen", &ConnectionParams::new("10.0.0.1"))
            .await
            .err()
            .unwrap();
        assert_eq!(err, HypervisorError::UnknownBackend("xen".into()));
        assert!(io.calls().is_empty());
        assert_eq!(factory.registry().kinds(), vec!["docker", "libvirt"]);
    }

    #[tokio::test]
    async fn test_driver_is_cached_per_host() {
        let backend = Arc::new(MockBackend::new());
        let factory = HypervisorFactory::new(mock_registry(backend.clone()), Arc::new(ScriptedIo::new()));

        let params = ConnectionParams::new("10.0.0.1");
        let first = factory.get_driver(MOCK_BACKEND, &params).await.unwrap();
        let second = factory.get_driver(MOCK_BACKEND, &params).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.connect_count(), 1);

        factory.get_driver(MOCK_BACKEND, &ConnectionParams::new("10.0.0.2")).await.unwrap();
        assert_eq!(factory.cached().await, 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let backend = Arc::new(MockBackend::new());
        backend.fail_connect(true);
        let factory = HypervisorFactory::new(mock_registry(backend.clone()), Arc::new(ScriptedIo::new()));
        let params = ConnectionParams::new("10.0.0.1");

        let err = factory.get_driver(MOCK_BACKEND, &params).await.err().unwrap();
        assert!(matches!(err, HypervisorError::ConnectionFailed(_)));
        assert_eq!(factory.cached().await, 0);

        backend.fail_connect(false);
        factory.get_driver(MOCK_BACKEND, &params).await.unwrap();
        assert_eq!(factory.cached().await, 1);
    }

    #[tokio::test]
    async fn test_docker_driver_from_defaults() {
        let io = Arc::new(ScriptedIo::new());
        io.on("version", ExecOutput::ok("24.0.7"));
        let factory = HypervisorFactory::new(
            DriverRegistry::with_defaults(DockerConfig::default(), LibvirtConfig::default()),
            io.clone(),
        );

        let driver = factory
            .get_driver(DOCKER_BACKEND, &ConnectionParams::new("10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(driver.kind(), DOCKER_BACKEND);
        assert!(driver.is_connected().await);

        factory.disconnect_all().await;
        assert!(!driver.is_connected().await);
        assert_eq!(factory.cached().await, 0);
    }

    #[tokio::test]
    async fn test_slow_host_does_not_block_other_hosts() {
        let inner = ScriptedIo::new();
        inner.on("version", ExecOutput::ok("24.0.7"));
        let io = Arc::new(SlowHostIo {
            inner,
            slow_host: "10.0.0.1".to_string(),
            delay: Duration::from_secs(3),
        });
        let factory = Arc::new(HypervisorFactory::new(
            DriverRegistry::with_defaults(DockerConfig::default(), LibvirtConfig::default()),
            io,
        ));

        let slow = tokio::spawn({
            let factory = factory.clone();
            async move {
                factory
                    .get_driver(DOCKER_BACKEND, &ConnectionParams::new("10.0.0.1"))
                    .await
                    .is_ok()
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            factory.get_driver(DOCKER_BACKEND, &ConnectionParams::new("10.0.0.2")),
        )
        .await
        .expect("connect to an idle host waited on another host");
        assert!(fast.is_ok());

        slow.abort();
    }

    #[tokio::test]
    async fn test_endpoint_override_gets_its_own_driver() {
        let backend = Arc::new(MockBackend::new());
        let factory = HypervisorFactory::new(mock_registry(backend.clone()), Arc::new(ScriptedIo::new()));

        factory.get_driver(MOCK_BACKEND, &ConnectionParams::new("10.0.0.1")).await.unwrap();
        factory
            .get_driver(
                MOCK_BACKEND,
                &ConnectionParams::new("10.0.0.1").with_endpoint("tcp://10.0.0.1:2375"),
            )
            .await
            .unwrap();

        assert_eq!(factory.cached().await, 2);
    }
}
