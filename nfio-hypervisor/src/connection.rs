//! Hypervisor connection bookkeeping shared by the drivers.

use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{HypervisorError, Result};

/// An open session with a backend. Owned by exactly one driver.
#[derive(Debug, Clone)]
pub struct HypervisorConnection {
    /// Backend kind
    pub backend: String,
    /// Endpoint the session is bound to
    pub endpoint: String,
    /// Version reported by the backend on connect
    pub server_version: String,
    /// When the session was opened
    pub connected_at: DateTime<Utc>,
}

impl HypervisorConnection {
    pub fn new(
        backend: impl Into<String>,
        endpoint: impl Into<String>,
        server_version: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            endpoint: endpoint.into(),
            server_version: server_version.into(),
            connected_at: Utc::now(),
        }
    }
}

/// Slot holding a driver's connection.
///
/// `open` and `close` take the write lock for their whole duration, so
/// structural changes never race each other; lifecycle operations only take
/// the read lock long enough to copy the endpoint.
#[derive(Debug, Default)]
pub struct ConnectionSlot {
    inner: RwLock<Option<HypervisorConnection>>,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the connection with `handshake` unless already open.
    ///
    /// `handshake` returns the server version on success.
    pub async fn open<F, Fut>(&self, backend: &str, endpoint: &str, handshake: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        let mut slot = self.inner.write().await;
        if let Some(existing) = slot.as_ref() {
            debug!(endpoint = %existing.endpoint, "Connection already open");
            return Ok(());
        }

        let version = handshake().await?;
        info!(backend = %backend, endpoint = %endpoint, version = %version, "Hypervisor connection opened");
        *slot = Some(HypervisorConnection::new(backend, endpoint, version));
        Ok(())
    }

    /// Release the connection. Returns the released session, if any.
    pub async fn close(&self) -> Option<HypervisorConnection> {
        let released = self.inner.write().await.take();
        if let Some(conn) = released.as_ref() {
            info!(backend = %conn.backend, endpoint = %conn.endpoint, "Hypervisor connection released");
        }
        released
    }

    /// Endpoint of the open connection.
    pub async fn endpoint(&self) -> Result<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|c| c.endpoint.clone())
            .ok_or_else(|| HypervisorError::ConnectionFailed("not connected".to_string()))
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// Copy of the current session.
    pub async fn current(&self) -> Option<HypervisorConnection> {
        self.inner.read().await.clone()
    }
}
