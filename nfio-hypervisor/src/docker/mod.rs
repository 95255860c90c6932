//! Container engine (Docker) hypervisor driver.
//!
//! Containers are driven through the `docker` CLI against the daemon's
//! remote endpoint (`tcp://<host>:<port>` by default). All process
//! invocations go through the [`HostIo`](crate::io::HostIo) capability.

mod driver;

pub use driver::{DockerConfig, DockerDriver, DEFAULT_DOCKER_PORT};
