//! # nfio Hypervisor
//!
//! Hypervisor abstraction layer for managing VNF instances.
//!
//! This crate provides a unified lifecycle interface over different backends:
//! - **Docker** - VNFs as containers on a remote docker daemon
//! - **Libvirt/QEMU** - VNFs as persistent VM domains
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          HypervisorFactory              │
//! │   (registry lookup, driver cache)       │
//! └─────────────────────┬───────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────┐
//! │          Hypervisor Trait               │
//! │  (create, start, stop, destroy, etc.)   │
//! └─────────────────────┬───────────────────┘
//!                       │
//!         ┌─────────────┴─────────────┐
//!         ▼                           ▼
//! ┌───────────────────┐     ┌───────────────────┐
//! │   DockerDriver    │     │   LibvirtDriver   │
//! │  (docker -H ...)  │     │  (virsh -c ...)   │
//! └─────────┬─────────┘     └─────────┬─────────┘
//!           └─────────────┬───────────┘
//!                         ▼
//!                  HostIo capability
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nfio_hypervisor::{ConnectionParams, DriverRegistry, HypervisorFactory, ProcessIo, VnfSpec};
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = HypervisorFactory::new(
//!         DriverRegistry::with_defaults(Default::default(), Default::default()),
//!         std::sync::Arc::new(ProcessIo::new()),
//!     );
//!
//!     let vnf = VnfSpec::new("fw", "nfio/fw", "10.0.0.1");
//!     let driver = factory
//!         .get_driver(&vnf.backend, &ConnectionParams::new(&vnf.host))
//!         .await
//!         .unwrap();
//!     driver.deploy(&vnf).await.unwrap();
//! }
//! ```

pub mod connection;
pub mod docker;
pub mod error;
pub mod factory;
pub mod io;
pub mod libvirt;
pub mod mock;
pub mod traits;
pub mod types;
mod xml;

pub use connection::{ConnectionSlot, HypervisorConnection};
pub use docker::{DockerConfig, DockerDriver, DEFAULT_DOCKER_PORT};
pub use error::{HypervisorError, Result};
pub use factory::{DriverConstructor, DriverRegistry, HypervisorFactory};
pub use io::{ExecOutput, HostIo, HostIoError, ProcessIo};
pub use libvirt::{LibvirtConfig, LibvirtDriver};
pub use mock::{MockBackend, ScriptedIo};
pub use traits::Hypervisor;
pub use types::*;
