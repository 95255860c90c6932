//! # nfio Node
//!
//! VNF lifecycle engine on top of the hypervisor abstraction layer, plus the
//! configuration model of the `nfio-node` binary.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use nfio_hypervisor::{DriverRegistry, HypervisorFactory, ProcessIo, VnfSpec};
//! use nfio_node::{OperationSettings, VnfOperations};
//!
//! #[tokio::main]
//! async fn main() {
//!     let factory = HypervisorFactory::new(
//!         DriverRegistry::with_defaults(Default::default(), Default::default()),
//!         Arc::new(ProcessIo::new()),
//!     );
//!     let ops = VnfOperations::new(Arc::new(factory), OperationSettings::default());
//!
//!     ops.deploy(VnfSpec::new("fw", "nfio/fw", "10.0.0.1")).await.unwrap();
//!     ops.pause("fw").await.unwrap();
//! }
//! ```

pub mod cli;
pub mod config;
pub mod operations;

pub use config::Config;
pub use operations::{
    GuestStat, OperationError, OperationSettings, Result, VnfOperations, VnfRecord,
};
