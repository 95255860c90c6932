//! # nfio Common
//!
//! Shared utilities for the nfio components.
//!
//! ## Logging
//!
//! ```rust,no_run
//! use nfio_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vnf = "fw-1", "VNF deployed");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
