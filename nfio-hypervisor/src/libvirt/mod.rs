//! Libvirt hypervisor driver.
//!
//! Domains are managed through `virsh -c <uri>`, so no system libvirt
//! client library is needed at build time. In-guest commands go through the
//! QEMU guest agent.

mod driver;

pub use driver::{LibvirtConfig, LibvirtDriver};
