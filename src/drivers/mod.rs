//! Hardware drivers.
//!
//! Each driver implements [`crate::driver::Driver`] for discovery and
//! hands out [`crate::device::DeviceOps`] instances for the devices its
//! scan found. The demo driver needs no hardware and is always available;
//! the others speak to instruments over serial transports.

pub mod demo;
pub mod dmm;
pub mod relay;
