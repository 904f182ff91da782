//! Physical transports.
//!
//! These are opaque I/O capabilities the driver state machine invokes;
//! their device-specific protocols live in the drivers. Every operation
//! here is bounded: reads and writes take an explicit timeout, so no
//! driver callback can stall the session dispatcher indefinitely.

pub mod modbus;
pub mod scpi;
pub mod serial;
