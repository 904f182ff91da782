//! # labstream
//!
//! A hardware-abstraction and acquisition-streaming engine for laboratory
//! instruments. Drivers turn device-specific wire protocols into one
//! structured packet stream (the datafeed); a single-threaded session
//! dispatcher multiplexes the I/O of many concurrently acquiring devices
//! and fans every packet out to registered consumers; output modules
//! render the stream, including a VCD writer that re-serializes
//! independently-timed per-channel deliveries into one monotonic dump.
//!
//! ## Crate Structure
//!
//! - **`channel`**: the static channel and channel-group model describing
//!   what a device measures.
//! - **`config`**: enumerated config keys, dynamic config values and the
//!   per-(key, group) capability flags drivers advertise.
//! - **`datafeed`**: the packet protocol between drivers and consumers,
//!   plus the stream-validity checker the session runs per device.
//! - **`device`**: device instances, the acquisition state machine and
//!   the capability-enforcing wrapper every caller goes through.
//! - **`driver`**: the driver discovery trait, the instance registry and
//!   acquisition limit bookkeeping.
//! - **`session`**: the cooperative event dispatcher that owns event
//!   sources and packet fan-out.
//! - **`transport`**: serial, Modbus-RTU and SCPI plumbing shared by the
//!   hardware drivers.
//! - **`drivers`**: the device families: `demo` (hardware-free pattern
//!   generator), `relay` (Modbus relay boxes), `dmm` (serial streaming
//!   multimeters).
//! - **`output`**: datafeed consumers; `output::vcd` renders value change
//!   dumps through a sample-number merge queue.
//! - **`error`**: the [`HalError`] taxonomy shared by every layer.

pub mod channel;
pub mod config;
pub mod datafeed;
pub mod device;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod output;
pub mod session;
pub mod transport;

pub use channel::{Channel, ChannelGroup, ChannelType};
pub use config::{ConfigCaps, ConfigKey, ConfigValue};
pub use datafeed::{AnalogPayload, FeedPacket, FeedSender, LogicPayload, Packet, StreamChecker};
pub use device::{Device, DeviceId, DeviceInfo, DeviceOps, DeviceState};
pub use driver::{Driver, DriverKind, DriverRegistry, ScanOptions};
pub use error::{HalError, HalResult};
pub use session::{DatafeedSink, EventSource, Session, SourceEvent, SourceFlow};
