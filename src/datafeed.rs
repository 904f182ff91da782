//! Datafeed packet protocol.
//!
//! The datafeed is the internal streaming protocol between a driver and any
//! consumer. A driver submits [`Packet`]s through its [`FeedSender`]; the
//! session fans each packet out, unmodified and in submission order, to
//! every registered sink.
//!
//! Stream invariants, validated by [`StreamChecker`]:
//!
//! - exactly one [`Packet::Header`] precedes all other packets of an
//!   acquisition, exactly one [`Packet::End`] follows all others;
//! - [`Packet::FrameBegin`] / [`Packet::FrameEnd`] pairs nest to depth 1
//!   only;
//! - [`Packet::Logic`] and [`Packet::Analog`] payloads occur only between
//!   `Header` and `End`;
//! - [`Packet::Meta`] may occur any time after `Header`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ConfigKey, ConfigValue};
use crate::device::DeviceId;
use crate::error::{HalError, HalResult};

/// Physical quantity of an analog sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Voltage,
    Current,
    Resistance,
    Power,
    Frequency,
    Temperature,
}

/// Unit of an analog sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    Volt,
    Ampere,
    Ohm,
    Watt,
    Hertz,
    Celsius,
}

/// Modifier flags for an analog measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasFlags {
    pub ac: bool,
    pub dc: bool,
    pub relative: bool,
}

/// Packed logic sample image.
///
/// Each sample occupies `unit_size` bytes; bit *i* of the image is the
/// state of the channel with index *i*. `data.len()` is always a multiple
/// of `unit_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicPayload {
    pub unit_size: usize,
    pub data: Bytes,
}

impl LogicPayload {
    /// Number of samples in the image.
    pub fn sample_count(&self) -> usize {
        if self.unit_size == 0 {
            return 0;
        }
        self.data.len() / self.unit_size
    }
}

/// Analog samples for a single channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogPayload {
    /// Index of the one channel this packet carries data for.
    pub channel_index: usize,
    pub samples: Vec<f32>,
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MeasFlags,
}

/// A datafeed packet, discriminated by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Start of an acquisition. Exactly one, first.
    Header,
    /// Key/value config updates, any time after `Header`.
    Meta(Vec<(ConfigKey, ConfigValue)>),
    /// Marks the trigger point within a frame.
    Trigger,
    /// Begin of a bounded sample sweep. Depth-1 nesting only.
    FrameBegin,
    /// End of a bounded sample sweep.
    FrameEnd,
    /// Packed logic sample image.
    Logic(LogicPayload),
    /// Float samples for one analog channel.
    Analog(AnalogPayload),
    /// End of an acquisition. Exactly one, last.
    End,
}

impl Packet {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Header => "header",
            Packet::Meta(_) => "meta",
            Packet::Trigger => "trigger",
            Packet::FrameBegin => "frame_begin",
            Packet::FrameEnd => "frame_end",
            Packet::Logic(_) => "logic",
            Packet::Analog(_) => "analog",
            Packet::End => "end",
        }
    }
}

/// A packet as seen by consumers, tagged with its originating device.
#[derive(Debug, Clone)]
pub struct FeedPacket {
    pub device: DeviceId,
    pub packet: Packet,
}

/// Driver-facing handle for submitting packets to the session.
///
/// Cloneable; all clones feed the same session in submission order.
#[derive(Debug, Clone)]
pub struct FeedSender {
    device: DeviceId,
    tx: mpsc::UnboundedSender<FeedPacket>,
}

impl FeedSender {
    pub(crate) fn new(device: DeviceId, tx: mpsc::UnboundedSender<FeedPacket>) -> Self {
        Self { device, tx }
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Submit one packet. Fails only when the session side is gone.
    pub fn send(&self, packet: Packet) -> HalResult<()> {
        self.tx
            .send(FeedPacket {
                device: self.device,
                packet,
            })
            .map_err(|_| HalError::Feed)
    }
}

/// Sequence validator for the datafeed invariants.
///
/// The session keeps one checker per streaming device and rejects packets
/// that violate the protocol before they reach any sink.
#[derive(Debug, Default)]
pub struct StreamChecker {
    header_seen: bool,
    ended: bool,
    in_frame: bool,
}

impl StreamChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next packet of the sequence.
    pub fn check(&mut self, packet: &Packet) -> HalResult<()> {
        if self.ended {
            return Err(HalError::data(format!(
                "'{}' packet after end of stream",
                packet.kind()
            )));
        }
        match packet {
            Packet::Header => {
                if self.header_seen {
                    return Err(HalError::data("duplicate header packet"));
                }
                self.header_seen = true;
            }
            Packet::End => {
                if !self.header_seen {
                    return Err(HalError::data("end packet without header"));
                }
                if self.in_frame {
                    return Err(HalError::data("end packet inside an open frame"));
                }
                self.ended = true;
            }
            Packet::FrameBegin => {
                self.require_header(packet)?;
                if self.in_frame {
                    return Err(HalError::data("frame_begin nested beyond depth 1"));
                }
                self.in_frame = true;
            }
            Packet::FrameEnd => {
                self.require_header(packet)?;
                if !self.in_frame {
                    return Err(HalError::data("frame_end without frame_begin"));
                }
                self.in_frame = false;
            }
            Packet::Trigger => {
                self.require_header(packet)?;
                if !self.in_frame {
                    return Err(HalError::data("trigger packet outside a frame"));
                }
            }
            Packet::Meta(_) | Packet::Logic(_) | Packet::Analog(_) => {
                self.require_header(packet)?;
            }
        }
        Ok(())
    }

    /// True once a well-formed sequence has been terminated by `End`.
    pub fn finished(&self) -> bool {
        self.ended
    }

    fn require_header(&self, packet: &Packet) -> HalResult<()> {
        if !self.header_seen {
            return Err(HalError::data(format!(
                "'{}' packet before header",
                packet.kind()
            )));
        }
        Ok(())
    }
}
