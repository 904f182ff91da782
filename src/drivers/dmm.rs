//! Serial streaming multimeters.
//!
//! The meter pushes fixed 9-byte frames continuously:
//!
//! ```text
//! [0x55, mode, exponent, d3, d2, d1, d0, flags, checksum]
//! ```
//!
//! `d3..d0` are decimal digits, `exponent` a signed power of ten applied
//! to the 4-digit mantissa, `checksum` the additive sum of the first 8
//! bytes. A bad checksum or digit discards that frame with a debug log
//! and the decoder resynchronises on the next sync byte; protocol errors
//! never abort a run. Scan succeeds when a valid frame arrives within
//! the probe window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::channel::{Channel, ChannelType};
use crate::config::{ConfigCaps, ConfigKey, ConfigValue};
use crate::datafeed::{AnalogPayload, FeedSender, MeasFlags, Packet, Quantity, Unit};
use crate::device::{ConnectionKind, Device, DeviceInfo, DeviceOps};
use crate::driver::{AcqLimits, Driver, DriverKind, ScanOptions};
use crate::error::{HalError, HalResult};
use crate::session::{EventSource, SourceEvent, SourceFlow};
use crate::transport::serial::{
    read_timeout, share, PortFactory, SerialParams, SharedSerial, SystemPorts,
};

pub const SYNC: u8 = 0x55;
pub const FRAME_LEN: usize = 9;

const DEFAULT_SERIALCOMM: &str = "2400/8n1";
const PROBE_WINDOW: Duration = Duration::from_millis(400);

// ============================================================================
// Frame decoding
// ============================================================================

/// One decoded measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub value: f32,
    pub quantity: Quantity,
    pub unit: Unit,
    pub flags: MeasFlags,
}

/// Decode one frame. `Data` errors are local to the frame.
pub fn parse_frame(frame: &[u8; FRAME_LEN]) -> HalResult<Reading> {
    if frame[0] != SYNC {
        return Err(HalError::data("missing sync byte"));
    }
    let sum = frame[..8].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != frame[8] {
        return Err(HalError::data(format!(
            "checksum {:#04x}, computed {sum:#04x}",
            frame[8]
        )));
    }

    let (quantity, unit) = match frame[1] {
        0x01 | 0x02 => (Quantity::Voltage, Unit::Volt),
        0x03 => (Quantity::Current, Unit::Ampere),
        0x04 => (Quantity::Resistance, Unit::Ohm),
        0x05 => (Quantity::Frequency, Unit::Hertz),
        0x06 => (Quantity::Temperature, Unit::Celsius),
        other => return Err(HalError::data(format!("unknown mode {other:#04x}"))),
    };

    let mut mantissa = 0u32;
    for &digit in &frame[3..7] {
        if digit > 9 {
            return Err(HalError::data(format!("digit byte {digit:#04x} out of range")));
        }
        mantissa = mantissa * 10 + u32::from(digit);
    }

    let exponent = frame[2] as i8;
    let mut value = mantissa as f64 * 10f64.powi(i32::from(exponent));
    let flags = MeasFlags {
        ac: frame[7] & 0x02 != 0 || frame[1] == 0x02,
        dc: frame[7] & 0x04 != 0 || frame[1] == 0x01,
        relative: frame[7] & 0x08 != 0,
    };
    if frame[7] & 0x01 != 0 {
        value = -value;
    }

    Ok(Reading {
        value: value as f32,
        quantity,
        unit,
        flags,
    })
}

/// Locate and decode the first valid frame in `buf`, returning the number
/// of bytes consumed up to and including it.
fn find_frame(buf: &[u8]) -> Option<(usize, Reading)> {
    let mut offset = 0;
    while buf.len() - offset >= FRAME_LEN {
        if buf[offset] != SYNC {
            offset += 1;
            continue;
        }
        let mut frame = [0u8; FRAME_LEN];
        frame.copy_from_slice(&buf[offset..offset + FRAME_LEN]);
        match parse_frame(&frame) {
            Ok(reading) => return Some((offset + FRAME_LEN, reading)),
            Err(e) => {
                tracing::debug!(%e, "discarding frame");
                offset += 1;
            }
        }
    }
    None
}

// ============================================================================
// Driver
// ============================================================================

pub struct DmmDriver {
    ports: Box<dyn PortFactory>,
}

impl DmmDriver {
    pub fn new() -> Self {
        Self {
            ports: Box::new(SystemPorts),
        }
    }

    pub fn with_port_factory(ports: Box<dyn PortFactory>) -> Self {
        Self { ports }
    }
}

impl Default for DmmDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for DmmDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::SerialDmm
    }

    fn name(&self) -> &'static str {
        "serial-dmm"
    }

    fn long_name(&self) -> &'static str {
        "Serial streaming multimeter"
    }

    async fn scan(&mut self, options: &ScanOptions) -> HalResult<Vec<Device>> {
        let conn = options
            .conn
            .as_deref()
            .ok_or_else(|| HalError::arg("dmm scan requires a connection string"))?;
        let serialcomm = options.serialcomm.as_deref().unwrap_or(DEFAULT_SERIALCOMM);
        let params = SerialParams::parse(serialcomm)?;
        let mut port = self.ports.open(conn, params).await?;

        // The meter streams unprompted; a valid frame inside the probe
        // window is the identification.
        let mut probe = Vec::new();
        let deadline = tokio::time::Instant::now() + PROBE_WINDOW;
        let found = loop {
            if find_frame(&probe).is_some() {
                break true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() || probe.len() > 4 * FRAME_LEN {
                break false;
            }
            let mut chunk = [0u8; FRAME_LEN];
            match read_timeout(&mut port, &mut chunk, remaining).await {
                Ok(0) | Err(_) => break false,
                Ok(n) => probe.extend_from_slice(&chunk[..n]),
            }
        };
        if !found {
            tracing::debug!(conn, "no multimeter frames seen");
            return Ok(Vec::new());
        }

        let ops = DmmDevice::build(conn, share(port))?;
        Ok(vec![Device::new(Box::new(ops))])
    }
}

// ============================================================================
// Device instance
// ============================================================================

struct RunState {
    ended: AtomicBool,
    stop: AtomicBool,
}

struct DmmDevice {
    info: DeviceInfo,
    port: SharedSerial,
    limit_samples: Option<u64>,
    run: Option<Arc<RunState>>,
    feed: Option<FeedSender>,
}

impl DmmDevice {
    fn build(conn: &str, port: SharedSerial) -> HalResult<Self> {
        let mut info = DeviceInfo::new("labstream", "Serial DMM", "")
            .with_connection(ConnectionKind::Serial, conn)
            .with_caps(ConfigKey::Conn, ConfigCaps::GET)
            .with_caps(ConfigKey::LimitSamples, ConfigCaps::GET_SET);
        info.add_channel(Channel::new(0, ChannelType::Analog, true, "P1"))?;
        Ok(Self {
            info,
            port,
            limit_samples: None,
            run: None,
            feed: None,
        })
    }
}

#[async_trait]
impl DeviceOps for DmmDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn open(&mut self) -> HalResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> HalResult<()> {
        Ok(())
    }

    async fn config_get(&self, key: ConfigKey, _group: Option<&str>) -> HalResult<ConfigValue> {
        match key {
            ConfigKey::Conn => Ok(ConfigValue::Str(
                self.info.connection().unwrap_or("").to_owned(),
            )),
            ConfigKey::LimitSamples => Ok(ConfigValue::UInt(self.limit_samples.unwrap_or(0))),
            _ => Err(HalError::NotApplicable),
        }
    }

    async fn config_set(
        &mut self,
        key: ConfigKey,
        value: ConfigValue,
        _group: Option<&str>,
    ) -> HalResult<()> {
        match key {
            ConfigKey::LimitSamples => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| HalError::arg("sample limit must be an unsigned integer"))?;
                self.limit_samples = (n > 0).then_some(n);
                Ok(())
            }
            _ => Err(HalError::NotApplicable),
        }
    }

    async fn config_list(
        &self,
        _key: ConfigKey,
        _group: Option<&str>,
    ) -> HalResult<Vec<ConfigValue>> {
        Err(HalError::NotApplicable)
    }

    async fn acquisition_start(
        &mut self,
        feed: FeedSender,
    ) -> HalResult<Vec<Box<dyn EventSource>>> {
        let run = Arc::new(RunState {
            ended: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        });

        feed.send(Packet::Header)?;

        let mut limits = AcqLimits::new(self.limit_samples, None);
        limits.start();

        let source = MeterSource {
            port: Arc::clone(&self.port),
            buf: Vec::new(),
            feed: feed.clone(),
            run: Arc::clone(&run),
            limits,
            pending_err: None,
        };

        self.run = Some(run);
        self.feed = Some(feed);
        Ok(vec![Box::new(source)])
    }

    async fn acquisition_stop(&mut self) -> HalResult<()> {
        if let Some(run) = self.run.take() {
            run.stop.store(true, Ordering::SeqCst);
            if !run.ended.swap(true, Ordering::SeqCst) {
                if let Some(feed) = &self.feed {
                    feed.send(Packet::End)?;
                }
            }
        }
        self.feed = None;
        Ok(())
    }
}

// ============================================================================
// Event source
// ============================================================================

struct MeterSource {
    port: SharedSerial,
    buf: Vec<u8>,
    feed: FeedSender,
    run: Arc<RunState>,
    limits: AcqLimits,
    pending_err: Option<std::io::Error>,
}

impl MeterSource {
    fn drain_frames(&mut self) -> HalResult<SourceFlow> {
        while let Some((consumed, reading)) = find_frame(&self.buf) {
            self.buf.drain(..consumed);
            self.feed.send(Packet::Analog(AnalogPayload {
                channel_index: 0,
                samples: vec![reading.value],
                quantity: reading.quantity,
                unit: reading.unit,
                flags: reading.flags,
            }))?;
            self.limits.update(1);
            if self.limits.reached() {
                if !self.run.ended.swap(true, Ordering::SeqCst) {
                    self.feed.send(Packet::End)?;
                }
                return Ok(SourceFlow::Stop);
            }
        }
        // Everything before a trailing partial frame is garbage by now.
        if self.buf.len() > 4 * FRAME_LEN {
            let keep = self.buf.len() - FRAME_LEN;
            self.buf.drain(..keep);
        }
        Ok(SourceFlow::Continue)
    }
}

#[async_trait]
impl EventSource for MeterSource {
    fn timeout(&self) -> Duration {
        Duration::from_millis(1000)
    }

    async fn ready(&mut self) {
        let mut guard = self.port.lock().await;
        let mut chunk = [0u8; 4 * FRAME_LEN];
        match guard.read(&mut chunk).await {
            Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            Err(e) => self.pending_err = Some(e),
        }
    }

    async fn dispatch(&mut self, event: SourceEvent) -> HalResult<SourceFlow> {
        if self.run.stop.load(Ordering::SeqCst) {
            return Ok(SourceFlow::Stop);
        }
        if let Some(e) = self.pending_err.take() {
            return Err(HalError::Io(e));
        }
        if event == SourceEvent::Timeout {
            tracing::debug!(device = %self.feed.device(), "multimeter idle");
            return Ok(SourceFlow::Continue);
        }
        self.drain_frames()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::FeedPacket;
    use crate::device::DeviceId;
    use tokio::sync::mpsc;

    /// Build a valid frame for `mantissa * 10^exp`.
    fn frame(mode: u8, exp: i8, digits: [u8; 4], flags: u8) -> [u8; FRAME_LEN] {
        let mut f = [
            SYNC, mode, exp as u8, digits[0], digits[1], digits[2], digits[3], flags, 0,
        ];
        f[8] = f[..8].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        f
    }

    #[test]
    fn decodes_a_negative_dc_voltage() {
        let f = frame(0x01, -2, [1, 2, 3, 4], 0x01);
        let reading = parse_frame(&f).unwrap();
        assert!((reading.value + 12.34).abs() < 1e-5);
        assert_eq!(reading.quantity, Quantity::Voltage);
        assert_eq!(reading.unit, Unit::Volt);
        assert!(reading.flags.dc);
        assert!(!reading.flags.ac);
    }

    #[test]
    fn checksum_mismatch_is_a_data_error() {
        let mut f = frame(0x01, 0, [0, 0, 4, 2], 0);
        f[8] ^= 0xFF;
        assert!(matches!(parse_frame(&f), Err(HalError::Data(_))));
    }

    #[test]
    #[tracing_test::traced_test]
    fn resyncs_past_garbage_and_bad_frames() {
        let good = frame(0x04, 1, [0, 1, 0, 0], 0);
        let mut bad = frame(0x04, 1, [0, 2, 0, 0], 0);
        bad[8] ^= 0x55; // corrupt checksum

        let mut buf = vec![0xDE, 0xAD, 0x55]; // garbage including a lone sync
        buf.extend_from_slice(&bad);
        buf.extend_from_slice(&good);

        let (consumed, reading) = find_frame(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert!((reading.value - 1000.0).abs() < 1e-3);
        assert_eq!(reading.quantity, Quantity::Resistance);
        assert!(logs_contain("discarding frame"));
    }

    #[tokio::test]
    async fn sample_limit_ends_the_stream() {
        let (mut host, port) = tokio::io::duplex(256);
        let mut device = DmmDevice::build("sim", share(Box::new(port))).unwrap();
        device.limit_samples = Some(2);

        let (tx, mut rx) = mpsc::unbounded_channel::<FeedPacket>();
        let feed = FeedSender::new(DeviceId::default(), tx);
        let mut sources = device.acquisition_start(feed).await.unwrap();
        let source = &mut sources[0];

        use tokio::io::AsyncWriteExt;
        for i in 0..3u8 {
            host.write_all(&frame(0x01, 0, [0, 0, 0, i], 0)).await.unwrap();
        }

        let mut flow = SourceFlow::Continue;
        for _ in 0..4 {
            source.ready().await;
            flow = source.dispatch(SourceEvent::Ready).await.unwrap();
            if flow == SourceFlow::Stop {
                break;
            }
        }
        assert_eq!(flow, SourceFlow::Stop);

        let mut readings = 0;
        let mut saw_end = false;
        while let Ok(pkt) = rx.try_recv() {
            match pkt.packet {
                Packet::Analog(_) => readings += 1,
                Packet::End => saw_end = true,
                _ => {}
            }
        }
        assert_eq!(readings, 2);
        assert!(saw_end);

        // A later stop must not emit a second End.
        device.acquisition_stop().await.unwrap();
    }

    #[tokio::test]
    async fn sample_limit_counts_each_reading_once() {
        let (mut host, port) = tokio::io::duplex(256);
        let mut device = DmmDevice::build("sim", share(Box::new(port))).unwrap();
        device.limit_samples = Some(4);

        let (tx, mut rx) = mpsc::unbounded_channel::<FeedPacket>();
        let feed = FeedSender::new(DeviceId::default(), tx);
        let mut sources = device.acquisition_start(feed).await.unwrap();
        let source = &mut sources[0];

        use tokio::io::AsyncWriteExt;
        for i in 0..6u8 {
            host.write_all(&frame(0x01, 0, [0, 0, 0, i], 0)).await.unwrap();
        }

        let mut flow = SourceFlow::Continue;
        for _ in 0..8 {
            source.ready().await;
            flow = source.dispatch(SourceEvent::Ready).await.unwrap();
            if flow == SourceFlow::Stop {
                break;
            }
        }
        assert_eq!(flow, SourceFlow::Stop);

        let mut readings = 0;
        while let Ok(pkt) = rx.try_recv() {
            if let Packet::Analog(_) = pkt.packet {
                readings += 1;
            }
        }
        assert_eq!(readings, 4);
    }
}
