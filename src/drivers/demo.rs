//! Hardware-free pattern generator.
//!
//! The demo device fabricates a mixed logic/analog stream: one packed
//! logic image per chunk plus one analog packet per enabled analog
//! channel. It exists to exercise the session, the stream protocol and
//! the output path without any instrument attached, and it is the only
//! driver whose scan always succeeds.
//!
//! Chunks are produced by an interval event source. The device stops
//! itself when a configured sample or time limit is reached, sending
//! `End` from inside the dispatch callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::channel::{Channel, ChannelGroup, ChannelType};
use crate::config::{ConfigCaps, ConfigKey, ConfigValue};
use crate::datafeed::{AnalogPayload, FeedSender, LogicPayload, MeasFlags, Packet, Quantity, Unit};
use crate::device::{Device, DeviceInfo, DeviceOps};
use crate::driver::{AcqLimits, Driver, DriverKind, ScanOptions};
use crate::error::{HalError, HalResult};
use crate::session::{EventSource, SourceEvent, SourceFlow};

pub const DEFAULT_LOGIC_CHANNELS: usize = 8;
pub const DEFAULT_ANALOG_CHANNELS: usize = 4;
pub const DEFAULT_SAMPLERATE: u64 = 200_000;

const LOGIC_GROUP: &str = "Logic";
const ANALOG_GROUP: &str = "Analog";

/// Chunk cadence of the interval source.
const TICK: Duration = Duration::from_millis(20);

const SAMPLERATES: &[u64] = &[1_000, 10_000, 100_000, 200_000, 1_000_000];

const LOGIC_PATTERNS: &[&str] = &["inc", "random", "all-low", "all-high"];
const ANALOG_PATTERNS: &[&str] = &["sine", "square", "triangle"];

// ============================================================================
// Driver
// ============================================================================

#[derive(Default)]
pub struct DemoDriver {
    logic_channels: usize,
    analog_channels: usize,
}

impl DemoDriver {
    pub fn new() -> Self {
        Self {
            logic_channels: DEFAULT_LOGIC_CHANNELS,
            analog_channels: DEFAULT_ANALOG_CHANNELS,
        }
    }

    pub fn with_channels(logic: usize, analog: usize) -> Self {
        Self {
            logic_channels: logic,
            analog_channels: analog,
        }
    }
}

#[async_trait]
impl Driver for DemoDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Demo
    }

    fn name(&self) -> &'static str {
        "demo"
    }

    fn long_name(&self) -> &'static str {
        "Demo pattern generator"
    }

    async fn scan(&mut self, _options: &ScanOptions) -> HalResult<Vec<Device>> {
        let ops = DemoDevice::build(self.logic_channels.max(1), self.analog_channels)?;
        Ok(vec![Device::new(Box::new(ops))])
    }
}

// ============================================================================
// Device instance
// ============================================================================

/// State shared between the device object and its running event source.
struct RunState {
    ended: AtomicBool,
    stop: AtomicBool,
}

struct DemoDevice {
    info: DeviceInfo,
    samplerate: u64,
    limit_samples: Option<u64>,
    limit_msec: Option<u64>,
    logic_pattern: &'static str,
    analog_pattern: &'static str,
    run: Option<Arc<RunState>>,
    feed: Option<FeedSender>,
}

impl DemoDevice {
    fn build(logic: usize, analog: usize) -> HalResult<Self> {
        let mut info = DeviceInfo::new("labstream", "Demo device", env!("CARGO_PKG_VERSION"))
            .with_caps(ConfigKey::Samplerate, ConfigCaps::GET_SET_LIST)
            .with_caps(ConfigKey::LimitSamples, ConfigCaps::GET_SET)
            .with_caps(ConfigKey::LimitMsec, ConfigCaps::GET_SET);

        info.add_group(
            ChannelGroup::new(LOGIC_GROUP).with_caps(ConfigKey::PatternMode, ConfigCaps::GET_SET_LIST),
        )?;
        info.add_group(
            ChannelGroup::new(ANALOG_GROUP)
                .with_caps(ConfigKey::PatternMode, ConfigCaps::GET_SET_LIST),
        )?;

        for i in 0..logic {
            let ch = info.add_channel(Channel::new(i, ChannelType::Logic, true, format!("D{i}")))?;
            info.attach_to_group(LOGIC_GROUP, &ch)?;
        }
        for i in 0..analog {
            let ch = info.add_channel(Channel::new(
                logic + i,
                ChannelType::Analog,
                true,
                format!("A{i}"),
            ))?;
            info.attach_to_group(ANALOG_GROUP, &ch)?;
        }

        Ok(Self {
            info,
            samplerate: DEFAULT_SAMPLERATE,
            limit_samples: None,
            limit_msec: None,
            logic_pattern: "inc",
            analog_pattern: "sine",
            run: None,
            feed: None,
        })
    }

    fn unit_size(&self) -> usize {
        let logic = self
            .info
            .channels()
            .iter()
            .filter(|c| c.channel_type() == ChannelType::Logic)
            .count();
        logic.div_ceil(8).max(1)
    }
}

#[async_trait]
impl DeviceOps for DemoDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn open(&mut self) -> HalResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> HalResult<()> {
        Ok(())
    }

    async fn config_get(&self, key: ConfigKey, group: Option<&str>) -> HalResult<ConfigValue> {
        match (key, group) {
            (ConfigKey::Samplerate, None) => Ok(ConfigValue::UInt(self.samplerate)),
            (ConfigKey::LimitSamples, None) => {
                Ok(ConfigValue::UInt(self.limit_samples.unwrap_or(0)))
            }
            (ConfigKey::LimitMsec, None) => Ok(ConfigValue::UInt(self.limit_msec.unwrap_or(0))),
            (ConfigKey::PatternMode, Some(LOGIC_GROUP)) => {
                Ok(ConfigValue::Str(self.logic_pattern.to_owned()))
            }
            (ConfigKey::PatternMode, Some(ANALOG_GROUP)) => {
                Ok(ConfigValue::Str(self.analog_pattern.to_owned()))
            }
            _ => Err(HalError::NotApplicable),
        }
    }

    async fn config_set(
        &mut self,
        key: ConfigKey,
        value: ConfigValue,
        group: Option<&str>,
    ) -> HalResult<()> {
        match (key, group) {
            (ConfigKey::Samplerate, None) => {
                let rate = value
                    .as_u64()
                    .ok_or_else(|| HalError::arg("samplerate must be an unsigned integer"))?;
                if !SAMPLERATES.contains(&rate) {
                    return Err(HalError::arg(format!("unsupported samplerate {rate}")));
                }
                self.samplerate = rate;
                Ok(())
            }
            (ConfigKey::LimitSamples, None) => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| HalError::arg("sample limit must be an unsigned integer"))?;
                self.limit_samples = (n > 0).then_some(n);
                Ok(())
            }
            (ConfigKey::LimitMsec, None) => {
                let n = value
                    .as_u64()
                    .ok_or_else(|| HalError::arg("time limit must be an unsigned integer"))?;
                self.limit_msec = (n > 0).then_some(n);
                Ok(())
            }
            (ConfigKey::PatternMode, Some(grp @ (LOGIC_GROUP | ANALOG_GROUP))) => {
                let table = if grp == LOGIC_GROUP {
                    LOGIC_PATTERNS
                } else {
                    ANALOG_PATTERNS
                };
                let name = value
                    .as_str()
                    .ok_or_else(|| HalError::arg("pattern must be a string"))?;
                let pattern = table
                    .iter()
                    .find(|p| **p == name)
                    .ok_or_else(|| HalError::arg(format!("unknown pattern {name:?}")))?;
                if grp == LOGIC_GROUP {
                    self.logic_pattern = pattern;
                } else {
                    self.analog_pattern = pattern;
                }
                Ok(())
            }
            _ => Err(HalError::NotApplicable),
        }
    }

    async fn config_list(
        &self,
        key: ConfigKey,
        group: Option<&str>,
    ) -> HalResult<Vec<ConfigValue>> {
        match (key, group) {
            (ConfigKey::Samplerate, None) => {
                Ok(SAMPLERATES.iter().map(|&r| ConfigValue::UInt(r)).collect())
            }
            (ConfigKey::PatternMode, Some(LOGIC_GROUP)) => Ok(LOGIC_PATTERNS
                .iter()
                .map(|p| ConfigValue::Str((*p).to_owned()))
                .collect()),
            (ConfigKey::PatternMode, Some(ANALOG_GROUP)) => Ok(ANALOG_PATTERNS
                .iter()
                .map(|p| ConfigValue::Str((*p).to_owned()))
                .collect()),
            _ => Err(HalError::NotApplicable),
        }
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
        feed.send(Packet::Meta(vec![(
            ConfigKey::Samplerate,
            ConfigValue::UInt(self.samplerate),
        )]))?;

        let mut limits = AcqLimits::new(self.limit_samples, self.limit_msec);
        limits.start();

        let analog_channels: Vec<usize> = self
            .info
            .channels()
            .iter()
            .filter(|c| c.channel_type() == ChannelType::Analog && c.enabled())
            .map(|c| c.index())
            .collect();

        let source = PatternSource {
            feed: feed.clone(),
            run: Arc::clone(&run),
            limits,
            samplerate: self.samplerate,
            unit_size: self.unit_size(),
            logic_pattern: self.logic_pattern,
            analog_pattern: self.analog_pattern,
            analog_channels,
            counter: 0,
            sent: 0,
            next: Instant::now() + TICK,
            rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(rand::random())),
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

struct PatternSource {
    feed: FeedSender,
    run: Arc<RunState>,
    limits: AcqLimits,
    samplerate: u64,
    unit_size: usize,
    logic_pattern: &'static str,
    analog_pattern: &'static str,
    analog_channels: Vec<usize>,
    /// Logic pattern position, persists across chunks.
    counter: u64,
    /// Samples emitted so far, drives the analog waveform phase.
    sent: u64,
    next: Instant,
    rng: Mutex<rand::rngs::StdRng>,
}

impl PatternSource {
    fn chunk_len(&self) -> u64 {
        // One tick's worth of samples at the configured rate.
        let per_tick = self.samplerate * TICK.as_millis() as u64 / 1000;
        let per_tick = per_tick.max(1);
        match self.limits.remaining() {
            Some(rem) => per_tick.min(rem),
            None => per_tick,
        }
    }

    fn logic_chunk(&mut self, count: u64) -> Bytes {
        let mut data = Vec::with_capacity(count as usize * self.unit_size);
        let mut rng = self.rng.lock();
        for i in 0..count {
            let word: u64 = match self.logic_pattern {
                "random" => rng.gen(),
                "all-low" => 0,
                "all-high" => u64::MAX,
                _ => self.counter + i,
            };
            data.extend_from_slice(&word.to_le_bytes()[..self.unit_size]);
        }
        drop(rng);
        self.counter += count;
        Bytes::from(data)
    }

    fn analog_chunk(&self, count: u64, position: u64) -> Vec<f32> {
        let mut rng = self.rng.lock();
        (0..count)
            .map(|i| {
                let t = (position + i) as f64 / self.samplerate as f64;
                // One full waveform period every 10 ms.
                let phase = (t * 100.0).fract();
                let value = match self.analog_pattern {
                    "square" => {
                        if phase < 0.5 {
                            1.0
                        } else {
                            -1.0
                        }
                    }
                    "triangle" => 4.0 * (phase - 0.5).abs() - 1.0,
                    _ => (phase * std::f64::consts::TAU).sin(),
                };
                let noise: f64 = rng.gen_range(-0.01..0.01);
                (value + noise) as f32
            })
            .collect()
    }

    fn emit_chunk(&mut self) -> HalResult<SourceFlow> {
        let count = self.chunk_len();
        if count > 0 {
            let data = self.logic_chunk(count);
            self.feed.send(Packet::Logic(LogicPayload {
                unit_size: self.unit_size,
                data,
            }))?;

            let position = self.sent;
            for &index in &self.analog_channels {
                let samples = self.analog_chunk(count, position);
                self.feed.send(Packet::Analog(AnalogPayload {
                    channel_index: index,
                    samples,
                    quantity: Quantity::Voltage,
                    unit: Unit::Volt,
                    flags: MeasFlags::default(),
                }))?;
            }
            self.sent += count;
            self.limits.update(count);
        }

        if self.limits.reached() {
            if !self.run.ended.swap(true, Ordering::SeqCst) {
                self.feed.send(Packet::End)?;
            }
            return Ok(SourceFlow::Stop);
        }
        Ok(SourceFlow::Continue)
    }
}

#[async_trait]
impl EventSource for PatternSource {
    fn timeout(&self) -> Duration {
        TICK * 4
    }

    async fn ready(&mut self) {
        tokio::time::sleep_until(self.next).await;
    }

    async fn dispatch(&mut self, event: SourceEvent) -> HalResult<SourceFlow> {
        if self.run.stop.load(Ordering::SeqCst) {
            return Ok(SourceFlow::Stop);
        }
        if event == SourceEvent::Ready {
            self.next += TICK;
        }
        self.emit_chunk()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::FeedPacket;
    use tokio::sync::mpsc;

    async fn scanned_device() -> Device {
        let mut driver = DemoDriver::new();
        let mut devices = driver.scan(&ScanOptions::default()).await.unwrap();
        devices.pop().unwrap()
    }

    #[tokio::test]
    async fn scan_builds_two_groups() {
        let device = scanned_device().await;
        let info = device.info();
        assert_eq!(info.channels().len(), 12);
        assert_eq!(info.group(LOGIC_GROUP).unwrap().len(), 8);
        assert_eq!(info.group(ANALOG_GROUP).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn pattern_set_rejects_unknown_name() {
        let mut device = scanned_device().await;
        device.open().await.unwrap();
        let err = device
            .config_set(
                ConfigKey::PatternMode,
                ConfigValue::Str("zigzag".into()),
                Some(LOGIC_GROUP),
            )
            .await;
        assert!(matches!(err, Err(HalError::Arg(_))));
    }

    #[tokio::test]
    async fn sample_limit_ends_the_stream() {
        let mut ops = DemoDevice::build(8, 1).unwrap();
        ops.limit_samples = Some(100);
        let (tx, mut rx) = mpsc::unbounded_channel::<FeedPacket>();
        let feed = FeedSender::new(crate::device::DeviceId::default(), tx);

        let mut sources = ops.acquisition_start(feed).await.unwrap();
        let source = &mut sources[0];

        let mut flow = SourceFlow::Continue;
        for _ in 0..8 {
            flow = source.dispatch(SourceEvent::Timeout).await.unwrap();
            if flow == SourceFlow::Stop {
                break;
            }
        }
        assert_eq!(flow, SourceFlow::Stop);

        let mut logic_samples = 0usize;
        let mut saw_end = false;
        while let Ok(pkt) = rx.try_recv() {
            match pkt.packet {
                Packet::Logic(ref p) => logic_samples += p.sample_count(),
                Packet::End => saw_end = true,
                _ => {}
            }
        }
        assert_eq!(logic_samples, 100);
        assert!(saw_end);

        // A second stop must not emit another End.
        ops.acquisition_stop().await.unwrap();
    }

    #[tokio::test]
    async fn sample_limit_holds_across_many_chunks() {
        // At 1 kHz a tick carries 20 samples, so a limit of 100 takes
        // five full chunks to reach.
        let mut ops = DemoDevice::build(8, 1).unwrap();
        ops.samplerate = 1_000;
        ops.limit_samples = Some(100);
        let (tx, mut rx) = mpsc::unbounded_channel::<FeedPacket>();
        let feed = FeedSender::new(crate::device::DeviceId::default(), tx);

        let mut sources = ops.acquisition_start(feed).await.unwrap();
        let source = &mut sources[0];

        let mut dispatches = 0usize;
        let mut flow = SourceFlow::Continue;
        for _ in 0..10 {
            flow = source.dispatch(SourceEvent::Timeout).await.unwrap();
            dispatches += 1;
            if flow == SourceFlow::Stop {
                break;
            }
        }
        assert_eq!(flow, SourceFlow::Stop);
        assert_eq!(dispatches, 5);

        let mut logic_samples = 0usize;
        while let Ok(pkt) = rx.try_recv() {
            if let Packet::Logic(ref p) = pkt.packet {
                logic_samples += p.sample_count();
            }
        }
        assert_eq!(logic_samples, 100);
    }
}
