//! Session event dispatcher.
//!
//! The session multiplexes the I/O event sources of many concurrently
//! acquiring devices and owns the fan-out of datafeed packets to consumers.
//! Dispatch is single-threaded and cooperative: the main loop waits —
//! bounded by the minimum of all registered source timeouts — for any
//! source to become ready, then invokes exactly one callback at a time.
//! No two callbacks ever run concurrently, for the same or for different
//! devices, so drivers need no cross-callback locking.
//!
//! Packets submitted by drivers through their [`FeedSender`] are forwarded
//! unmodified and in submission order to every registered [`DatafeedSink`]
//! after each callback returns; the dispatcher performs no batching and no
//! reordering. Any reordering (such as the VCD writer's merge queue) is a
//! property of a specific consumer, never of the session.

use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::datafeed::{FeedPacket, FeedSender, StreamChecker};
use crate::device::{Device, DeviceId};
use crate::error::{HalError, HalResult};

/// What woke an event source up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    /// `ready()` completed: data or a tick is pending.
    Ready,
    /// The source's own timeout elapsed without readiness.
    Timeout,
}

/// Continuation flag returned by a source callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFlow {
    /// Keep the source registered.
    Continue,
    /// Deregister the source.
    Stop,
}

/// One registered I/O event source of an acquiring device.
///
/// The session drives a source in two phases: a cancel-safe readiness wait
/// and a dispatch callback. `ready()` futures race against each other and
/// against the loop timeout, so implementations must not lose data when
/// their future is dropped before completion — buffer anything consumed
/// from the transport and hand it to `dispatch`.
///
/// All I/O inside `dispatch` must be non-blocking or bounded-blocking;
/// nothing may stall the dispatcher indefinitely.
#[async_trait::async_trait]
pub trait EventSource: Send {
    /// Upper bound on how long the session lets this source sleep before
    /// dispatching a [`SourceEvent::Timeout`].
    fn timeout(&self) -> Duration;

    /// Wait until the source has something to dispatch. Must be cancel
    /// safe.
    async fn ready(&mut self);

    /// Handle one readiness or timeout event. Errors are fatal for this
    /// source only: the session logs them and deregisters the source.
    async fn dispatch(&mut self, event: SourceEvent) -> HalResult<SourceFlow>;
}

/// Consumer of the datafeed (frontend, output module).
pub trait DatafeedSink: Send {
    /// Name for log messages.
    fn name(&self) -> &'static str {
        "sink"
    }

    /// Receive one packet. Packets arrive in driver-submission order. An
    /// error (for example a capacity error) is fatal for this sink only:
    /// the session drops the sink and keeps running.
    fn receive(&mut self, packet: &FeedPacket) -> HalResult<()>;
}

struct SourceEntry {
    device: DeviceId,
    source: Box<dyn EventSource>,
    deadline: Instant,
}

/// The session dispatcher.
pub struct Session {
    sources: Vec<SourceEntry>,
    sinks: Vec<Box<dyn DatafeedSink>>,
    feed_tx: mpsc::UnboundedSender<FeedPacket>,
    feed_rx: mpsc::UnboundedReceiver<FeedPacket>,
    checkers: std::collections::HashMap<DeviceId, StreamChecker>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            sources: Vec::new(),
            sinks: Vec::new(),
            feed_tx,
            feed_rx,
            checkers: std::collections::HashMap::new(),
        }
    }

    /// Register a datafeed consumer.
    pub fn add_sink(&mut self, sink: Box<dyn DatafeedSink>) {
        tracing::debug!(sink = sink.name(), "sink registered");
        self.sinks.push(sink);
    }

    /// Number of currently registered sinks.
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Number of currently registered event sources.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// A feed handle for `device`, for drivers that submit packets outside
    /// `acquisition_start` (for example `End` from `acquisition_stop`).
    pub fn feed_sender(&self, device: DeviceId) -> FeedSender {
        FeedSender::new(device, self.feed_tx.clone())
    }

    /// Start acquisition on `dev` and register its event sources.
    ///
    /// The device's `acquisition_start` either returns every source it
    /// needs or fails with none created, so a failed start never leaves a
    /// partially registered set.
    pub async fn start(&mut self, dev: &mut Device) -> HalResult<()> {
        let feed = self.feed_sender(dev.id());
        let sources = dev.start(feed).await?;
        if sources.is_empty() {
            return Err(HalError::arg("driver returned no event sources"));
        }
        self.checkers.insert(dev.id(), StreamChecker::new());
        let now = Instant::now();
        for source in sources {
            let deadline = now + source.timeout();
            self.sources.push(SourceEntry {
                device: dev.id(),
                source,
                deadline,
            });
        }
        Ok(())
    }

    /// Register a bare event source, for consumers and tests that bypass
    /// the driver layer.
    pub fn register_source(&mut self, device: DeviceId, source: Box<dyn EventSource>) {
        let deadline = Instant::now() + source.timeout();
        self.checkers.entry(device).or_default();
        self.sources.push(SourceEntry {
            device,
            source,
            deadline,
        });
    }

    /// Run the dispatch loop until every source has deregistered itself.
    ///
    /// Each iteration waits — bounded by the nearest source deadline — for
    /// any source to become ready, dispatches exactly one readiness
    /// callback (or the timeout callbacks of all overdue sources), then
    /// fans out the packets that the callback submitted.
    pub async fn run(&mut self) -> HalResult<()> {
        while !self.sources.is_empty() {
            let now = Instant::now();
            let wait = self
                .sources
                .iter()
                .map(|s| s.deadline.saturating_duration_since(now))
                .min()
                .unwrap_or(Duration::ZERO);

            let ready_idx = {
                let mut waits = FuturesUnordered::new();
                for (idx, entry) in self.sources.iter_mut().enumerate() {
                    waits.push(async move {
                        entry.source.ready().await;
                        idx
                    });
                }
                match tokio::time::timeout(wait, waits.next()).await {
                    Ok(Some(idx)) => Some(idx),
                    Ok(None) => None,
                    Err(_) => None,
                }
            };

            match ready_idx {
                Some(idx) => {
                    self.dispatch_one(idx, SourceEvent::Ready).await;
                    self.pump_feed();
                }
                None => {
                    // Deliver timeouts to every overdue source. Indices are
                    // walked from the back so removal keeps them valid.
                    let now = Instant::now();
                    for idx in (0..self.sources.len()).rev() {
                        if self.sources[idx].deadline <= now {
                            self.dispatch_one(idx, SourceEvent::Timeout).await;
                            self.pump_feed();
                        }
                    }
                }
            }
        }

        // Packets submitted by the final callbacks (End, stop teardown).
        self.pump_feed();
        Ok(())
    }

    /// Forward pending packets to the sinks without running the loop.
    /// Useful after `Device::stop` once `run` has returned.
    pub fn pump(&mut self) {
        self.pump_feed();
    }

    async fn dispatch_one(&mut self, idx: usize, event: SourceEvent) {
        let entry = &mut self.sources[idx];
        let flow = match entry.source.dispatch(event).await {
            Ok(flow) => flow,
            Err(e) => {
                // Transport failure while acquiring: fatal for this run,
                // cooperative stop of the source.
                tracing::error!(device = %entry.device, error = %e, "source failed, deregistering");
                SourceFlow::Stop
            }
        };
        match flow {
            SourceFlow::Continue => {
                entry.deadline = Instant::now() + entry.source.timeout();
            }
            SourceFlow::Stop => {
                let entry = self.sources.remove(idx);
                tracing::debug!(device = %entry.device, "source deregistered");
            }
        }
    }

    /// Drain the feed channel, validate per-device stream invariants, and
    /// fan every packet out to all sinks in submission order.
    fn pump_feed(&mut self) {
        while let Ok(packet) = self.feed_rx.try_recv() {
            let checker = self.checkers.entry(packet.device).or_default();
            if let Err(e) = checker.check(&packet.packet) {
                tracing::error!(
                    device = %packet.device,
                    kind = packet.packet.kind(),
                    error = %e,
                    "dropping packet violating stream protocol"
                );
                continue;
            }

            let mut failed: Vec<usize> = Vec::new();
            for (idx, sink) in self.sinks.iter_mut().enumerate() {
                if let Err(e) = sink.receive(&packet) {
                    tracing::error!(sink = sink.name(), error = %e, "sink failed, dropping it");
                    failed.push(idx);
                }
            }
            for idx in failed.into_iter().rev() {
                self.sinks.remove(idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::Packet;
    use std::sync::{Arc, Mutex};

    /// Sink recording every packet it sees.
    struct Recorder {
        seen: Arc<Mutex<Vec<FeedPacket>>>,
    }

    impl DatafeedSink for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn receive(&mut self, packet: &FeedPacket) -> HalResult<()> {
            self.seen.lock().unwrap().push(packet.clone());
            Ok(())
        }
    }

    /// Source emitting a fixed number of ticks, then End + Stop.
    struct TickSource {
        feed: FeedSender,
        remaining: u32,
        started: bool,
    }

    #[async_trait::async_trait]
    impl EventSource for TickSource {
        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn ready(&mut self) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        async fn dispatch(&mut self, _event: SourceEvent) -> HalResult<SourceFlow> {
            if !self.started {
                self.started = true;
                self.feed.send(Packet::Header)?;
            }
            if self.remaining == 0 {
                self.feed.send(Packet::End)?;
                return Ok(SourceFlow::Stop);
            }
            self.remaining -= 1;
            self.feed.send(Packet::FrameBegin)?;
            self.feed.send(Packet::Trigger)?;
            self.feed.send(Packet::FrameEnd)?;
            Ok(SourceFlow::Continue)
        }
    }

    #[tokio::test]
    async fn packets_fan_out_in_order() {
        let mut session = Session::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        session.add_sink(Box::new(Recorder {
            seen: Arc::clone(&seen),
        }));

        let device = crate::device::Device::new(Box::new(NullOps::default())).id();
        let feed = session.feed_sender(device);
        session.register_source(
            device,
            Box::new(TickSource {
                feed,
                remaining: 3,
                started: false,
            }),
        );

        session.run().await.unwrap();

        let seen = seen.lock().unwrap();
        let kinds: Vec<&str> = seen.iter().map(|p| p.packet.kind()).collect();
        assert_eq!(
            kinds,
            [
                "header",
                "frame_begin",
                "trigger",
                "frame_end",
                "frame_begin",
                "trigger",
                "frame_end",
                "frame_begin",
                "trigger",
                "frame_end",
                "end",
            ]
        );
    }

    #[tokio::test]
    async fn invalid_packets_are_dropped_not_fatal() {
        let mut session = Session::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        session.add_sink(Box::new(Recorder {
            seen: Arc::clone(&seen),
        }));

        let device = crate::device::Device::new(Box::new(NullOps::default())).id();
        let feed = session.feed_sender(device);

        // Trigger before Header violates the protocol.
        feed.send(Packet::Trigger).unwrap();
        feed.send(Packet::Header).unwrap();
        feed.send(Packet::End).unwrap();
        session.pump();

        let kinds: Vec<&str> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.packet.kind())
            .collect();
        assert_eq!(kinds, ["header", "end"]);
    }

    #[tokio::test]
    async fn failing_sink_is_removed() {
        struct FailingSink;
        impl DatafeedSink for FailingSink {
            fn receive(&mut self, _: &FeedPacket) -> HalResult<()> {
                Err(HalError::Capacity("out of identifiers".into()))
            }
        }

        let mut session = Session::new();
        session.add_sink(Box::new(FailingSink));
        let device = crate::device::Device::new(Box::new(NullOps::default())).id();
        session.feed_sender(device).send(Packet::Header).unwrap();
        session.pump();
        assert_eq!(session.sink_count(), 0);
    }

    /// Minimal DeviceOps used only to mint fresh DeviceIds in tests.
    #[derive(Default)]
    struct NullOps {
        info: crate::device::DeviceInfo,
    }

    #[async_trait::async_trait]
    impl crate::device::DeviceOps for NullOps {
        fn info(&self) -> &crate::device::DeviceInfo {
            &self.info
        }
        async fn open(&mut self) -> HalResult<()> {
            Ok(())
        }
        async fn close(&mut self) -> HalResult<()> {
            Ok(())
        }
        async fn config_get(
            &self,
            _: crate::config::ConfigKey,
            _: Option<&str>,
        ) -> HalResult<crate::config::ConfigValue> {
            Err(HalError::NotApplicable)
        }
        async fn config_set(
            &mut self,
            _: crate::config::ConfigKey,
            _: crate::config::ConfigValue,
            _: Option<&str>,
        ) -> HalResult<()> {
            Err(HalError::NotApplicable)
        }
        async fn config_list(
            &self,
            _: crate::config::ConfigKey,
            _: Option<&str>,
        ) -> HalResult<Vec<crate::config::ConfigValue>> {
            Err(HalError::NotApplicable)
        }
        async fn acquisition_start(
            &mut self,
            _: FeedSender,
        ) -> HalResult<Vec<Box<dyn EventSource>>> {
            Ok(vec![])
        }
        async fn acquisition_stop(&mut self) -> HalResult<()> {
            Ok(())
        }
    }
}
