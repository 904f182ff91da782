//! Device instances and the acquisition state machine.
//!
//! A driver produces [`Device`]s from `scan`. The `Device` wrapper owns the
//! driver's instance object (a [`DeviceOps`] trait object) and enforces two
//! contracts *before* any driver code runs:
//!
//! - the state machine `Scanned → Open → Acquiring → Open → Closed`, and
//! - the config capability check: a get/set/list call whose capability bit
//!   is unset returns [`HalError::NotApplicable`] as a pure data check.
//!
//! # State machine
//!
//! ```text
//! scan ──► Scanned ──open──► Open ──start──► Acquiring
//!                             ▲                  │
//!                             └──────stop────────┘
//!                             │
//!                           close
//!                             ▼
//!                          Closed
//! ```
//!
//! Config operations are legal in `Scanned` and `Open`. While `Acquiring`,
//! only keys flagged `live_set` may be touched. `acquisition_stop` is
//! idempotent: a second `stop` is a no-op and cannot double-remove an event
//! source.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{Channel, ChannelGroup};
use crate::config::{ConfigCaps, ConfigKey, ConfigValue};
use crate::datafeed::FeedSender;
use crate::error::{HalError, HalResult};
use crate::session::EventSource;

/// Opaque device instance identifier, stable for the instance's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(Uuid);

impl DeviceId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::generate()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport family a device instance is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Serial,
    Usb,
    ModbusSerial,
    Scpi,
    /// Virtual devices (demo driver).
    None,
}

/// Acquisition state of a device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Instance exists, transport not connected.
    Scanned,
    /// Transport connected, configuration cached.
    Open,
    /// Datafeed flowing.
    Acquiring,
    /// Transport disconnected; terminal.
    Closed,
}

/// Static description of a device instance: identity, channels, groups and
/// the per-key capability tables.
#[derive(Debug, Default)]
pub struct DeviceInfo {
    vendor: String,
    model: String,
    version: String,
    connection: Option<String>,
    connection_kind: Option<ConnectionKind>,
    channels: Vec<Arc<Channel>>,
    groups: Vec<ChannelGroup>,
    caps: HashMap<ConfigKey, ConfigCaps>,
}

impl DeviceInfo {
    pub fn new(
        vendor: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_connection(mut self, kind: ConnectionKind, id: impl Into<String>) -> Self {
        self.connection_kind = Some(kind);
        self.connection = Some(id.into());
        self
    }

    pub fn with_caps(mut self, key: ConfigKey, caps: ConfigCaps) -> Self {
        self.caps.insert(key, caps);
        self
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    pub fn connection_kind(&self) -> Option<ConnectionKind> {
        self.connection_kind
    }

    /// Add a channel. Fails if the index is already used: downstream bit
    /// and byte offsets depend on the index staying unique and stable.
    pub fn add_channel(&mut self, channel: Channel) -> HalResult<Arc<Channel>> {
        if self.channels.iter().any(|c| c.index() == channel.index()) {
            return Err(HalError::arg(format!(
                "channel index {} already in use",
                channel.index()
            )));
        }
        let channel = Arc::new(channel);
        self.channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    pub fn add_group(&mut self, group: ChannelGroup) -> HalResult<()> {
        if self.groups.iter().any(|g| g.name() == group.name()) {
            return Err(HalError::arg(format!(
                "channel group '{}' already exists",
                group.name()
            )));
        }
        self.groups.push(group);
        Ok(())
    }

    /// Attach one of this device's own channels to one of its groups.
    /// Fails if the channel belongs to a different device instance.
    pub fn attach_to_group(&mut self, group: &str, channel: &Arc<Channel>) -> HalResult<()> {
        if !self.channels.iter().any(|c| Arc::ptr_eq(c, channel)) {
            return Err(HalError::arg(format!(
                "channel '{}' belongs to a different device",
                channel.name()
            )));
        }
        let group = self
            .groups
            .iter_mut()
            .find(|g| g.name() == group)
            .ok_or_else(|| HalError::arg(format!("no such channel group '{group}'")))?;
        group.attach(channel);
        Ok(())
    }

    /// Channels in index order of creation.
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    pub fn groups(&self) -> &[ChannelGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&ChannelGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    /// Capability flags for `key`, scoped to `group` when given, else
    /// device-wide. `None` means the key is not declared at that scope.
    pub fn caps(&self, key: ConfigKey, group: Option<&str>) -> Option<ConfigCaps> {
        match group {
            Some(name) => self.group(name).and_then(|g| g.caps(key)),
            None => self.caps.get(&key).copied(),
        }
    }
}

/// Driver-implemented operations of one device instance.
///
/// Implementations may assume the framework has already validated state and
/// capability bits; `config_*` is only invoked for advertised operations.
///
/// `acquisition_start` returns the event sources to register with the
/// session. Returning them (instead of registering incrementally) means a
/// failed start cannot leave a partially registered source set.
#[async_trait]
pub trait DeviceOps: Send {
    fn info(&self) -> &DeviceInfo;

    /// Connect the transport and run any startup/handshake sequence.
    async fn open(&mut self) -> HalResult<()>;

    /// Disconnect the transport.
    async fn close(&mut self) -> HalResult<()>;

    async fn config_get(&self, key: ConfigKey, group: Option<&str>) -> HalResult<ConfigValue>;

    async fn config_set(
        &mut self,
        key: ConfigKey,
        value: ConfigValue,
        group: Option<&str>,
    ) -> HalResult<()>;

    async fn config_list(
        &self,
        key: ConfigKey,
        group: Option<&str>,
    ) -> HalResult<Vec<ConfigValue>>;

    /// Arm the device, send the datafeed `Header`, and hand back the event
    /// sources to drive the acquisition.
    async fn acquisition_start(
        &mut self,
        feed: FeedSender,
    ) -> HalResult<Vec<Box<dyn EventSource>>>;

    /// Cooperatively stop: flag the sources to finish, emit `End` if not
    /// already sent, revert settings that were overridden for acquisition.
    async fn acquisition_stop(&mut self) -> HalResult<()>;
}

/// A scanned device instance, wrapped with state-machine and capability
/// enforcement.
pub struct Device {
    id: DeviceId,
    state: DeviceState,
    ops: Box<dyn DeviceOps>,
}

impl Device {
    pub fn new(ops: Box<dyn DeviceOps>) -> Self {
        Self {
            id: DeviceId::generate(),
            state: DeviceState::Scanned,
            ops,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn info(&self) -> &DeviceInfo {
        self.ops.info()
    }

    /// `Scanned → Open`. On failure the instance stays `Scanned`.
    pub async fn open(&mut self) -> HalResult<()> {
        match self.state {
            DeviceState::Scanned => {}
            DeviceState::Closed => return Err(HalError::DeviceClosed),
            _ => return Err(HalError::arg("device is already open")),
        }
        self.ops.open().await?;
        self.state = DeviceState::Open;
        tracing::debug!(device = %self.id, "device opened");
        Ok(())
    }

    /// `Open → Closed` (also legal from `Scanned`). Not legal while
    /// acquiring; stop first.
    pub async fn close(&mut self) -> HalResult<()> {
        match self.state {
            DeviceState::Acquiring => {
                return Err(HalError::arg("stop acquisition before closing"))
            }
            DeviceState::Closed => return Ok(()),
            DeviceState::Open => self.ops.close().await?,
            DeviceState::Scanned => {}
        }
        self.state = DeviceState::Closed;
        tracing::debug!(device = %self.id, "device closed");
        Ok(())
    }

    pub async fn config_get(
        &self,
        key: ConfigKey,
        group: Option<&str>,
    ) -> HalResult<ConfigValue> {
        let caps = self.check_config(key, group, false)?;
        if !caps.get {
            return Err(HalError::NotApplicable);
        }
        self.ops.config_get(key, group).await
    }

    pub async fn config_set(
        &mut self,
        key: ConfigKey,
        value: ConfigValue,
        group: Option<&str>,
    ) -> HalResult<()> {
        let caps = self.check_config(key, group, true)?;
        if !caps.set {
            return Err(HalError::NotApplicable);
        }
        self.ops.config_set(key, value, group).await
    }

    pub async fn config_list(
        &self,
        key: ConfigKey,
        group: Option<&str>,
    ) -> HalResult<Vec<ConfigValue>> {
        let caps = self.check_config(key, group, false)?;
        if !caps.list {
            return Err(HalError::NotApplicable);
        }
        self.ops.config_list(key, group).await
    }

    /// `Open → Acquiring`. Returns the event sources the caller (the
    /// session) must register. On error no source exists and the state is
    /// unchanged.
    pub(crate) async fn start(
        &mut self,
        feed: FeedSender,
    ) -> HalResult<Vec<Box<dyn EventSource>>> {
        match self.state {
            DeviceState::Open => {}
            DeviceState::Closed => return Err(HalError::DeviceClosed),
            DeviceState::Acquiring => return Err(HalError::arg("device is already acquiring")),
            DeviceState::Scanned => return Err(HalError::arg("open the device first")),
        }
        let sources = self.ops.acquisition_start(feed).await?;
        self.state = DeviceState::Acquiring;
        tracing::info!(device = %self.id, sources = sources.len(), "acquisition started");
        Ok(sources)
    }

    /// `Acquiring → Open`. Idempotent; a no-op in any other state except
    /// `Closed`.
    pub async fn stop(&mut self) -> HalResult<()> {
        match self.state {
            DeviceState::Acquiring => {}
            DeviceState::Closed => return Err(HalError::DeviceClosed),
            _ => return Ok(()),
        }
        self.ops.acquisition_stop().await?;
        self.state = DeviceState::Open;
        tracing::info!(device = %self.id, "acquisition stopped");
        Ok(())
    }

    /// The pure data check preceding every config operation: state
    /// legality, group membership, capability presence.
    fn check_config(
        &self,
        key: ConfigKey,
        group: Option<&str>,
        is_write: bool,
    ) -> HalResult<ConfigCaps> {
        match self.state {
            DeviceState::Closed => return Err(HalError::DeviceClosed),
            DeviceState::Acquiring => {
                let live = self.info().caps(key, group).map(|c| c.live_set);
                if live != Some(true) {
                    return Err(HalError::arg(format!(
                        "config key '{}' is not live-settable while acquiring",
                        key.id()
                    )));
                }
                if !is_write {
                    return Err(HalError::arg(
                        "config reads are not available while acquiring",
                    ));
                }
            }
            DeviceState::Scanned | DeviceState::Open => {}
        }
        if let Some(name) = group {
            if self.info().group(name).is_none() {
                return Err(HalError::arg(format!("no such channel group '{name}'")));
            }
        }
        self.info().caps(key, group).ok_or(HalError::NotApplicable)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("model", &self.info().model())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Device whose config handlers count their invocations, to prove the
    /// capability check short-circuits before driver code.
    struct ProbeDevice {
        info: DeviceInfo,
        config_calls: Arc<AtomicUsize>,
    }

    impl ProbeDevice {
        fn new(calls: Arc<AtomicUsize>) -> Self {
            let mut info = DeviceInfo::new("probe", "probe-1", "1.0")
                .with_caps(ConfigKey::Samplerate, ConfigCaps::GET_SET_LIST);
            let ch = info
                .add_channel(Channel::new(0, ChannelType::Logic, true, "D0"))
                .unwrap();
            info.add_group(ChannelGroup::new("G0")).unwrap();
            info.attach_to_group("G0", &ch).unwrap();
            Self {
                info,
                config_calls: calls,
            }
        }
    }

    #[async_trait]
    impl DeviceOps for ProbeDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        async fn open(&mut self) -> HalResult<()> {
            Ok(())
        }

        async fn close(&mut self) -> HalResult<()> {
            Ok(())
        }

        async fn config_get(&self, _: ConfigKey, _: Option<&str>) -> HalResult<ConfigValue> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ConfigValue::UInt(1000))
        }

        async fn config_set(
            &mut self,
            _: ConfigKey,
            _: ConfigValue,
            _: Option<&str>,
        ) -> HalResult<()> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn config_list(
            &self,
            _: ConfigKey,
            _: Option<&str>,
        ) -> HalResult<Vec<ConfigValue>> {
            self.config_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn acquisition_start(
            &mut self,
            _feed: FeedSender,
        ) -> HalResult<Vec<Box<dyn EventSource>>> {
            Ok(vec![])
        }

        async fn acquisition_stop(&mut self) -> HalResult<()> {
            Ok(())
        }
    }

    fn probe() -> (Device, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let dev = Device::new(Box::new(ProbeDevice::new(Arc::clone(&calls))));
        (dev, calls)
    }

    #[tokio::test]
    async fn capability_check_short_circuits() {
        let (dev, calls) = probe();
        // LimitSamples is not declared at all.
        let err = dev.config_get(ConfigKey::LimitSamples, None).await;
        assert!(matches!(err, Err(HalError::NotApplicable)));
        // Samplerate is declared device-wide but not for group "G0".
        let err = dev.config_get(ConfigKey::Samplerate, Some("G0")).await;
        assert!(matches!(err, Err(HalError::NotApplicable)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The advertised operation does reach the driver.
        dev.config_get(ConfigKey::Samplerate, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_group_is_an_argument_error() {
        let (dev, calls) = probe();
        let err = dev.config_get(ConfigKey::Samplerate, Some("nope")).await;
        assert!(matches!(err, Err(HalError::Arg(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn state_machine_transitions() {
        let (mut dev, _) = probe();
        assert_eq!(dev.state(), DeviceState::Scanned);
        dev.open().await.unwrap();
        assert_eq!(dev.state(), DeviceState::Open);
        assert!(matches!(dev.open().await, Err(HalError::Arg(_))));

        // stop is idempotent outside Acquiring.
        dev.stop().await.unwrap();
        assert_eq!(dev.state(), DeviceState::Open);

        dev.close().await.unwrap();
        assert_eq!(dev.state(), DeviceState::Closed);
        assert!(matches!(
            dev.config_get(ConfigKey::Samplerate, None).await,
            Err(HalError::DeviceClosed)
        ));
    }

    #[test]
    fn duplicate_channel_index_rejected() {
        let mut info = DeviceInfo::new("v", "m", "1");
        info.add_channel(Channel::new(0, ChannelType::Logic, true, "D0"))
            .unwrap();
        let err = info.add_channel(Channel::new(0, ChannelType::Logic, true, "D0b"));
        assert!(matches!(err, Err(HalError::Arg(_))));
    }

    #[test]
    fn device_id_round_trips_through_serde() {
        let id = DeviceId::default();
        let json = serde_json::to_string(&id).unwrap();
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn foreign_channel_rejected_from_group() {
        let mut a = DeviceInfo::new("v", "m", "1");
        let mut b = DeviceInfo::new("v", "m", "1");
        let ch_b = b
            .add_channel(Channel::new(0, ChannelType::Logic, true, "D0"))
            .unwrap();
        a.add_group(ChannelGroup::new("G")).unwrap();
        assert!(matches!(
            a.attach_to_group("G", &ch_b),
            Err(HalError::Arg(_))
        ));
    }
}
