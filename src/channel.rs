//! Channel and channel-group model.
//!
//! A [`Channel`] describes one logical signal line in the acquired data: a
//! logic bit or an analog quantity. Channels are owned by their device
//! instance as `Arc<Channel>`; a channel's `index` gives its position in
//! the packed per-sample data image and must remain stable for the lifetime
//! of the instance, because downstream bit and byte offsets depend on it.
//!
//! A [`ChannelGroup`] is a named set of *weak* references to channels (no
//! ownership) plus optional driver-private grouping metadata such as a
//! probe index or coil sub-address. Groups scope capability operations to a
//! subset of channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::config::{ConfigCaps, ConfigKey};

/// Kind of signal a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Single-bit digital line.
    Logic,
    /// Floating point quantity (voltage, current, ...).
    Analog,
}

/// One logical signal line of a device.
#[derive(Debug)]
pub struct Channel {
    index: usize,
    channel_type: ChannelType,
    name: String,
    enabled: AtomicBool,
    /// Driver-private annotation, e.g. a probe label or register name.
    note: Option<String>,
}

impl Channel {
    pub fn new(index: usize, channel_type: ChannelType, enabled: bool, name: impl Into<String>) -> Self {
        Self {
            index,
            channel_type,
            name: name.into(),
            enabled: AtomicBool::new(enabled),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Position within the packed per-sample data image.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn note(&self) -> Option<&str> {
        self.note.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// A named set of weak channel references sharing configuration scope.
#[derive(Debug, Default)]
pub struct ChannelGroup {
    name: String,
    channels: Vec<Weak<Channel>>,
    /// Driver-private sub-address (probe index, coil number, ...).
    address: Option<u32>,
    caps: HashMap<ConfigKey, ConfigCaps>,
}

impl ChannelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_caps(mut self, key: ConfigKey, caps: ConfigCaps) -> Self {
        self.caps.insert(key, caps);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    /// Capability flags for `key` scoped to this group, if declared.
    pub fn caps(&self, key: ConfigKey) -> Option<ConfigCaps> {
        self.caps.get(&key).copied()
    }

    /// Attach a channel reference. The caller (the device) is responsible
    /// for ensuring the channel belongs to the same instance.
    pub(crate) fn attach(&mut self, channel: &Arc<Channel>) {
        self.channels.push(Arc::downgrade(channel));
    }

    /// Upgraded live channel references, in attach order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
