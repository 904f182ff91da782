//! Driver interface and registry.
//!
//! Each supported device family provides one [`Driver`] implementation,
//! selected by its [`DriverKind`]. Drivers probe transports in `scan` and
//! yield zero or more [`Device`] instances; the instances are owned by the
//! [`DriverRegistry`], which is an explicitly constructed and torn down
//! object — there is no ambient global driver table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::device::{Device, DeviceId};
use crate::error::{HalError, HalResult};

/// Enumerated device families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Hardware-free pattern generator.
    Demo,
    /// Modbus relay/multiplexer boxes.
    Relay,
    /// Serial streaming multimeters.
    SerialDmm,
}

impl DriverKind {
    pub fn id(&self) -> &'static str {
        match self {
            DriverKind::Demo => "demo",
            DriverKind::Relay => "relay",
            DriverKind::SerialDmm => "serial_dmm",
        }
    }
}

/// Optional connection hints passed to `scan`.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// Connection string ("/dev/ttyUSB0", "COM3", ...).
    pub conn: Option<String>,
    /// Serial line parameters ("9600/8n1").
    pub serialcomm: Option<String>,
    /// Modbus slave address; drivers default to 1.
    pub modbus_addr: Option<u8>,
}

/// A device family driver.
///
/// `scan` probes a transport using the given hints and validates the
/// identification response against the driver's table of supported device
/// profiles. No match yields an empty result, not an error.
#[async_trait]
pub trait Driver: Send {
    fn kind(&self) -> DriverKind;

    /// Short name, matching `kind().id()`.
    fn name(&self) -> &'static str;

    /// Human-readable driver description.
    fn long_name(&self) -> &'static str;

    /// One-time driver setup. Called by the registry on registration.
    fn init(&mut self) -> HalResult<()> {
        Ok(())
    }

    /// One-time driver teardown. Called by the registry on shutdown.
    fn cleanup(&mut self) {}

    async fn scan(&mut self, options: &ScanOptions) -> HalResult<Vec<Device>>;
}

struct RegisteredDevice {
    kind: DriverKind,
    device: Device,
}

/// Owned driver registry.
///
/// Constructed at process start, passed by reference, explicitly torn down
/// with [`DriverRegistry::shutdown`]. Scanned instances live here until
/// [`DriverRegistry::clear`] releases them.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Box<dyn Driver>>,
    devices: Vec<RegisteredDevice>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver, running its `init`.
    pub fn register(&mut self, mut driver: Box<dyn Driver>) -> HalResult<()> {
        if self.drivers.iter().any(|d| d.kind() == driver.kind()) {
            return Err(HalError::arg(format!(
                "driver '{}' already registered",
                driver.kind().id()
            )));
        }
        driver.init()?;
        tracing::debug!(driver = driver.name(), "driver registered");
        self.drivers.push(driver);
        Ok(())
    }

    /// Kinds of all registered drivers.
    pub fn kinds(&self) -> Vec<DriverKind> {
        self.drivers.iter().map(|d| d.kind()).collect()
    }

    /// Scan with one driver; newly found instances are owned by the
    /// registry and their ids returned.
    pub async fn scan(
        &mut self,
        kind: DriverKind,
        options: &ScanOptions,
    ) -> HalResult<Vec<DeviceId>> {
        let driver = self
            .drivers
            .iter_mut()
            .find(|d| d.kind() == kind)
            .ok_or_else(|| HalError::arg(format!("no driver '{}'", kind.id())))?;
        let found = driver.scan(options).await?;
        tracing::info!(driver = kind.id(), found = found.len(), "scan finished");
        let ids: Vec<DeviceId> = found.iter().map(Device::id).collect();
        self.devices
            .extend(found.into_iter().map(|device| RegisteredDevice { kind, device }));
        Ok(ids)
    }

    /// Instances owned by the registry for one driver.
    pub fn list_instances(&self, kind: DriverKind) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| d.device.id())
            .collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.device.id() == id)
            .map(|d| &d.device)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.device.id() == id)
            .map(|d| &mut d.device)
    }

    /// Release all instances of one driver, closing any that are open.
    pub async fn clear(&mut self, kind: DriverKind) -> HalResult<()> {
        let mut kept = Vec::with_capacity(self.devices.len());
        for mut entry in self.devices.drain(..) {
            if entry.kind != kind {
                kept.push(entry);
                continue;
            }
            entry.device.stop().await.ok();
            if let Err(e) = entry.device.close().await {
                tracing::warn!(device = %entry.device.id(), error = %e, "close failed during clear");
            }
        }
        self.devices = kept;
        Ok(())
    }

    /// Tear the registry down: release every instance, run every driver's
    /// `cleanup`.
    pub async fn shutdown(mut self) {
        let kinds = self.kinds();
        for kind in kinds {
            self.clear(kind).await.ok();
        }
        for driver in &mut self.drivers {
            driver.cleanup();
        }
    }
}

/// Software acquisition limits: stop after a sample count or an elapsed
/// time, whichever is configured and reached first.
#[derive(Debug, Clone)]
pub struct AcqLimits {
    samples: Option<u64>,
    msec: Option<u64>,
    sent: u64,
    started: Option<Instant>,
}

impl AcqLimits {
    pub fn new(samples: Option<u64>, msec: Option<u64>) -> Self {
        Self {
            samples,
            msec,
            sent: 0,
            started: None,
        }
    }

    /// Arm the time limit and reset the sample counter.
    pub fn start(&mut self) {
        self.sent = 0;
        self.started = Some(Instant::now());
    }

    /// Account `count` delivered samples.
    pub fn update(&mut self, count: u64) {
        self.sent = self.sent.saturating_add(count);
    }

    /// How many more samples fit under the sample limit, if one is set.
    pub fn remaining(&self) -> Option<u64> {
        self.samples.map(|limit| limit.saturating_sub(self.sent))
    }

    /// True once any configured limit is reached.
    pub fn reached(&self) -> bool {
        if let Some(limit) = self.samples {
            if self.sent >= limit {
                return true;
            }
        }
        if let (Some(msec), Some(started)) = (self.msec, self.started) {
            if started.elapsed().as_millis() as u64 >= msec {
                return true;
            }
        }
        false
    }
}
