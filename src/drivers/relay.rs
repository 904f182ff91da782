//! Modbus relay/multiplexer boxes.
//!
//! Supported models are listed in a profile table keyed by the value of
//! an identification holding register. Scan probes that register over
//! Modbus-RTU and yields zero instances when the value matches no
//! profile. A box with N relays is modelled as N single-channel groups,
//! each carrying the coil address of its relay; toggling a group's
//! `Enabled` key writes the coil and updates a cached state word, so
//! reads never touch the wire.
//!
//! These boxes do not stream: `acquisition_start` is `NotApplicable`.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelGroup, ChannelType};
use crate::config::{ConfigCaps, ConfigKey, ConfigValue};
use crate::datafeed::FeedSender;
use crate::device::{ConnectionKind, Device, DeviceInfo, DeviceOps};
use crate::driver::{Driver, DriverKind, ScanOptions};
use crate::error::{HalError, HalResult};
use crate::session::EventSource;
use crate::transport::modbus::ModbusClient;
use crate::transport::serial::{PortFactory, SerialParams, SystemPorts};

/// Holding register probed during scan.
const ID_REGISTER: u16 = 0x0000;

const DEFAULT_MODBUS_ADDRESS: u8 = 1;
const DEFAULT_SERIALCOMM: &str = "9600/8n1";

struct Profile {
    id: u16,
    model: &'static str,
    relays: usize,
}

const PROFILES: &[Profile] = &[
    Profile {
        id: 0x0004,
        model: "LS-R4",
        relays: 4,
    },
    Profile {
        id: 0x0008,
        model: "LS-R8",
        relays: 8,
    },
    Profile {
        id: 0x0010,
        model: "LS-R16",
        relays: 16,
    },
];

// ============================================================================
// Driver
// ============================================================================

pub struct RelayDriver {
    ports: Box<dyn PortFactory>,
}

impl RelayDriver {
    pub fn new() -> Self {
        Self {
            ports: Box::new(SystemPorts),
        }
    }

    pub fn with_port_factory(ports: Box<dyn PortFactory>) -> Self {
        Self { ports }
    }
}

impl Default for RelayDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for RelayDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Relay
    }

    fn name(&self) -> &'static str {
        "relay"
    }

    fn long_name(&self) -> &'static str {
        "Modbus relay box"
    }

    async fn scan(&mut self, options: &ScanOptions) -> HalResult<Vec<Device>> {
        let conn = options
            .conn
            .as_deref()
            .ok_or_else(|| HalError::arg("relay scan requires a connection string"))?;
        let serialcomm = options.serialcomm.as_deref().unwrap_or(DEFAULT_SERIALCOMM);
        let address = options.modbus_addr.unwrap_or(DEFAULT_MODBUS_ADDRESS);

        let params = SerialParams::parse(serialcomm)?;
        let port = self.ports.open(conn, params).await?;
        let mut client = ModbusClient::new(port, address);

        let id = match client.read_holding_registers(ID_REGISTER, 1).await {
            Ok(regs) => regs[0],
            Err(e) => {
                tracing::debug!(conn, %e, "relay identification probe failed");
                return Ok(Vec::new());
            }
        };
        let Some(profile) = PROFILES.iter().find(|p| p.id == id) else {
            tracing::info!(conn, id = format!("{id:#06x}"), "no relay profile matches");
            return Ok(Vec::new());
        };
        tracing::info!(conn, model = profile.model, relays = profile.relays, "relay box found");

        // Seed the cached state word from the hardware.
        let coils = client.read_coils(0, profile.relays as u16).await?;
        let mut state: u32 = 0;
        for (i, on) in coils.iter().enumerate() {
            if *on {
                state |= 1 << i;
            }
        }

        let ops = RelayDevice::build(profile, conn, client, state)?;
        Ok(vec![Device::new(Box::new(ops))])
    }
}

// ============================================================================
// Device instance
// ============================================================================

struct RelayDevice {
    info: DeviceInfo,
    client: ModbusClient,
    /// Bit *i* mirrors the state of coil *i*.
    state: Arc<Mutex<u32>>,
}

impl RelayDevice {
    fn build(
        profile: &Profile,
        conn: &str,
        client: ModbusClient,
        state: u32,
    ) -> HalResult<Self> {
        let mut info = DeviceInfo::new("labstream", profile.model, "")
            .with_connection(ConnectionKind::ModbusSerial, conn)
            .with_caps(ConfigKey::Conn, ConfigCaps::GET)
            .with_caps(ConfigKey::ModbusAddr, ConfigCaps::GET);

        for i in 0..profile.relays {
            let group = format!("R{i}");
            info.add_group(
                ChannelGroup::new(group.as_str())
                    .with_address(i as u32)
                    .with_caps(ConfigKey::Enabled, ConfigCaps::GET_SET),
            )?;
            let on = state & (1 << i) != 0;
            let ch = info.add_channel(Channel::new(i, ChannelType::Logic, on, group.clone()))?;
            info.attach_to_group(&group, &ch)?;
        }

        Ok(Self {
            info,
            client,
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn coil_for(&self, group: Option<&str>) -> HalResult<u16> {
        let name = group.ok_or_else(|| HalError::arg("Enabled is a per-relay key"))?;
        let group = self
            .info
            .group(name)
            .ok_or_else(|| HalError::arg(format!("unknown group {name:?}")))?;
        let coil = group
            .address()
            .ok_or_else(|| HalError::arg(format!("group {name:?} has no coil address")))?;
        Ok(coil as u16)
    }
}

#[async_trait]
impl DeviceOps for RelayDevice {
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
        match key {
            ConfigKey::Conn => Ok(ConfigValue::Str(
                self.info.connection().unwrap_or("").to_owned(),
            )),
            ConfigKey::ModbusAddr => Ok(ConfigValue::UInt(u64::from(self.client.address()))),
            ConfigKey::Enabled => {
                let coil = self.coil_for(group)?;
                let on = *self.state.lock() & (1 << coil) != 0;
                Ok(ConfigValue::Bool(on))
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
        match key {
            ConfigKey::Enabled => {
                let coil = self.coil_for(group)?;
                let on = value
                    .as_bool()
                    .ok_or_else(|| HalError::arg("Enabled takes a boolean"))?;
                self.client.write_coil(coil, on).await?;
                let mut state = self.state.lock();
                if on {
                    *state |= 1 << coil;
                } else {
                    *state &= !(1 << coil);
                }
                drop(state);
                if let Some(ch) = self
                    .info
                    .channels()
                    .iter()
                    .find(|c| c.index() == coil as usize)
                {
                    ch.set_enabled(on);
                }
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
        _feed: FeedSender,
    ) -> HalResult<Vec<Box<dyn EventSource>>> {
        Err(HalError::NotApplicable)
    }

    async fn acquisition_stop(&mut self) -> HalResult<()> {
        Err(HalError::NotApplicable)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::modbus::{build_frame, crc16, function};
    use crate::transport::serial::DynSerial;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::Mutex as AsyncMutex;

    /// Hand out one prepared stream, then fail further opens.
    struct OneShotPorts(AsyncMutex<Option<DynSerial>>);

    #[async_trait]
    impl PortFactory for OneShotPorts {
        async fn open(&self, _conn: &str, _params: SerialParams) -> HalResult<DynSerial> {
            self.0
                .lock()
                .await
                .take()
                .ok_or_else(|| HalError::arg("no port left"))
        }
    }

    /// Simulated relay box: answers identification, coil reads and coil
    /// writes until the host hangs up.
    async fn serve_box(mut host: DuplexStream, id: u16, mut coils: u32) {
        loop {
            let mut request = [0u8; 8];
            if host.read_exact(&mut request).await.is_err() {
                return;
            }
            let (body, crc) = request.split_at(6);
            assert_eq!(crc16(body).to_le_bytes(), *crc, "request CRC");
            let address = body[0];
            let start = u16::from_be_bytes([body[2], body[3]]);
            let arg = u16::from_be_bytes([body[4], body[5]]);

            let reply = match body[1] {
                function::READ_HOLDING_REGISTERS => {
                    assert_eq!(start, ID_REGISTER);
                    let [hi, lo] = id.to_be_bytes();
                    build_frame(address, &[body[1], 2, hi, lo])
                }
                function::READ_COILS => {
                    let byte_count = (arg as usize + 7) / 8;
                    let mut payload = vec![body[1], byte_count as u8];
                    payload.extend_from_slice(&coils.to_le_bytes()[..byte_count]);
                    build_frame(address, &payload)
                }
                function::WRITE_COIL => {
                    if arg == 0xFF00 {
                        coils |= 1 << start;
                    } else {
                        coils &= !(1 << start);
                    }
                    build_frame(address, &body[1..])
                }
                other => panic!("unexpected function {other:#04x}"),
            };
            if host.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    fn driver_for(stream: DuplexStream) -> RelayDriver {
        RelayDriver::with_port_factory(Box::new(OneShotPorts(AsyncMutex::new(Some(Box::new(
            stream,
        ))))))
    }

    fn scan_options() -> ScanOptions {
        ScanOptions {
            conn: Some("sim".into()),
            ..ScanOptions::default()
        }
    }

    #[tokio::test]
    async fn unknown_identification_yields_no_instances() {
        let (host, port) = tokio::io::duplex(256);
        let server = tokio::spawn(serve_box(host, 0xBEEF, 0));
        let mut driver = driver_for(port);

        let devices = driver.scan(&scan_options()).await.unwrap();
        assert!(devices.is_empty());
        drop(driver);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn scan_builds_one_group_per_relay() {
        let (host, port) = tokio::io::duplex(256);
        let server = tokio::spawn(serve_box(host, 0x0008, 0b0000_0101));
        let mut driver = driver_for(port);

        let mut devices = driver.scan(&scan_options()).await.unwrap();
        assert_eq!(devices.len(), 1);
        let device = devices.pop().unwrap();
        assert_eq!(device.info().model(), "LS-R8");
        assert_eq!(device.info().groups().len(), 8);
        for group in device.info().groups() {
            assert_eq!(group.len(), 1);
        }
        drop(devices);
        drop(device);
        drop(driver);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn toggling_a_group_writes_the_coil_and_the_cache() {
        let (host, port) = tokio::io::duplex(256);
        let server = tokio::spawn(serve_box(host, 0x0008, 0));
        let mut driver = driver_for(port);

        let mut devices = driver.scan(&scan_options()).await.unwrap();
        let mut device = devices.pop().unwrap();
        device.open().await.unwrap();

        for i in [2usize, 5] {
            let group = format!("R{i}");
            device
                .config_set(ConfigKey::Enabled, ConfigValue::Bool(true), Some(&group))
                .await
                .unwrap();
            let on = device
                .config_get(ConfigKey::Enabled, Some(&group))
                .await
                .unwrap();
            assert_eq!(on, ConfigValue::Bool(true));
        }
        // An untouched relay stays off in the cache.
        let off = device
            .config_get(ConfigKey::Enabled, Some("R3"))
            .await
            .unwrap();
        assert_eq!(off, ConfigValue::Bool(false));

        device.close().await.unwrap();
        drop(device);
        drop(driver);
        server.await.unwrap();
    }
}
