//! Minimal SCPI command layer over a shared serial line.
//!
//! Commands are newline-terminated ASCII. Queries (any command ending in
//! `?`) read back one response line. The only structured parsing here is
//! `*IDN?`, whose comma-separated fields identify the instrument.

use std::time::Duration;

use crate::error::{HalError, HalResult};
use crate::transport::serial::{read_line_timeout, write_all_timeout, SharedSerial};

/// Parsed `*IDN?` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiIdentity {
    pub vendor: String,
    pub model: String,
    pub version: String,
}

/// SCPI client sharing a serial line with other readers.
pub struct ScpiClient {
    port: SharedSerial,
    timeout: Duration,
}

impl ScpiClient {
    pub fn new(port: SharedSerial) -> Self {
        Self {
            port,
            timeout: Duration::from_millis(1000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a command with no response expected.
    pub async fn send(&self, command: &str) -> HalResult<()> {
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        let mut guard = self.port.lock().await;
        write_all_timeout(guard.get_mut(), line.as_bytes(), self.timeout).await
    }

    /// Send a query and read back one response line.
    pub async fn query(&self, command: &str) -> HalResult<String> {
        self.send(command).await?;
        let line = read_line_timeout(&self.port, self.timeout).await?;
        Ok(line.trim_end().to_owned())
    }

    /// `*IDN?` identification, split into vendor/model/version.
    pub async fn identify(&self) -> HalResult<ScpiIdentity> {
        let reply = self.query("*IDN?").await?;
        parse_identity(&reply)
    }
}

fn parse_identity(reply: &str) -> HalResult<ScpiIdentity> {
    let mut fields = reply.split(',').map(str::trim);
    let vendor = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HalError::data(format!("malformed *IDN? reply: {reply:?}")))?;
    let model = fields
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HalError::data(format!("malformed *IDN? reply: {reply:?}")))?;
    // Serial number (field 3) is ignored; version is field 4 when present.
    let version = fields.nth(1).unwrap_or("").to_owned();
    Ok(ScpiIdentity {
        vendor: vendor.to_owned(),
        model: model.to_owned(),
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::serial::share;

    #[test]
    fn identity_parses_four_fields() {
        let id = parse_identity("ACME Instruments,VM-2020,S0042,1.07").unwrap();
        assert_eq!(id.vendor, "ACME Instruments");
        assert_eq!(id.model, "VM-2020");
        assert_eq!(id.version, "1.07");
    }

    #[test]
    fn identity_tolerates_missing_version() {
        let id = parse_identity("ACME,VM-2020").unwrap();
        assert_eq!(id.version, "");
    }

    #[test]
    fn empty_identity_is_rejected() {
        assert!(parse_identity("").is_err());
    }

    #[tokio::test]
    async fn query_round_trip() {
        let (mut host, device) = tokio::io::duplex(256);
        let client = ScpiClient::new(share(Box::new(device)));

        let server = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 64];
            let n = host.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\n");
            host.write_all(b"ACME,VM-2020,S1,2.00\n").await.unwrap();
        });

        let id = client.identify().await.unwrap();
        assert_eq!(id.model, "VM-2020");
        assert_eq!(id.version, "2.00");
        server.await.unwrap();
    }
}
