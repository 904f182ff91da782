//! Modbus-RTU over a serial line.
//!
//! Request and reply frames carry a CRC16 trailer; replies are validated
//! for slave address, function echo, payload length and CRC. Read
//! operations run a bounded retry: up to [`READ_RETRY_ATTEMPTS`] attempts,
//! each one a full request/reply transaction, before the last error is
//! surfaced. Writes are not retried.
//!
//! Exception replies (function code with the high bit set) are decoded
//! into [`HalError::Data`] with the exception name.

use std::time::Duration;

use crate::error::{HalError, HalResult};
use crate::transport::serial::{
    drain_stale, read_exact_timeout, write_all_timeout, DynSerial,
};

/// Bounded retry on the register/coil read path.
pub const READ_RETRY_ATTEMPTS: usize = 3;

/// Modbus function codes used by this crate.
pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const WRITE_COIL: u8 = 0x05;
    pub const WRITE_REGISTER: u8 = 0x06;
}

/// CRC-16/MODBUS over `data` (poly 0xA001 reflected, init 0xFFFF).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        _ => "unknown exception",
    }
}

/// A Modbus-RTU client owning its serial stream.
pub struct ModbusClient {
    port: DynSerial,
    address: u8,
    timeout: Duration,
}

impl ModbusClient {
    pub fn new(port: DynSerial, address: u8) -> Self {
        Self {
            port,
            address,
            timeout: Duration::from_millis(1000),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Read `count` holding registers starting at `start`, with bounded
    /// retry.
    pub async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> HalResult<Vec<u16>> {
        if count == 0 || count > 125 {
            return Err(HalError::arg(format!("register count {count} out of range")));
        }
        let mut pdu = vec![function::READ_HOLDING_REGISTERS];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let expect_data = 1 + 2 * count as usize; // byte count + registers

        let data = self.transact_retry(&pdu, expect_data).await?;
        if data[0] as usize != 2 * count as usize {
            return Err(HalError::data(format!(
                "register reply announces {} bytes, expected {}",
                data[0],
                2 * count
            )));
        }
        Ok(data[1..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Read `count` coil states starting at `start`, with bounded retry.
    pub async fn read_coils(&mut self, start: u16, count: u16) -> HalResult<Vec<bool>> {
        if count == 0 || count > 2000 {
            return Err(HalError::arg(format!("coil count {count} out of range")));
        }
        let mut pdu = vec![function::READ_COILS];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        let byte_count = (count as usize + 7) / 8;
        let expect_data = 1 + byte_count;

        let data = self.transact_retry(&pdu, expect_data).await?;
        if data[0] as usize != byte_count {
            return Err(HalError::data(format!(
                "coil reply announces {} bytes, expected {byte_count}",
                data[0]
            )));
        }
        Ok((0..count as usize)
            .map(|i| data[1 + i / 8] & (1 << (i % 8)) != 0)
            .collect())
    }

    /// Switch a single coil. The device echoes the request on success.
    pub async fn write_coil(&mut self, coil: u16, on: bool) -> HalResult<()> {
        let mut pdu = vec![function::WRITE_COIL];
        pdu.extend_from_slice(&coil.to_be_bytes());
        pdu.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        let echo = self.transact(&pdu, 4).await?;
        if echo != pdu[1..] {
            return Err(HalError::data("coil write echo mismatch"));
        }
        Ok(())
    }

    /// Write a single holding register.
    pub async fn write_register(&mut self, register: u16, value: u16) -> HalResult<()> {
        let mut pdu = vec![function::WRITE_REGISTER];
        pdu.extend_from_slice(&register.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        let echo = self.transact(&pdu, 4).await?;
        if echo != pdu[1..] {
            return Err(HalError::data("register write echo mismatch"));
        }
        Ok(())
    }

    /// Run one transaction with the bounded read retry policy.
    async fn transact_retry(&mut self, pdu: &[u8], expect_data: usize) -> HalResult<Vec<u8>> {
        let mut last = HalError::Timeout;
        for attempt in 1..=READ_RETRY_ATTEMPTS {
            match self.transact(pdu, expect_data).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    tracing::debug!(
                        attempt,
                        of = READ_RETRY_ATTEMPTS,
                        error = %e,
                        "modbus read attempt failed"
                    );
                    last = e;
                    // Resynchronise before the next attempt.
                    drain_stale(&mut self.port, Duration::from_millis(20)).await;
                }
            }
        }
        Err(last)
    }

    /// One request/reply exchange. `expect_data` is the payload length
    /// after the function echo, before the CRC.
    async fn transact(&mut self, pdu: &[u8], expect_data: usize) -> HalResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(pdu.len() + 3);
        frame.push(self.address);
        frame.extend_from_slice(pdu);
        frame.extend_from_slice(&crc16(&frame).to_le_bytes());
        write_all_timeout(&mut self.port, &frame, self.timeout).await?;

        // Address + function tell us whether this is an exception frame.
        let mut head = [0u8; 2];
        read_exact_timeout(&mut self.port, &mut head, self.timeout).await?;
        if head[0] != self.address {
            return Err(HalError::data(format!(
                "reply from slave {}, expected {}",
                head[0], self.address
            )));
        }

        if head[1] & 0x80 != 0 {
            let mut rest = [0u8; 3]; // exception code + CRC
            read_exact_timeout(&mut self.port, &mut rest, self.timeout).await?;
            let full = [&head[..], &rest[..1]].concat();
            if crc16(&full).to_le_bytes() != rest[1..] {
                return Err(HalError::data("bad CRC on exception reply"));
            }
            return Err(HalError::data(format!(
                "modbus exception: {}",
                exception_name(rest[0])
            )));
        }

        if head[1] != pdu[0] {
            return Err(HalError::data(format!(
                "function echo {:#04x}, expected {:#04x}",
                head[1], pdu[0]
            )));
        }

        let mut rest = vec![0u8; expect_data + 2];
        read_exact_timeout(&mut self.port, &mut rest, self.timeout).await?;
        let (data, crc) = rest.split_at(expect_data);
        let full = [&head[..], data].concat();
        if crc16(&full).to_le_bytes() != *crc {
            return Err(HalError::data("bad CRC on reply"));
        }
        Ok(data.to_vec())
    }
}

/// Build a well-formed reply frame, for device simulators in tests.
pub fn build_frame(address: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 3);
    frame.push(address);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(&frame).to_le_bytes());
    frame
}
