//! Serial line abstractions.
//!
//! Drivers talk to serial instruments through [`DynSerial`], a type-erased
//! async stream. Anything implementing `AsyncRead + AsyncWrite + Unpin +
//! Send` qualifies: a real port (`tokio_serial::SerialStream`, behind the
//! `serial-ports` feature), or a `tokio::io::DuplexStream` in tests.
//!
//! Line-oriented protocols share a port through [`SharedSerial`], which
//! wraps the stream in a `BufReader` for delimiter-based reads. All
//! helpers take explicit timeouts and map elapsed deadlines to
//! [`HalError::Timeout`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;

use crate::error::{HalError, HalResult};

/// Trait alias for async serial I/O.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> SerialIo for T {}

/// Type-erased serial stream.
pub type DynSerial = Box<dyn SerialIo>;

/// Thread-safe shared serial stream with buffered reading.
pub type SharedSerial = Arc<Mutex<BufReader<DynSerial>>>;

/// Wrap a stream for sharing between a config accessor and an acquisition
/// callback.
pub fn share(port: DynSerial) -> SharedSerial {
    Arc::new(Mutex::new(BufReader::new(port)))
}

/// Opens the serial transport a driver scan connects through. Swappable
/// so tests can hand a driver an in-memory stream.
#[async_trait::async_trait]
pub trait PortFactory: Send + Sync {
    async fn open(&self, conn: &str, params: SerialParams) -> HalResult<DynSerial>;
}

/// The default factory: real ports via `tokio-serial`.
pub struct SystemPorts;

#[async_trait::async_trait]
impl PortFactory for SystemPorts {
    #[cfg(feature = "serial-ports")]
    async fn open(&self, conn: &str, params: SerialParams) -> HalResult<DynSerial> {
        open_serial_port(conn, params).await
    }

    #[cfg(not(feature = "serial-ports"))]
    async fn open(&self, _conn: &str, _params: SerialParams) -> HalResult<DynSerial> {
        Err(HalError::arg(
            "serial port support not compiled in (enable the serial-ports feature)",
        ))
    }
}

/// Serial line parameters in "9600/8n1" notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    pub baud_rate: u32,
}

impl SerialParams {
    /// Parse a "baud/8n1" connection parameter string. Only 8n1 framing is
    /// supported; the framing suffix is optional.
    pub fn parse(spec: &str) -> HalResult<Self> {
        let baud_part = spec.split('/').next().unwrap_or(spec);
        let baud_rate: u32 = baud_part
            .parse()
            .map_err(|_| HalError::arg(format!("bad serial spec '{spec}'")))?;
        if let Some(framing) = spec.split('/').nth(1) {
            if !framing.eq_ignore_ascii_case("8n1") {
                return Err(HalError::arg(format!("unsupported framing '{framing}'")));
            }
        }
        Ok(Self { baud_rate })
    }
}

impl Default for SerialParams {
    fn default() -> Self {
        Self { baud_rate: 9600 }
    }
}

/// Open a real serial port with standard 8n1 settings.
#[cfg(feature = "serial-ports")]
pub async fn open_serial_port(path: &str, params: SerialParams) -> HalResult<DynSerial> {
    use tokio_serial::SerialPortBuilderExt;

    let stream = tokio_serial::new(path, params.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| HalError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(Box::new(stream))
}

/// Write the full buffer within `timeout`.
pub async fn write_all_timeout<W: AsyncWrite + Unpin>(
    port: &mut W,
    data: &[u8],
    timeout: Duration,
) -> HalResult<()> {
    match tokio::time::timeout(timeout, port.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HalError::Io(e)),
        Err(_) => Err(HalError::Timeout),
    }
}

/// Read up to `buf.len()` bytes, returning how many arrived before the
/// timeout. Zero means end of stream.
pub async fn read_timeout<R: AsyncRead + Unpin>(
    port: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> HalResult<usize> {
    match tokio::time::timeout(timeout, port.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(HalError::Io(e)),
        Err(_) => Err(HalError::Timeout),
    }
}

/// Read exactly `buf.len()` bytes within `timeout`.
pub async fn read_exact_timeout<R: AsyncRead + Unpin>(
    port: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> HalResult<()> {
    match tokio::time::timeout(timeout, port.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(HalError::Io(e)),
        Err(_) => Err(HalError::Timeout),
    }
}

/// Read one newline-terminated line from a shared port, trimmed.
pub async fn read_line_timeout(port: &SharedSerial, timeout: Duration) -> HalResult<String> {
    let mut guard = port.lock().await;
    let mut line = String::new();
    match tokio::time::timeout(timeout, guard.read_line(&mut line)).await {
        Ok(Ok(0)) => Err(HalError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "serial stream closed",
        ))),
        Ok(Ok(_)) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
        Ok(Err(e)) => Err(HalError::Io(e)),
        Err(_) => Err(HalError::Timeout),
    }
}

/// Drain stale bytes sitting in the receive path, e.g. before a probe on a
/// multidrop bus. Returns the number of bytes discarded.
pub async fn drain_stale<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn serial_params_parse() {
        assert_eq!(SerialParams::parse("115200").unwrap().baud_rate, 115200);
        assert_eq!(SerialParams::parse("9600/8n1").unwrap().baud_rate, 9600);
        assert!(SerialParams::parse("fast").is_err());
        assert!(SerialParams::parse("9600/7e1").is_err());
    }

    #[tokio::test]
    async fn read_line_from_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let port = share(Box::new(device));
        host.write_all(b"*IDN ok\r\n").await.unwrap();

        let line = read_line_timeout(&port, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(line, "*IDN ok");
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let (_host, mut device) = tokio::io::duplex(64);
        let mut buf = [0u8; 4];
        let err = read_timeout(&mut device, &mut buf, Duration::from_millis(10)).await;
        assert!(matches!(err, Err(HalError::Timeout)));
    }

    #[tokio::test]
    async fn read_exact_crosses_partial_reads() {
        // Scripted stream: the reply arrives in two pieces.
        let mut port = tokio_test::io::Builder::new()
            .read(b"\x01\x03")
            .read(b"\x02\x00\x2A")
            .build();
        let mut buf = [0u8; 5];
        read_exact_timeout(&mut port, &mut buf, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(&buf, b"\x01\x03\x02\x00\x2A");
    }

    #[tokio::test]
    async fn drain_discards_pending_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let discarded = drain_stale(&mut device, Duration::from_millis(20)).await;
        assert_eq!(discarded, 16);
    }
}
