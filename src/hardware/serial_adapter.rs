//! Serial command channel for line-oriented instruments.
//!
//! A [`CommandChannel`] owns one physical port and performs strictly ordered
//! request/response exchanges over it:
//!
//! - Outgoing commands are framed with a single carriage return (`\r`).
//! - One response line is read back (LF-terminated), bounded by the channel timeout,
//!   and trimmed of its terminators.
//! - An empty response or a timeout is [`TransportError::NoResponse`]; faults on the
//!   line itself are [`TransportError::Io`].
//!
//! The protocol carries no request IDs, so the port sits behind a `tokio::sync::Mutex`
//! held for the whole write/read pair. The mutex is fair: concurrent callers queue in
//! arrival order instead of interleaving their traffic.
//!
//! # Resynchronisation
//! A late reply must never be taken as the answer to the next command. An exchange that
//! times out, fails on the line, or is dropped mid-way leaves the port out of sync; the
//! next `send` first discards incoming bytes until the line has been quiet for one
//! timeout period, and only then writes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::TransportError;

/// Byte stream a command channel can run over (serial port, duplex pipe in tests).
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
type DynSerial = Box<dyn SerialPortIO>;

/// Line terminator appended to every outgoing command.
pub const COMMAND_TERMINATOR: &str = "\r";

/// Bytes discarded while resynchronising before the device is treated as faulty.
const MAX_RESYNC_BYTES: usize = 4096;

struct StreamPort {
    io: BufReader<DynSerial>,
    // Cleared before each write, set once a complete reply line was read
    in_sync: bool,
}

impl StreamPort {
    fn new(io: DynSerial) -> Self {
        Self {
            io: BufReader::new(io),
            in_sync: true,
        }
    }
}

enum Backend {
    Stream(StreamPort),
    /// Answers every command with a placeholder without touching hardware
    Mock,
    Closed,
}

/// Exclusive, ordered request/response transport over one serial line.
#[derive(Clone)]
pub struct CommandChannel {
    port_name: Arc<str>,
    baud_rate: u32,
    timeout: Duration,
    backend: Arc<Mutex<Backend>>,
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("port_name", &self.port_name)
            .field("baud_rate", &self.baud_rate)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CommandChannel {
    /// Open a physical serial port (8N1, no flow control).
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (9600 for the 9014 supplies)
    /// * `timeout` - Upper bound on waiting for each response line
    #[cfg(feature = "tokio_serial")]
    pub async fn open(
        port_name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        use tokio_serial::SerialPortBuilderExt;

        let path = port_name.to_string();
        // Opening can block on some USB adapters
        let port = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
        })
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

        debug!(port = port_name, baud_rate, "Serial port opened");
        Ok(Self::build(
            port_name,
            baud_rate,
            timeout,
            Backend::Stream(StreamPort::new(Box::new(port))),
        ))
    }

    /// Run the channel over an arbitrary byte stream.
    pub fn from_stream<S>(port_name: &str, stream: S, timeout: Duration) -> Self
    where
        S: SerialPortIO + 'static,
    {
        Self::build(
            port_name,
            0,
            timeout,
            Backend::Stream(StreamPort::new(Box::new(stream))),
        )
    }

    /// Channel that never touches hardware.
    ///
    /// Every command is answered with `"Mock response based on <command>"`.
    pub fn mock(port_name: &str) -> Self {
        Self::build(port_name, 0, Duration::from_secs(1), Backend::Mock)
    }

    fn build(port_name: &str, baud_rate: u32, timeout: Duration, backend: Backend) -> Self {
        Self {
            port_name: Arc::from(port_name),
            baud_rate,
            timeout,
            backend: Arc::new(Mutex::new(backend)),
        }
    }

    /// Port identifier.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured baud rate (0 when not backed by a physical port).
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Response timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether this channel synthesises responses.
    pub async fn is_mock(&self) -> bool {
        matches!(*self.backend.lock().await, Backend::Mock)
    }

    /// Whether [`close`](Self::close) has been called.
    pub async fn is_closed(&self) -> bool {
        matches!(*self.backend.lock().await, Backend::Closed)
    }

    /// Send one command and wait for its single-line response.
    pub async fn send(&self, command: &str) -> Result<String, TransportError> {
        let mut backend = self.backend.lock().await;

        let port = match &mut *backend {
            Backend::Mock => return Ok(format!("Mock response based on {}", command)),
            Backend::Closed => return Err(TransportError::Closed),
            Backend::Stream(port) => port,
        };

        if port.in_sync {
            // Drop stale bytes left by a previous exchange (e.g. a trailing "OK" after GETD)
            let stale = port.io.buffer().len();
            if stale > 0 {
                debug!(port = %self.port_name, bytes = stale, "Discarding stale response bytes");
                port.io.consume(stale);
            }
        } else {
            self.resync(&mut port.io).await?;
        }

        port.in_sync = false;
        let framed = format!("{}{}", command, COMMAND_TERMINATOR);
        port.io.get_mut().write_all(framed.as_bytes()).await?;
        port.io.get_mut().flush().await?;
        debug!(port = %self.port_name, command, "Sent command");

        let mut line = String::new();
        match tokio::time::timeout(self.timeout, port.io.read_line(&mut line)).await {
            Ok(Ok(0)) => {
                warn!(port = %self.port_name, command, "Line closed by device");
                return Err(TransportError::NoResponse {
                    command: command.to_string(),
                });
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(port = %self.port_name, command, error = %e, "Serial read failed");
                return Err(TransportError::Io(e));
            }
            Err(_) => {
                warn!(port = %self.port_name, command, timeout = ?self.timeout, "Response timed out");
                return Err(TransportError::NoResponse {
                    command: command.to_string(),
                });
            }
        }
        port.in_sync = true;

        let response = line.trim();
        if response.is_empty() {
            warn!(port = %self.port_name, command, "Empty response");
            return Err(TransportError::NoResponse {
                command: command.to_string(),
            });
        }

        debug!(port = %self.port_name, command, response, "Received response");
        Ok(response.to_string())
    }

    /// Discard input until the line stays quiet for one timeout period.
    async fn resync(&self, io: &mut BufReader<DynSerial>) -> Result<(), TransportError> {
        let mut discarded = 0usize;
        loop {
            let buffered = io.buffer().len();
            if buffered > 0 {
                io.consume(buffered);
                discarded += buffered;
            }
            if discarded > MAX_RESYNC_BYTES {
                warn!(port = %self.port_name, bytes = discarded, "Device keeps talking; line not resynchronised");
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unsolicited data on the line",
                )));
            }

            let filled = match tokio::time::timeout(self.timeout, io.fill_buf()).await {
                Ok(Ok(bytes)) => bytes.len(),
                Ok(Err(e)) => return Err(TransportError::Io(e)),
                Err(_) => 0,
            };
            if filled == 0 {
                break;
            }
        }

        if discarded > 0 {
            warn!(port = %self.port_name, bytes = discarded, "Discarded late response after a failed exchange");
        } else {
            debug!(port = %self.port_name, "Line quiet; resynchronised");
        }
        Ok(())
    }

    /// Release the port. Any later `send` fails with [`TransportError::Closed`].
    pub async fn close(&self) {
        let mut backend = self.backend.lock().await;
        if !matches!(*backend, Backend::Closed) {
            *backend = Backend::Closed;
            debug!(port = %self.port_name, "Command channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn frames_with_carriage_return_and_trims_reply() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = CommandChannel::from_stream("test", device, Duration::from_millis(200));

        let device_side = tokio::spawn(async move {
            let mut buf = vec![0u8; 32];
            let n = host.read(&mut buf).await.unwrap();
            host.write_all(b"OK\r\n").await.unwrap();
            (String::from_utf8_lossy(&buf[..n]).to_string(), host)
        });

        let reply = channel.send("GOUT").await.unwrap();
        let (sent, _host) = device_side.await.unwrap();
        assert_eq!(sent, "GOUT\r");
        assert_eq!(reply, "OK");
    }

    #[tokio::test]
    async fn silence_is_no_response() {
        let (_host, device) = tokio::io::duplex(64);
        let channel = CommandChannel::from_stream("test", device, Duration::from_millis(20));

        let err = channel.send("GETD").await.unwrap_err();
        assert!(matches!(err, TransportError::NoResponse { ref command } if command == "GETD"));
    }

    #[tokio::test]
    async fn blank_line_is_no_response() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = CommandChannel::from_stream("test", device, Duration::from_millis(200));
        host.write_all(b"\r\n").await.unwrap();

        assert!(matches!(
            channel.send("GOUT").await,
            Err(TransportError::NoResponse { .. })
        ));
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_next_answer() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = CommandChannel::from_stream("test", device, Duration::from_millis(50));

        let device_side = tokio::spawn(async move {
            let mut buf = vec![0u8; 32];
            host.read(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(80)).await;
            host.write_all(b"OK\r\n").await.unwrap();
            // Answer nothing else
            let n = host.read(&mut buf).await.unwrap();
            (String::from_utf8_lossy(&buf[..n]).to_string(), host)
        });

        assert!(matches!(
            channel.send("SOUT1").await,
            Err(TransportError::NoResponse { .. })
        ));
        let err = channel.send("VOLT 10500").await.unwrap_err();
        assert!(matches!(err, TransportError::NoResponse { ref command } if command == "VOLT 10500"));

        let (second, _host) = device_side.await.unwrap();
        assert_eq!(second, "VOLT 10500\r");
    }

    #[tokio::test]
    async fn resyncs_after_timeout_then_works() {
        let (mut host, device) = tokio::io::duplex(64);
        let channel = CommandChannel::from_stream("test", device, Duration::from_millis(50));

        let device_side = tokio::spawn(async move {
            let mut buf = vec![0u8; 32];
            host.read(&mut buf).await.unwrap();
            tokio::time::sleep(Duration::from_millis(70)).await;
            host.write_all(b"OK\r\n").await.unwrap();
            host.read(&mut buf).await.unwrap();
            host.write_all(b"1\r\n").await.unwrap();
            host
        });

        assert!(channel.send("SOUT1").await.is_err());
        assert_eq!(channel.send("GOUT").await.unwrap(), "1");
        let _host = device_side.await.unwrap();
    }

    #[tokio::test]
    async fn mock_embeds_command() {
        let channel = CommandChannel::mock("COM9");
        assert!(channel.is_mock().await);
        assert_eq!(
            channel.send("SOUT1").await.unwrap(),
            "Mock response based on SOUT1"
        );
    }

    #[tokio::test]
    async fn closed_channel_rejects_sends() {
        let channel = CommandChannel::mock("COM9");
        channel.close().await;
        assert!(channel.is_closed().await);
        assert!(matches!(
            channel.send("GOUT").await,
            Err(TransportError::Closed)
        ));
    }
}
