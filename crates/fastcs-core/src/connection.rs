//! Line-based device connections.
//!
//! [`Connection`] is the seam attribute IOs use to talk to a device: a command
//! is written without expecting a reply, a query is written and one reply line
//! is read back. Exchanges on one connection are serialized by an async mutex,
//! so concurrent periodic tasks never interleave their requests.
//!
//! A query that times out leaves its reply in flight, so the stream is
//! poisoned: every later exchange fails with `Disconnected`. `IpConnection`
//! and `SerialConnection` reopen a poisoned link on the next exchange.
//!
//! # Types
//!
//! - [`StreamConnection`]: any `AsyncRead + AsyncWrite` stream (TCP, serial,
//!   `tokio::io::duplex` in tests)
//! - [`IpConnection`]: TCP client with explicit `connect` / `close`
//! - `SerialConnection`: serial port client (requires the `serial` feature)

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{FastCsError, Result};
use crate::tracer::{Traced, Tracer};

/// Request/response exchange with a device.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write `message` without waiting for a reply.
    async fn send_command(&self, message: &str) -> Result<()>;

    /// Write `message` and return the reply line, terminator included.
    async fn send_query(&self, message: &str) -> Result<String>;
}

/// Stream usable as a device link.
///
/// Blanket-implemented for anything `AsyncRead + AsyncWrite + Unpin + Send`.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Type-erased device stream.
pub type DynStream = Box<dyn DeviceStream>;

/// Connection over a byte stream with newline-terminated replies.
pub struct StreamConnection {
    port: Mutex<BufReader<DynStream>>,
    response_timeout: Option<Duration>,
    poisoned: AtomicBool,
    tracer: Arc<Tracer>,
}

impl StreamConnection {
    /// Wrap `stream` with no response timeout.
    pub fn new(stream: impl DeviceStream + 'static) -> Self {
        Self::from_boxed(Box::new(stream))
    }

    pub fn from_boxed(stream: DynStream) -> Self {
        Self {
            port: Mutex::new(BufReader::new(stream)),
            response_timeout: None,
            poisoned: AtomicBool::new(false),
            tracer: Arc::new(Tracer::new("connection")),
        }
    }

    /// Fail queries whose reply takes longer than `timeout`.
    pub fn with_response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Share `tracer` with the owner of this stream.
    pub fn with_tracer(mut self, tracer: Arc<Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Whether a timed-out query has made the stream unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_poisoned() {
            return Err(FastCsError::Disconnected(
                "stream abandoned after a response timeout".into(),
            ));
        }
        Ok(())
    }
}

impl Traced for StreamConnection {
    fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

#[async_trait]
impl Connection for StreamConnection {
    async fn send_command(&self, message: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        self.check_usable()?;
        port.get_mut().write_all(message.as_bytes()).await?;
        port.get_mut().flush().await?;
        self.tracer
            .log_event("Send command", &[("command", &message.trim_end())]);
        Ok(())
    }

    async fn send_query(&self, message: &str) -> Result<String> {
        let mut port = self.port.lock().await;
        self.check_usable()?;
        port.get_mut().write_all(message.as_bytes()).await?;
        port.get_mut().flush().await?;

        let mut response = String::new();
        let read = port.read_line(&mut response);
        let n = match self.response_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, read).await {
                Ok(read) => read?,
                Err(_) => {
                    // The late reply would be read by the next query
                    self.poisoned.store(true, Ordering::SeqCst);
                    tracing::warn!(query = %message.trim_end(), ?timeout, "Device reply timed out, abandoning stream");
                    return Err(FastCsError::DeviceCommunication(format!(
                        "no response to {:?} within {timeout:?}",
                        message.trim_end()
                    )));
                }
            },
            None => read.await?,
        };
        if n == 0 {
            return Err(FastCsError::Disconnected(
                "device closed the connection".into(),
            ));
        }
        self.tracer.log_event(
            "Query",
            &[
                ("query", &message.trim_end()),
                ("response", &response.trim_end()),
            ],
        );
        Ok(response)
    }
}

// =============================================================================
// TCP
// =============================================================================

/// Address and timing of a TCP device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConnectionSettings {
    /// Host name or address
    pub ip: String,
    /// TCP port
    pub port: u16,
    /// Per-query reply deadline, `None` waits indefinitely
    pub response_timeout: Option<Duration>,
}

impl IpConnectionSettings {
    /// Settings without a response timeout.
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            response_timeout: None,
        }
    }

    /// `ip:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// TCP connection opened by `connect` and released by `close`.
pub struct IpConnection {
    settings: IpConnectionSettings,
    stream: SyncMutex<Option<Arc<StreamConnection>>>,
    tracer: Arc<Tracer>,
}

impl IpConnection {
    /// Unconnected client; call `connect` before the first exchange.
    pub fn new(settings: IpConnectionSettings) -> Self {
        Self {
            settings,
            stream: SyncMutex::new(None),
            tracer: Arc::new(Tracer::new("connection")),
        }
    }

    pub fn settings(&self) -> &IpConnectionSettings {
        &self.settings
    }

    /// Open the TCP stream, replacing any previous one.
    pub async fn connect(&self) -> Result<()> {
        let address = self.settings.address();
        let connecting = TcpStream::connect(&address);
        let stream = match self.settings.response_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting).await.map_err(|_| {
                FastCsError::DeviceCommunication(format!(
                    "timed out connecting to {address} after {timeout:?}"
                ))
            })??,
            None => connecting.await?,
        };
        stream.set_nodelay(true)?;
        tracing::info!(%address, "Connected to device");

        let connection = StreamConnection::new(stream)
            .with_response_timeout(self.settings.response_timeout)
            .with_tracer(self.tracer.clone());
        *self.stream.lock() = Some(Arc::new(connection));
        Ok(())
    }

    /// Drop the stream. Later exchanges fail with `Disconnected`.
    pub async fn close(&self) -> Result<()> {
        if self.stream.lock().take().is_some() {
            tracing::info!(address = %self.settings.address(), "Closed device connection");
        }
        Ok(())
    }

    /// Whether a stream is open.
    pub fn is_connected(&self) -> bool {
        self.stream.lock().is_some()
    }

    /// Open stream, reconnecting first if the last one was poisoned.
    async fn current(&self) -> Result<Arc<StreamConnection>> {
        let stream = self
            .stream
            .lock()
            .clone()
            .ok_or_else(|| FastCsError::Disconnected(self.settings.address()))?;
        if !stream.is_poisoned() {
            return Ok(stream);
        }
        tracing::info!(address = %self.settings.address(), "Reconnecting after response timeout");
        self.connect().await?;
        self.stream
            .lock()
            .clone()
            .ok_or_else(|| FastCsError::Disconnected(self.settings.address()))
    }
}

impl Traced for IpConnection {
    fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

#[async_trait]
impl Connection for IpConnection {
    async fn send_command(&self, message: &str) -> Result<()> {
        self.current().await?.send_command(message).await
    }

    async fn send_query(&self, message: &str) -> Result<String> {
        self.current().await?.send_query(message).await
    }
}

// =============================================================================
// Serial
// =============================================================================

#[cfg(feature = "serial")]
pub use serial::{SerialConnection, SerialConnectionSettings};

#[cfg(feature = "serial")]
mod serial {
    use super::*;
    use tokio_serial::SerialPortBuilderExt;

    /// Port and line settings of a serial device (8N1, no flow control).
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SerialConnectionSettings {
        /// Device path, e.g. `/dev/ttyUSB0`
        pub port: String,
        /// Line speed
        pub baud_rate: u32,
        /// Per-query reply deadline, `None` waits indefinitely
        pub response_timeout: Option<Duration>,
    }

    /// Serial connection opened by `connect` and released by `close`.
    pub struct SerialConnection {
        settings: SerialConnectionSettings,
        stream: SyncMutex<Option<Arc<StreamConnection>>>,
        tracer: Arc<Tracer>,
    }

    impl SerialConnection {
        /// Unopened port; call `connect` before the first exchange.
        pub fn new(settings: SerialConnectionSettings) -> Self {
            Self {
                settings,
                stream: SyncMutex::new(None),
                tracer: Arc::new(Tracer::new("connection")),
            }
        }

        /// Open the port on the blocking pool.
        pub async fn connect(&self) -> Result<()> {
            let port_path = self.settings.port.clone();
            let baud_rate = self.settings.baud_rate;
            let stream = tokio::task::spawn_blocking(move || {
                tokio_serial::new(&port_path, baud_rate)
                    .data_bits(tokio_serial::DataBits::Eight)
                    .parity(tokio_serial::Parity::None)
                    .stop_bits(tokio_serial::StopBits::One)
                    .flow_control(tokio_serial::FlowControl::None)
                    .open_native_async()
            })
            .await
            .map_err(|e| FastCsError::DeviceCommunication(format!("serial open task failed: {e}")))?
            .map_err(|e| {
                FastCsError::DeviceCommunication(format!(
                    "failed to open serial port {}: {e}",
                    self.settings.port
                ))
            })?;
            tracing::info!(port = %self.settings.port, baud_rate, "Opened serial port");

            let connection = StreamConnection::new(stream)
                .with_response_timeout(self.settings.response_timeout)
                .with_tracer(self.tracer.clone());
            *self.stream.lock() = Some(Arc::new(connection));
            Ok(())
        }

        pub async fn close(&self) -> Result<()> {
            self.stream.lock().take();
            Ok(())
        }

        async fn current(&self) -> Result<Arc<StreamConnection>> {
            let stream = self
                .stream
                .lock()
                .clone()
                .ok_or_else(|| FastCsError::Disconnected(self.settings.port.clone()))?;
            if !stream.is_poisoned() {
                return Ok(stream);
            }
            self.connect().await?;
            self.stream
                .lock()
                .clone()
                .ok_or_else(|| FastCsError::Disconnected(self.settings.port.clone()))
        }
    }

    impl Traced for SerialConnection {
        fn tracer(&self) -> &Tracer {
            &self.tracer
        }
    }

    #[async_trait]
    impl Connection for SerialConnection {
        async fn send_command(&self, message: &str) -> Result<()> {
            self.current().await?.send_command(message).await
        }

        async fn send_query(&self, message: &str) -> Result<String> {
            self.current().await?.send_query(message).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tracing_test::traced_test;

    /// Replies to `T?` only after `delay`, to `P?` immediately.
    async fn slow_temperature_device(stream: impl DeviceStream, delay: Duration) {
        let mut device = BufReader::new(stream);
        let mut line = String::new();
        while matches!(device.read_line(&mut line).await, Ok(n) if n > 0) {
            let reply: &[u8] = match line.trim_end() {
                "T?" => {
                    tokio::time::sleep(delay).await;
                    b"TEMP_REPLY\r\n"
                }
                "P?" => b"POWER_REPLY\r\n",
                _ => b"ERR\r\n",
            };
            if device.get_mut().write_all(reply).await.is_err() {
                break;
            }
            line.clear();
        }
    }

    #[tokio::test]
    async fn query_over_duplex() {
        let (host, device) = tokio::io::duplex(64);
        let connection = StreamConnection::new(host);

        let responder = tokio::spawn(async move {
            let mut device = BufReader::new(device);
            let mut line = String::new();
            device.read_line(&mut line).await.unwrap();
            assert_eq!(line, "T?\r\n");
            device.get_mut().write_all(b"23.50\r\n").await.unwrap();
        });

        let response = connection.send_query("T?\r\n").await.unwrap();
        assert_eq!(response, "23.50\r\n");
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out() {
        let (host, _device) = tokio::io::duplex(64);
        let connection =
            StreamConnection::new(host).with_response_timeout(Some(Duration::from_millis(100)));
        let err = connection.send_query("T?\r\n").await.unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));
        assert!(err.is_recoverable());
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_never_returned_to_next_query() {
        let (host, device) = tokio::io::duplex(64);
        tokio::spawn(slow_temperature_device(device, Duration::from_millis(100)));
        let connection =
            StreamConnection::new(host).with_response_timeout(Some(Duration::from_millis(50)));

        let err = connection.send_query("T?\r\n").await.unwrap_err();
        assert!(matches!(err, FastCsError::DeviceCommunication(_)));
        assert!(connection.is_poisoned());

        // Give the device time to write the stale reply
        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = connection.send_query("P?\r\n").await.unwrap_err();
        assert!(matches!(err, FastCsError::Disconnected(_)));
        assert!(matches!(
            connection.send_command("X=1\r\n").await,
            Err(FastCsError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn ip_connection_reopens_after_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(slow_temperature_device(socket, Duration::from_millis(200)));
            }
        });

        let mut settings = IpConnectionSettings::new("127.0.0.1", port);
        settings.response_timeout = Some(Duration::from_millis(50));
        let connection = IpConnection::new(settings);
        connection.connect().await.unwrap();

        assert!(matches!(
            connection.send_query("T?\r\n").await,
            Err(FastCsError::DeviceCommunication(_))
        ));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(
            connection.send_query("P?\r\n").await.unwrap(),
            "POWER_REPLY\r\n"
        );
        assert!(connection.is_connected());
    }

    #[traced_test]
    #[tokio::test]
    async fn traced_queries_respect_filters() {
        let (host, device) = tokio::io::duplex(64);
        tokio::spawn(slow_temperature_device(device, Duration::ZERO));
        let connection = StreamConnection::new(host);

        connection.send_query("P?\r\n").await.unwrap();
        assert!(!logs_contain("POWER_REPLY"));

        connection.enable_tracing();
        connection.add_tracing_filter("query", "T?");
        connection.send_query("P?\r\n").await.unwrap();
        connection.send_query("T?\r\n").await.unwrap();
        assert!(!logs_contain("POWER_REPLY"));
        assert!(logs_contain("response=TEMP_REPLY"));

        connection.remove_tracing_filter("query", "T?");
        connection.send_query("P?\r\n").await.unwrap();
        assert!(logs_contain("response=POWER_REPLY"));

        connection.disable_tracing();
        connection.send_command("Q\r\n").await.unwrap();
        assert!(!logs_contain("command=Q"));
    }

    #[tokio::test]
    async fn closed_device_is_disconnected() {
        let (host, device) = tokio::io::duplex(64);
        let connection = StreamConnection::new(host);
        drop(device);
        let err = connection.send_query("T?\r\n").await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn ip_connection_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            while socket.read_line(&mut line).await.unwrap() > 0 {
                let reply = format!("echo {}", line);
                socket.get_mut().write_all(reply.as_bytes()).await.unwrap();
                line.clear();
            }
        });

        let connection = IpConnection::new(IpConnectionSettings::new("127.0.0.1", port));
        assert!(matches!(
            connection.send_query("X?\n").await,
            Err(FastCsError::Disconnected(_))
        ));

        connection.connect().await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.send_query("X?\n").await.unwrap(), "echo X?\n");

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
    }
}
