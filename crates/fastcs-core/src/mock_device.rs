//! Scripted devices for tests.
//!
//! Two levels of fake are provided:
//!
//! - [`MockDevicePort`] / [`MockDeviceHarness`]: a byte-level stream pair. The
//!   port implements `AsyncRead + AsyncWrite` and goes into a
//!   [`StreamConnection`](crate::connection::StreamConnection); the harness
//!   stays in the test to assert on writes and script replies.
//! - [`FakeConnection`]: a message-level [`Connection`] answering queries from
//!   a table. Commands of the form `NAME=value` are echoed back on the next
//!   `NAME?` query, which is enough to round-trip puts and updates.
//!
//! # Example
//!
//! ```rust,ignore
//! let (port, mut harness) = mock_device::pair();
//! let connection = StreamConnection::new(port);
//!
//! let app = tokio::spawn(async move { connection.send_query("T?\r\n").await });
//! harness.expect_and_respond(b"T?\r\n", b"23.50\r\n").await;
//! assert_eq!(app.await??, "23.50\r\n");
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::connection::Connection;
use crate::error::{FastCsError, Result};

/// Application side of the mock stream.
#[derive(Debug)]
pub struct MockDevicePort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Bytes received from the harness but not yet read
    read_buffer: VecDeque<u8>,
}

/// Test side of the mock stream.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    /// Bytes written by the application but not yet asserted
    write_buffer: Vec<u8>,
}

/// Create a connected port/harness pair.
pub fn pair() -> (MockDevicePort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    (
        MockDevicePort {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        MockDeviceHarness {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

impl MockDevicePort {
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockDevicePort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }
        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.drain_into(buf);
                Poll::Ready(Ok(()))
            }
            // Harness dropped: end of file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockDevicePort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Send bytes for the application to read.
    ///
    /// # Errors
    ///
    /// `Disconnected` if the port was dropped.
    pub fn send_response(&self, data: &[u8]) -> Result<()> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| FastCsError::Disconnected("mock device port dropped".into()))
    }

    /// Wait for the application to write exactly `expected` next.
    ///
    /// # Panics
    ///
    /// If nothing arrives within 2 seconds, the port is dropped, or the
    /// written bytes differ.
    #[allow(clippy::panic)]
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let deadline = Duration::from_secs(2);
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(deadline, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("mock device port closed while expecting a write"),
                Err(_) => panic!(
                    "timed out waiting for write {:?}, received {:?}",
                    String::from_utf8_lossy(expected),
                    String::from_utf8_lossy(&self.write_buffer)
                ),
            }
        }
        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "expected write {:?}, got {:?}",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );
        self.write_buffer.drain(..expected.len());
    }

    /// [`expect_write`](Self::expect_write) followed by
    /// [`send_response`](Self::send_response).
    #[allow(clippy::expect_used)]
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        self.send_response(response)
            .expect("mock device port dropped before response");
    }
}

// =============================================================================
// FakeConnection
// =============================================================================

#[derive(Default)]
struct FakeState {
    responses: HashMap<String, String>,
    sent: Vec<String>,
    failing: bool,
}

/// Table-driven [`Connection`] for controller tests.
#[derive(Default)]
pub struct FakeConnection {
    state: Mutex<FakeState>,
}

impl FakeConnection {
    /// Device with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `query` (terminator stripped) with `response`.
    pub fn with_response(self, query: &str, response: &str) -> Self {
        self.set_response(query, response);
        self
    }

    /// Replace the response to `query`.
    pub fn set_response(&self, query: &str, response: &str) {
        self.state
            .lock()
            .responses
            .insert(query.trim_end().to_string(), response.to_string());
    }

    /// Make every exchange fail with `DeviceCommunication` while set.
    pub fn set_failing(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// Every message received so far, terminators stripped.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Number of times `message` was received.
    pub fn count(&self, message: &str) -> usize {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|m| m.as_str() == message)
            .count()
    }

    fn record(&self, message: &str) -> Result<String> {
        let mut state = self.state.lock();
        let message = message.trim_end().to_string();
        state.sent.push(message.clone());
        if state.failing {
            return Err(FastCsError::DeviceCommunication(format!(
                "fake device failing on {message:?}"
            )));
        }
        Ok(message)
    }
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send_command(&self, message: &str) -> Result<()> {
        let message = self.record(message)?;
        if let Some((name, value)) = message.split_once('=') {
            self.set_response(&format!("{name}?"), &format!("{value}\r\n"));
        }
        Ok(())
    }

    async fn send_query(&self, message: &str) -> Result<String> {
        let message = self.record(message)?;
        self.state
            .lock()
            .responses
            .get(&message)
            .cloned()
            .ok_or_else(|| {
                FastCsError::DeviceCommunication(format!("no response scripted for {message:?}"))
            })
    }
}
