//! # MQTT Transport Abstraction
//!
//! The `MqttTransport` trait abstracts the communication channel under the
//! session layer, so the client can run over any reliable, ordered byte
//! stream. A TCP implementation over `embassy-net` is provided.
//!
//! With the Rust 2024 Edition, the trait uses native `async fn`, removing
//! the need for the `#[async_trait]` macro.

use embassy_net::IpEndpoint;
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

/// A trait representing a transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: TransportError;

    /// (Re-)establishes the byte stream.
    ///
    /// The session layer calls this before every CONNECT, so a transport
    /// over a dead stream can recover without outside help. Transports
    /// whose stream is managed externally keep the no-op default.
    async fn reset(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read. Implementations bound the wait and
    /// report expiry through [`TransportError::is_timeout`], which the
    /// session layer treats as "no data yet" rather than a failure.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// A trait for transport-related errors.
pub trait TransportError: core::fmt::Debug {
    /// Whether this error only signals that a bounded read expired.
    fn is_timeout(&self) -> bool {
        false
    }
}

/// Errors produced by [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpTransportError {
    /// A socket-level error.
    Tcp(TcpError),
    /// The TCP connection could not be established.
    Connect(ConnectError),
    /// The peer closed the connection.
    Closed,
    /// The bounded read expired without data.
    Timeout,
}

impl TransportError for TcpTransportError {
    fn is_timeout(&self) -> bool {
        matches!(self, TcpTransportError::Timeout)
    }
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    endpoint: IpEndpoint,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` over an unconnected socket. The stream
    /// is established by [`MqttTransport::reset`] before the first use.
    pub fn new(socket: TcpSocket<'a>, endpoint: impl Into<IpEndpoint>, timeout: Duration) -> Self {
        Self {
            socket,
            endpoint: endpoint.into(),
            timeout,
        }
    }

    /// A helper function to perform a read with a timeout.
    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, TcpTransportError> {
        // Race the read operation against a timer.
        let read_fut = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        match futures::future::select(core::pin::pin!(read_fut), core::pin::pin!(timer)).await {
            futures::future::Either::Left((Ok(n), _)) => {
                if n == 0 {
                    // If the peer closes the connection, read returns 0.
                    Err(TcpTransportError::Closed)
                } else {
                    Ok(n)
                }
            }
            futures::future::Either::Left((Err(e), _)) => Err(TcpTransportError::Tcp(e)),
            futures::future::Either::Right(((), _)) => Err(TcpTransportError::Timeout),
        }
    }
}

impl<'a> MqttTransport for TcpTransport<'a> {
    type Error = TcpTransportError;

    async fn reset(&mut self) -> Result<(), Self::Error> {
        self.socket.abort();
        // Completes the abort handshake so the socket can be reused.
        let _ = self.socket.flush().await;
        self.socket
            .connect(self.endpoint)
            .await
            .map_err(TcpTransportError::Connect)
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.socket
            .write_all(buf)
            .await
            .map_err(TcpTransportError::Tcp)?;

        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpTransportError::Tcp)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }
}
