//! # Error Types
//!
//! Error types for the whole bridge, from the MQTT session layer up to the
//! command-routing boundary. The split mirrors how failures are recovered:
//! transport and protocol errors drive the connection backoff, command and
//! config errors are logged and dropped at their boundary, and modem errors
//! only decide whether the optional poll task is scheduled at all.

use crate::transport;

/// A placeholder error type used in generic contexts where the specific transport
/// error is not yet known, e.g. in packet encode/decode helpers that return a
/// `Result` compatible with the client's error type.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorPlaceHolder;

impl transport::TransportError for ErrorPlaceHolder {}

/// The primary error enum for the MQTT session layer.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying network transport.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
    /// An operation timed out.
    Timeout,
}

/// Allows the `?` operator to lift transport errors into `MqttError`.
impl<T: transport::TransportError> From<T> for MqttError<T> {
    fn from(err: T) -> Self {
        MqttError::Transport(err)
    }
}

impl<T: transport::TransportError> MqttError<T> {
    /// Converts an `MqttError` carrying a placeholder transport error into one
    /// carrying the concrete transport error type `T`.
    ///
    /// Packet codec functions cannot know the client's transport type, so they
    /// report `ErrorPlaceHolder`; this bridges their results into the client's
    /// `Result`. Codec logic never produces a `Transport` variant, which is
    /// mapped to a protocol error rather than panicking.
    pub fn cast_transport_error<E: transport::TransportError>(other: MqttError<E>) -> MqttError<T> {
        match other {
            MqttError::Protocol(p) => MqttError::Protocol(p),
            MqttError::ConnectionRefused(c) => MqttError::ConnectionRefused(c),
            MqttError::NotConnected => MqttError::NotConnected,
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
            MqttError::Timeout => MqttError::Timeout,
            MqttError::Transport(_) => MqttError::Protocol(ProtocolError::InvalidResponse),
        }
    }
}

/// Represents the reason codes for a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified error occurred.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an invalid or unexpected response.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
}

/// Why an inbound command was dropped at the routing boundary.
///
/// These never propagate past the router: the message is logged and
/// discarded, and the connection stays up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// The command names a status key the target subsystem does not have.
    UnknownKey,
    /// The payload could not be parsed into a value for the addressed key.
    InvalidValue,
}

/// A failure while building the bridge configuration from the credential store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The credential store has no value for the named key.
    MissingCredential(&'static str),
    /// A stored value does not fit the fixed-capacity config field.
    ValueTooLong(&'static str),
}

/// A failure while bringing up the optional cellular modem.
///
/// Reported once at startup; the modem poll task is simply not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModemError {
    /// No modem hardware was detected.
    Absent,
    /// The modem was detected but its setup sequence failed.
    SetupFailed,
}
