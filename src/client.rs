//! # MQTT Session Client
//!
//! A compact MQTT 3.1.1 client over an [`MqttTransport`]. It covers exactly
//! the session surface the bridge needs: CONNECT with last will and
//! credentials, QoS 0/1 publishing, subscription, keepalive pings and a
//! polled receive path that hands inbound publishes to the caller as owned
//! messages.
//!
//! The client never retries on its own. Connection establishment and
//! re-subscription policy live in the connection manager; a transport
//! failure here just marks the session dead and surfaces the error.

use embassy_time::{Duration, Instant};
use heapless::{Deque, String, Vec};

use crate::error::{ConnectReasonCode, MqttError, ProtocolError};
use crate::packet::{
    self, Connect, Disconnect, EncodePacket, LastWill, MqttPacket, PingReq, PubAck, QoS, Subscribe,
};
use crate::transport::{MqttTransport, TransportError};
use crate::util;

/// Maximum length of a topic string handled by the session layer.
pub const MAX_TOPIC_LEN: usize = 128;

/// Maximum inbound payload the client will buffer. Inbound traffic is
/// command scalars, so this is deliberately small.
pub const MAX_INBOUND_PAYLOAD: usize = 64;

/// How many packets the client will read through while waiting for an ack
/// before giving up.
const ACK_WAIT_ROUNDS: usize = 8;

/// Inbound publishes that arrive while waiting for an ack are parked here
/// and drained by the next `poll` calls.
const INBOX_DEPTH: usize = 4;

/// Session parameters supplied once at client construction.
#[derive(Debug, Clone, Copy)]
pub struct MqttOptions<'a> {
    pub client_id: &'a str,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub last_will: Option<LastWill<'a>>,
}

impl<'a> MqttOptions<'a> {
    /// Creates options with a clean session and a 90 second keepalive.
    pub fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            keep_alive: 90,
            clean_session: true,
            username: None,
            password: None,
            last_will: None,
        }
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    pub fn with_credentials(mut self, username: &'a str, password: &'a str) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    /// Registers the last will. Must be set before `connect`; the broker
    /// publishes it on our behalf if the session drops uncleanly.
    pub fn with_last_will(mut self, will: LastWill<'a>) -> Self {
        self.last_will = Some(will);
        self
    }
}

/// An inbound publish copied out of the receive buffer.
#[derive(Debug, Clone)]
pub struct InboundPublish {
    pub topic: String<MAX_TOPIC_LEN>,
    pub payload: Vec<u8, MAX_INBOUND_PAYLOAD>,
    pub qos: QoS,
}

/// Events surfaced by [`MqttClient::poll`].
#[derive(Debug)]
pub enum MqttEvent {
    /// A message arrived on a subscribed topic.
    Publish(InboundPublish),
}

/// An MQTT 3.1.1 client over a generic transport.
///
/// `BUF_SIZE` bounds both the encode and the receive buffer and therefore
/// the largest packet in either direction.
pub struct MqttClient<'a, T: MqttTransport, const BUF_SIZE: usize> {
    transport: T,
    options: MqttOptions<'a>,
    connected: bool,
    next_packet_id: u16,
    last_tx: Instant,
    tx_buf: [u8; BUF_SIZE],
    rx_buf: [u8; BUF_SIZE],
    rx_len: usize,
    inbox: Deque<InboundPublish, INBOX_DEPTH>,
}

impl<'a, T: MqttTransport, const BUF_SIZE: usize> MqttClient<'a, T, BUF_SIZE> {
    /// Creates a new client. No I/O happens until `connect`.
    pub fn new(transport: T, options: MqttOptions<'a>) -> Self {
        Self {
            transport,
            options,
            connected: false,
            next_packet_id: 0,
            last_tx: Instant::now(),
            tx_buf: [0; BUF_SIZE],
            rx_buf: [0; BUF_SIZE],
            rx_len: 0,
            inbox: Deque::new(),
        }
    }

    /// Whether the last CONNECT succeeded and no transport error has been
    /// seen since.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Re-establishes the byte stream and performs the CONNECT handshake,
    /// so every reconnect attempt starts from a fresh transport.
    pub async fn connect(&mut self) -> Result<(), MqttError<T::Error>> {
        self.connected = false;
        self.transport.reset().await?;
        self.rx_len = 0;
        self.inbox.clear();

        let connect = Connect {
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            client_id: self.options.client_id,
            username: self.options.username,
            password: self.options.password,
            last_will: self.options.last_will,
        };
        self.send_packet(&connect).await?;

        let total = self.read_packet().await?;
        let reason_code = {
            let decoded = packet::decode(&self.rx_buf[..total])
                .map_err(MqttError::cast_transport_error)?;
            match decoded {
                Some(MqttPacket::ConnAck(ack)) => ack.reason_code,
                _ => return Err(MqttError::Protocol(ProtocolError::InvalidResponse)),
            }
        };
        self.consume(total);

        match ConnectReasonCode::from(reason_code) {
            ConnectReasonCode::Success => {
                self.connected = true;
                Ok(())
            }
            refused => Err(MqttError::ConnectionRefused(refused)),
        }
    }

    /// Sends DISCONNECT and marks the session closed. Best effort: a send
    /// failure still leaves the client disconnected.
    pub async fn disconnect(&mut self) {
        let _ = self.send_packet(&Disconnect).await;
        self.connected = false;
    }

    /// Publishes a message. QoS 1 waits for the matching PUBACK.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }

        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(self.take_packet_id())
        };
        let publish = packet::Publish {
            topic,
            qos,
            retain,
            payload,
            packet_id,
        };
        self.send_packet(&publish).await?;

        if let Some(id) = packet_id {
            self.wait_for_puback(id).await?;
        }
        Ok(())
    }

    /// Subscribes to a topic filter and waits for the SUBACK.
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }

        let packet_id = self.take_packet_id();
        self.send_packet(&Subscribe::new(packet_id, topic, qos))
            .await?;

        for _ in 0..ACK_WAIT_ROUNDS {
            let total = match self.read_packet().await {
                Ok(n) => n,
                Err(MqttError::Timeout) => continue,
                Err(e) => return Err(e),
            };
            let (stash, ack_id, granted) = {
                let decoded = packet::decode(&self.rx_buf[..total])
                    .map_err(MqttError::cast_transport_error)?;
                match decoded {
                    Some(MqttPacket::SubAck(ack)) if ack.packet_id == packet_id => {
                        let ok = ack.reason_codes.iter().all(|code| *code < 0x80);
                        (None, None, Some(ok))
                    }
                    Some(MqttPacket::Publish(publish)) => (
                        Self::to_owned_publish(&publish),
                        Self::inbound_ack_id(&publish),
                        None,
                    ),
                    _ => (None, None, None),
                }
            };
            self.consume(total);
            self.stash_inbound(stash, ack_id).await?;
            match granted {
                Some(true) => return Ok(()),
                Some(false) => return Err(MqttError::Protocol(ProtocolError::InvalidResponse)),
                None => {}
            }
        }
        Err(MqttError::Timeout)
    }

    /// Processes one inbound packet, sending a keepalive ping first when the
    /// session has been idle for half the keepalive window.
    ///
    /// Returns `Ok(None)` when the bounded read expired without traffic, so
    /// callers can interleave polling with other work.
    pub async fn poll(&mut self) -> Result<Option<MqttEvent>, MqttError<T::Error>> {
        if let Some(msg) = self.inbox.pop_front() {
            return Ok(Some(MqttEvent::Publish(msg)));
        }
        if !self.connected {
            return Err(MqttError::NotConnected);
        }

        if self.options.keep_alive > 0 {
            let idle_limit = Duration::from_secs(u64::from(self.options.keep_alive) / 2);
            if self.last_tx.elapsed() >= idle_limit {
                self.send_packet(&PingReq).await?;
            }
        }

        let total = match self.read_packet().await {
            Ok(n) => n,
            Err(MqttError::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        };

        let (event, ack_id) = {
            let decoded =
                packet::decode(&self.rx_buf[..total]).map_err(MqttError::cast_transport_error)?;
            match decoded {
                Some(MqttPacket::Publish(publish)) => (
                    Self::to_owned_publish(&publish),
                    Self::inbound_ack_id(&publish),
                ),
                // Acks outside a wait loop and ping responses carry no event.
                _ => (None, None),
            }
        };
        self.consume(total);

        // Park the message before the ack send suspends: a caller may
        // drop this future from a select arm, and a packet consumed from
        // the receive buffer must survive that.
        if let Some(msg) = event {
            self.push_inbox(msg);
        }
        if let Some(packet_id) = ack_id {
            self.send_packet(&PubAck { packet_id }).await?;
        }
        Ok(self.inbox.pop_front().map(MqttEvent::Publish))
    }

    fn take_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        self.next_packet_id
    }

    fn to_owned_publish(publish: &packet::Publish<'_>) -> Option<InboundPublish> {
        let mut topic = String::new();
        if topic.push_str(publish.topic).is_err() {
            log::warn!("mqtt: dropping inbound message, topic too long");
            return None;
        }
        let mut payload = Vec::new();
        if payload.extend_from_slice(publish.payload).is_err() {
            log::warn!(
                "mqtt: dropping inbound message on {}, payload too large",
                publish.topic
            );
            return None;
        }
        Some(InboundPublish {
            topic,
            payload,
            qos: publish.qos,
        })
    }

    /// Parks an inbound publish that arrived while waiting for an ack and
    /// acknowledges it if required. The oldest parked message is dropped
    /// when the inbox is full.
    async fn stash_inbound(
        &mut self,
        msg: Option<InboundPublish>,
        ack_id: Option<u16>,
    ) -> Result<(), MqttError<T::Error>> {
        if let Some(msg) = msg {
            self.push_inbox(msg);
        }
        if let Some(packet_id) = ack_id {
            self.send_packet(&PubAck { packet_id }).await?;
        }
        Ok(())
    }

    fn push_inbox(&mut self, msg: InboundPublish) {
        if self.inbox.is_full() {
            log::warn!("mqtt: inbound inbox full, dropping oldest message");
            let _ = self.inbox.pop_front();
        }
        let _ = self.inbox.push_back(msg);
    }

    fn inbound_ack_id(publish: &packet::Publish<'_>) -> Option<u16> {
        if publish.qos == QoS::AtMostOnce {
            None
        } else {
            publish.packet_id
        }
    }

    async fn wait_for_puback(&mut self, packet_id: u16) -> Result<(), MqttError<T::Error>> {
        for _ in 0..ACK_WAIT_ROUNDS {
            let total = match self.read_packet().await {
                Ok(n) => n,
                Err(MqttError::Timeout) => continue,
                Err(e) => return Err(e),
            };
            let (stash, ack_id, acked) = {
                let decoded = packet::decode(&self.rx_buf[..total])
                    .map_err(MqttError::cast_transport_error)?;
                match decoded {
                    Some(MqttPacket::PubAck(ack)) => (None, None, ack.packet_id == packet_id),
                    Some(MqttPacket::Publish(publish)) => (
                        Self::to_owned_publish(&publish),
                        Self::inbound_ack_id(&publish),
                        false,
                    ),
                    _ => (None, None, false),
                }
            };
            self.consume(total);
            self.stash_inbound(stash, ack_id).await?;
            if acked {
                return Ok(());
            }
        }
        Err(MqttError::Timeout)
    }

    async fn send_packet<P: EncodePacket>(&mut self, p: &P) -> Result<(), MqttError<T::Error>> {
        let len = p.encode(&mut self.tx_buf).map_err(MqttError::cast_transport_error)?;
        match self.transport.send(&self.tx_buf[..len]).await {
            Ok(()) => {
                self.last_tx = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.connected = false;
                Err(MqttError::Transport(e))
            }
        }
    }

    /// Accumulates transport reads until one complete packet sits at the
    /// front of the receive buffer, returning its total length.
    ///
    /// Partial reads keep their progress across calls, so a timeout here
    /// never desynchronizes the stream.
    async fn read_packet(&mut self) -> Result<usize, MqttError<T::Error>> {
        loop {
            if self.rx_len >= 2 {
                let mut cursor = 1;
                match util::read_variable_byte_integer(&mut cursor, &self.rx_buf[..self.rx_len]) {
                    Ok(remaining) => {
                        let total = cursor + remaining;
                        if total > BUF_SIZE {
                            self.connected = false;
                            return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
                        }
                        if self.rx_len >= total {
                            return Ok(total);
                        }
                    }
                    // Up to 5 header bytes may be needed before the length
                    // parses; fewer means the header is still incomplete.
                    Err(_) if self.rx_len < 5 => {}
                    Err(e) => {
                        self.connected = false;
                        return Err(MqttError::cast_transport_error(e));
                    }
                }
            }

            match self.transport.recv(&mut self.rx_buf[self.rx_len..]).await {
                Ok(n) => self.rx_len += n,
                Err(e) if e.is_timeout() => return Err(MqttError::Timeout),
                Err(e) => {
                    self.connected = false;
                    return Err(MqttError::Transport(e));
                }
            }
        }
    }

    /// Drops a consumed packet, shifting any following bytes to the front.
    fn consume(&mut self, n: usize) {
        self.rx_buf.copy_within(n..self.rx_len, 0);
        self.rx_len -= n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[derive(Debug)]
    struct NoData;

    impl TransportError for NoData {
        fn is_timeout(&self) -> bool {
            true
        }
    }

    /// A transport serving a scripted byte stream and recording all writes.
    struct ScriptedTransport {
        incoming: Vec<u8, 256>,
        pos: usize,
        sent: Vec<u8, 512>,
        resets: usize,
        stall_next_send: bool,
    }

    impl ScriptedTransport {
        fn new() -> Self {
            Self {
                incoming: Vec::new(),
                pos: 0,
                sent: Vec::new(),
                resets: 0,
                stall_next_send: false,
            }
        }

        fn feed(&mut self, bytes: &[u8]) {
            self.incoming.extend_from_slice(bytes).unwrap();
        }
    }

    /// Suspends exactly once, like a transport write parked on the network.
    fn yield_once() -> impl core::future::Future<Output = ()> {
        let mut yielded = false;
        core::future::poll_fn(move |cx| {
            if yielded {
                core::task::Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                core::task::Poll::Pending
            }
        })
    }

    impl MqttTransport for ScriptedTransport {
        type Error = NoData;

        async fn reset(&mut self) -> Result<(), NoData> {
            self.resets += 1;
            Ok(())
        }

        async fn send(&mut self, buf: &[u8]) -> Result<(), NoData> {
            self.sent.extend_from_slice(buf).unwrap();
            if self.stall_next_send {
                self.stall_next_send = false;
                yield_once().await;
            }
            Ok(())
        }

        async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NoData> {
            if self.pos >= self.incoming.len() {
                return Err(NoData);
            }
            let n = (self.incoming.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.incoming[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    const CONNACK_OK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    fn connected_client() -> MqttClient<'static, ScriptedTransport, 256> {
        let mut transport = ScriptedTransport::new();
        transport.feed(&CONNACK_OK);
        let mut client = MqttClient::new(transport, MqttOptions::new("bridge-1"));
        block_on(client.connect()).unwrap();
        client
    }

    #[test]
    fn connect_succeeds_on_accepting_connack() {
        let client = connected_client();
        assert!(client.is_connected());
        assert_eq!(client.transport.sent[0] >> 4, 1, "CONNECT went out first");
        assert_eq!(
            client.transport.resets, 1,
            "the stream is re-established before the handshake"
        );
    }

    #[test]
    fn refused_connack_surfaces_the_reason() {
        let mut transport = ScriptedTransport::new();
        transport.feed(&[0x20, 0x02, 0x00, 0x05]);
        let mut client: MqttClient<'_, _, 256> =
            MqttClient::new(transport, MqttOptions::new("bridge-1"));

        match block_on(client.connect()) {
            Err(MqttError::ConnectionRefused(ConnectReasonCode::NotAuthorized)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!client.is_connected());
    }

    #[test]
    fn qos1_publish_waits_for_its_puback() {
        let mut client = connected_client();
        // First taken packet id is 1.
        client.transport.feed(&[0x40, 0x02, 0x00, 0x01]);
        let sent_before = client.transport.sent.len();

        block_on(client.publish("truma/control_status/rssi", b"-71", QoS::AtLeastOnce, false))
            .unwrap();
        assert_eq!(
            client.transport.sent[sent_before], 0x32,
            "PUBLISH with QoS 1 flags"
        );
        assert!(client.is_connected());
    }

    #[test]
    fn poll_returns_none_when_the_read_times_out() {
        let mut client = connected_client();
        assert!(block_on(client.poll()).unwrap().is_none());
    }

    #[test]
    fn poll_surfaces_inbound_publish_and_acks_qos1() {
        let mut client = connected_client();

        let inbound = packet::Publish {
            topic: "truma/set/heating_mode",
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"eco",
            packet_id: Some(9),
        };
        let mut buf = [0u8; 64];
        let len = inbound.encode(&mut buf).unwrap();
        client.transport.feed(&buf[..len]);

        let event = block_on(client.poll()).unwrap();
        let Some(MqttEvent::Publish(msg)) = event else {
            panic!("expected a publish event");
        };
        assert_eq!(msg.topic.as_str(), "truma/set/heating_mode");
        assert_eq!(msg.payload.as_slice(), b"eco");

        // PUBACK for packet id 9 is the last thing on the wire.
        let sent = &client.transport.sent;
        assert_eq!(&sent[sent.len() - 4..], &[0x40, 0x02, 0x00, 0x09]);
    }

    #[test]
    fn consumed_command_survives_a_dropped_poll_future() {
        use core::future::Future;

        let mut client = connected_client();
        let inbound = packet::Publish {
            topic: "truma/set/heating_mode",
            qos: QoS::AtLeastOnce,
            retain: false,
            payload: b"eco",
            packet_id: Some(5),
        };
        let mut buf = [0u8; 64];
        let len = inbound.encode(&mut buf).unwrap();
        client.transport.feed(&buf[..len]);
        client.transport.stall_next_send = true;

        {
            // Drive the poll up to the parked PUBACK send, then drop it,
            // as a select arm losing the race would.
            let fut = client.poll();
            let mut fut = core::pin::pin!(fut);
            let waker = futures::task::noop_waker();
            let mut cx = core::task::Context::from_waker(&waker);
            assert!(fut.as_mut().poll(&mut cx).is_pending());
        }

        // The consumed message is still delivered by the next poll.
        let event = block_on(client.poll()).unwrap();
        let Some(MqttEvent::Publish(msg)) = event else {
            panic!("expected the parked publish event");
        };
        assert_eq!(msg.topic.as_str(), "truma/set/heating_mode");
        assert_eq!(msg.payload.as_slice(), b"eco");
    }

    #[test]
    fn packet_framing_survives_a_split_read() {
        let mut client = connected_client();

        let inbound = packet::Publish {
            topic: "truma/set/target_temp_room",
            qos: QoS::AtMostOnce,
            retain: false,
            payload: b"21",
            packet_id: None,
        };
        let mut buf = [0u8; 64];
        let len = inbound.encode(&mut buf).unwrap();

        // Only half the packet is available: the poll gives up for now but
        // keeps the buffered prefix.
        client.transport.feed(&buf[..len / 2]);
        assert!(block_on(client.poll()).unwrap().is_none());

        client.transport.feed(&buf[len / 2..]);
        let event = block_on(client.poll()).unwrap();
        let Some(MqttEvent::Publish(msg)) = event else {
            panic!("expected a publish event");
        };
        assert_eq!(msg.payload.as_slice(), b"21");
    }
}
