//! # Broker Connection Management
//!
//! The connection manager owns the broker session lifecycle: it is the only
//! component that transitions the connection state, it announces liveness
//! and re-establishes subscriptions after every (re)connect, and it bounds
//! reconnection pressure with a fixed short retry delay, an attempt ceiling
//! and a long cooldown. With the 50 ms retry delay and the ceiling of 200
//! attempts, a dead network costs one burst of roughly ten seconds of rapid
//! tries per minute of downtime.

use embassy_time::{Duration, Timer};
use log::{debug, error, info, warn};

use crate::client::{InboundPublish, MqttClient, MqttEvent, MqttOptions};
use crate::config::{BridgeConfig, TopicSet};
use crate::indicator::{Indicator, IndicatorSink};
use crate::packet::{LastWill, QoS};
use crate::transport::MqttTransport;

use super::publisher::{PublishError, PublishSink};

/// Failed connect attempts tolerated before a cooldown.
pub const ATTEMPT_CEILING: u16 = 200;

/// Delay between connect attempts within a burst.
pub const SHORT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Sleep taken after the attempt ceiling is reached.
pub const COOLDOWN: Duration = Duration::from_secs(60);

const ONLINE: &[u8] = b"Online";
const OFFLINE: &[u8] = b"Offline";

/// Session options for the bridge: clean session, the configured
/// keepalive and credentials, and a retained `Offline` last will on the
/// root topic. The will has to be registered before `connect`, which is
/// why this is built here and not inside the manager.
pub fn session_options<'a>(config: &'a BridgeConfig, topics: &'a TopicSet) -> MqttOptions<'a> {
    MqttOptions::new(config.root_topic.as_str())
        .with_keep_alive(config.keep_alive_secs)
        .with_credentials(config.username.as_str(), config.password.as_str())
        .with_last_will(LastWill {
            topic: topics.root(),
            payload: OFFLINE,
            qos: QoS::AtMostOnce,
            retain: true,
        })
}

/// The broker operations the connection manager drives.
///
/// [`MqttClient`] is the production implementation; tests substitute
/// recording fakes.
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    type Error: core::fmt::Debug;

    /// Establishes a fresh session. Called for every reconnect attempt,
    /// so implementations must re-create the underlying byte stream, not
    /// just resend the handshake.
    async fn connect(&mut self) -> Result<(), Self::Error>;
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), Self::Error>;
    async fn poll(&mut self) -> Result<Option<MqttEvent>, Self::Error>;
    fn is_connected(&self) -> bool;
}

impl<'a, T: MqttTransport, const BUF_SIZE: usize> BrokerSession for MqttClient<'a, T, BUF_SIZE> {
    type Error = crate::error::MqttError<T::Error>;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, qos, retain).await
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic, qos).await
    }

    async fn poll(&mut self) -> Result<Option<MqttEvent>, Self::Error> {
        MqttClient::poll(self).await
    }

    fn is_connected(&self) -> bool {
        MqttClient::is_connected(self)
    }
}

/// Connection lifecycle state. Exactly one value is active at a time and
/// only the connection manager transitions it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What to do after a failed connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Stay in the burst: wait the short delay and try again.
    ShortDelay,
    /// The ceiling was reached: take the long cooldown, then start a fresh
    /// burst.
    Cooldown,
}

/// Bounded reconnect accounting.
///
/// `attempts` never exceeds the ceiling: reaching it resets the counter to
/// zero and arms exactly one cooldown.
#[derive(Debug, Default)]
pub struct BackoffState {
    attempts: u16,
    cooldown_active: bool,
}

impl BackoffState {
    pub const fn new() -> Self {
        Self {
            attempts: 0,
            cooldown_active: false,
        }
    }

    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn cooldown_active(&self) -> bool {
        self.cooldown_active
    }

    /// Registers a failed attempt and decides how to continue.
    pub fn on_failure(&mut self) -> RetryAction {
        self.attempts += 1;
        if self.attempts >= ATTEMPT_CEILING {
            self.attempts = 0;
            self.cooldown_active = true;
            RetryAction::Cooldown
        } else {
            RetryAction::ShortDelay
        }
    }

    /// Marks the cooldown sleep as over.
    pub fn cooldown_finished(&mut self) {
        self.cooldown_active = false;
    }

    /// Clears all accounting after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.cooldown_active = false;
    }
}

/// Owns the broker session, its state machine and the backoff accounting.
pub struct ConnectionManager<'a, S: BrokerSession> {
    pub(crate) session: S,
    topics: &'a TopicSet,
    indicators: &'a mut dyn IndicatorSink,
    state: ConnectionState,
    backoff: BackoffState,
}

impl<'a, S: BrokerSession> ConnectionManager<'a, S> {
    pub fn new(session: S, topics: &'a TopicSet, indicators: &'a mut dyn IndicatorSink) -> Self {
        Self {
            session,
            topics,
            indicators,
            state: ConnectionState::Disconnected,
            backoff: BackoffState::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Blocks (cooperatively) until a session is established, applying the
    /// short-delay/cooldown policy across failed attempts.
    pub async fn maintain(&mut self) {
        if self.is_connected() {
            return;
        }
        self.indicators.set(Indicator::Broker, false);
        loop {
            match self.establish().await {
                Ok(()) => return,
                Err(e) => {
                    debug!("connect attempt failed: {e:?}");
                    self.state = ConnectionState::Disconnected;
                    // Blink the channel so an observer can tell an active
                    // retry burst from a dead box.
                    self.indicators.toggle(Indicator::Broker);
                    match self.backoff.on_failure() {
                        RetryAction::ShortDelay => Timer::after(SHORT_RETRY_DELAY).await,
                        RetryAction::Cooldown => {
                            warn!(
                                "broker unreachable after {ATTEMPT_CEILING} attempts, cooling down for {}s",
                                COOLDOWN.as_secs()
                            );
                            self.indicators.set(Indicator::Broker, false);
                            Timer::after(COOLDOWN).await;
                            self.backoff.cooldown_finished();
                        }
                    }
                }
            }
        }
    }

    /// One connect attempt. On success the liveness announcement goes out
    /// and all subscriptions are re-established before this returns, so no
    /// queued inbound command can be observed before `Online` is published.
    async fn establish(&mut self) -> Result<(), S::Error> {
        self.state = ConnectionState::Connecting;
        self.session.connect().await?;
        self.session
            .publish(self.topics.root(), ONLINE, QoS::AtMostOnce, true)
            .await?;
        self.session
            .subscribe(self.topics.command_filter(), QoS::AtLeastOnce)
            .await?;
        self.state = ConnectionState::Connected;
        self.backoff.reset();
        self.indicators.set(Indicator::Broker, true);
        info!("broker connected, subscribed to {}", self.topics.command_filter());
        Ok(())
    }

    /// Re-announces liveness on the root topic; used by the slow health
    /// cadence while the session is up.
    pub async fn announce_online(&mut self) {
        if !self.is_connected() {
            return;
        }
        if self
            .publish(self.topics.root(), ONLINE, QoS::AtMostOnce, true)
            .await
            .is_ok()
        {
            self.indicators.set(Indicator::Broker, true);
        }
    }

    /// Fire-and-forget publish: a failure is logged and surfaced as a
    /// non-fatal signal, never retried here. Callers that need eventual
    /// delivery rely on the next scheduled cycle re-sending a still-dirty
    /// value.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        match self.session.publish(topic, payload, qos, retain).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("publish to {topic} failed: {e:?}");
                if !self.session.is_connected() {
                    self.mark_disconnected();
                }
                Err(PublishError::Transport)
            }
        }
    }

    /// Pumps the session for one inbound message.
    pub async fn poll(&mut self) -> Option<InboundPublish> {
        if !self.is_connected() {
            return None;
        }
        match self.session.poll().await {
            Ok(Some(MqttEvent::Publish(msg))) => Some(msg),
            Ok(None) => None,
            Err(e) => {
                warn!("session poll failed: {e:?}");
                if !self.session.is_connected() {
                    self.mark_disconnected();
                }
                None
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Disconnected {
            warn!("broker connection lost");
        }
        self.state = ConnectionState::Disconnected;
        self.indicators.set(Indicator::Broker, false);
    }
}

impl<'a, S: BrokerSession> PublishSink for ConnectionManager<'a, S> {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        ConnectionManager::publish(self, topic, payload, qos, retain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::NoopIndicators;
    use futures::executor::block_on;
    use heapless::{String, Vec};

    #[derive(Debug, PartialEq)]
    enum Op {
        Connect,
        Publish(String<64>, bool, QoS),
        Subscribe(String<64>, QoS),
    }

    struct FakeSession {
        ops: Vec<Op, 16>,
        connected: bool,
    }

    impl FakeSession {
        fn new() -> Self {
            Self {
                ops: Vec::new(),
                connected: false,
            }
        }

        fn record(&mut self, op: Op) {
            self.ops.push(op).unwrap();
        }
    }

    impl BrokerSession for FakeSession {
        type Error = ();

        async fn connect(&mut self) -> Result<(), ()> {
            self.record(Op::Connect);
            self.connected = true;
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            _payload: &[u8],
            qos: QoS,
            retain: bool,
        ) -> Result<(), ()> {
            let mut t = String::new();
            t.push_str(topic).unwrap();
            self.record(Op::Publish(t, retain, qos));
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ()> {
            let mut t = String::new();
            t.push_str(topic).unwrap();
            self.record(Op::Subscribe(t, qos));
            Ok(())
        }

        async fn poll(&mut self) -> Result<Option<MqttEvent>, ()> {
            Ok(None)
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    #[test]
    fn backoff_attempts_are_bounded_by_the_ceiling() {
        let mut backoff = BackoffState::new();
        for _ in 0..ATTEMPT_CEILING - 1 {
            assert_eq!(backoff.on_failure(), RetryAction::ShortDelay);
            assert!(backoff.attempts() < ATTEMPT_CEILING);
        }
        assert_eq!(backoff.on_failure(), RetryAction::Cooldown);
        assert_eq!(backoff.attempts(), 0);
        assert!(backoff.cooldown_active());
    }

    #[test]
    fn exactly_one_cooldown_per_attempt_burst() {
        let mut backoff = BackoffState::new();
        let mut cooldowns = 0;
        for _ in 0..ATTEMPT_CEILING {
            if backoff.on_failure() == RetryAction::Cooldown {
                cooldowns += 1;
                backoff.cooldown_finished();
            }
        }
        assert_eq!(cooldowns, 1);

        // Attempt 201 opens a fresh burst with the counter back at 1.
        assert_eq!(backoff.on_failure(), RetryAction::ShortDelay);
        assert_eq!(backoff.attempts(), 1);
        assert!(!backoff.cooldown_active());
    }

    #[test]
    fn successful_connect_announces_before_subscribing() {
        let topics = TopicSet::new("truma").unwrap();
        let mut indicators = NoopIndicators;
        let mut conn = ConnectionManager::new(FakeSession::new(), &topics, &mut indicators);

        block_on(conn.establish()).unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let ops = &conn.session.ops;
        assert_eq!(ops[0], Op::Connect);
        // Liveness goes out retained on the root topic before the command
        // subscription exists, so no queued command can be seen first.
        let mut root = String::new();
        root.push_str("truma").unwrap();
        assert_eq!(ops[1], Op::Publish(root, true, QoS::AtMostOnce));
        let mut filter = String::new();
        filter.push_str("truma/set/#").unwrap();
        assert_eq!(ops[2], Op::Subscribe(filter, QoS::AtLeastOnce));
    }

    #[test]
    fn session_options_register_the_offline_will() {
        use crate::config::{CredentialKey, CredentialStore};
        struct Store;
        impl CredentialStore for Store {
            fn get(&self, key: CredentialKey) -> Option<&str> {
                match key {
                    CredentialKey::PhoneNumber | CredentialKey::SimPin => None,
                    CredentialKey::RootTopic => Some("truma"),
                    _ => Some("value"),
                }
            }
        }
        let config = BridgeConfig::from_store(&Store).unwrap();
        let topics = TopicSet::new(config.root_topic.as_str()).unwrap();

        let options = session_options(&config, &topics);
        assert_eq!(options.keep_alive, 90);
        let will = options.last_will.unwrap();
        assert_eq!(will.topic, "truma");
        assert_eq!(will.payload, b"Offline");
        assert!(will.retain);
    }

    #[test]
    fn publish_requires_a_connected_session() {
        let topics = TopicSet::new("truma").unwrap();
        let mut indicators = NoopIndicators;
        let mut conn = ConnectionManager::new(FakeSession::new(), &topics, &mut indicators);

        let result = block_on(ConnectionManager::publish(
            &mut conn,
            "truma/control_status/alive",
            b"1",
            QoS::AtLeastOnce,
            false,
        ));
        assert_eq!(result, Err(PublishError::NotConnected));
    }
}
