//! # Bridge Configuration
//!
//! The bridge never reads credentials itself; a [`CredentialStore`]
//! collaborator hands out decrypted scalar values by key. From those values
//! an immutable [`BridgeConfig`] is built once at startup and passed by
//! reference to every component that needs it, and a [`TopicSet`] derives
//! all broker topic prefixes from the configured root topic.

use core::fmt::Write as _;

use embassy_time::Duration;
use heapless::String;

use crate::error::ConfigError;

/// Capacity of a derived topic prefix (root topic plus the longest suffix).
pub const TOPIC_PREFIX_LEN: usize = 64;

const ROOT_TOPIC_LEN: usize = 48;

/// Keys understood by the credential store.
///
/// The names returned by [`CredentialKey::name`] match the entries of the
/// encrypted credential file the provisioning tool writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CredentialKey {
    BrokerAddress,
    NetworkSsid,
    NetworkPassword,
    Username,
    Password,
    RootTopic,
    PhoneNumber,
    SimPin,
}

impl CredentialKey {
    pub fn name(&self) -> &'static str {
        match self {
            CredentialKey::BrokerAddress => "MQTT",
            CredentialKey::NetworkSsid => "SSID",
            CredentialKey::NetworkPassword => "WIFIPW",
            CredentialKey::Username => "UN",
            CredentialKey::Password => "UPW",
            CredentialKey::RootTopic => "MAINTOPIC",
            CredentialKey::PhoneNumber => "TELNR",
            CredentialKey::SimPin => "PIN",
        }
    }
}

/// Synchronous key-to-value lookup over the decrypted credential set.
///
/// Decryption happens in the collaborator; by the time the bridge runs, a
/// lookup is a plain read. `None` means the key is not provisioned.
pub trait CredentialStore {
    fn get(&self, key: CredentialKey) -> Option<&str>;
}

/// Immutable bridge configuration, constructed once at startup.
#[derive(Debug)]
pub struct BridgeConfig {
    pub broker_address: String<64>,
    pub network_ssid: String<32>,
    pub network_password: String<64>,
    pub username: String<32>,
    pub password: String<64>,
    pub root_topic: String<ROOT_TOPIC_LEN>,
    /// Present only when the cellular feature is provisioned.
    pub phone_number: Option<String<20>>,
    /// Present only when the cellular feature is provisioned.
    pub sim_pin: Option<String<8>>,
    /// Broker keepalive; the broker fires the last will this long after the
    /// session goes silent.
    pub keep_alive_secs: u16,
    /// Base scheduler period; all slower cadences derive from this tick.
    pub base_tick: Duration,
    /// Free-heap floor below which the reclaim hook runs.
    pub low_mem_threshold: usize,
}

impl BridgeConfig {
    /// Builds the configuration from the credential store.
    ///
    /// The cellular keys are optional: their absence disables the modem
    /// feature rather than failing startup.
    pub fn from_store(store: &dyn CredentialStore) -> Result<Self, ConfigError> {
        Ok(Self {
            broker_address: required(store, CredentialKey::BrokerAddress)?,
            network_ssid: required(store, CredentialKey::NetworkSsid)?,
            network_password: required(store, CredentialKey::NetworkPassword)?,
            username: required(store, CredentialKey::Username)?,
            password: required(store, CredentialKey::Password)?,
            root_topic: required(store, CredentialKey::RootTopic)?,
            phone_number: optional(store, CredentialKey::PhoneNumber)?,
            sim_pin: optional(store, CredentialKey::SimPin)?,
            keep_alive_secs: 90,
            base_tick: Duration::from_secs(10),
            low_mem_threshold: 20_000,
        })
    }

    /// Whether the cellular collaborator can be brought up at all.
    pub fn cellular_provisioned(&self) -> bool {
        self.phone_number.is_some() && self.sim_pin.is_some()
    }
}

fn required<const N: usize>(
    store: &dyn CredentialStore,
    key: CredentialKey,
) -> Result<String<N>, ConfigError> {
    let value = store
        .get(key)
        .ok_or(ConfigError::MissingCredential(key.name()))?;
    copy_value(value, key)
}

fn optional<const N: usize>(
    store: &dyn CredentialStore,
    key: CredentialKey,
) -> Result<Option<String<N>>, ConfigError> {
    match store.get(key) {
        Some(value) if !value.is_empty() => copy_value(value, key).map(Some),
        _ => Ok(None),
    }
}

fn copy_value<const N: usize>(value: &str, key: CredentialKey) -> Result<String<N>, ConfigError> {
    let mut out = String::new();
    out.push_str(value)
        .map_err(|_| ConfigError::ValueTooLong(key.name()))?;
    Ok(out)
}

/// All broker topics used by the bridge, derived once from the root topic.
///
/// The root topic itself carries the liveness announcement and the last
/// will; everything else hangs off fixed suffixes.
#[derive(Debug)]
pub struct TopicSet {
    root: String<ROOT_TOPIC_LEN>,
    command_prefix: String<TOPIC_PREFIX_LEN>,
    command_filter: String<TOPIC_PREFIX_LEN>,
    control_prefix: String<TOPIC_PREFIX_LEN>,
    gsm_prefix: String<TOPIC_PREFIX_LEN>,
    display_prefix: String<TOPIC_PREFIX_LEN>,
}

impl TopicSet {
    pub fn new(root_topic: &str) -> Result<Self, ConfigError> {
        let mut root = String::new();
        root.push_str(root_topic)
            .map_err(|_| ConfigError::ValueTooLong(CredentialKey::RootTopic.name()))?;
        Ok(Self {
            command_prefix: join(root_topic, "/set/")?,
            command_filter: join(root_topic, "/set/#")?,
            control_prefix: join(root_topic, "/control_status/")?,
            gsm_prefix: join(root_topic, "/gsm/")?,
            display_prefix: join(root_topic, "/display_status/")?,
            root,
        })
    }

    /// The root topic: liveness announcements and the last will.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Prefix stripped from inbound command topics.
    pub fn command_prefix(&self) -> &str {
        &self.command_prefix
    }

    /// The wildcard filter subscribed on every (re)connect.
    pub fn command_filter(&self) -> &str {
        &self.command_filter
    }

    /// Outbound prefix for device-bus control state (acknowledged delivery).
    pub fn control_prefix(&self) -> &str {
        &self.control_prefix
    }

    /// Outbound prefix for modem telemetry (best effort).
    pub fn gsm_prefix(&self) -> &str {
        &self.gsm_prefix
    }

    /// Outbound prefix for display snapshots (best effort).
    pub fn display_prefix(&self) -> &str {
        &self.display_prefix
    }
}

fn join(root: &str, suffix: &str) -> Result<String<TOPIC_PREFIX_LEN>, ConfigError> {
    let mut out = String::new();
    write!(&mut out, "{root}{suffix}")
        .map_err(|_| ConfigError::ValueTooLong(CredentialKey::RootTopic.name()))?;
    Ok(out)
}
