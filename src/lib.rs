//! # LIN Telemetry Bridge
//!
//! `lin-mqtt-bridge` connects a LIN-attached heater controller and an
//! optional cellular modem to an MQTT broker, built upon the
//! [Embassy](https://embassy.dev/) async ecosystem.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Designed to run on bare-metal microcontrollers without requiring a
//!   standard library or dynamic memory allocation. Buffers are managed using `heapless`.
//! - **Fully Async:** Built with `async/await` and leverages the Embassy ecosystem for timers
//!   and networking, ensuring non-blocking operations.
//! - **Rust 2024 Edition:** Uses native `async fn` in traits, removing the need for `async-trait`.
//! - **MQTT v3.1.1:** A built-in client with QoS 0/1, keepalive and a retained last will that
//!   flips the root topic to `Offline` when the bridge dies.
//! - **Transport Agnostic:** A flexible `MqttTransport` trait allows the client to run over any
//!   reliable, ordered, stream-based communication channel.
//! - **Bounded Reconnect:** A fixed retry burst with an attempt ceiling and a long cooldown keeps
//!   a dead network from melting the link or the board.
//!
//! ## Architecture
//!
//! All tasks share one executor. Each serial-attached subsystem runs a poll
//! loop ([`bridge::run_device_poll`], [`bridge::run_modem_poll`]) that feeds
//! a [`SharedStatusMap`] with per-entry dirty markers. The
//! [`bridge::BridgeRuntime`] task owns the broker session: on a base tick
//! it drains changed entries under their topic prefixes, and in between it
//! routes inbound `<root>/set/<key>` commands back into the maps.
//!
//! ```ignore
//! let topics = TopicSet::new(config.root_topic.as_str())?;
//! let client = MqttClient::<_, 512>::new(transport, options);
//! let conn = ConnectionManager::new(client, &topics, &mut indicators);
//! let mut runtime = BridgeRuntime::new(
//!     conn, &topics, &config, &device, Some(&modem), &display,
//!     &device, &mut memory, &mut link,
//! );
//! runtime.run().await
//! ```

#![no_std]
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod indicator;
pub mod packet;
pub mod status;
pub mod transport;
pub mod util;

// Re-export key types for easier access at the crate root.
pub use bridge::{BridgeRuntime, ConnectionManager};
pub use client::{MqttClient, MqttEvent, MqttOptions};
pub use config::{BridgeConfig, CredentialKey, CredentialStore, TopicSet};
pub use indicator::{Indicator, IndicatorSink};
pub use packet::QoS;
pub use status::{SharedStatusMap, StatusValue};
pub use transport::TcpTransport;
