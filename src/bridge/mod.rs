//! # Telemetry Bridge
//!
//! The long-running half of the crate: connection management with bounded
//! reconnect, inbound command routing, scheduled status publication and
//! the per-subsystem poll loops. Everything here runs as cooperative tasks
//! on a single executor.

pub mod connection;
pub mod poll;
pub mod publisher;
pub mod router;
pub mod runtime;
pub mod scheduler;

pub use connection::{
    BackoffState, BrokerSession, ConnectionManager, ConnectionState, session_options,
};
pub use poll::{CellularModem, DeviceBus, run_device_poll, run_modem_poll};
pub use publisher::{PublishError, PublishOutcome, PublishSink, drain_and_publish};
pub use router::{RouteOutcome, TopicRouter};
pub use runtime::BridgeRuntime;
pub use scheduler::{LinkQuality, MemoryMonitor, NoopMemoryMonitor, TickSchedule};

use log::info;

use crate::indicator::IndicatorSink;

/// Best-effort cleanup before the firmware exits or resets: clears every
/// indicator channel so a dead bridge does not keep health lights on.
pub fn shutdown(indicators: &mut dyn IndicatorSink) {
    indicators.clear_all();
    info!("indicators cleared");
}
