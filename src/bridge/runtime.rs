//! # Bridge Main Loop
//!
//! Ties the connection manager, the router and the scheduler together into
//! the single long-running task of the bridge. The loop alternates between
//! waiting for the next base tick and pumping the broker session for
//! inbound commands; a lost session falls back to the reconnect path and
//! the loop resumes where it left off.

use embassy_futures::select::{Either, select};
use embassy_time::Ticker;
use log::{debug, info, warn};

use crate::config::{BridgeConfig, TopicSet};
use crate::packet::QoS;
use crate::status::{CommandSink, SharedStatusMap, StatusValue};

use super::connection::{BrokerSession, ConnectionManager};
use super::publisher::drain_and_publish;
use super::router::TopicRouter;
use super::scheduler::{LinkQuality, MemoryMonitor, TickSchedule};

/// Liveness marker key on the device status map.
pub const ALIVE_KEY: &str = "alive";

/// Link quality key on the device status map.
pub const RSSI_KEY: &str = "rssi";

/// The bridge's single scheduling task.
///
/// `DN`, `GN` and `XN` are the capacities of the device, modem and display
/// status maps.
pub struct BridgeRuntime<'a, S, const DN: usize, const GN: usize, const XN: usize>
where
    S: BrokerSession,
{
    conn: ConnectionManager<'a, S>,
    topics: &'a TopicSet,
    config: &'a BridgeConfig,
    router: TopicRouter<'a>,
    device_status: &'a SharedStatusMap<DN>,
    modem_status: Option<&'a SharedStatusMap<GN>>,
    display_status: &'a SharedStatusMap<XN>,
    command_sink: &'a dyn CommandSink,
    memory: &'a mut dyn MemoryMonitor,
    link: &'a mut dyn LinkQuality,
    schedule: TickSchedule,
}

impl<'a, S, const DN: usize, const GN: usize, const XN: usize> BridgeRuntime<'a, S, DN, GN, XN>
where
    S: BrokerSession,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: ConnectionManager<'a, S>,
        topics: &'a TopicSet,
        config: &'a BridgeConfig,
        device_status: &'a SharedStatusMap<DN>,
        modem_status: Option<&'a SharedStatusMap<GN>>,
        display_status: &'a SharedStatusMap<XN>,
        command_sink: &'a dyn CommandSink,
        memory: &'a mut dyn MemoryMonitor,
        link: &'a mut dyn LinkQuality,
    ) -> Self {
        Self {
            conn,
            topics,
            config,
            router: TopicRouter::new(topics.command_prefix()),
            device_status,
            modem_status,
            display_status,
            command_sink,
            memory,
            link,
            schedule: TickSchedule::new(),
        }
    }

    /// Runs the bridge forever.
    pub async fn run(&mut self) -> ! {
        info!("bridge main loop running, root topic {}", self.topics.root());
        loop {
            self.conn.maintain().await;
            self.seed_link_quality();

            // The ticker keeps its phase across inbound messages, so a
            // chatty broker cannot starve the tick cadence.
            let mut ticker = Ticker::every(self.config.base_tick);
            while self.conn.is_connected() {
                match select(ticker.next(), self.conn.poll()).await {
                    Either::First(()) => self.on_tick().await,
                    Either::Second(Some(msg)) => {
                        self.router
                            .route(msg.topic.as_str(), &msg.payload, self.command_sink);
                    }
                    Either::Second(None) => {}
                }
            }
            warn!("broker session lost, reconnecting");
        }
    }

    /// One base tick: memory watchdog, then the publication passes due on
    /// this tick.
    async fn on_tick(&mut self) {
        let free = self.memory.free_bytes();
        if free < self.config.low_mem_threshold {
            debug!("{free} bytes free, running reclaim");
            self.memory.reclaim();
        }

        let plan = self.schedule.advance();

        drain_and_publish(
            &mut self.conn,
            self.device_status,
            self.topics.control_prefix(),
            QoS::AtLeastOnce,
        )
        .await;

        if let Some(modem_status) = self.modem_status {
            drain_and_publish(
                &mut self.conn,
                modem_status,
                self.topics.gsm_prefix(),
                QoS::AtMostOnce,
            )
            .await;
        }

        if plan.display_pass {
            // Re-mark the entry so the device-reported link state rides
            // out with the next control drain; the value itself belongs
            // to the bus decoder.
            self.device_status.mark_dirty(ALIVE_KEY);
            drain_and_publish(
                &mut self.conn,
                self.display_status,
                self.topics.display_prefix(),
                QoS::AtMostOnce,
            )
            .await;
        }

        if plan.health_refresh {
            self.seed_link_quality();
            self.conn.announce_online().await;
        }
    }

    /// Writes the current link quality into the device map so it is
    /// published with the next control drain.
    fn seed_link_quality(&mut self) {
        let rssi = self.link.rssi_dbm();
        if self
            .device_status
            .set(RSSI_KEY, StatusValue::Int(rssi as i32))
            .is_err()
        {
            debug!("device status map carries no {RSSI_KEY} key");
        }
    }
}
