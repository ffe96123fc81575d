//! # Status Publication
//!
//! Drains dirty entries out of a shared status map and publishes each one
//! under its topic prefix. Delivery is fire and forget: a failed entry is
//! logged and counted, the remaining entries of the same batch still go
//! out, and nothing is re-queued here.

use core::fmt::Write as _;

use heapless::String;
use log::{info, warn};

use crate::config::TOPIC_PREFIX_LEN;
use crate::packet::QoS;
use crate::status::{SharedStatusMap, VALUE_LEN};

const TOPIC_LEN: usize = TOPIC_PREFIX_LEN + VALUE_LEN;

/// Why a single publish was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PublishError {
    NotConnected,
    Transport,
}

/// Outbound publish boundary, implemented by the connection manager.
#[allow(async_fn_in_trait)]
pub trait PublishSink {
    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// Tally of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub attempted: usize,
    pub failed: usize,
}

impl PublishOutcome {
    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }
}

/// Drains the map's changed entries and publishes each as
/// `<prefix><key>` with the stringified value as payload.
///
/// The snapshot is taken atomically up front, so values written while the
/// batch is in flight stay dirty for the next pass.
pub async fn drain_and_publish<P: PublishSink, const N: usize>(
    sink: &mut P,
    map: &SharedStatusMap<N>,
    prefix: &str,
    qos: QoS,
) -> PublishOutcome {
    let changed = map.take_changed();
    let mut outcome = PublishOutcome::default();
    for entry in &changed {
        outcome.attempted += 1;
        let mut topic: String<TOPIC_LEN> = String::new();
        if write!(&mut topic, "{prefix}{}", entry.key).is_err() {
            warn!("topic for status key {} exceeds capacity, dropping", entry.key);
            outcome.failed += 1;
            continue;
        }
        info!("publishing {} = {}", topic, entry.value);
        if sink
            .publish(&topic, entry.value.as_bytes(), qos, false)
            .await
            .is_err()
        {
            // The failure itself was already logged by the sink; keep
            // draining so one bad entry cannot starve the rest.
            outcome.failed += 1;
        }
    }
    outcome
}
