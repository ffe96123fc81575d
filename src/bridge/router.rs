//! # Inbound Command Routing
//!
//! Maps inbound broker messages onto subsystem state. A topic under the
//! command prefix names a status key; the payload is the new value. All
//! routing failures are logged and absorbed here, an inbound message can
//! never take the bridge down.

use log::{debug, info, warn};

use crate::status::CommandSink;

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouteOutcome {
    /// Topic outside the command prefix; not for us.
    Ignored,
    /// A command that could not be applied (unknown key, bad payload).
    Rejected,
    /// The command mutated subsystem state.
    Applied,
}

/// Routes command topics to a [`CommandSink`] by stripping the command
/// prefix and treating the remainder as the status key.
pub struct TopicRouter<'a> {
    command_prefix: &'a str,
}

impl<'a> TopicRouter<'a> {
    pub fn new(command_prefix: &'a str) -> Self {
        Self { command_prefix }
    }

    pub fn route(&self, topic: &str, payload: &[u8], sink: &dyn CommandSink) -> RouteOutcome {
        let Some(key) = topic.strip_prefix(self.command_prefix) else {
            debug!("ignoring message on non-command topic {topic}");
            return RouteOutcome::Ignored;
        };
        if key.is_empty() || key.contains('/') {
            warn!("malformed command topic {topic}");
            return RouteOutcome::Rejected;
        }
        let Ok(value) = core::str::from_utf8(payload) else {
            warn!("command payload for {key} is not valid utf-8");
            return RouteOutcome::Rejected;
        };
        // Reject unknown keys up front so the sink never sees them as
        // writes; the key set is fixed and commands cannot grow it.
        if !sink.has_key(key) {
            warn!("command for unknown status key {key}");
            return RouteOutcome::Rejected;
        }
        match sink.set_status(key, value) {
            Ok(()) => {
                info!("command applied: {key} = {value}");
                RouteOutcome::Applied
            }
            Err(e) => {
                warn!("command for {key} rejected: {e:?}");
                RouteOutcome::Rejected
            }
        }
    }
}
