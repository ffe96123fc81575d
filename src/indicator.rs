//! # Health Indicators
//!
//! Named boolean output channels reflecting connection and subsystem
//! health, typically backed by board LEDs. The connection manager drives
//! the broker channel; subsystem collaborators drive their own. On
//! shutdown all channels are cleared best-effort.

use embedded_hal::digital::StatefulOutputPin;

/// The indicator channels the bridge knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Indicator {
    /// Broker session health ("MQTT").
    Broker,
    /// Cellular modem health ("GSM").
    Modem,
    /// Auxiliary board channel ("D8").
    Aux,
}

impl Indicator {
    /// The board-level channel name.
    pub fn name(&self) -> &'static str {
        match self {
            Indicator::Broker => "MQTT",
            Indicator::Modem => "GSM",
            Indicator::Aux => "D8",
        }
    }

    pub const ALL: [Indicator; 3] = [Indicator::Broker, Indicator::Modem, Indicator::Aux];
}

/// Sink for indicator transitions. Failures are not interesting to the
/// bridge, so the interface is infallible; implementations swallow pin
/// errors.
pub trait IndicatorSink {
    fn set(&mut self, indicator: Indicator, on: bool);

    /// Flips a channel, used to blink the broker channel during an active
    /// retry burst.
    fn toggle(&mut self, indicator: Indicator);

    /// Clears every channel; part of the best-effort shutdown sequence.
    fn clear_all(&mut self) {
        for indicator in Indicator::ALL {
            self.set(indicator, false);
        }
    }
}

/// An indicator sink that discards all transitions, for boards without
/// status LEDs.
pub struct NoopIndicators;

impl IndicatorSink for NoopIndicators {
    fn set(&mut self, _indicator: Indicator, _on: bool) {}
    fn toggle(&mut self, _indicator: Indicator) {}
}

/// Indicator channels backed by GPIO pins.
pub struct PinIndicators<P: StatefulOutputPin> {
    broker: P,
    modem: P,
    aux: P,
}

impl<P: StatefulOutputPin> PinIndicators<P> {
    pub fn new(broker: P, modem: P, aux: P) -> Self {
        Self { broker, modem, aux }
    }

    fn pin(&mut self, indicator: Indicator) -> &mut P {
        match indicator {
            Indicator::Broker => &mut self.broker,
            Indicator::Modem => &mut self.modem,
            Indicator::Aux => &mut self.aux,
        }
    }
}

impl<P: StatefulOutputPin> IndicatorSink for PinIndicators<P> {
    fn set(&mut self, indicator: Indicator, on: bool) {
        let pin = self.pin(indicator);
        let _ = if on { pin.set_high() } else { pin.set_low() };
    }

    fn toggle(&mut self, indicator: Indicator) {
        let _ = self.pin(indicator).toggle();
    }
}
