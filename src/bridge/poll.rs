//! # Subsystem Poll Loops
//!
//! Each serial-attached subsystem gets its own forever task that advances
//! the subsystem's frame handling and yields briefly so the executor can
//! run everything else. The yields are the scheduling backbone of the
//! whole bridge: nothing here blocks, and a subsystem can suppress its own
//! yield during a timing-critical frame window.

use embassy_time::Timer;
use log::{info, warn};

use crate::error::ModemError;

/// Delay before the device bus loop starts advancing.
pub const DEVICE_STARTUP_DELAY_SECS: u64 = 1;

/// Delay before the modem is first probed; the modem needs time to
/// register on the network after power-up.
pub const MODEM_STARTUP_DELAY_SECS: u64 = 10;

const DEVICE_YIELD_MILLIS: u64 = 1;
const MODEM_YIELD_MILLIS: u64 = 5;

/// One step of the device-bus frame engine.
///
/// `advance` must return quickly; long waits belong to the loop's yield.
pub trait DeviceBus {
    fn advance(&mut self);

    /// While set, the poll loop spins without yielding so the bus can hit
    /// its frame response window. The implementation must clear the flag
    /// itself; a stuck flag starves every other task.
    fn hold_requested(&self) -> bool;
}

/// The cellular modem collaborator. `setup` runs once; its failure is
/// terminal for the modem feature, not for the bridge.
#[allow(async_fn_in_trait)]
pub trait CellularModem {
    async fn setup(&mut self) -> Result<(), ModemError>;
    async fn advance(&mut self);
    fn hold_requested(&self) -> bool;
}

/// Drives the device bus forever with a tight 1 ms yield.
pub async fn run_device_poll<B: DeviceBus>(bus: B) -> ! {
    Timer::after_secs(DEVICE_STARTUP_DELAY_SECS).await;
    info!("device bus poll loop running");
    drive_device(bus).await
}

async fn drive_device<B: DeviceBus>(mut bus: B) -> ! {
    loop {
        bus.advance();
        if !bus.hold_requested() {
            Timer::after_millis(DEVICE_YIELD_MILLIS).await;
        }
    }
}

/// Drives the modem. If setup fails the loop logs once and returns,
/// leaving the bridge running without cellular.
pub async fn run_modem_poll<M: CellularModem>(modem: M) {
    Timer::after_secs(MODEM_STARTUP_DELAY_SECS).await;
    drive_modem(modem).await
}

async fn drive_modem<M: CellularModem>(mut modem: M) {
    if let Err(e) = modem.setup().await {
        warn!("cellular modem unavailable ({e:?}), feature disabled");
        return;
    }
    info!("modem poll loop running");
    loop {
        modem.advance().await;
        if !modem.hold_requested() {
            Timer::after_millis(MODEM_YIELD_MILLIS).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use core::future::Future;
    use core::pin::pin;
    use core::task::{Context, Poll};
    use futures::executor::block_on;
    use futures::task::noop_waker;

    struct AbsentModem;

    impl CellularModem for AbsentModem {
        async fn setup(&mut self) -> Result<(), ModemError> {
            Err(ModemError::Absent)
        }

        async fn advance(&mut self) {
            panic!("a failed setup must not be followed by polling");
        }

        fn hold_requested(&self) -> bool {
            false
        }
    }

    #[test]
    fn failed_modem_setup_ends_the_loop_without_polling() {
        // Returning at all is the property: the feature is disabled and
        // the executor gets its task slot back.
        block_on(drive_modem(AbsentModem));
    }

    struct CountingBus<'a> {
        advances: &'a Cell<u32>,
        hold_until: u32,
    }

    impl DeviceBus for CountingBus<'_> {
        fn advance(&mut self) {
            self.advances.set(self.advances.get() + 1);
        }

        fn hold_requested(&self) -> bool {
            self.advances.get() < self.hold_until
        }
    }

    #[test]
    fn device_loop_skips_the_yield_while_hold_is_requested() {
        let advances = Cell::new(0);
        let fut = drive_device(CountingBus {
            advances: &advances,
            hold_until: 3,
        });
        let mut fut = pin!(fut);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        // The held iterations run back to back inside one poll; the loop
        // parks only at the first yield after the hold clears.
        assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Pending));
        assert_eq!(advances.get(), 3);
    }

    struct CountingModem<'a> {
        advances: &'a Cell<u32>,
        hold_until: u32,
    }

    impl CellularModem for CountingModem<'_> {
        async fn setup(&mut self) -> Result<(), ModemError> {
            Ok(())
        }

        async fn advance(&mut self) {
            self.advances.set(self.advances.get() + 1);
        }

        fn hold_requested(&self) -> bool {
            self.advances.get() < self.hold_until
        }
    }

    #[test]
    fn modem_loop_yields_once_the_hold_clears() {
        let advances = Cell::new(0);
        let fut = drive_modem(CountingModem {
            advances: &advances,
            hold_until: 2,
        });
        let mut fut = pin!(fut);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Pending));
        assert_eq!(advances.get(), 2);
    }
}
