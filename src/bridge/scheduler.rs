//! # Tick Scheduling and Health Hooks
//!
//! All slow work in the bridge hangs off one base tick. The tick counter
//! derives two slower cadences from it and resets on the slowest one, so
//! the phase relationship between cadences never drifts: every health
//! refresh coincides with a display pass.

/// Base ticks between display snapshot passes.
pub const TICKS_PER_DISPLAY: u32 = 6;

/// Base ticks between health refreshes; also the counter reset point.
pub const TICKS_PER_HEALTH: u32 = 60;

/// Work selected for one base tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickPlan {
    /// Publish the display snapshot and refresh the liveness marker.
    pub display_pass: bool,
    /// Re-read link quality and re-announce liveness.
    pub health_refresh: bool,
}

/// Derives the slower cadences from the base tick.
#[derive(Debug, Default)]
pub struct TickSchedule {
    counter: u32,
}

impl TickSchedule {
    pub const fn new() -> Self {
        Self { counter: 0 }
    }

    /// Advances one base tick and returns the work due on it.
    pub fn advance(&mut self) -> TickPlan {
        self.counter += 1;
        let plan = TickPlan {
            display_pass: self.counter % TICKS_PER_DISPLAY == 0,
            health_refresh: self.counter % TICKS_PER_HEALTH == 0,
        };
        if plan.health_refresh {
            self.counter = 0;
        }
        plan
    }
}

/// Free-heap inspection and reclaim hook.
///
/// Crossing the configured floor is a scheduling condition, not a fault:
/// the bridge runs the reclaim hook and carries on.
pub trait MemoryMonitor {
    fn free_bytes(&mut self) -> usize;
    fn reclaim(&mut self);
}

/// Monitor for targets without a meaningful heap; never triggers reclaim.
pub struct NoopMemoryMonitor;

impl MemoryMonitor for NoopMemoryMonitor {
    fn free_bytes(&mut self) -> usize {
        usize::MAX
    }

    fn reclaim(&mut self) {}
}

/// Sentinel reported when the radio cannot produce a reading.
pub const UNKNOWN_RSSI: i16 = -999;

/// Link quality probe, read once after connect and on every health refresh.
pub trait LinkQuality {
    fn rssi_dbm(&mut self) -> i16;
}
