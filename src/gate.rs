use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    config::DEFAULT_INTERVAL,
    error::{Result, SamplerError},
};

// Layout of the gate word: | cycle (16) | open (1) | count (47) |
const COUNT_BITS: u32 = 47;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;
const OPEN_BIT: u64 = 1 << COUNT_BITS;
const CYCLE_SHIFT: u32 = COUNT_BITS + 1;
const CYCLE_MASK: u64 = (1 << (u64::BITS - CYCLE_SHIFT)) - 1;

/// The enable/disable cycle in which an event was accepted.
///
/// A sample may only be filed into the cycle that accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cycle(u64);

impl Cycle {
    fn of(state: u64) -> Self {
        Cycle(state >> CYCLE_SHIFT)
    }
}

/// Decimates allocation events by count.
///
/// Events are only counted while the gate is open. An event is sampled when
/// the new counter value is a multiple of the interval. A sample stands for
/// one occurrence, it is never scaled by the interval.
///
/// The counter, the open flag and the cycle share one atomic word, so an event
/// is counted in exactly the cycle it was accepted in and never after the gate
/// closes.
#[derive(Debug)]
pub struct SamplerGate {
    interval: u64,
    state: AtomicU64,
}

impl Default for SamplerGate {
    fn default() -> Self {
        SamplerGate {
            interval: DEFAULT_INTERVAL,
            state: AtomicU64::new(0),
        }
    }
}

impl SamplerGate {
    pub fn new(interval: u64) -> Result<Self> {
        if interval == 0 {
            return Err(SamplerError::InvalidConfiguration(
                "sampling interval must be a positive integer".to_string(),
            ));
        }
        Ok(SamplerGate {
            interval,
            state: AtomicU64::new(0),
        })
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Events counted since the gate was last opened.
    pub fn allocation_count(&self) -> u64 {
        self.state.load(Ordering::Acquire) & COUNT_MASK
    }

    pub fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) & OPEN_BIT != 0
    }

    pub fn cycle(&self) -> Cycle {
        Cycle::of(self.state.load(Ordering::Acquire))
    }

    /// Counts one event. Returns the accepting cycle when the event is to be
    /// recorded, `None` when it is skipped or the gate is closed.
    pub fn should_sample(&self) -> Option<Cycle> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & OPEN_BIT == 0 {
                return None;
            }
            let count = (current & COUNT_MASK) + 1;
            if count > COUNT_MASK {
                return None;
            }
            let next = (current & !COUNT_MASK) | count;
            match self.state.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return (count % self.interval == 0).then_some(Cycle::of(current));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether a sample accepted in `cycle` may still be filed.
    pub fn accepts(&self, cycle: Cycle) -> bool {
        let state = self.state.load(Ordering::Acquire);
        state & OPEN_BIT != 0 && Cycle::of(state) == cycle
    }

    /// Starts a new cycle with a zero count. Returns whether the gate was
    /// already open.
    pub(crate) fn open(&self) -> bool {
        let update = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                let cycle = ((state >> CYCLE_SHIFT) + 1) & CYCLE_MASK;
                Some((cycle << CYCLE_SHIFT) | OPEN_BIT)
            });
        let previous = match update {
            Ok(previous) | Err(previous) => previous,
        };
        previous & OPEN_BIT != 0
    }

    /// Stops counting, keeping the count. Returns whether the gate was open.
    pub(crate) fn close(&self) -> bool {
        self.state.fetch_and(!OPEN_BIT, Ordering::AcqRel) & OPEN_BIT != 0
    }
}
