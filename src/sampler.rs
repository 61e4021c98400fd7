use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use log::{debug, info};

use crate::{
    config::SamplerConfig,
    error::{Result, SamplerError},
    export::SamplerReport,
    frame::StackPath,
    gate::{Cycle, SamplerGate},
    query::{self, LocationCounts, LocationEntry},
    reentry::ReentryGuard,
    store::{AggregationStore, TypeAggregation},
};

/// The host side of the profiler: something that observes allocations and
/// delivers them to a sampler.
///
/// Only one sampler may be observed at a time. After `stop_observing`
/// returns, no further events may reach that sampler.
pub trait AllocationHook: Send + Sync {
    fn start_observing(&self, sampler: &AllocationSampler) -> Result<()>;
    fn stop_observing(&self, sampler: &AllocationSampler);
}

struct SamplerInner {
    /// Also holds the enabled flag and the current cycle.
    gate: SamplerGate,
    store: Mutex<AggregationStore>,
    hook: Option<&'static dyn AllocationHook>,
}

/// Builder for an [`AllocationSampler`] with a host hook attached.
#[derive(Default)]
pub struct SamplerBuilder {
    config: SamplerConfig,
    hook: Option<&'static dyn AllocationHook>,
}

impl SamplerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: SamplerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn interval(mut self, interval: u64) -> Self {
        self.config.interval = interval;
        self
    }

    /// Deliver allocations observed by `hook` while the sampler is enabled.
    #[must_use]
    pub fn hook(mut self, hook: &'static dyn AllocationHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn build(self) -> Result<AllocationSampler> {
        let gate = SamplerGate::new(self.config.interval)?;
        debug!(
            "Created allocation sampler (interval {}, hook attached: {})",
            gate.interval(),
            self.hook.is_some()
        );
        Ok(AllocationSampler::from_parts(gate, self.hook))
    }
}

/// Sampling allocation profiler.
///
/// ```rust
/// use allocation_sampler::{AllocationSampler, Frame, StackPath};
///
/// let sampler = AllocationSampler::with_interval(1).unwrap();
/// sampler.enable().unwrap();
/// let stack = StackPath::new(vec![Frame::new("main", "main.rs", 3)]);
/// sampler.on_allocation("Object", &stack).unwrap();
/// sampler.disable().unwrap();
///
/// let counts = sampler.per_location_counts().unwrap();
/// assert_eq!(counts["Object"]["main.rs"][&3], 1);
/// ```
///
/// Clones share the same state. Each `enable` starts a fresh result set.
#[derive(Clone)]
pub struct AllocationSampler {
    inner: Arc<SamplerInner>,
}

impl fmt::Debug for AllocationSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationSampler")
            .field("interval", &self.interval())
            .field("enabled", &self.is_enabled())
            .field("allocation_count", &self.allocation_count())
            .finish_non_exhaustive()
    }
}

impl AllocationSampler {
    /// A sampler that records every allocation.
    pub fn new() -> Self {
        AllocationSampler::from_parts(SamplerGate::default(), None)
    }

    fn from_parts(gate: SamplerGate, hook: Option<&'static dyn AllocationHook>) -> Self {
        AllocationSampler {
            inner: Arc::new(SamplerInner {
                gate,
                store: Mutex::new(AggregationStore::new()),
                hook,
            }),
        }
    }

    pub fn with_interval(interval: u64) -> Result<Self> {
        SamplerBuilder::new().interval(interval).build()
    }

    pub fn with_config(config: SamplerConfig) -> Result<Self> {
        SamplerBuilder::new().with_config(config).build()
    }

    pub fn builder() -> SamplerBuilder {
        SamplerBuilder::new()
    }

    pub fn interval(&self) -> u64 {
        self.inner.gate.interval()
    }

    /// Allocations observed in the current cycle, sampled or not.
    pub fn allocation_count(&self) -> u64 {
        self.inner.gate.allocation_count()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.gate.is_open()
    }

    /// Whether two handles refer to the same sampler.
    pub fn same_as(&self, other: &AllocationSampler) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts a new cycle, discarding the results of the previous one.
    ///
    /// Enabling an enabled sampler resets it. Events accepted before the new
    /// cycle starts are never filed into it.
    pub fn enable(&self) -> Result<()> {
        let _guard = ReentryGuard::enter();
        if let Some(hook) = self.inner.hook {
            hook.start_observing(self)?;
        }

        let mut store = match self.inner.store.lock() {
            Ok(store) => store,
            Err(poisoned) => {
                self.inner.store.clear_poison();
                poisoned.into_inner()
            }
        };
        store.reset();
        let was_enabled = self.inner.gate.open();
        drop(store);

        if was_enabled {
            debug!("Allocation sampler re-enabled, previous samples discarded");
        } else {
            info!(
                "Allocation sampler enabled (interval {})",
                self.interval()
            );
        }
        Ok(())
    }

    /// Freezes the current cycle. Once this returns, neither the allocation
    /// count nor the results change.
    pub fn disable(&self) -> Result<()> {
        let _guard = ReentryGuard::enter();
        {
            let _store = self
                .inner
                .store
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !self.inner.gate.close() {
                return Err(SamplerError::NotEnabled);
            }
        }

        if let Some(hook) = self.inner.hook {
            hook.stop_observing(self);
        }

        info!(
            "Allocation sampler disabled after {} allocations",
            self.allocation_count()
        );
        Ok(())
    }

    /// Counts one observed allocation and decides whether to record it.
    ///
    /// Returns the cycle to pass to [`record`], or `None` when the event is
    /// skipped. Events are not counted while disabled.
    ///
    /// [`record`]: AllocationSampler::record
    pub fn should_sample(&self) -> Option<Cycle> {
        self.inner.gate.should_sample()
    }

    /// Files a sampled allocation accepted by [`should_sample`] in `cycle`.
    ///
    /// The sample is discarded when the sampler was disabled or re-enabled in
    /// the meantime.
    ///
    /// [`should_sample`]: AllocationSampler::should_sample
    pub fn record(&self, cycle: Cycle, type_name: &str, stack: &StackPath) -> Result<()> {
        self.with_store(|store| {
            // `enable` and `disable` move the gate while holding the store lock.
            if self.inner.gate.accepts(cycle) {
                store.record(type_name, stack);
            }
        })
    }

    /// Entry point for hosts that already hold the full stack.
    pub fn on_allocation(&self, type_name: &str, stack: &StackPath) -> Result<()> {
        match self.should_sample() {
            Some(cycle) => self.record(cycle, type_name, stack),
            None => Ok(()),
        }
    }

    /// Runs `f` under the store lock, with this thread's allocations hidden
    /// from the hook.
    fn with_store<T>(&self, f: impl FnOnce(&mut AggregationStore) -> T) -> Result<T> {
        let _guard = ReentryGuard::enter();
        let mut store = self.inner.store.lock().map_err(|_| SamplerError::Poisoned)?;
        Ok(f(&mut store))
    }

    /// Samples filed in the current cycle.
    pub fn sample_count(&self) -> Result<u64> {
        self.with_store(|store| store.sample_count())
    }

    /// Sampled events that carried no frames.
    pub fn dropped_samples(&self) -> Result<u64> {
        self.with_store(|store| store.dropped_samples())
    }

    pub fn raw_result(&self) -> Result<BTreeMap<String, TypeAggregation>> {
        self.with_store(|store| store.raw_result())
    }

    /// type name -> file -> line -> samples.
    pub fn per_location_counts(&self) -> Result<LocationCounts> {
        self.with_store(|store| query::per_location_counts(store))
    }

    /// Same as [`per_location_counts`](AllocationSampler::per_location_counts).
    pub fn result(&self) -> Result<LocationCounts> {
        self.per_location_counts()
    }

    pub fn heaviest_locations(&self) -> Result<Vec<LocationEntry>> {
        self.with_store(|store| query::heaviest_locations(store))
    }

    pub fn report(&self) -> Result<SamplerReport> {
        self.with_store(|store| SamplerReport {
            interval: self.interval(),
            allocation_count: self.allocation_count(),
            sample_count: store.sample_count(),
            dropped_samples: store.dropped_samples(),
            locations: query::heaviest_locations(store),
        })
    }
}

impl Default for AllocationSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use pretty_assertions::assert_eq;
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };

    fn at(line: u32) -> StackPath {
        StackPath::new(vec![
            Frame::new("<main>", "<compiled>", 1),
            Frame::new("block", "<compiled>", line),
        ])
    }

    #[test]
    fn default_interval_is_one() {
        assert_eq!(AllocationSampler::new().interval(), 1);
        assert_eq!(AllocationSampler::with_interval(10).unwrap().interval(), 10);
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(
            AllocationSampler::with_interval(0),
            Err(SamplerError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn disabled_sampler_ignores_events() {
        let sampler = AllocationSampler::new();
        sampler.on_allocation("Object", &at(1)).unwrap();
        assert_eq!(sampler.allocation_count(), 0);
        assert!(sampler.per_location_counts().unwrap().is_empty());
    }

    #[test]
    fn events_after_disable_are_not_recorded() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        sampler.on_allocation("Object", &at(1)).unwrap();
        sampler.disable().unwrap();
        sampler.on_allocation("Object", &at(2)).unwrap();

        let counts = sampler.per_location_counts().unwrap();
        assert_eq!(counts["Object"]["<compiled>"], BTreeMap::from([(1, 1)]));
    }

    #[test]
    fn disable_twice_reports_not_enabled() {
        let sampler = AllocationSampler::new();
        assert!(matches!(sampler.disable(), Err(SamplerError::NotEnabled)));
        sampler.enable().unwrap();
        sampler.disable().unwrap();
        assert!(matches!(sampler.disable(), Err(SamplerError::NotEnabled)));
    }

    #[test]
    fn enable_resets_previous_cycle() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        sampler.on_allocation("Object", &at(1)).unwrap();
        sampler.disable().unwrap();

        sampler.enable().unwrap();
        sampler.on_allocation("String", &at(2)).unwrap();
        sampler.disable().unwrap();

        let counts = sampler.per_location_counts().unwrap();
        assert_eq!(counts.keys().collect::<Vec<_>>(), vec!["String"]);
        assert_eq!(sampler.allocation_count(), 1);
        assert_eq!(sampler.sample_count().unwrap(), 1);
    }

    #[test]
    fn re_enable_while_enabled_resets() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        sampler.on_allocation("Object", &at(1)).unwrap();
        sampler.enable().unwrap();
        assert!(sampler.is_enabled());
        assert_eq!(sampler.allocation_count(), 0);
        assert_eq!(sampler.sample_count().unwrap(), 0);
    }

    #[test]
    fn event_accepted_before_re_enable_is_discarded() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        let stale = sampler.should_sample().unwrap();

        sampler.enable().unwrap();
        sampler.record(stale, "Object", &at(1)).unwrap();

        assert_eq!(sampler.sample_count().unwrap(), 0);
        assert_eq!(sampler.allocation_count(), 0);
        assert!(sampler.per_location_counts().unwrap().is_empty());
    }

    #[test]
    fn event_accepted_before_disable_is_discarded() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        let pending = sampler.should_sample().unwrap();
        sampler.disable().unwrap();

        sampler.record(pending, "Object", &at(1)).unwrap();
        assert!(sampler.should_sample().is_none());
        assert_eq!(sampler.sample_count().unwrap(), 0);
        assert_eq!(sampler.allocation_count(), 1);
    }

    #[test]
    fn re_enabling_under_load_keeps_cycles_apart() {
        let sampler = AllocationSampler::new();
        let stop = Arc::new(AtomicBool::new(false));
        sampler.enable().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let sampler = sampler.clone();
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        sampler.on_allocation("Object", &at(worker + 1)).unwrap();
                    }
                })
            })
            .collect();

        for _ in 0..50 {
            sampler.enable().unwrap();
            thread::yield_now();
        }
        sampler.disable().unwrap();

        // Every sample in the last cycle was counted in it.
        let counted = sampler.allocation_count();
        let sampled = sampler.sample_count().unwrap();
        assert!(sampled <= counted, "{sampled} samples for {counted} events");
        assert!(sampler.raw_result().unwrap().values().all(|a| a.tree().counts_are_consistent()));

        // Workers still running do not move a disabled sampler.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(sampler.allocation_count(), counted);
        assert_eq!(sampler.sample_count().unwrap(), sampled);

        stop.store(true, Ordering::Relaxed);
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn empty_stacks_are_counted_as_dropped() {
        let sampler = AllocationSampler::new();
        sampler.enable().unwrap();
        sampler
            .on_allocation("Object", &StackPath::default())
            .unwrap();
        sampler.disable().unwrap();
        assert_eq!(sampler.allocation_count(), 1);
        assert_eq!(sampler.dropped_samples().unwrap(), 1);
        assert_eq!(sampler.sample_count().unwrap(), 0);
    }

    #[test]
    fn concurrent_recording_keeps_counts_consistent() {
        let sampler = AllocationSampler::with_interval(3).unwrap();
        sampler.enable().unwrap();

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let sampler = sampler.clone();
                thread::spawn(move || {
                    for _ in 0..300 {
                        sampler.on_allocation("Object", &at(worker + 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        sampler.disable().unwrap();

        assert_eq!(sampler.allocation_count(), 1200);
        assert_eq!(sampler.sample_count().unwrap(), 400);
        let raw = sampler.raw_result().unwrap();
        assert!(raw["Object"].tree().counts_are_consistent());
        assert_eq!(raw["Object"].sample_count(), 400);
    }

    #[test]
    fn clones_share_state() {
        let sampler = AllocationSampler::new();
        let other = sampler.clone();
        sampler.enable().unwrap();
        assert!(other.is_enabled());
        assert!(sampler.same_as(&other));
        assert!(!sampler.same_as(&AllocationSampler::new()));
    }
}
