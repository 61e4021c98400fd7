use std::cell::Cell;

thread_local! {
    static IN_PROFILER: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running profiler code. While it is held,
/// allocations made on this thread go straight to the system allocator.
///
/// `enter` returns `None` when the thread is already marked, or when its
/// thread-local storage is gone during teardown.
pub(crate) struct ReentryGuard;

impl ReentryGuard {
    pub(crate) fn enter() -> Option<Self> {
        IN_PROFILER
            .try_with(|flag| {
                if flag.get() {
                    None
                } else {
                    flag.set(true);
                    Some(ReentryGuard)
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_PROFILER.try_with(|flag| flag.set(false));
    }
}
