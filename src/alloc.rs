use std::{
    alloc::{GlobalAlloc, Layout, System},
    path::Path,
    sync::RwLock,
};

use log::debug;

use crate::{
    error::{Result, SamplerError},
    frame::{Frame, NativeFrame, StackPath},
    reentry::ReentryGuard,
    sampler::{AllocationHook, AllocationSampler},
};

const DEFAULT_MAX_FRAMES: usize = 128;

/// A global allocator that delivers allocations to an attached
/// [`AllocationSampler`].
///
/// ```rust
/// use allocation_sampler::{AllocationSampler, SamplingAllocator};
///
/// #[global_allocator]
/// static ALLOCATOR: SamplingAllocator = SamplingAllocator::new();
///
/// fn foo() -> Vec<u8> {
///     Vec::with_capacity(1024)
/// }
///
/// fn main() {
///     let sampler = AllocationSampler::builder()
///         .interval(1)
///         .hook(&ALLOCATOR)
///         .build()
///         .unwrap();
///
///     sampler.enable().unwrap();
///     let _buffer = foo();
///     sampler.disable().unwrap();
///
///     assert!(sampler.allocation_count() >= 1);
/// }
/// ```
///
/// Allocations are classified by size, as `alloc[<size>B]`, since a global
/// allocator only sees a [`Layout`].
pub struct SamplingAllocator {
    alloc: System,
    observed: RwLock<Option<AllocationSampler>>,
    max_frames: usize,
}

impl Default for SamplingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SamplingAllocator {
    pub const fn new() -> Self {
        Self::with_max_frames(DEFAULT_MAX_FRAMES)
    }

    /// Limit how many frames are captured per sampled allocation.
    pub const fn with_max_frames(max_frames: usize) -> Self {
        SamplingAllocator {
            alloc: System,
            observed: RwLock::new(None),
            max_frames,
        }
    }

    fn observe(&self, layout: &Layout) {
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        // Held for the whole delivery: `stop_observing` waits for it.
        let Ok(observed) = self.observed.read() else {
            return;
        };
        let Some(sampler) = observed.as_ref() else {
            return;
        };
        let Some(cycle) = sampler.should_sample() else {
            return;
        };

        let stack = capture_stack(self.max_frames);
        // A poisoned store already invalidates the cycle; an allocator has no
        // way to report it.
        let _ = sampler.record(cycle, &size_class(layout), &stack);
    }
}

fn size_class(layout: &Layout) -> String {
    format!("alloc[{}B]", layout.size())
}

fn capture_stack(max_frames: usize) -> StackPath {
    let mut frames: Vec<Frame> = Vec::new();

    backtrace::trace(|frame| {
        backtrace::resolve_frame(frame, |symbol| {
            let native = NativeFrame {
                filename: symbol.filename().map(Path::to_path_buf),
                lineno: symbol.lineno(),
                fn_name: symbol
                    .name()
                    .and_then(|name| name.as_str())
                    .map(str::to_string),
            };
            if let Ok(frame) = Frame::try_from(native)
                && !is_profiler_frame(&frame)
            {
                frames.push(frame);
            }
        });
        frames.len() < max_frames
    });

    frames.truncate(max_frames);
    StackPath::from_innermost(frames)
}

/// Frames of the sampler, the stack walker and the allocation shims.
fn is_profiler_frame(frame: &Frame) -> bool {
    const PATHS: &[&str] = &["allocation_sampler", "backtrace", "alloc::alloc", "std::alloc"];

    if frame.method.starts_with("__rust_") || frame.method.starts_with("__rdl_") {
        return true;
    }
    let Some(owner) = frame.owner.as_deref() else {
        return false;
    };
    let owner = owner.strip_prefix('<').unwrap_or(owner);
    PATHS.iter().any(|path| {
        owner
            .strip_prefix(path)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

impl AllocationHook for SamplingAllocator {
    fn start_observing(&self, sampler: &AllocationSampler) -> Result<()> {
        let _guard = ReentryGuard::enter();
        {
            let mut observed = self.observed.write().map_err(|_| SamplerError::Poisoned)?;
            match observed.as_ref() {
                Some(current) if current.same_as(sampler) => {}
                Some(_) => return Err(SamplerError::AlreadyObserving),
                None => *observed = Some(sampler.clone()),
            }
        }
        debug!("Allocator hook attached");
        Ok(())
    }

    fn stop_observing(&self, sampler: &AllocationSampler) {
        let _guard = ReentryGuard::enter();
        let detached = match self.observed.write() {
            Ok(mut observed) if observed.as_ref().is_some_and(|s| s.same_as(sampler)) => {
                observed.take()
            }
            _ => None,
        };
        if detached.is_some() {
            debug!("Allocator hook detached");
        }
    }
}

unsafe impl GlobalAlloc for SamplingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.observe(&layout);
        unsafe { self.alloc.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.alloc.dealloc(ptr, layout) }
    }
}
