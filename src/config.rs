/// Default sampling interval: every allocation is recorded.
pub const DEFAULT_INTERVAL: u64 = 1;

/// Controls how often observed allocations are recorded.
///
/// The interval is validated when a sampler is built from the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    /// Record every `interval`-th observed allocation.
    pub interval: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl SamplerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_interval_is_one() {
        assert_eq!(SamplerConfig::default().interval, 1);
        assert_eq!(SamplerConfig::new().with_interval(10).interval, 10);
    }
}
