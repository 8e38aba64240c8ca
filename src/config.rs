//! Module-wide tunables.
//!
//! Mirrors the kernel module's load-time parameters
//! (`examples/original_source/module/params.c`): a single read-mostly
//! struct, sanity-checked once at construction rather than validated on
//! every use.

/// Engine-wide configuration. All fields are validated and silently
/// clamped to sane minima by [`SnapshotEngineConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotEngineConfig {
    /// Smallest CBT block shift (2^shift bytes per tracked block).
    pub tracking_block_minimum_shift: u32,
    /// Largest CBT block shift the adaptive sizing will grow to.
    pub tracking_block_maximum_shift: u32,
    /// Upper bound on the number of CBT blocks before the shift grows.
    pub tracking_block_maximum_count: u64,
    /// Smallest chunk shift (2^shift bytes per chunk).
    pub chunk_minimum_shift: u32,
    /// Largest chunk shift the adaptive sizing will grow to.
    pub chunk_maximum_shift: u32,
    /// `log2` of the maximum chunk count before the shift grows.
    pub chunk_maximum_count_shift: u32,
    /// Maximum chunks the store queue will hold before backpressure.
    pub chunk_maximum_in_queue: usize,
    /// Maximum number of idle chunk buffers kept for reuse.
    pub free_diff_buffer_pool_size: usize,
    /// Minimum diff-storage grow increment, in sectors.
    pub diff_storage_minimum: u64,
}

impl Default for SnapshotEngineConfig {
    fn default() -> Self {
        Self {
            tracking_block_minimum_shift: 16,
            tracking_block_maximum_shift: 26,
            tracking_block_maximum_count: 2_097_152,
            chunk_minimum_shift: 18,
            chunk_maximum_shift: 26,
            chunk_maximum_count_shift: 40,
            chunk_maximum_in_queue: 16,
            free_diff_buffer_pool_size: 128,
            diff_storage_minimum: 2_097_152,
        }
    }
}

impl SnapshotEngineConfig {
    /// Clamp every field to the minima the engine can actually operate
    /// with, rather than rejecting a bad module parameter outright.
    pub fn validate(mut self) -> Self {
        let defaults = Self::default();

        if self.tracking_block_minimum_shift < 12 {
            self.tracking_block_minimum_shift = 12;
        }
        if self.tracking_block_maximum_shift < self.tracking_block_minimum_shift {
            self.tracking_block_maximum_shift = self.tracking_block_minimum_shift;
        }
        if self.tracking_block_maximum_count == 0 {
            self.tracking_block_maximum_count = defaults.tracking_block_maximum_count;
        }

        if self.chunk_minimum_shift < 12 {
            self.chunk_minimum_shift = 12;
        }
        if self.chunk_maximum_shift < self.chunk_minimum_shift {
            self.chunk_maximum_shift = self.chunk_minimum_shift;
        }
        if self.chunk_maximum_count_shift == 0 {
            self.chunk_maximum_count_shift = defaults.chunk_maximum_count_shift;
        }
        if self.chunk_maximum_in_queue == 0 {
            self.chunk_maximum_in_queue = 1;
        }
        if self.free_diff_buffer_pool_size == 0 {
            self.free_diff_buffer_pool_size = 1;
        }
        if self.diff_storage_minimum == 0 {
            self.diff_storage_minimum = defaults.diff_storage_minimum;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_already_valid() {
        let cfg = SnapshotEngineConfig::default();
        assert_eq!(cfg, cfg.validate());
    }

    #[test]
    fn zeroed_fields_are_clamped_to_usable_minima() {
        let cfg = SnapshotEngineConfig {
            tracking_block_minimum_shift: 0,
            tracking_block_maximum_shift: 0,
            tracking_block_maximum_count: 0,
            chunk_minimum_shift: 0,
            chunk_maximum_shift: 0,
            chunk_maximum_count_shift: 0,
            chunk_maximum_in_queue: 0,
            free_diff_buffer_pool_size: 0,
            diff_storage_minimum: 0,
        }
        .validate();

        assert!(cfg.tracking_block_minimum_shift >= 12);
        assert!(cfg.tracking_block_maximum_shift >= cfg.tracking_block_minimum_shift);
        assert!(cfg.tracking_block_maximum_count > 0);
        assert!(cfg.chunk_minimum_shift >= 12);
        assert!(cfg.chunk_maximum_shift >= cfg.chunk_minimum_shift);
        assert!(cfg.chunk_maximum_count_shift > 0);
        assert!(cfg.chunk_maximum_in_queue > 0);
        assert!(cfg.free_diff_buffer_pool_size > 0);
        assert!(cfg.diff_storage_minimum > 0);
    }
}
