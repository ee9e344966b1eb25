// src/defaults.rs

// I/O constants
pub const IO_BUFFER_SIZE: usize = 32 * 1024 * 1024 - 4096;
pub const IO_BUFFER_COUNT: usize = 3;
pub const MMAP_BATCH_SIZE: usize = 16 * 1024 * 1024;
pub const MMAP_BATCH_COUNT: usize = 3;
pub const WRITE_BUFFER_SIZE: usize = 16 * 1024 * 1024;
pub const WRITE_BUFFER_COUNT: usize = 2;

// Reads per supplier queue element
pub const READS_PER_ELEMENT: usize = 5_000;

// How far ahead one paired-file reader may get (in queue elements) before
// it is parked to let its sibling catch up.
pub const MAX_IMBALANCE: i32 = 2;

// Largest read we are prepared to handle anywhere in the pipeline
pub const MAX_READ_SIZE: usize = 10_000;

// Reads shorter than this are not worth seeding; they go straight to the
// unmapped path (or to the single-end fallback for pairs).
pub const MIN_READ_LENGTH: usize = 50;

// Alignment defaults
pub const DEFAULT_CONF_DIFF: u32 = 2;
pub const DEFAULT_MAX_HITS: u32 = 300;
pub const DEFAULT_MAX_DIST: u32 = 8;
pub const DEFAULT_MAX_SEEDS: u32 = 25;
pub const DEFAULT_ADAPTIVE_CONF_DIFF_THRESHOLD: u32 = 4;
pub const DEFAULT_MIN_SPACING: u32 = 50;
pub const DEFAULT_MAX_SPACING: u32 = 1_000;
pub const DEFAULT_EXTRA_SEARCH_DEPTH: u32 = 2;
pub const DEFAULT_MAX_BIG_HITS: u32 = 16_000;
pub const DEFAULT_LV_LIMIT: u64 = 1_000_000;
