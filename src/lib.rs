// public module: contains implementation details (hidden via pub(crate))
pub mod suballoc;

// allocator surface
pub use suballoc::ranges::{Allocation, Blocks, BlockInfo, Suballocator, DEFAULT_MAX_BLOCKS};

// stats
pub use suballoc::ranges::SuballocStats;

// errors
pub use suballoc::ranges::SuballocError;
