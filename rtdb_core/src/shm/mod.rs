//! Shared segment mapping and layout.

pub mod platform;
pub mod segment;

pub use platform::{has_native_shm, segment_path, shm_base_dir};
pub use segment::{SegmentConfig, SegmentHeader, SegmentView, ShmSegment, SEGMENT_MAGIC};
