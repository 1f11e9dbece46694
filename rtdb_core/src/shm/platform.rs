// Platform shared-memory path abstraction
//
// Linux: /dev/shm/rtdb (tmpfs - RAM-backed)
// elsewhere: /tmp/rtdb (regular filesystem, still usable for IPC)

use std::path::{Path, PathBuf};

/// Base directory for RTDB segments.
pub fn shm_base_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/dev/shm/rtdb")
    }

    #[cfg(not(target_os = "linux"))]
    {
        PathBuf::from("/tmp/rtdb")
    }
}

/// Segment file path for a database name, under `base` (or the platform
/// default when `base` is `None`). The name is derived from a host/db
/// identifier by the caller; unsafe path characters are flattened.
pub fn segment_path(base: Option<&Path>, name: &str) -> PathBuf {
    let safe_name = name.replace(['/', ':'], "_");
    base.map(Path::to_path_buf)
        .unwrap_or_else(shm_base_dir)
        .join(format!("rtdb_{safe_name}"))
}

/// True on platforms with RAM-backed shared memory.
pub fn has_native_shm() -> bool {
    cfg!(target_os = "linux")
}
