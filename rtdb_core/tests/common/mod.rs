//! Shared test fixture: a fresh segment in a temp directory plus
//! registered connections on it.

use rtdb_core::alloc::AllocKind;
use rtdb_core::shm::{SegmentConfig, SegmentView};
use rtdb_core::sync::LockMode;
use rtdb_core::{ConnectOptions, Connection};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestDb {
    // owns the segment file for the test's lifetime
    _dir: TempDir,
    pub view: Arc<SegmentView>,
}

impl TestDb {
    pub fn new() -> TestDb {
        Self::with_config(SegmentConfig {
            lock_mode: LockMode::Emulated,
            alloc_kind: AllocKind::FreeList,
            min_grace: Duration::from_millis(50),
            ..SegmentConfig::default()
        })
    }

    pub fn with_config(cfg: SegmentConfig) -> TestDb {
        let dir = tempfile::tempdir().unwrap();
        let view = Arc::new(SegmentView::create(&dir.path().join("db"), &cfg).unwrap());
        view.mark_ready();
        TestDb { _dir: dir, view }
    }

    pub fn connect(&self, process_name: &str) -> Connection {
        Connection::register_on(
            self.view.clone(),
            &ConnectOptions::new("test", process_name).cycle(Duration::from_millis(10)),
        )
        .unwrap()
    }

    pub fn connect_admin(&self, process_name: &str) -> Connection {
        Connection::register_on(
            self.view.clone(),
            &ConnectOptions::new("test", process_name)
                .cycle(Duration::from_millis(10))
                .admin(),
        )
        .unwrap()
    }
}
