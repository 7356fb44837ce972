use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stratum::engine::{EngineOptions, StorageEngine};
use tempfile::{tempdir, TempDir};

/// A scratch database location that survives engine restarts within one
/// test and is cleaned up when the test ends.
pub struct TestDb {
    pub db_path: PathBuf,
    pub log_path: PathBuf,
    _dir: TempDir,
}

pub fn test_db(name: &str) -> TestDb {
    let dir = tempdir().unwrap();
    TestDb {
        db_path: dir.path().join(format!("{name}.db")),
        log_path: dir.path().join(format!("{name}.log")),
        _dir: dir,
    }
}

pub fn open_engine(db: &TestDb, options: EngineOptions) -> Arc<StorageEngine> {
    StorageEngine::open(&db.db_path, &db.log_path, options).unwrap()
}

/// Small fan-out so a handful of keys already builds a multi-level tree,
/// and a fast detector so deadlock tests finish quickly.
pub fn small_tree_options() -> EngineOptions {
    EngineOptions {
        buffer_pool_size: 64,
        leaf_max_size: 4,
        internal_max_size: 4,
        cycle_detection_interval: Duration::from_millis(10),
        ..EngineOptions::default()
    }
}

/// A slow flusher timeout, for tests that need to observe the log buffer
/// before the background thread drains it on its own.
pub fn lazy_flush_options() -> EngineOptions {
    EngineOptions {
        buffer_pool_size: 16,
        log_timeout: Duration::from_secs(3600),
        ..EngineOptions::default()
    }
}
