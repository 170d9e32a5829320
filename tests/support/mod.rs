//! Shared fixtures: an in-memory remote and sync managers wired to it.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use mailround_sync::{MemoryServer, SyncConfig, SyncManager};

pub const ROOT: &str = "mem://couch/";

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` to filter).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A remote server holding `databases`, plus a manager that only replicates
/// when told to.
pub fn manual(databases: &[&str]) -> (MemoryServer, Arc<SyncManager>) {
    init_tracing();
    let server = server(databases);
    let manager = SyncManager::new(SyncConfig::new(ROOT).manual(), Arc::new(server.clone()));
    (server, Arc::new(manager))
}

/// Like [`manual`], with background replication every few milliseconds.
pub fn continuous(databases: &[&str]) -> (MemoryServer, Arc<SyncManager>) {
    init_tracing();
    let server = server(databases);
    let config = SyncConfig::new(ROOT).with_interval(Duration::from_millis(5));
    let manager = SyncManager::new(config, Arc::new(server.clone()));
    (server, Arc::new(manager))
}

fn server(databases: &[&str]) -> MemoryServer {
    let server = MemoryServer::new();
    for name in databases {
        server.create_database(&url(name));
    }
    server
}

pub fn url(name: &str) -> String {
    format!("{}{}", ROOT, name)
}

/// Poll `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
