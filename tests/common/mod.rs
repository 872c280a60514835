//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use msgpipe_rs::Step;
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// Upper bound for any single pipeline run in tests
pub fn run_timeout() -> Duration {
    Duration::from_secs(20)
}

/// Directory holding the given step files
pub fn step_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("create step dir");
    for (name, content) in files {
        std::fs::write(dir.path().join(name), content).expect("write step file");
    }
    dir
}

pub fn steps(names: &[&str]) -> Vec<Step> {
    names.iter().copied().map(Step::from).collect()
}

/// Read an output file, failing the test if it is missing
pub fn read_output(dir: &Path, name: &str) -> String {
    let path = dir.join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("read {:?}: {}", path, e))
}

/// An address that was free a moment ago
pub fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    listener.local_addr().expect("probe address").to_string()
}
