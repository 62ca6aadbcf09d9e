// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities intended for development tools and the test suite.  These should
//! not be used in production code.

use anyhow::Context;
use camino::Utf8Path;
use camino_tempfile::Utf8TempDir;
use provision_common::logging::ConfigLogging;
use slog::Level;
use slog::Logger;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

/// Name of the directory (under the system temporary directory) that
/// receives per-test log files.
const TEST_LOG_DIR: &str = "node-provision-test-logs";

/// Distinguishes the log files of tests in one process that share a name.
static TEST_LOG_ID: AtomicU32 = AtomicU32::new(0);

/// A logger for a single test, backed by its own file
///
/// Tests that pass call [`LogContext::cleanup_successful`] to remove the
/// file.  A failing test leaves it behind for inspection, and its location is
/// printed to stderr when the logger is created.
pub struct LogContext {
    pub log: Logger,
    log_path: PathBuf,
}

impl LogContext {
    /// Removes the log file of a test that passed.
    pub fn cleanup_successful(self) {
        let LogContext { log, log_path } = self;
        // Flush the async drain before the file goes away.
        drop(log);
        remove_log_file(&log_path).unwrap();
    }
}

fn remove_log_file(path: &std::path::Path) -> Result<(), anyhow::Error> {
    std::fs::remove_file(path)
        .with_context(|| format!("Failed to remove log {}", path.display()))
}

/// Set up a [`LogContext`] appropriate for a test named `test_name`
pub fn test_setup_log(test_name: &str) -> LogContext {
    let id = TEST_LOG_ID.fetch_add(1, Ordering::SeqCst);
    let log_path = std::env::temp_dir()
        .join(TEST_LOG_DIR)
        .join(format!("{test_name}.{}.{id}.log", std::process::id()));
    eprintln!("log file: {}", log_path.display());

    let log_config = ConfigLogging::File {
        level: Level::Trace,
        path: log_path.clone(),
        truncate: true,
    };
    let log = log_config.to_logger().expect("failed to create test logger");
    LogContext { log, log_path }
}

/// Creates an empty configuration directory, as used to hold image
/// metadata, that is removed when the returned handle is dropped.
pub fn test_setup_conf_dir() -> Utf8TempDir {
    camino_tempfile::Builder::new()
        .prefix("node-provision-conf.")
        .tempdir()
        .expect("failed to create temporary configuration directory")
}

/// Lists the entries under `dir`, sorted by name.
pub fn list_dir(dir: &Utf8Path) -> Result<Vec<String>, anyhow::Error> {
    let mut names = Vec::new();
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("Failed to read_dir {dir}"))?
    {
        let entry =
            entry.with_context(|| format!("Failed to read entry in {dir}"))?;
        names.push(entry.file_name().to_owned());
    }
    names.sort();
    Ok(names)
}
