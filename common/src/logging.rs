// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration (the `[log]` table of a provisioning config file)

use crate::FileKv;
use serde::Deserialize;
use serde::Deserializer;
use slog::Drain;
use slog::Level;
use slog::Logger;
use slog::o;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

/// `name` field of every record written to a log file
const BUNYAN_NAME: &str = "node-provision";

#[derive(Debug, thiserror::Error)]
pub enum LogInitError {
    #[error("Failed to open log file {path}")]
    Open {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Where provisioning runs log, and from which level on
///
/// ```toml
/// [log]
/// mode = "file"
/// level = "debug"
/// path = "/var/log/provision.log"
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ConfigLogging {
    /// Human-readable records on stderr.
    StderrTerminal {
        #[serde(deserialize_with = "deserialize_level")]
        level: Level,
    },

    /// Bunyan records appended to `path`, or written over it with
    /// `truncate`.
    File {
        #[serde(deserialize_with = "deserialize_level")]
        level: Level,
        path: PathBuf,
        #[serde(default)]
        truncate: bool,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: Level::Info }
    }
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    Level::from_str(&name).map_err(|()| {
        serde::de::Error::custom(format!("unknown log level {name:?}"))
    })
}

impl ConfigLogging {
    pub fn level(&self) -> Level {
        match self {
            ConfigLogging::StderrTerminal { level }
            | ConfigLogging::File { level, .. } => *level,
        }
    }

    /// Builds the root logger for a provisioning run.
    pub fn to_logger(&self) -> Result<Logger, LogInitError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator =
                    slog_term::TermDecorator::new().stderr().build();
                let drain = slog_term::FullFormat::new(decorator).build();
                Ok(root_logger(*level, drain))
            }
            ConfigLogging::File { level, path, truncate } => {
                let drain = file_drain(path, *truncate)?;
                Ok(root_logger(*level, drain))
            }
        }
    }
}

// Job waits log from their own tasks, so records go through an async drain.
fn root_logger<D>(level: Level, drain: D) -> Logger
where
    D: Drain + Send + 'static,
    D::Err: std::fmt::Debug,
{
    let drain = drain.filter_level(level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!("pid" => std::process::id(), FileKv))
}

fn file_drain(
    path: &Path,
    truncate: bool,
) -> Result<slog_json::Json<std::fs::File>, LogInitError> {
    let open_err = |err| LogInitError::Open { path: path.to_path_buf(), err };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(open_err)?;
    }

    let mut options = OpenOptions::new();
    options.create(true);
    if truncate {
        options.write(true).truncate(true);
    } else {
        options.append(true);
    }
    let file = options.open(path).map_err(open_err)?;
    Ok(slog_bunyan::with_name(BUNYAN_NAME, file).build())
}
