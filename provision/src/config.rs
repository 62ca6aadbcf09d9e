// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for working with provisioning configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use provision_common::logging::ConfigLogging;
use provision_common::poll::PollPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Configuration for the provisioning engine
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Configuration for the provisioning log
    #[serde(default)]
    pub log: ConfigLogging,
    /// Directory holding local state; image metadata lives under
    /// `<conf_dir>/images`.
    pub conf_dir: Utf8PathBuf,
    /// Public key installed for root on every disk created from a
    /// distribution or image.
    pub root_ssh_key: Utf8PathBuf,
    /// Polling for remote jobs.
    #[serde(default = "PollPolicy::remote_job")]
    pub jobs: PollPolicy,
    /// Polling for a booted node to answer before it is provisioned.
    #[serde(default = "PollPolicy::reachability")]
    pub reachability: PollPolicy,
    #[serde(default)]
    pub temporary_node: TemporaryNodeConfig,
    pub ansible: Option<AnsibleConfig>,
}

/// Shape of the single-use node booted to build an image
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TemporaryNodeConfig {
    pub plan_id: u32,
    pub boot_disk_size: u32,
    pub group: String,
}

impl Default for TemporaryNodeConfig {
    fn default() -> Self {
        TemporaryNodeConfig {
            plan_id: 1,
            boot_disk_size: 5000,
            group: String::from("temporary"),
        }
    }
}

/// Settings for [`AnsibleProvisioner`](crate::provisioner::AnsibleProvisioner)
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnsibleConfig {
    pub playbook: Utf8PathBuf,
    #[serde(default = "default_remote_user")]
    pub user: String,
    /// Passed to the playbook as JSON with `-e`.
    #[serde(default)]
    pub extra_vars: BTreeMap<String, serde_json::Value>,
    /// Command used to check that a node answers.
    #[serde(default = "default_ansible")]
    pub ansible: Utf8PathBuf,
    /// Command used to run the playbook.
    #[serde(default = "default_ansible_playbook")]
    pub ansible_playbook: Utf8PathBuf,
}

impl AnsibleConfig {
    /// Settings for running `playbook` with the `ansible` tools on `PATH`.
    pub fn new(playbook: Utf8PathBuf) -> AnsibleConfig {
        AnsibleConfig {
            playbook,
            user: default_remote_user(),
            extra_vars: BTreeMap::new(),
            ansible: default_ansible(),
            ansible_playbook: default_ansible_playbook(),
        }
    }
}

fn default_remote_user() -> String {
    String::from("root")
}

fn default_ansible() -> Utf8PathBuf {
    Utf8PathBuf::from("ansible")
}

fn default_ansible_playbook() -> Utf8PathBuf {
    Utf8PathBuf::from("ansible-playbook")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        Ok(config)
    }

    /// A configuration rooted at `conf_dir` with every other setting at its
    /// default.
    pub fn new(conf_dir: Utf8PathBuf, root_ssh_key: Utf8PathBuf) -> Self {
        Config {
            log: ConfigLogging::default(),
            conf_dir,
            root_ssh_key,
            jobs: PollPolicy::remote_job(),
            reachability: PollPolicy::reachability(),
            temporary_node: TemporaryNodeConfig::default(),
            ansible: None,
        }
    }
}
