// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuring software on booted nodes

use crate::config::AnsibleConfig;
use crate::config::Config;
use crate::node::Node;
use async_trait::async_trait;
use provision_common::ids::NodeId;
use provision_common::poll::PollPolicy;
use regex::Regex;
use serde::Deserialize;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::process::Output;
use std::sync::LazyLock;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("Node {0} has no public address")]
    NoAddress(NodeId),

    #[error("Failed to run `{command}`")]
    Run {
        command: String,
        #[source]
        err: io::Error,
    },

    #[error("No playbook report in the output of `{command}`")]
    MissingReport { command: String },

    #[error("Failed to parse the playbook report of `{command}`")]
    ParseReport {
        command: String,
        #[source]
        err: serde_json::Error,
    },

    #[error("Failed to serialize playbook variables")]
    Variables(#[source] serde_json::Error),

    #[error("Provisioning {targets} failed: {reason}")]
    Failed { targets: String, reason: String },
}

/// Something that configures software on a booted node
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Waits for `node` to answer, checking at most `policy.poll_count()`
    /// times.  Returns whether it ever did.
    async fn wait_for_reachability(&self, node: &Node, policy: PollPolicy)
        -> bool;

    async fn provision(&self, node: &Node) -> Result<(), ProvisionerError>;
}

/// Renders hosts as an inline ansible inventory.
///
/// A lone host needs a trailing comma, or ansible takes it for an
/// inventory file.
pub fn format_targets(hosts: &[IpAddr]) -> String {
    match hosts {
        [host] => format!("{host},"),
        hosts => hosts
            .iter()
            .map(|host| host.to_string())
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Pulls the JSON report out of `ansible-playbook` output.
///
/// With the `json` stdout callback the report is printed as one block from a
/// line opening `{` followed by `"plays` to the first line that is only
/// `}`.  Warnings and debug output may surround it.
pub fn extract_json_output(output: &str) -> Option<&str> {
    static REPORT_START: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(?m)^\{[\n ]+"plays"#)
            .expect("playbook report start regex should be valid")
    });
    static REPORT_END: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^\}$")
            .expect("playbook report end regex should be valid")
    });

    let start = REPORT_START.find(output)?.start();
    let end = REPORT_END.find_at(output, start)?.end();
    Some(&output[start..end])
}

#[derive(Debug, Deserialize)]
struct PlaybookReport {
    #[serde(default)]
    stats: BTreeMap<String, HostStats>,
}

#[derive(Debug, Default, Deserialize)]
struct HostStats {
    #[serde(default)]
    ok: u64,
    #[serde(default)]
    changed: u64,
    #[serde(default)]
    failures: u64,
    #[serde(default)]
    unreachable: u64,
}

impl PlaybookReport {
    /// Hosts that had failed tasks or could not be reached.
    fn failed_hosts(&self) -> Vec<&str> {
        self.stats
            .iter()
            .filter(|(_, stats)| stats.failures > 0 || stats.unreachable > 0)
            .map(|(host, _)| host.as_str())
            .collect()
    }
}

fn command_line(command: &Command) -> String {
    let command = command.as_std();
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn run(command: &mut Command) -> Result<Output, ProvisionerError> {
    command.output().await.map_err(|err| ProvisionerError::Run {
        command: command_line(command),
        err,
    })
}

/// Provisions nodes by running an ansible playbook against them
pub struct AnsibleProvisioner {
    log: Logger,
    config: AnsibleConfig,
}

impl AnsibleProvisioner {
    pub fn new(log: &Logger, config: AnsibleConfig) -> AnsibleProvisioner {
        AnsibleProvisioner {
            log: log.new(o!("component" => "AnsibleProvisioner")),
            config,
        }
    }

    /// Builds the provisioner described by the `[ansible]` table of
    /// `config`, if there is one.
    pub fn from_config(
        log: &Logger,
        config: &Config,
    ) -> Option<AnsibleProvisioner> {
        config
            .ansible
            .clone()
            .map(|ansible| AnsibleProvisioner::new(log, ansible))
    }

    fn address(node: &Node) -> Result<IpAddr, ProvisionerError> {
        node.primary_public_ip().ok_or(ProvisionerError::NoAddress(node.id))
    }

    /// Checks once whether ansible can reach `node`.
    pub async fn ping(&self, node: &Node) -> Result<bool, ProvisionerError> {
        let target = format_targets(&[Self::address(node)?]);
        let mut command = Command::new(&self.config.ansible);
        command
            .args(["all", "-i", target.as_str()])
            .args(["-u", self.config.user.as_str(), "-m", "ping"])
            .env("ANSIBLE_HOST_KEY_CHECKING", "False");

        let output = run(&mut command).await?;
        debug!(self.log, "ping";
            "target" => &target,
            "status" => %output.status,
            "stdout" => String::from_utf8_lossy(&output.stdout).into_owned(),
        );
        Ok(output.status.success())
    }

    /// Runs the configured playbook against `hosts`.
    pub async fn exec_playbook(
        &self,
        hosts: &[IpAddr],
    ) -> Result<(), ProvisionerError> {
        let targets = format_targets(hosts);
        let mut command = Command::new(&self.config.ansible_playbook);
        command
            .arg(self.config.playbook.as_str())
            .args(["-i", targets.as_str(), "-u", self.config.user.as_str()]);
        if !self.config.extra_vars.is_empty() {
            let vars = serde_json::to_string(&self.config.extra_vars)
                .map_err(ProvisionerError::Variables)?;
            command.arg("-e").arg(vars);
        }
        command
            .env("ANSIBLE_STDOUT_CALLBACK", "json")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False");

        info!(self.log, "run playbook";
            "playbook" => %self.config.playbook,
            "targets" => &targets,
        );
        let output = run(&mut command).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(json) = extract_json_output(&stdout) else {
            if !output.status.success() {
                return Err(ProvisionerError::Failed {
                    targets,
                    reason: format!(
                        "{} exited with {}: {}",
                        self.config.ansible_playbook,
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ),
                });
            }
            return Err(ProvisionerError::MissingReport {
                command: command_line(&command),
            });
        };
        let report: PlaybookReport =
            serde_json::from_str(json).map_err(|err| {
                ProvisionerError::ParseReport {
                    command: command_line(&command),
                    err,
                }
            })?;

        for (host, stats) in &report.stats {
            info!(self.log, "playbook result";
                "host" => host,
                "ok" => stats.ok,
                "changed" => stats.changed,
                "failures" => stats.failures,
                "unreachable" => stats.unreachable,
            );
        }

        let failed = report.failed_hosts();
        if !failed.is_empty() {
            return Err(ProvisionerError::Failed {
                targets,
                reason: format!("failed hosts: {}", failed.join(", ")),
            });
        }
        if !output.status.success() {
            return Err(ProvisionerError::Failed {
                targets,
                reason: format!(
                    "{} exited with {}",
                    self.config.ansible_playbook, output.status
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for AnsibleProvisioner {
    async fn wait_for_reachability(
        &self,
        node: &Node,
        policy: PollPolicy,
    ) -> bool {
        for attempt in 1..=policy.poll_count() {
            tokio::time::sleep(policy.interval).await;
            match self.ping(node).await {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(self.log, "node not reachable yet";
                        "node_id" => node.id,
                        "attempt" => attempt,
                    );
                }
                Err(err) => {
                    warn!(self.log, "failed to ping node";
                        "node_id" => node.id,
                        "error" => %err,
                    );
                    return false;
                }
            }
        }
        false
    }

    async fn provision(&self, node: &Node) -> Result<(), ProvisionerError> {
        self.exec_playbook(&[Self::address(node)?]).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use provision_test_utils::dev::test_setup_log;

    const PLAYBOOK_OUTPUT: &str = r#" [WARNING]: provided hosts list is empty
Using /etc/ansible/ansible.cfg as config file
{
    "plays": [
        {
            "play": {"name": "all"},
            "tasks": []
        }
    ],
    "stats": {
        "198.51.0.7": {
            "changed": 3,
            "failures": 0,
            "ok": 9,
            "skipped": 1,
            "unreachable": 0
        }
    }
}
trailing noise
}
"#;

    #[test]
    fn test_extract_json_output() {
        let json = extract_json_output(PLAYBOOK_OUTPUT).unwrap();
        assert!(json.starts_with("{\n    \"plays\""));
        assert!(json.ends_with("\n}"));
        assert!(!json.contains("trailing noise"));

        let report: PlaybookReport = serde_json::from_str(json).unwrap();
        let stats = &report.stats["198.51.0.7"];
        assert_eq!((stats.ok, stats.changed), (9, 3));
        assert!(report.failed_hosts().is_empty());

        let output = "ERROR! the playbook could not be found";
        assert_eq!(extract_json_output(output), None);
    }

    #[test]
    fn test_failed_hosts() {
        let report: PlaybookReport = serde_json::from_str(
            r#"{
                "plays": [],
                "stats": {
                    "10.0.0.1": {"ok": 2, "failures": 1, "unreachable": 0},
                    "10.0.0.2": {"ok": 0, "failures": 0, "unreachable": 1},
                    "10.0.0.3": {"ok": 5, "failures": 0, "unreachable": 0}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(report.failed_hosts(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_format_targets() {
        let one: IpAddr = "198.51.100.4".parse().unwrap();
        let two: IpAddr = "198.51.100.5".parse().unwrap();
        assert_eq!(format_targets(&[one]), "198.51.100.4,");
        assert_eq!(format_targets(&[one, two]), "198.51.100.4,198.51.100.5");
    }

    // Stand-ins for the ansible tools, run by path from a scratch directory.
    struct FakeAnsible {
        dir: camino_tempfile::Utf8TempDir,
    }

    impl FakeAnsible {
        fn new() -> FakeAnsible {
            FakeAnsible { dir: camino_tempfile::Utf8TempDir::new().unwrap() }
        }

        fn path(&self, name: &str) -> Utf8PathBuf {
            self.dir.path().join(name)
        }

        fn script(&self, name: &str, body: &str) -> Utf8PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = self.path(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(
                &path,
                std::fs::Permissions::from_mode(0o755),
            )
            .unwrap();
            path
        }

        fn config(&self) -> AnsibleConfig {
            let mut config = AnsibleConfig::new(self.path("site.yml"));
            config.ansible = self.path("ansible");
            config.ansible_playbook = self.path("ansible-playbook");
            config
        }

        /// Lines appended to `name` by the scripts.
        fn lines(&self, name: &str) -> Vec<String> {
            match std::fs::read_to_string(self.path(name)) {
                Ok(contents) => contents.lines().map(String::from).collect(),
                Err(_) => Vec::new(),
            }
        }
    }

    fn booted_node(address: &str) -> Node {
        Node {
            id: NodeId::new(77),
            label: String::from("imaging-77"),
            group: String::from("temporary"),
            boot_disk_id: None,
            disks: Vec::new(),
            config_id: None,
            public_ips: vec![address.parse().unwrap()],
            private_ip: None,
            created: true,
            initialized: true,
        }
    }

    fn playbook_script(fake: &FakeAnsible, stats: &str) -> Utf8PathBuf {
        let args = fake.path("args");
        fake.script(
            "ansible-playbook",
            &format!(
                "echo \"$@\" >> {args}\n\
                 echo ' [WARNING]: noise before the report'\n\
                 cat <<'REPORT'\n\
                 {{\n    \"plays\": [],\n    \"stats\": {stats}\n}}\n\
                 REPORT"
            ),
        )
    }

    #[tokio::test]
    async fn test_exec_playbook_succeeds() {
        let logctx = test_setup_log("test_exec_playbook_succeeds");
        let fake = FakeAnsible::new();
        playbook_script(
            &fake,
            r#"{"198.51.0.7": {"ok": 9, "changed": 3, "failures": 0}}"#,
        );
        let mut config = fake.config();
        config
            .extra_vars
            .insert(String::from("cluster"), serde_json::json!("gluster"));
        let provisioner = AnsibleProvisioner::new(&logctx.log, config);

        provisioner.provision(&booted_node("198.51.0.7")).await.unwrap();

        let args = fake.lines("args");
        assert_eq!(
            args,
            vec![format!(
                "{} -i 198.51.0.7, -u root -e {{\"cluster\":\"gluster\"}}",
                fake.path("site.yml")
            )]
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_exec_playbook_reports_failed_hosts() {
        let logctx = test_setup_log("test_exec_playbook_reports_failed_hosts");
        let fake = FakeAnsible::new();
        playbook_script(
            &fake,
            r#"{
                "198.51.0.7": {"ok": 2, "failures": 1},
                "198.51.0.8": {"ok": 0, "unreachable": 1},
                "198.51.0.9": {"ok": 4}
            }"#,
        );
        let provisioner = AnsibleProvisioner::new(&logctx.log, fake.config());

        let hosts: [IpAddr; 3] = ["198.51.0.7", "198.51.0.8", "198.51.0.9"]
            .map(|host| host.parse().unwrap());
        let err = provisioner.exec_playbook(&hosts).await.unwrap_err();
        match err {
            ProvisionerError::Failed { targets, reason } => {
                assert_eq!(targets, "198.51.0.7,198.51.0.8,198.51.0.9");
                assert_eq!(reason, "failed hosts: 198.51.0.7, 198.51.0.8");
            }
            err => panic!("unexpected error: {err}"),
        }
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_exec_playbook_without_report() {
        let logctx = test_setup_log("test_exec_playbook_without_report");
        let fake = FakeAnsible::new();
        let provisioner = AnsibleProvisioner::new(&logctx.log, fake.config());
        let node = booted_node("198.51.0.7");

        fake.script(
            "ansible-playbook",
            "echo 'ERROR! the playbook could not be found' >&2\nexit 2",
        );
        match provisioner.provision(&node).await.unwrap_err() {
            ProvisionerError::Failed { targets, reason } => {
                assert_eq!(targets, "198.51.0.7,");
                assert!(reason.contains("exit status: 2"), "{reason}");
                assert!(reason.contains("could not be found"), "{reason}");
            }
            err => panic!("unexpected error: {err}"),
        }

        fake.script("ansible-playbook", "echo 'nothing to report'");
        let err = provisioner.provision(&node).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::MissingReport { .. }));

        let mut node = node;
        node.public_ips.clear();
        let err = provisioner.provision(&node).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::NoAddress(_)));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reachability_gives_up() {
        let logctx = test_setup_log("test_wait_for_reachability_gives_up");
        let fake = FakeAnsible::new();
        let pings = fake.path("pings");
        fake.script("ansible", &format!("echo \"$@\" >> {pings}\nexit 4"));
        let provisioner = AnsibleProvisioner::new(&logctx.log, fake.config());
        let policy = PollPolicy::reachability();

        let start = tokio::time::Instant::now();
        let node = booted_node("198.51.0.7");
        assert!(!provisioner.wait_for_reachability(&node, policy).await);
        assert_eq!(start.elapsed(), policy.timeout);

        let pings = fake.lines("pings");
        assert_eq!(pings.len(), usize::try_from(policy.poll_count()).unwrap());
        assert_eq!(pings[0], "all -i 198.51.0.7, -u root -m ping");
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reachability_succeeds() {
        let logctx = test_setup_log("test_wait_for_reachability_succeeds");
        let fake = FakeAnsible::new();
        let pings = fake.path("pings");
        // Answers from the third ping on.
        fake.script(
            "ansible",
            &format!("echo ping >> {pings}\n[ $(wc -l < {pings}) -ge 3 ]"),
        );
        let provisioner = AnsibleProvisioner::new(&logctx.log, fake.config());

        let node = booted_node("198.51.0.7");
        let policy = PollPolicy::reachability();
        assert!(provisioner.wait_for_reachability(&node, policy).await);
        assert_eq!(fake.lines("pings").len(), 3);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_reachability_without_ansible() {
        let logctx =
            test_setup_log("test_wait_for_reachability_without_ansible");
        let fake = FakeAnsible::new();
        let provisioner = AnsibleProvisioner::new(&logctx.log, fake.config());

        let node = booted_node("198.51.0.7");
        let err = provisioner.ping(&node).await.unwrap_err();
        assert!(matches!(err, ProvisionerError::Run { .. }));

        // A missing command is not worth retrying.
        let start = tokio::time::Instant::now();
        let policy = PollPolicy::reachability();
        assert!(!provisioner.wait_for_reachability(&node, policy).await);
        assert_eq!(start.elapsed(), policy.interval);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_from_config() {
        let logctx = test_setup_log("test_from_config");
        let mut config = Config::new(
            Utf8PathBuf::from("/var/lib/provision"),
            Utf8PathBuf::from("/root/.ssh/id_rsa.pub"),
        );
        let provisioner = AnsibleProvisioner::from_config(&logctx.log, &config);
        assert!(provisioner.is_none());

        config.ansible = Some(AnsibleConfig::new("site.yml".into()));
        let provisioner =
            AnsibleProvisioner::from_config(&logctx.log, &config).unwrap();
        assert_eq!(provisioner.config.playbook, "site.yml");
        assert_eq!(provisioner.config.ansible_playbook, "ansible-playbook");
        logctx.cleanup_successful();
    }

    #[test]
    fn test_command_line() {
        let mut command = Command::new("ansible");
        command.args(["all", "-m", "ping"]);
        assert_eq!(command_line(&command), "ansible all -m ping");
    }
}
