// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating compute nodes

use crate::cloud::RootCredentials;
use crate::context::ProvisionContext;
use crate::disk::Disk;
use crate::disk::DiskRole;
use crate::disk::DiskSource;
use crate::disk::DiskSpecs;
use crate::disk::Filesystem;
use crate::image::ImageDiskRequest;
use crate::image::ImageError;
use crate::job::JobOutcome;
use crate::job::JobWait;
use crate::password::RootPassword;
use crate::undo::UndoAction;
use crate::undo::UndoLog;
use provision_common::api::ApiError;
use provision_common::ids::ConfigId;
use provision_common::ids::DiskId;
use provision_common::ids::JobId;
use provision_common::ids::NodeId;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::net::IpAddr;
use std::sync::Arc;

/// Placeholder in a requested label that is replaced by the node's id.
pub const NODE_ID_PLACEHOLDER: &str = "{node_id}";

/// Label of the boot configuration created for every node.
const CONFIG_LABEL: &str = "default";

/// Label of the boot disk when it is created from an image.
const BOOT_DISK_LABEL: &str = "boot";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Invalid node spec: {0}")]
    InvalidSpec(String),

    #[error("Failed to {step}")]
    Api {
        step: &'static str,
        #[source]
        err: ApiError,
    },

    #[error("Failed to create boot disk from image {label:?}")]
    ImageDisk {
        label: String,
        #[source]
        err: Box<ImageError>,
    },

    #[error("{} of {total} disk jobs did not succeed", failed.len())]
    DiskJobs { failed: Vec<JobOutcome>, total: usize },

    #[error("Boot job {job_id} did not succeed (finished: {})", wait.finished)]
    BootJob { job_id: JobId, wait: JobWait },
}

impl NodeError {
    fn api(step: &'static str) -> impl FnOnce(ApiError) -> NodeError {
        move |err| NodeError::Api { step, err }
    }
}

/// Where a node's boot disk comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootSource {
    Distribution(String),
    /// Label of an image in the metadata store
    Image(String),
}

/// Everything needed to create a node
#[derive(Clone, Debug, Deserialize)]
pub struct NodeSpec {
    pub plan_id: u32,
    pub datacenter: String,
    /// Exactly one of `distribution` and `image` must be given.
    #[serde(default)]
    pub distribution: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    pub kernel: String,
    /// May contain [`NODE_ID_PLACEHOLDER`].
    pub label: String,
    pub group: String,
    pub disks: DiskSpecs,
}

impl NodeSpec {
    pub fn boot_source(&self) -> Result<BootSource, NodeError> {
        match (&self.distribution, &self.image) {
            (Some(distribution), None) => {
                Ok(BootSource::Distribution(distribution.clone()))
            }
            (None, Some(image)) => Ok(BootSource::Image(image.clone())),
            (None, None) => Err(NodeError::InvalidSpec(String::from(
                "one of \"distribution\" or \"image\" is required",
            ))),
            (Some(_), Some(_)) => Err(NodeError::InvalidSpec(String::from(
                "only one of \"distribution\" or \"image\" may be given",
            ))),
        }
    }

    /// The label with the node id substituted in.
    pub fn label_for(&self, node_id: NodeId) -> String {
        self.label.replace(NODE_ID_PLACEHOLDER, &node_id.to_string())
    }
}

/// A node being built, or built, by [`NodeManager::create_node`]
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub label: String,
    pub group: String,
    pub boot_disk_id: Option<DiskId>,
    pub disks: Vec<Disk>,
    pub config_id: Option<ConfigId>,
    pub public_ips: Vec<IpAddr>,
    pub private_ip: Option<IpAddr>,
    /// The node exists on the provider.
    pub created: bool,
    /// Every creation step finished; the node is ready to use.
    pub initialized: bool,
}

impl Node {
    fn new(id: NodeId, label: String, group: String) -> Node {
        Node {
            id,
            label,
            group,
            boot_disk_id: None,
            disks: Vec::new(),
            config_id: None,
            public_ips: Vec::new(),
            private_ip: None,
            created: true,
            initialized: false,
        }
    }

    pub fn disk_ids(&self) -> Vec<DiskId> {
        self.disks.iter().map(|disk| disk.id).collect()
    }

    /// The first public address, which is what provisioners connect to.
    pub fn primary_public_ip(&self) -> Option<IpAddr> {
        self.public_ips.first().copied()
    }
}

/// Creates nodes: the node itself, its disks, its boot configuration and
/// addresses, and optionally boots it
pub struct NodeManager {
    log: Logger,
    ctx: Arc<ProvisionContext>,
}

impl NodeManager {
    pub fn new(ctx: Arc<ProvisionContext>) -> NodeManager {
        let log = ctx.log.new(o!("component" => "NodeManager"));
        NodeManager { log, ctx }
    }

    /// Creates a node described by `spec`.
    ///
    /// If any step after the node itself exists fails and `delete_on_error`
    /// is set, the node is deleted before returning the error.  Otherwise it
    /// is left in place for inspection.
    pub async fn create_node(
        &self,
        spec: &NodeSpec,
        boot: bool,
        delete_on_error: bool,
    ) -> Result<Node, NodeError> {
        let source = spec.boot_source()?;

        info!(self.log, "create node";
            "plan_id" => spec.plan_id,
            "datacenter" => &spec.datacenter,
        );
        let node_id = self
            .ctx
            .cloud
            .create_node(spec.plan_id, &spec.datacenter)
            .await
            .map_err(|err| {
                error!(self.log, "create node failed"; "error" => %err);
                NodeError::Api { step: "create node", err }
            })?;
        info!(self.log, "created node"; "node_id" => node_id);

        let log = self.log.new(o!("node_id" => node_id));
        let mut undo = UndoLog::new(&log);
        undo.push(UndoAction::DeleteNode(node_id));

        let mut node =
            Node::new(node_id, spec.label_for(node_id), spec.group.clone());
        match self.build_node(&log, &mut node, spec, &source, boot).await {
            Ok(()) => {
                undo.disarm();
                node.initialized = true;
                Ok(node)
            }
            Err(err) => {
                error!(log, "node creation failed"; "error" => %err);
                if delete_on_error {
                    undo.unwind(&self.ctx).await;
                } else {
                    warn!(log, "leaving partially created node in place");
                    undo.disarm();
                }
                Err(err)
            }
        }
    }

    async fn build_node(
        &self,
        log: &Logger,
        node: &mut Node,
        spec: &NodeSpec,
        source: &BootSource,
        boot: bool,
    ) -> Result<(), NodeError> {
        let cloud = &self.ctx.cloud;
        let node_id = node.id;

        info!(log, "update node label"; "label" => &node.label);
        if let Err(err) =
            cloud.update_node(node_id, &node.label, &node.group).await
        {
            // A label collision shouldn't cost us the node.
            warn!(log, "update node failed but continuing"; "error" => %err);
        }

        let password = RootPassword::generate();
        let root = RootCredentials {
            password: password.secret(),
            ssh_key_file: &self.ctx.root_ssh_key,
        };

        let mut jobs = Vec::new();

        let boot_size = spec.disks.boot.disk_size;
        let boot_disk = match source {
            BootSource::Image(label) => {
                info!(log, "create boot disk from image"; "image" => label);
                let request = ImageDiskRequest {
                    node_id,
                    label: BOOT_DISK_LABEL,
                    size_mb: boot_size,
                    root,
                };
                let details = self
                    .ctx
                    .image_manager()
                    .create_disk_from_image(label, &request)
                    .await
                    .map_err(|err| NodeError::ImageDisk {
                        label: label.clone(),
                        err: Box::new(err),
                    })?;
                Disk {
                    id: details.disk_id,
                    role: DiskRole::Boot,
                    size_mb: Some(boot_size),
                    filesystem: Filesystem::Ext4,
                    source: DiskSource::Image(label.clone()),
                }
            }
            BootSource::Distribution(distribution) => {
                info!(log, "create boot disk from distribution";
                    "distribution" => distribution,
                );
                let created = cloud
                    .create_disk_from_distribution(
                        node_id,
                        distribution,
                        boot_size,
                        root,
                    )
                    .await
                    .map_err(NodeError::api(
                        "create boot disk from distribution",
                    ))?;
                info!(log, "creating boot disk";
                    "disk_id" => created.disk_id,
                    "job_id" => created.job_id,
                );
                jobs.push((node_id, created.job_id));
                Disk {
                    id: created.disk_id,
                    role: DiskRole::Boot,
                    size_mb: Some(boot_size),
                    filesystem: Filesystem::Ext4,
                    source: DiskSource::Distribution(distribution.clone()),
                }
            }
        };
        node.boot_disk_id = Some(boot_disk.id);
        node.disks.push(boot_disk);

        if let Some(swap) = &spec.disks.swap {
            let size_mb = swap.disk_size.as_mb();
            info!(log, "create swap disk"; "size_mb" => ?size_mb);
            let created = cloud
                .create_swap_disk(node_id, size_mb)
                .await
                .map_err(NodeError::api("create swap disk"))?;
            jobs.push((node_id, created.job_id));
            node.disks.push(Disk {
                id: created.disk_id,
                role: DiskRole::Swap,
                size_mb,
                filesystem: Filesystem::Swap,
                source: DiskSource::Blank,
            });
        }

        for other in &spec.disks.others {
            info!(log, "create additional disk";
                "label" => &other.label,
                "filesystem" => %other.filesystem,
                "size_mb" => other.disk_size,
            );
            let created = cloud
                .create_disk(
                    node_id,
                    other.filesystem,
                    other.disk_size,
                    &other.label,
                )
                .await
                .map_err(NodeError::api("create additional disk"))?;
            info!(log, "created additional disk"; "disk_id" => created.disk_id);
            jobs.push((node_id, created.job_id));
            node.disks.push(Disk {
                id: created.disk_id,
                role: DiskRole::Other,
                size_mb: Some(other.disk_size),
                filesystem: other.filesystem,
                source: DiskSource::Blank,
            });
        }

        let outcomes = self.ctx.jobs.wait_for_jobs(&jobs).await;
        let failed: Vec<JobOutcome> =
            outcomes.into_iter().filter(|o| !o.is_success()).collect();
        if !failed.is_empty() {
            for outcome in &failed {
                error!(log, "disk job failed";
                    "job_id" => outcome.job_id,
                    "finished" => outcome.finished,
                );
            }
            return Err(NodeError::DiskJobs { failed, total: jobs.len() });
        }

        info!(log, "create configuration"; "kernel" => &spec.kernel);
        let config_id = cloud
            .create_config(
                node_id,
                &spec.kernel,
                &node.disk_ids(),
                CONFIG_LABEL,
            )
            .await
            .map_err(NodeError::api("create configuration"))?;
        node.config_id = Some(config_id);

        info!(log, "configure private IP");
        let private_ip = cloud
            .add_private_ip(node_id)
            .await
            .map_err(NodeError::api("add private IP"))?;
        node.private_ip = Some(private_ip);
        let public_ip = cloud
            .get_public_ip(node_id)
            .await
            .map_err(NodeError::api("get public IP"))?;
        node.public_ips = vec![public_ip];
        info!(log, "node addresses";
            "private_ip" => %private_ip,
            "public_ip" => %public_ip,
        );

        if boot {
            info!(log, "booting");
            let job_id = cloud
                .boot_node(node_id, config_id)
                .await
                .map_err(NodeError::api("boot node"))?;
            let wait = self.ctx.jobs.wait_for_job(node_id, job_id).await;
            if !wait.is_success() {
                return Err(NodeError::BootJob { job_id, wait });
            }
            info!(log, "node booted");
        }

        Ok(())
    }
}
