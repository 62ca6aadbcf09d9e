// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated cloud provider and provisioner
//!
//! [`SimCloud`] keeps nodes, disks, jobs and images in memory, records every
//! mutating call it receives, and lets tests script how jobs end and which
//! operations fail.  [`SimProvisioner`] stands in for a real configuration
//! tool.

use crate::cloud::CloudApi;
use crate::cloud::DiskJob;
use crate::cloud::ImageJob;
use crate::cloud::JobStatus;
use crate::cloud::RootCredentials;
use crate::disk::Filesystem;
use crate::node::Node;
use crate::provisioner::Provisioner;
use crate::provisioner::ProvisionerError;
use async_trait::async_trait;
use provision_common::api::ApiError;
use provision_common::api::ResourceType;
use provision_common::ids::ConfigId;
use provision_common::ids::DiskId;
use provision_common::ids::ImageId;
use provision_common::ids::JobId;
use provision_common::ids::NodeId;
use provision_common::poll::PollPolicy;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

/// How a simulated job behaves when its status is queried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobScript {
    /// Reports success on the given status query (1-based).
    SucceedAfter(u32),
    /// Reports failure on the given status query (1-based).
    FailAfter(u32),
    /// Stays pending forever.
    NeverFinish,
    /// The provider forgets the job as soon as it's created.
    Vanish,
}

/// The operations that start jobs, for scripting their outcome by kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobKind {
    DistributionDisk,
    ImageDisk,
    SwapDisk,
    OtherDisk,
    Boot,
    Shutdown,
    Imaging,
}

/// Mutating [`CloudApi`] operations, as recorded by [`SimCloud::calls`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    CreateNode,
    UpdateNode,
    CreateDiskFromDistribution,
    CreateSwapDisk,
    CreateDisk,
    CreateDiskFromImage,
    CreateConfig,
    AddPrivateIp,
    GetPublicIp,
    BootNode,
    ShutdownNode,
    CreateDiskImage,
    DeleteImage,
    DeleteNode,
}

/// One recorded call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub node_id: Option<NodeId>,
    pub detail: String,
}

/// A simulated node
#[derive(Clone, Debug)]
pub struct SimNode {
    pub id: NodeId,
    pub plan_id: u32,
    pub datacenter: String,
    pub label: String,
    pub group: String,
    pub disks: Vec<DiskId>,
    pub config_disks: Vec<DiskId>,
    pub private_ip: Option<IpAddr>,
    pub public_ip: IpAddr,
    pub booted: bool,
}

struct SimJob {
    node_id: NodeId,
    script: JobScript,
    polls: u32,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    nodes: BTreeMap<NodeId, SimNode>,
    jobs: BTreeMap<JobId, SimJob>,
    job_scripts: BTreeMap<JobKind, JobScript>,
    failing_ops: BTreeSet<Op>,
    calls: Vec<Call>,
    status_queries: BTreeMap<JobId, usize>,
    status_failures: BTreeMap<JobId, usize>,
    images: BTreeSet<ImageId>,
}

impl SimState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Records a call, then fails it if its operation was set up to fail.
    fn record(
        &mut self,
        op: Op,
        node_id: Option<NodeId>,
        detail: String,
    ) -> Result<(), ApiError> {
        self.calls.push(Call { op, node_id, detail });
        if self.failing_ops.contains(&op) {
            return Err(ApiError::transport(&format!(
                "simulated failure of {op:?}"
            )));
        }
        Ok(())
    }

    fn node_mut(&mut self, node_id: NodeId) -> Result<&mut SimNode, ApiError> {
        self.nodes.get_mut(&node_id).ok_or_else(|| {
            ApiError::not_found(ResourceType::Node, node_id)
        })
    }

    fn start_job(&mut self, node_id: NodeId, kind: JobKind) -> JobId {
        let script = self
            .job_scripts
            .get(&kind)
            .copied()
            .unwrap_or(JobScript::SucceedAfter(1));
        let job_id = JobId::new(self.next_id());
        self.jobs.insert(job_id, SimJob { node_id, script, polls: 0 });
        job_id
    }

    fn start_disk_job(&mut self, node_id: NodeId, kind: JobKind) -> DiskJob {
        let disk_id = DiskId::new(self.next_id());
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.disks.push(disk_id);
        }
        let job_id = self.start_job(node_id, kind);
        DiskJob { disk_id, job_id }
    }
}

/// An in-memory [`CloudApi`]
///
/// Jobs succeed on their first status query unless scripted otherwise with
/// [`SimCloud::script_jobs`].
#[derive(Default)]
pub struct SimCloud {
    state: Mutex<SimState>,
}

impl SimCloud {
    pub fn new() -> SimCloud {
        SimCloud::default()
    }

    /// Adds a node directly, without recording a call.
    pub fn add_node(&self) -> NodeId {
        let mut state = self.state.lock().unwrap();
        let node_id = NodeId::new(state.next_id());
        let node = SimNode::new(node_id, 1, "sim");
        state.nodes.insert(node_id, node);
        node_id
    }

    /// Adds a job directly with the given behavior.
    pub fn add_job(&self, node_id: NodeId, script: JobScript) -> JobId {
        let mut state = self.state.lock().unwrap();
        let job_id = JobId::new(state.next_id());
        state.jobs.insert(job_id, SimJob { node_id, script, polls: 0 });
        job_id
    }

    /// Adds an existing provider image.
    pub fn add_image(&self, image_id: &ImageId) {
        self.state.lock().unwrap().images.insert(image_id.clone());
    }

    /// Sets how every job subsequently started by `kind` behaves.
    pub fn script_jobs(&self, kind: JobKind, script: JobScript) {
        self.state.lock().unwrap().job_scripts.insert(kind, script);
    }

    /// Makes every subsequent call of `op` fail with a transport error.
    pub fn fail_calls(&self, op: Op) {
        self.state.lock().unwrap().failing_ops.insert(op);
    }

    /// Makes the next `count` status queries for `job_id` fail.
    pub fn fail_status_queries(&self, job_id: JobId, count: usize) {
        self.state.lock().unwrap().status_failures.insert(job_id, count);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_for(&self, op: Op) -> Vec<Call> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    /// Number of status queries made for `job_id`, including failed ones.
    pub fn status_queries(&self, job_id: JobId) -> usize {
        self.state
            .lock()
            .unwrap()
            .status_queries
            .get(&job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn node(&self, node_id: NodeId) -> Option<SimNode> {
        self.state.lock().unwrap().nodes.get(&node_id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    pub fn has_image(&self, image_id: &ImageId) -> bool {
        self.state.lock().unwrap().images.contains(image_id)
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }
}

impl SimNode {
    fn new(id: NodeId, plan_id: u32, datacenter: &str) -> SimNode {
        let octets = id.get().to_be_bytes();
        SimNode {
            id,
            plan_id,
            datacenter: datacenter.to_string(),
            label: format!("linode{id}"),
            group: String::new(),
            disks: Vec::new(),
            config_disks: Vec::new(),
            private_ip: None,
            public_ip: IpAddr::V4(Ipv4Addr::new(
                198, 51, octets[6], octets[7],
            )),
            booted: false,
        }
    }
}

#[async_trait]
impl CloudApi for SimCloud {
    async fn create_node(
        &self,
        plan_id: u32,
        datacenter: &str,
    ) -> Result<NodeId, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateNode,
            None,
            format!("plan={plan_id} datacenter={datacenter}"),
        )?;
        let node_id = NodeId::new(state.next_id());
        state.nodes.insert(node_id, SimNode::new(node_id, plan_id, datacenter));
        Ok(node_id)
    }

    async fn update_node(
        &self,
        node_id: NodeId,
        label: &str,
        group: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::UpdateNode,
            Some(node_id),
            format!("label={label} group={group}"),
        )?;
        let node = state.node_mut(node_id)?;
        node.label = label.to_string();
        node.group = group.to_string();
        Ok(())
    }

    async fn create_disk_from_distribution(
        &self,
        node_id: NodeId,
        distribution: &str,
        size_mb: u32,
        _root: RootCredentials<'_>,
    ) -> Result<DiskJob, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateDiskFromDistribution,
            Some(node_id),
            format!("distribution={distribution} size={size_mb}"),
        )?;
        state.node_mut(node_id)?;
        Ok(state.start_disk_job(node_id, JobKind::DistributionDisk))
    }

    async fn create_swap_disk(
        &self,
        node_id: NodeId,
        size_mb: Option<u32>,
    ) -> Result<DiskJob, ApiError> {
        let mut state = self.state.lock().unwrap();
        let size = size_mb
            .map_or_else(|| String::from("auto"), |mb| mb.to_string());
        state.record(
            Op::CreateSwapDisk,
            Some(node_id),
            format!("size={size}"),
        )?;
        state.node_mut(node_id)?;
        Ok(state.start_disk_job(node_id, JobKind::SwapDisk))
    }

    async fn create_disk(
        &self,
        node_id: NodeId,
        filesystem: Filesystem,
        size_mb: u32,
        label: &str,
    ) -> Result<DiskJob, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateDisk,
            Some(node_id),
            format!("label={label} type={filesystem} size={size_mb}"),
        )?;
        state.node_mut(node_id)?;
        Ok(state.start_disk_job(node_id, JobKind::OtherDisk))
    }

    async fn create_disk_from_image(
        &self,
        node_id: NodeId,
        image_id: &ImageId,
        label: &str,
        size_mb: u32,
        _root: RootCredentials<'_>,
    ) -> Result<DiskJob, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateDiskFromImage,
            Some(node_id),
            format!("image={image_id} label={label} size={size_mb}"),
        )?;
        state.node_mut(node_id)?;
        if !state.images.contains(image_id) {
            return Err(ApiError::not_found(
                ResourceType::Image,
                image_id.as_str(),
            ));
        }
        Ok(state.start_disk_job(node_id, JobKind::ImageDisk))
    }

    async fn create_config(
        &self,
        node_id: NodeId,
        kernel: &str,
        disk_ids: &[DiskId],
        label: &str,
    ) -> Result<ConfigId, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateConfig,
            Some(node_id),
            format!("kernel={kernel} label={label} disks={}", disk_ids.len()),
        )?;
        let config_id = ConfigId::new(state.next_id());
        let node = state.node_mut(node_id)?;
        if let Some(missing) =
            disk_ids.iter().find(|&disk_id| !node.disks.contains(disk_id))
        {
            return Err(ApiError::invalid_request(&format!(
                "disk {missing} is not attached to node {node_id}"
            )));
        }
        node.config_disks = disk_ids.to_vec();
        Ok(config_id)
    }

    async fn add_private_ip(
        &self,
        node_id: NodeId,
    ) -> Result<IpAddr, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(Op::AddPrivateIp, Some(node_id), String::new())?;
        let node = state.node_mut(node_id)?;
        let octets = node_id.get().to_be_bytes();
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, octets[6], octets[7]));
        node.private_ip = Some(ip);
        Ok(ip)
    }

    async fn get_public_ip(&self, node_id: NodeId) -> Result<IpAddr, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(Op::GetPublicIp, Some(node_id), String::new())?;
        Ok(state.node_mut(node_id)?.public_ip)
    }

    async fn boot_node(
        &self,
        node_id: NodeId,
        config_id: ConfigId,
    ) -> Result<JobId, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::BootNode,
            Some(node_id),
            format!("config={config_id}"),
        )?;
        state.node_mut(node_id)?.booted = true;
        Ok(state.start_job(node_id, JobKind::Boot))
    }

    async fn shutdown_node(&self, node_id: NodeId) -> Result<JobId, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(Op::ShutdownNode, Some(node_id), String::new())?;
        state.node_mut(node_id)?.booted = false;
        Ok(state.start_job(node_id, JobKind::Shutdown))
    }

    async fn create_disk_image(
        &self,
        node_id: NodeId,
        disk_id: DiskId,
        label: &str,
    ) -> Result<ImageJob, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(
            Op::CreateDiskImage,
            Some(node_id),
            format!("disk={disk_id} label={label}"),
        )?;
        if !state.node_mut(node_id)?.disks.contains(&disk_id) {
            return Err(ApiError::not_found(ResourceType::Disk, disk_id));
        }
        let image_id = ImageId::from(state.next_id());
        state.images.insert(image_id.clone());
        let job_id = state.start_job(node_id, JobKind::Imaging);
        Ok(ImageJob { image_id, job_id })
    }

    async fn delete_image(&self, image_id: &ImageId) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(Op::DeleteImage, None, format!("image={image_id}"))?;
        if !state.images.remove(image_id) {
            return Err(ApiError::not_found(
                ResourceType::Image,
                image_id.as_str(),
            ));
        }
        Ok(())
    }

    async fn delete_node(
        &self,
        node_id: NodeId,
        force: bool,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.record(Op::DeleteNode, Some(node_id), format!("force={force}"))?;
        let node = state.node_mut(node_id)?;
        if !force && !node.disks.is_empty() {
            return Err(ApiError::invalid_request(&format!(
                "node {node_id} still has disks attached"
            )));
        }
        state.nodes.remove(&node_id);
        Ok(())
    }

    async fn job_status(
        &self,
        node_id: NodeId,
        job_id: JobId,
    ) -> Result<JobStatus, ApiError> {
        let mut state = self.state.lock().unwrap();
        *state.status_queries.entry(job_id).or_default() += 1;

        if let Some(remaining) = state.status_failures.get_mut(&job_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ApiError::transport("simulated status failure"));
            }
        }

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(JobStatus::NotFound);
        };
        if job.node_id != node_id {
            return Ok(JobStatus::NotFound);
        }
        job.polls += 1;
        let status = match job.script {
            JobScript::SucceedAfter(n) if job.polls >= n => {
                JobStatus::Finished { succeeded: true }
            }
            JobScript::FailAfter(n) if job.polls >= n => {
                JobStatus::Finished { succeeded: false }
            }
            JobScript::SucceedAfter(_)
            | JobScript::FailAfter(_)
            | JobScript::NeverFinish => JobStatus::Pending,
            JobScript::Vanish => JobStatus::NotFound,
        };
        Ok(status)
    }
}

/// A [`Provisioner`] whose behavior is fixed up front
#[derive(Debug)]
pub struct SimProvisioner {
    reachable: bool,
    provision_ok: bool,
    provisioned: AtomicUsize,
}

impl SimProvisioner {
    pub fn new(reachable: bool, provision_ok: bool) -> SimProvisioner {
        SimProvisioner {
            reachable,
            provision_ok,
            provisioned: AtomicUsize::new(0),
        }
    }

    /// How many times `provision` was called.
    pub fn provision_count(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for SimProvisioner {
    async fn wait_for_reachability(
        &self,
        _node: &Node,
        policy: PollPolicy,
    ) -> bool {
        if !self.reachable {
            tokio::time::sleep(policy.interval * policy.poll_count()).await;
        }
        self.reachable
    }

    async fn provision(&self, node: &Node) -> Result<(), ProvisionerError> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        if self.provision_ok {
            Ok(())
        } else {
            Err(ProvisionerError::Failed {
                targets: node
                    .primary_public_ip()
                    .map(|ip| ip.to_string())
                    .unwrap_or_default(),
                reason: String::from("simulated provisioning failure"),
            })
        }
    }
}
