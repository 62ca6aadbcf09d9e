// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the cloud provider's control plane
//!
//! The wire-level client lives outside this crate.  Everything the
//! provisioning workflows need from the provider is expressed by
//! [`CloudApi`]; mutating calls that take time on the provider side hand
//! back a [`JobId`] that is waited on with the
//! [`JobTracker`](crate::job::JobTracker).

use crate::disk::Filesystem;
use async_trait::async_trait;
use camino::Utf8Path;
use provision_common::api::ApiError;
use provision_common::ids::ConfigId;
use provision_common::ids::DiskId;
use provision_common::ids::ImageId;
use provision_common::ids::JobId;
use provision_common::ids::NodeId;
use secrecy::SecretString;
use std::net::IpAddr;

/// A disk whose creation is still running as a remote job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskJob {
    pub disk_id: DiskId,
    pub job_id: JobId,
}

/// An image whose creation is still running as a remote job
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageJob {
    pub image_id: ImageId,
    pub job_id: JobId,
}

/// What the provider reports about a job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// The job exists and has not reached a terminal state.
    Pending,
    /// The job reached a terminal state.
    Finished { succeeded: bool },
    /// The provider has no record of the job.
    NotFound,
}

/// Root credentials installed on disks created from a distribution or image.
#[derive(Clone, Copy)]
pub struct RootCredentials<'a> {
    pub password: &'a SecretString,
    pub ssh_key_file: &'a Utf8Path,
}

impl std::fmt::Debug for RootCredentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCredentials")
            .field("password", &"<redacted>")
            .field("ssh_key_file", &self.ssh_key_file)
            .finish()
    }
}

/// The provider's control-plane operations
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Creates a bare node on the given plan, returning its id.
    async fn create_node(
        &self,
        plan_id: u32,
        datacenter: &str,
    ) -> Result<NodeId, ApiError>;

    /// Sets the display label and group of a node.
    async fn update_node(
        &self,
        node_id: NodeId,
        label: &str,
        group: &str,
    ) -> Result<(), ApiError>;

    async fn create_disk_from_distribution(
        &self,
        node_id: NodeId,
        distribution: &str,
        size_mb: u32,
        root: RootCredentials<'_>,
    ) -> Result<DiskJob, ApiError>;

    /// Creates a swap disk.  `None` lets the provider choose the size.
    async fn create_swap_disk(
        &self,
        node_id: NodeId,
        size_mb: Option<u32>,
    ) -> Result<DiskJob, ApiError>;

    /// Creates an empty disk with the given filesystem.
    async fn create_disk(
        &self,
        node_id: NodeId,
        filesystem: Filesystem,
        size_mb: u32,
        label: &str,
    ) -> Result<DiskJob, ApiError>;

    async fn create_disk_from_image(
        &self,
        node_id: NodeId,
        image_id: &ImageId,
        label: &str,
        size_mb: u32,
        root: RootCredentials<'_>,
    ) -> Result<DiskJob, ApiError>;

    /// Creates a boot configuration with the disks attached in order.
    async fn create_config(
        &self,
        node_id: NodeId,
        kernel: &str,
        disk_ids: &[DiskId],
        label: &str,
    ) -> Result<ConfigId, ApiError>;

    async fn add_private_ip(&self, node_id: NodeId)
        -> Result<IpAddr, ApiError>;

    async fn get_public_ip(&self, node_id: NodeId) -> Result<IpAddr, ApiError>;

    async fn boot_node(
        &self,
        node_id: NodeId,
        config_id: ConfigId,
    ) -> Result<JobId, ApiError>;

    async fn shutdown_node(&self, node_id: NodeId) -> Result<JobId, ApiError>;

    /// Turns a disk into a persisted image labeled `label`.
    async fn create_disk_image(
        &self,
        node_id: NodeId,
        disk_id: DiskId,
        label: &str,
    ) -> Result<ImageJob, ApiError>;

    async fn delete_image(&self, image_id: &ImageId) -> Result<(), ApiError>;

    /// Deletes a node.  With `force`, the node is deleted even if it still
    /// has disks attached.
    async fn delete_node(
        &self,
        node_id: NodeId,
        force: bool,
    ) -> Result<(), ApiError>;

    async fn job_status(
        &self,
        node_id: NodeId,
        job_id: JobId,
    ) -> Result<JobStatus, ApiError>;
}
