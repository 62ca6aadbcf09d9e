// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning of cloud compute nodes, their disks, and reusable images
//!
//! A [`ProvisionContext`] ties together the provider's API ([`CloudApi`]),
//! the [`JobTracker`] that waits on the provider's asynchronous jobs, and
//! the local [`ImageStore`].  From it come the two workflows:
//!
//! * [`NodeManager::create_node`] builds a node with its disks, boot
//!   configuration and addresses, optionally booting it.
//! * [`ImageManager::create_image`] builds a reusable image by provisioning
//!   a temporary node and snapshotting its boot disk.
//!
//! Both roll back what they created when a step fails, if asked to.

pub mod cloud;
pub mod config;
pub mod context;
pub mod disk;
pub mod image;
pub mod job;
pub mod node;
pub mod password;
pub mod provisioner;
#[cfg(any(test, feature = "testing"))]
pub mod sim;
mod undo;

pub use cloud::CloudApi;
pub use config::Config;
pub use context::ProvisionContext;
pub use image::ImageManager;
pub use image::ImageStore;
pub use job::JobTracker;
pub use node::NodeManager;
