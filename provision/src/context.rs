// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared state for the provisioning workflows

use crate::cloud::CloudApi;
use crate::config::Config;
use crate::config::TemporaryNodeConfig;
use crate::image::ImageManager;
use crate::image::store::ImageStore;
use crate::job::JobTracker;
use crate::node::NodeManager;
use camino::Utf8PathBuf;
use provision_common::poll::PollPolicy;
use slog::Logger;
use std::sync::Arc;

/// Everything node and image creation need to reach the provider, the image
/// store and each other
///
/// Image creation boots a temporary node, and node creation may build its
/// boot disk from an image.  Both managers are thin handles over this
/// context, so either can construct the other on demand.
pub struct ProvisionContext {
    pub(crate) log: Logger,
    pub(crate) cloud: Arc<dyn CloudApi>,
    pub(crate) store: ImageStore,
    pub(crate) jobs: JobTracker,
    pub(crate) root_ssh_key: Utf8PathBuf,
    pub(crate) reachability: PollPolicy,
    pub(crate) temporary_node: TemporaryNodeConfig,
}

impl ProvisionContext {
    pub fn new(
        log: &Logger,
        cloud: Arc<dyn CloudApi>,
        config: &Config,
    ) -> Arc<ProvisionContext> {
        let jobs = JobTracker::new(log, cloud.clone(), config.jobs);
        let store = ImageStore::new(log, &config.conf_dir);
        Arc::new(ProvisionContext {
            log: log.clone(),
            cloud,
            store,
            jobs,
            root_ssh_key: config.root_ssh_key.clone(),
            reachability: config.reachability,
            temporary_node: config.temporary_node.clone(),
        })
    }

    pub fn node_manager(self: &Arc<Self>) -> NodeManager {
        NodeManager::new(self.clone())
    }

    pub fn image_manager(self: &Arc<Self>) -> ImageManager {
        ImageManager::new(self.clone())
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }
}
