// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating reusable disk images, and disks from them
//!
//! An image is built by booting a single-use node, letting a
//! [`Provisioner`] configure it, shutting it down and snapshotting its boot
//! disk.  Its metadata is then recorded in the [`ImageStore`] under the
//! image's label, where node creation looks it up to build boot disks.

pub mod store;

use crate::cloud::RootCredentials;
use crate::context::ProvisionContext;
use crate::disk::BootDiskSpec;
use crate::disk::DiskSpecs;
use crate::job::JobWait;
use crate::node::Node;
use crate::node::NodeError;
use crate::node::NodeSpec;
use crate::provisioner::Provisioner;
use crate::provisioner::ProvisionerError;
use crate::undo::UndoAction;
use crate::undo::UndoLog;
use provision_common::api::ApiError;
use provision_common::ids::DiskId;
use provision_common::ids::ImageId;
use provision_common::ids::JobId;
use provision_common::ids::NodeId;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::fmt;
use std::sync::Arc;
use store::StoreError;

pub use store::ImageStore;

/// Who stores the image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageProvider {
    Linode,
    Hosted,
}

impl fmt::Display for ImageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageProvider::Linode => "linode",
            ImageProvider::Hosted => "hosted",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageType {
    /// A disk image held by the provider
    LinodeImage,
    /// An image kept outside the provider (not yet supported)
    HostedImage,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ImageType::LinodeImage => "linode-image",
            ImageType::HostedImage => "hosted-image",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(rename = "type")]
    pub image_type: ImageType,
    #[serde(rename = "cluster-type", default)]
    pub cluster_type: Option<String>,
    pub datacenter: String,
    pub distribution: String,
    pub kernel: String,
    /// The provider's id for the image, known once it has been persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ImageId>,
}

/// A named, reusable disk image
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Unique; the image's key in the [`ImageStore`].
    pub label: String,
    pub provider: ImageProvider,
    pub spec: ImageSpec,
}

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Image {0:?} already exists")]
    AlreadyExists(String),

    #[error("Unsupported image: provider {provider}, type {image_type}")]
    Unsupported { provider: ImageProvider, image_type: ImageType },

    #[error("No image named {0:?}")]
    NotFound(String),

    #[error("Image {0:?} has no provider image id")]
    MissingProviderId(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to create temporary node")]
    TemporaryNode(#[source] Box<NodeError>),

    #[error("Node {0} did not become reachable")]
    Unreachable(NodeId),

    #[error("Failed to provision node")]
    Provision(#[from] ProvisionerError),

    #[error("Failed to {step}")]
    Api {
        step: &'static str,
        #[source]
        err: ApiError,
    },

    #[error(
        "Job {job_id} to {step} did not succeed (finished: {})",
        wait.finished
    )]
    Job { step: &'static str, job_id: JobId, wait: JobWait },
}

impl ImageError {
    fn api(step: &'static str) -> impl FnOnce(ApiError) -> ImageError {
        move |err| ImageError::Api { step, err }
    }
}

/// Parameters of a disk created from an image
#[derive(Clone, Copy, Debug)]
pub struct ImageDiskRequest<'a> {
    pub node_id: NodeId,
    pub label: &'a str,
    pub size_mb: u32,
    pub root: RootCredentials<'a>,
}

/// A disk created from an image
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskDetails {
    pub disk_id: DiskId,
    pub image_id: ImageId,
}

pub struct ImageManager {
    log: Logger,
    ctx: Arc<ProvisionContext>,
}

impl ImageManager {
    pub fn new(ctx: Arc<ProvisionContext>) -> ImageManager {
        let log = ctx.log.new(o!("component" => "ImageManager"));
        ImageManager { log, ctx }
    }

    /// Looks up a persisted image by label.
    pub async fn load_image(&self, label: &str) -> Option<Image> {
        let image = self.ctx.store.load(label).await;
        if image.is_none() {
            info!(self.log, "image not available"; "label" => label);
        }
        image
    }

    /// Builds `image` and records it in the store, returning the provider's
    /// id for it.
    ///
    /// With a `provisioner`, the temporary node is configured by it before
    /// being snapshotted; without one the image is a plain copy of the
    /// distribution.  The temporary node is deleted once the image is
    /// recorded.  If a step fails and `delete_on_error` is set, everything
    /// created so far is removed again, including the label reservation.
    pub async fn create_image(
        &self,
        image: &Image,
        provisioner: Option<&dyn Provisioner>,
        delete_on_error: bool,
    ) -> Result<ImageId, ImageError> {
        if self.ctx.store.exists(&image.label).await {
            error!(self.log, "image already exists"; "label" => &image.label);
            return Err(ImageError::AlreadyExists(image.label.clone()));
        }

        match (image.provider, image.spec.image_type) {
            (ImageProvider::Linode, ImageType::LinodeImage) => {
                self.create_linode_image(image, provisioner, delete_on_error)
                    .await
            }
            (ImageProvider::Linode, ImageType::HostedImage)
            | (ImageProvider::Hosted, _) => {
                error!(self.log, "unsupported image";
                    "provider" => %image.provider,
                    "type" => %image.spec.image_type,
                );
                Err(ImageError::Unsupported {
                    provider: image.provider,
                    image_type: image.spec.image_type,
                })
            }
        }
    }

    async fn create_linode_image(
        &self,
        image: &Image,
        provisioner: Option<&dyn Provisioner>,
        delete_on_error: bool,
    ) -> Result<ImageId, ImageError> {
        let log = self.log.new(o!("image" => image.label.clone()));

        info!(log, "reserve image label");
        self.ctx.store.reserve(&image.label).await?;
        let mut undo = UndoLog::new(&log);
        undo.push(UndoAction::ReleaseImageLabel(image.label.clone()));

        let result = self
            .build_linode_image(
                &log,
                image,
                provisioner,
                delete_on_error,
                &mut undo,
            )
            .await;
        match result {
            Ok((node, image_id)) => {
                undo.disarm();
                info!(log, "created image"; "image_id" => &image_id);
                self.delete_temporary_node(&log, node.id).await;
                Ok(image_id)
            }
            Err(err) => {
                error!(log, "image creation failed"; "error" => %err);
                if delete_on_error {
                    undo.unwind(&self.ctx).await;
                } else {
                    warn!(log, "leaving partially created image in place");
                    undo.disarm();
                }
                Err(err)
            }
        }
    }

    async fn build_linode_image(
        &self,
        log: &Logger,
        image: &Image,
        provisioner: Option<&dyn Provisioner>,
        delete_on_error: bool,
        undo: &mut UndoLog,
    ) -> Result<(Node, ImageId), ImageError> {
        let cloud = &self.ctx.cloud;
        let template = &self.ctx.temporary_node;
        let spec = NodeSpec {
            plan_id: template.plan_id,
            datacenter: image.spec.datacenter.clone(),
            distribution: Some(image.spec.distribution.clone()),
            image: None,
            kernel: image.spec.kernel.clone(),
            label: image.label.clone(),
            group: template.group.clone(),
            disks: DiskSpecs {
                boot: BootDiskSpec { disk_size: template.boot_disk_size },
                swap: None,
                others: Vec::new(),
            },
        };

        info!(log, "create temporary node");
        // With delete_on_error, a node that fails to come up has already
        // been deleted by the time this returns.
        let node = self
            .ctx
            .node_manager()
            .create_node(&spec, true, delete_on_error)
            .await
            .map_err(|err| ImageError::TemporaryNode(Box::new(err)))?;
        undo.push(UndoAction::DeleteNode(node.id));
        let log = log.new(o!("node_id" => node.id));

        if let Some(provisioner) = provisioner {
            info!(log, "wait for temporary node to become reachable");
            if !provisioner
                .wait_for_reachability(&node, self.ctx.reachability)
                .await
            {
                return Err(ImageError::Unreachable(node.id));
            }
            info!(log, "provision temporary node");
            provisioner.provision(&node).await?;
        }

        info!(log, "shut down temporary node");
        let job_id = cloud
            .shutdown_node(node.id)
            .await
            .map_err(ImageError::api("shut down temporary node"))?;
        let wait = self.ctx.jobs.wait_for_job(node.id, job_id).await;
        if !wait.is_success() {
            return Err(ImageError::Job {
                step: "shut down temporary node",
                job_id,
                wait,
            });
        }

        let Some(disk_id) = node.boot_disk_id else {
            return Err(ImageError::Api {
                step: "find temporary node boot disk",
                err: ApiError::internal_error("node has no boot disk"),
            });
        };
        info!(log, "create image from boot disk"; "disk_id" => disk_id);
        let created = cloud
            .create_disk_image(node.id, disk_id, &image.label)
            .await
            .map_err(ImageError::api("create image from disk"))?;
        undo.push(UndoAction::DeleteImage(created.image_id.clone()));
        let wait = self.ctx.jobs.wait_for_job(node.id, created.job_id).await;
        if !wait.is_success() {
            return Err(ImageError::Job {
                step: "create image from disk",
                job_id: created.job_id,
                wait,
            });
        }

        info!(log, "save image record"; "image_id" => &created.image_id);
        self.ctx.store.save(image, &created.image_id).await?;
        Ok((node, created.image_id))
    }

    async fn delete_temporary_node(&self, log: &Logger, node_id: NodeId) {
        info!(log, "delete temporary node"; "node_id" => node_id);
        if let Err(err) = self.ctx.cloud.delete_node(node_id, true).await {
            warn!(log, "failed to delete temporary node";
                "node_id" => node_id,
                "error" => %err,
            );
        }
    }

    /// Creates a disk on `request.node_id` from the image labeled `label`
    /// and waits for it to be ready.
    pub async fn create_disk_from_image(
        &self,
        label: &str,
        request: &ImageDiskRequest<'_>,
    ) -> Result<DiskDetails, ImageError> {
        let Some(image) = self.load_image(label).await else {
            return Err(ImageError::NotFound(label.to_string()));
        };
        match (image.provider, image.spec.image_type) {
            (ImageProvider::Linode, ImageType::LinodeImage) => (),
            (ImageProvider::Linode, ImageType::HostedImage)
            | (ImageProvider::Hosted, _) => {
                return self
                    .create_disk_from_hosted_image(&image, request)
                    .await;
            }
        }
        let Some(image_id) = image.spec.id else {
            return Err(ImageError::MissingProviderId(image.label));
        };

        let log = self.log.new(o!(
            "image" => image.label.clone(),
            "node_id" => request.node_id,
        ));
        info!(log, "create disk from image"; "image_id" => &image_id);
        let created = self
            .ctx
            .cloud
            .create_disk_from_image(
                request.node_id,
                &image_id,
                request.label,
                request.size_mb,
                request.root,
            )
            .await
            .map_err(ImageError::api("create disk from image"))?;

        let wait =
            self.ctx.jobs.wait_for_job(request.node_id, created.job_id).await;
        if !wait.is_success() {
            error!(log, "disk from image did not finish";
                "disk_id" => created.disk_id,
                "job_id" => created.job_id,
            );
            return Err(ImageError::Job {
                step: "create disk from image",
                job_id: created.job_id,
                wait,
            });
        }
        info!(log, "created disk from image"; "disk_id" => created.disk_id);
        Ok(DiskDetails { disk_id: created.disk_id, image_id })
    }

    /// Creates a disk from an image kept outside the provider.
    ///
    /// No hosting backend exists yet, so this always fails.
    pub async fn create_disk_from_hosted_image(
        &self,
        image: &Image,
        _request: &ImageDiskRequest<'_>,
    ) -> Result<DiskDetails, ImageError> {
        error!(self.log, "hosted images are not supported";
            "image" => &image.label,
        );
        Err(ImageError::Unsupported {
            provider: image.provider,
            image_type: image.spec.image_type,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::password::RootPassword;
    use crate::sim::JobKind;
    use crate::sim::JobScript;
    use crate::sim::Op;
    use crate::sim::SimCloud;
    use crate::sim::SimProvisioner;
    use camino::Utf8PathBuf;
    use camino_tempfile::Utf8TempDir;
    use provision_common::poll::PollPolicy;
    use provision_test_utils::dev::test_setup_conf_dir;
    use provision_test_utils::dev::test_setup_log;
    use std::time::Duration;

    struct TestContext {
        cloud: Arc<SimCloud>,
        ctx: Arc<ProvisionContext>,
        _conf_dir: Utf8TempDir,
    }

    impl TestContext {
        fn new(log: &Logger) -> TestContext {
            let conf_dir = test_setup_conf_dir();
            let cloud = Arc::new(SimCloud::new());
            let config = Config::new(
                conf_dir.path().to_owned(),
                Utf8PathBuf::from("/root/.ssh/id_rsa.pub"),
            );
            let ctx = ProvisionContext::new(log, cloud.clone(), &config);
            TestContext { cloud, ctx, _conf_dir: conf_dir }
        }

        fn manager(&self) -> ImageManager {
            self.ctx.image_manager()
        }
    }

    fn gluster_image() -> Image {
        Image {
            label: String::from("base-gluster"),
            provider: ImageProvider::Linode,
            spec: ImageSpec {
                image_type: ImageType::LinodeImage,
                cluster_type: Some(String::from("gluster")),
                datacenter: String::from("sg"),
                distribution: String::from("Ubuntu 14.04"),
                kernel: String::from("Latest 64 bit"),
                id: None,
            },
        }
    }

    #[test]
    fn test_image_parses_from_json() {
        let image: Image = serde_json::from_value(serde_json::json!({
            "label": "base-gluster",
            "provider": "linode",
            "spec": {
                "type": "linode-image",
                "cluster-type": "gluster",
                "datacenter": "sg",
                "distribution": "Ubuntu 14.04",
                "kernel": "Latest 64 bit"
            }
        }))
        .unwrap();
        assert_eq!(image, gluster_image());

        let bad = serde_json::from_value::<Image>(serde_json::json!({
            "label": "x",
            "provider": "aws",
            "spec": {
                "type": "linode-image",
                "datacenter": "sg",
                "distribution": "Ubuntu 14.04",
                "kernel": "Latest 64 bit"
            }
        }));
        assert!(bad.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_image() {
        let logctx = test_setup_log("test_create_image");
        let test = TestContext::new(&logctx.log);
        let provisioner = SimProvisioner::new(true, true);
        let image = gluster_image();

        let image_id = test
            .manager()
            .create_image(&image, Some(&provisioner), true)
            .await
            .expect("image created");
        assert_eq!(provisioner.provision_count(), 1);

        let loaded = test.manager().load_image(&image.label).await.unwrap();
        assert_eq!(loaded.spec.id, Some(image_id.clone()));
        assert_eq!(loaded.spec.distribution, "Ubuntu 14.04");
        assert!(test.cloud.has_image(&image_id));

        // The temporary node was built from the template and is gone.
        let creates = test.cloud.calls_for(Op::CreateNode);
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].detail, "plan=1 datacenter=sg");
        let updates = test.cloud.calls_for(Op::UpdateNode);
        assert_eq!(updates[0].detail, "label=base-gluster group=temporary");
        let disks = test.cloud.calls_for(Op::CreateDiskFromDistribution);
        assert_eq!(disks[0].detail, "distribution=Ubuntu 14.04 size=5000");
        assert_eq!(test.cloud.calls_for(Op::ShutdownNode).len(), 1);
        assert_eq!(test.cloud.calls_for(Op::DeleteNode).len(), 1);
        assert_eq!(test.cloud.node_count(), 0);
        assert!(test.cloud.calls_for(Op::DeleteImage).is_empty());

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_image_without_provisioner() {
        let logctx = test_setup_log("test_create_image_without_provisioner");
        let test = TestContext::new(&logctx.log);

        test.manager()
            .create_image(&gluster_image(), None, false)
            .await
            .unwrap();
        assert!(test.ctx.store().load("base-gluster").await.is_some());
        // The temporary node is deleted even without delete_on_error.
        assert_eq!(test.cloud.node_count(), 0);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_image_makes_no_remote_calls() {
        let logctx =
            test_setup_log("test_existing_image_makes_no_remote_calls");
        let test = TestContext::new(&logctx.log);
        let image = gluster_image();
        test.ctx.store().reserve(&image.label).await.unwrap();

        let err = test
            .manager()
            .create_image(&image, None, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::AlreadyExists(label) if label == "base-gluster"
        ));
        assert!(test.cloud.calls().is_empty());
        // Someone else's reservation is left alone.
        assert!(test.ctx.store().exists(&image.label).await);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosted_images_are_unsupported() {
        let logctx = test_setup_log("test_hosted_images_are_unsupported");
        let test = TestContext::new(&logctx.log);

        let mut image = gluster_image();
        image.spec.image_type = ImageType::HostedImage;
        let err = test.manager().create_image(&image, None, true).await;
        assert!(matches!(
            err,
            Err(ImageError::Unsupported {
                provider: ImageProvider::Linode,
                image_type: ImageType::HostedImage,
            })
        ));

        image.provider = ImageProvider::Hosted;
        image.spec.image_type = ImageType::LinodeImage;
        let err = test.manager().create_image(&image, None, true).await;
        assert!(matches!(err, Err(ImageError::Unsupported { .. })));

        assert!(test.cloud.calls().is_empty());
        assert!(!test.ctx.store().exists(&image.label).await);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_is_rolled_back() {
        let logctx = test_setup_log("test_unreachable_node_is_rolled_back");
        let test = TestContext::new(&logctx.log);
        let provisioner = SimProvisioner::new(false, true);
        let image = gluster_image();

        let start = tokio::time::Instant::now();
        let err = test
            .manager()
            .create_image(&image, Some(&provisioner), true)
            .await
            .unwrap_err();
        let ImageError::Unreachable(node_id) = err else {
            panic!("unexpected error: {err}");
        };

        // Waited out the full reachability bound.
        assert!(start.elapsed() >= PollPolicy::reachability().timeout);
        assert_eq!(provisioner.provision_count(), 0);
        let deletes = test.cloud.calls_for(Op::DeleteNode);
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].node_id, Some(node_id));
        assert!(test.cloud.calls_for(Op::CreateDiskImage).is_empty());
        assert!(!test.ctx.store().exists(&image.label).await);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_imaging_job_deletes_image() {
        let logctx = test_setup_log("test_failed_imaging_job_deletes_image");
        let test = TestContext::new(&logctx.log);
        test.cloud.script_jobs(JobKind::Imaging, JobScript::FailAfter(3));
        let image = gluster_image();

        let err = test
            .manager()
            .create_image(&image, None, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Job { step: "create image from disk", .. }
        ));

        // Undone newest first: the image, then the node.
        let ops: Vec<Op> = test
            .cloud
            .calls()
            .iter()
            .map(|call| call.op)
            .filter(|op| matches!(op, Op::DeleteImage | Op::DeleteNode))
            .collect();
        assert_eq!(ops, vec![Op::DeleteImage, Op::DeleteNode]);
        assert_eq!(test.cloud.image_count(), 0);
        assert_eq!(test.cloud.node_count(), 0);
        assert!(!test.ctx.store().exists(&image.label).await);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_provisioning_without_delete_on_error() {
        let logctx =
            test_setup_log("test_failed_provisioning_without_delete_on_error");
        let test = TestContext::new(&logctx.log);
        let provisioner = SimProvisioner::new(true, false);
        let image = gluster_image();

        let err = test
            .manager()
            .create_image(&image, Some(&provisioner), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Provision(_)));

        // Everything is left for inspection, but there is no usable image.
        assert!(test.cloud.calls_for(Op::DeleteNode).is_empty());
        assert_eq!(test.cloud.node_count(), 1);
        assert!(test.ctx.store().exists(&image.label).await);
        assert!(test.manager().load_image(&image.label).await.is_none());

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_temporary_node_releases_label() {
        let logctx =
            test_setup_log("test_failed_temporary_node_releases_label");
        let test = TestContext::new(&logctx.log);
        test.cloud.script_jobs(JobKind::Boot, JobScript::FailAfter(1));
        let image = gluster_image();

        let err = test
            .manager()
            .create_image(&image, None, true)
            .await
            .unwrap_err();
        let ImageError::TemporaryNode(node_err) = err else {
            panic!("unexpected error: {err}");
        };
        assert!(matches!(*node_err, NodeError::BootJob { .. }));

        // The node was deleted once, by node creation's own rollback.
        assert_eq!(test.cloud.calls_for(Op::DeleteNode).len(), 1);
        assert!(test.cloud.calls_for(Op::ShutdownNode).is_empty());
        assert!(!test.ctx.store().exists(&image.label).await);

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_shutdown_is_rolled_back() {
        let logctx = test_setup_log("test_failed_shutdown_is_rolled_back");
        let test = TestContext::new(&logctx.log);
        test.cloud.script_jobs(JobKind::Shutdown, JobScript::NeverFinish);

        let start = tokio::time::Instant::now();
        let err = test
            .manager()
            .create_image(&gluster_image(), None, true)
            .await
            .unwrap_err();
        let ImageError::Job { step, wait, .. } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(step, "shut down temporary node");
        assert!(!wait.finished);
        assert!(start.elapsed() >= Duration::from_secs(240));
        assert!(test.cloud.calls_for(Op::CreateDiskImage).is_empty());
        assert_eq!(test.cloud.node_count(), 0);

        logctx.cleanup_successful();
    }

    /// Puts a directory where the image record is about to be written.
    struct RecordBlocker {
        record: Utf8PathBuf,
    }

    #[async_trait::async_trait]
    impl Provisioner for RecordBlocker {
        async fn wait_for_reachability(
            &self,
            _node: &Node,
            _policy: PollPolicy,
        ) -> bool {
            true
        }

        async fn provision(
            &self,
            _node: &Node,
        ) -> Result<(), ProvisionerError> {
            tokio::fs::create_dir(&self.record).await.unwrap();
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_record_write_is_rolled_back() {
        let logctx = test_setup_log("test_failed_record_write_is_rolled_back");
        let test = TestContext::new(&logctx.log);
        let image = gluster_image();
        let label_dir = test.ctx.store().root().join(&image.label);
        let provisioner =
            RecordBlocker { record: label_dir.join("image.json") };

        let err = test
            .manager()
            .create_image(&image, Some(&provisioner), true)
            .await
            .unwrap_err();
        assert!(
            matches!(err, ImageError::Store(StoreError::Io { .. })),
            "unexpected error: {err}"
        );

        // The remote image and the node are undone, newest first.
        let ops: Vec<Op> = test
            .cloud
            .calls()
            .iter()
            .map(|call| call.op)
            .filter(|op| matches!(op, Op::DeleteImage | Op::DeleteNode))
            .collect();
        assert_eq!(ops, vec![Op::DeleteImage, Op::DeleteNode]);
        assert_eq!(test.cloud.image_count(), 0);
        assert_eq!(test.cloud.node_count(), 0);
        assert!(!test.ctx.store().exists(&image.label).await);
        assert!(!label_dir.exists());

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_disk_from_image() {
        let logctx = test_setup_log("test_create_disk_from_image");
        let test = TestContext::new(&logctx.log);
        let image = gluster_image();
        let image_id = ImageId::new("9000");
        test.cloud.add_image(&image_id);
        test.ctx.store().reserve(&image.label).await.unwrap();
        test.ctx.store().save(&image, &image_id).await.unwrap();

        let node_id = test.cloud.add_node();
        let password = RootPassword::generate();
        let key = Utf8PathBuf::from("/root/.ssh/id_rsa.pub");
        let request = ImageDiskRequest {
            node_id,
            label: "boot",
            size_mb: 5000,
            root: RootCredentials {
                password: password.secret(),
                ssh_key_file: &key,
            },
        };

        let details = test
            .manager()
            .create_disk_from_image(&image.label, &request)
            .await
            .unwrap();
        assert_eq!(details.image_id, image_id);
        let disks = test.cloud.node(node_id).unwrap().disks;
        assert!(disks.contains(&details.disk_id));
        let calls = test.cloud.calls_for(Op::CreateDiskFromImage);
        assert_eq!(calls[0].detail, "image=9000 label=boot size=5000");

        // The same disk job failing yields no disk.
        test.cloud.script_jobs(JobKind::ImageDisk, JobScript::FailAfter(1));
        let err = test
            .manager()
            .create_disk_from_image(&image.label, &request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::Job { step: "create disk from image", .. }
        ));

        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_disk_from_missing_image() {
        let logctx = test_setup_log("test_create_disk_from_missing_image");
        let test = TestContext::new(&logctx.log);
        let password = RootPassword::generate();
        let key = Utf8PathBuf::from("/root/.ssh/id_rsa.pub");
        let request = ImageDiskRequest {
            node_id: test.cloud.add_node(),
            label: "boot",
            size_mb: 5000,
            root: RootCredentials {
                password: password.secret(),
                ssh_key_file: &key,
            },
        };

        let err = test
            .manager()
            .create_disk_from_image("no-such-image", &request)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ImageError::NotFound(label) if label == "no-such-image"
        ));
        assert!(test.cloud.calls().is_empty());

        logctx.cleanup_successful();
    }
}
