// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local metadata records for persisted images
//!
//! Each image owns a directory `<conf_dir>/images/<label>/`.  The directory
//! is created when image creation starts, which reserves the label; the
//! record `image.json` inside it only appears once the image exists on the
//! provider.

use super::Image;
use super::ImageProvider;
use super::ImageSpec;
use super::ImageType;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use provision_common::ids::ImageId;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use slog::Logger;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;

const IMAGES_DIR: &str = "images";
const RECORD_FILE: &str = "image.json";
const RECORD_TMP_FILE: &str = "image.json.tmp";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid image label {0:?}")]
    InvalidLabel(String),

    #[error("Image label {0:?} is already in use")]
    AlreadyExists(String),

    #[error("Failed to {op} {path}")]
    Io {
        op: &'static str,
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("Failed to serialize record for image {label:?}")]
    Serialize {
        label: String,
        #[source]
        err: serde_json::Error,
    },
}

/// The on-disk shape of an image record
#[derive(Debug, Serialize, Deserialize)]
struct ImageRecord {
    provider: ImageProvider,
    #[serde(rename = "type")]
    image_type: ImageType,
    #[serde(rename = "cluster-type", default)]
    cluster_type: Option<String>,
    #[serde(deserialize_with = "deserialize_image_id")]
    id: ImageId,
    datacenter: String,
    distribution: String,
    kernel: String,
}

/// Older records store the provider's image id as a number.
fn deserialize_image_id<'de, D>(deserializer: D) -> Result<ImageId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawImageId {
        Number(u64),
        Text(String),
    }

    Ok(match RawImageId::deserialize(deserializer)? {
        RawImageId::Number(id) => ImageId::from(id),
        RawImageId::Text(id) => ImageId::new(id),
    })
}

/// Image metadata, stored as one directory per label
pub struct ImageStore {
    log: Logger,
    root: Utf8PathBuf,
}

impl ImageStore {
    pub fn new(log: &Logger, conf_dir: &Utf8Path) -> ImageStore {
        let root = conf_dir.join(IMAGES_DIR);
        let log = log.new(o!(
            "component" => "ImageStore",
            "root" => root.to_string(),
        ));
        ImageStore { log, root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn label_dir(&self, label: &str) -> Result<Utf8PathBuf, StoreError> {
        if label.is_empty()
            || label == "."
            || label == ".."
            || label.contains('/')
            || label.contains('\\')
        {
            return Err(StoreError::InvalidLabel(label.to_string()));
        }
        Ok(self.root.join(label))
    }

    /// Whether `label` is reserved, whether or not its record exists yet.
    pub async fn exists(&self, label: &str) -> bool {
        let Ok(dir) = self.label_dir(label) else {
            return false;
        };
        tokio::fs::metadata(&dir)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false)
    }

    /// Claims `label` by creating its directory.
    pub async fn reserve(&self, label: &str) -> Result<(), StoreError> {
        let dir = self.label_dir(label)?;
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            StoreError::Io { op: "create", path: self.root.clone(), err }
        })?;
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {
                debug!(self.log, "reserved image label"; "label" => label);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(label.to_string()))
            }
            Err(err) => Err(StoreError::Io { op: "create", path: dir, err }),
        }
    }

    /// Reads the record for `label`.
    ///
    /// A missing or unreadable record is reported as no image.
    pub async fn load(&self, label: &str) -> Option<Image> {
        let path = match self.label_dir(label) {
            Ok(dir) => dir.join(RECORD_FILE),
            Err(err) => {
                warn!(self.log, "cannot load image"; "error" => %err);
                return None;
            }
        };

        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(self.log, "no record for image"; "label" => label);
                return None;
            }
            Err(err) => {
                warn!(self.log, "failed to read image record";
                    "path" => %path,
                    "error" => %err,
                );
                return None;
            }
        };

        let record: ImageRecord = match serde_json::from_slice(&contents) {
            Ok(record) => record,
            Err(err) => {
                warn!(self.log, "failed to parse image record";
                    "path" => %path,
                    "error" => %err,
                );
                return None;
            }
        };

        Some(Image {
            label: label.to_string(),
            provider: record.provider,
            spec: ImageSpec {
                image_type: record.image_type,
                cluster_type: record.cluster_type,
                datacenter: record.datacenter,
                distribution: record.distribution,
                kernel: record.kernel,
                id: Some(record.id),
            },
        })
    }

    /// Writes the record for `image`, which now exists on the provider as
    /// `image_id`.
    ///
    /// The record is written to a temporary file that is renamed into place,
    /// so a failure never leaves a partial `image.json` behind.
    pub async fn save(
        &self,
        image: &Image,
        image_id: &ImageId,
    ) -> Result<(), StoreError> {
        let dir = self.label_dir(&image.label)?;
        let record = ImageRecord {
            provider: image.provider,
            image_type: image.spec.image_type,
            cluster_type: image.spec.cluster_type.clone(),
            id: image_id.clone(),
            datacenter: image.spec.datacenter.clone(),
            distribution: image.spec.distribution.clone(),
            kernel: image.spec.kernel.clone(),
        };
        let contents = serde_json::to_vec_pretty(&record).map_err(|err| {
            StoreError::Serialize { label: image.label.clone(), err }
        })?;

        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            StoreError::Io { op: "create", path: dir.clone(), err }
        })?;
        let tmp_path = dir.join(RECORD_TMP_FILE);
        let path = dir.join(RECORD_FILE);
        let result = async {
            tokio::fs::write(&tmp_path, &contents).await.map_err(|err| {
                StoreError::Io { op: "write", path: tmp_path.clone(), err }
            })?;
            tokio::fs::rename(&tmp_path, &path).await.map_err(|err| {
                StoreError::Io { op: "rename", path: path.clone(), err }
            })
        }
        .await;

        if let Err(err) = &result {
            warn!(self.log, "failed to save image record";
                "label" => &image.label,
                "error" => %err,
            );
            if let Err(remove_err) = tokio::fs::remove_file(&tmp_path).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(self.log, "failed to remove partial image record";
                        "path" => %tmp_path,
                        "error" => %remove_err,
                    );
                }
            }
            return result;
        }

        info!(self.log, "saved image record";
            "label" => &image.label,
            "image_id" => image_id,
        );
        Ok(())
    }

    /// Releases `label`, deleting its directory and any record in it.
    pub async fn remove(&self, label: &str) -> Result<(), StoreError> {
        let dir = self.label_dir(label)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(self.log, "released image label"; "label" => label);
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Io { op: "remove", path: dir, err }),
        }
    }
}
