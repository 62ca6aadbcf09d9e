// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disks attached to a node, and the requests that describe them

use provision_common::ids::DiskId;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Filesystem the provider formats a new disk with
///
/// Any filesystem the provider can't create is requested as `raw`; the
/// provisioner is expected to format it later.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum Filesystem {
    Ext4,
    Ext3,
    Swap,
    Raw,
}

impl From<String> for Filesystem {
    fn from(s: String) -> Self {
        Filesystem::from(s.as_str())
    }
}

impl From<&str> for Filesystem {
    fn from(s: &str) -> Self {
        match s {
            "ext4" => Filesystem::Ext4,
            "ext3" => Filesystem::Ext3,
            "swap" => Filesystem::Swap,
            _ => Filesystem::Raw,
        }
    }
}

impl fmt::Display for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Ext3 => "ext3",
            Filesystem::Swap => "swap",
            Filesystem::Raw => "raw",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskRole {
    Boot,
    Swap,
    Other,
}

/// What a disk's initial contents come from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum DiskSource {
    Distribution(String),
    /// Label of an image in the metadata store
    Image(String),
    Blank,
}

/// A disk that has been created on a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub id: DiskId,
    pub role: DiskRole,
    /// Size in megabytes; `None` when the provider chose it.
    pub size_mb: Option<u32>,
    pub filesystem: Filesystem,
    pub source: DiskSource,
}

/// Size of a requested swap disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawSwapSize")]
pub enum SwapSize {
    /// Let the provider pick its default size.
    Auto,
    Mb(u32),
}

impl SwapSize {
    pub fn as_mb(self) -> Option<u32> {
        match self {
            SwapSize::Auto => None,
            SwapSize::Mb(mb) => Some(mb),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSwapSize {
    Mb(u32),
    Keyword(String),
}

impl TryFrom<RawSwapSize> for SwapSize {
    type Error = String;

    fn try_from(raw: RawSwapSize) -> Result<Self, Self::Error> {
        match raw {
            RawSwapSize::Mb(mb) => Ok(SwapSize::Mb(mb)),
            RawSwapSize::Keyword(s) if s == "auto" => Ok(SwapSize::Auto),
            RawSwapSize::Keyword(s) => {
                Err(format!("swap disk_size must be \"auto\" or MB, got {s:?}"))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct BootDiskSpec {
    pub disk_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SwapDiskSpec {
    pub disk_size: SwapSize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OtherDiskSpec {
    pub label: String,
    pub disk_size: u32,
    #[serde(rename = "type")]
    pub filesystem: Filesystem,
}

/// The disks requested for a new node
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DiskSpecs {
    pub boot: BootDiskSpec,
    #[serde(default)]
    pub swap: Option<SwapDiskSpec>,
    #[serde(default)]
    pub others: Vec<OtherDiskSpec>,
}
