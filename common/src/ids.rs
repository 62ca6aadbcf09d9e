// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed identifiers for provider-side objects.
//!
//! The provider hands out plain integers for nodes, disks, jobs and
//! configuration profiles. If they're all `u64`, it's easy to pass a disk id
//! where a job id was expected; these wrappers keep them apart.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

macro_rules! provider_id {
    ($(#[$attr:meta])* $name:ident, $tag:literal) => {
        $(#[$attr])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(id: u64) -> Self {
                Self(id)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} ({})", self.0, $tag)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl slog::Value for $name {
            fn serialize(
                &self,
                _record: &slog::Record,
                key: slog::Key,
                serializer: &mut dyn slog::Serializer,
            ) -> slog::Result {
                serializer.emit_u64(key, self.0)
            }
        }
    };
}

provider_id!(
    /// Identifies a compute node.
    NodeId,
    "node"
);
provider_id!(
    /// Identifies a disk attached to a node.
    DiskId,
    "disk"
);
provider_id!(
    /// Identifies an asynchronous job running against a node.
    JobId,
    "job"
);
provider_id!(
    /// Identifies a boot configuration profile of a node.
    ConfigId,
    "config"
);

/// The provider's identifier for a persisted disk image.
///
/// Treated as opaque: it is only ever read back from the metadata store and
/// handed to the provider again.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for ImageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl slog::Value for ImageId {
    fn serialize(
        &self,
        _record: &slog::Record,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_str(key, &self.0)
    }
}
