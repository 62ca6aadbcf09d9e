// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors returned by remote control-plane calls

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// An error returned by a single remote control-plane call
///
/// Every mutating call (create, update, delete, boot, ...) either succeeds
/// with its payload or fails with one of these.  The provisioning workflows
/// never retry a failed call; they treat it as a failed step.  Only the
/// job-status query is repeated, and only as part of bounded polling.
#[derive(Clone, Debug, Deserialize, thiserror::Error, PartialEq, Serialize)]
pub enum ApiError {
    /// The object named by the call does not exist.
    #[error("{type_name} not found: {id}")]
    ObjectNotFound { type_name: ResourceType, id: String },
    /// The provider rejected the call, e.g. invalid plan or datacenter.
    #[error("Invalid Request: {messages:?}")]
    InvalidRequest { messages: Vec<String> },
    /// The call did not reach the provider or the response was unusable.
    #[error("Transport error: {message}")]
    Transport { message: String },
    /// The provider reported an unexpected failure.
    #[error("Internal Error: {internal_message}")]
    InternalError { internal_message: String },
}

impl ApiError {
    /// Returns whether the error is likely transient
    ///
    /// Only the job-status poll consults this: a transient failure there is
    /// absorbed by the next poll.
    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Transport { .. } => true,

            ApiError::ObjectNotFound { .. }
            | ApiError::InvalidRequest { .. }
            | ApiError::InternalError { .. } => false,
        }
    }

    pub fn not_found(type_name: ResourceType, id: impl fmt::Display) -> Self {
        ApiError::ObjectNotFound { type_name, id: id.to_string() }
    }

    pub fn invalid_request(message: &str) -> Self {
        ApiError::InvalidRequest { messages: vec![message.to_owned()] }
    }

    pub fn transport(message: &str) -> Self {
        ApiError::Transport { message: message.to_owned() }
    }

    pub fn internal_error(internal_message: &str) -> Self {
        ApiError::InternalError {
            internal_message: internal_message.to_owned(),
        }
    }
}

/// Kinds of provider objects named in [`ApiError::ObjectNotFound`]
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Node,
    Disk,
    Config,
    Image,
    Job,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceType::Node => "node",
            ResourceType::Disk => "disk",
            ResourceType::Config => "config",
            ResourceType::Image => "image",
            ResourceType::Job => "job",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_messages() {
        let error = ApiError::not_found(ResourceType::Node, 123);
        assert_eq!(error.to_string(), "node not found: 123");
        assert!(!error.retryable());

        let error = ApiError::transport("connection reset");
        assert_eq!(error.to_string(), "Transport error: connection reset");
        assert!(error.retryable());
    }
}
