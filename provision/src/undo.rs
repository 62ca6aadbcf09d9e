// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rollback of partially completed workflows
//!
//! Each workflow step that creates something pushes the action that undoes
//! it onto an [`UndoLog`].  When the workflow reaches its success marker it
//! disarms the log; on any other exit the caller unwinds it, which runs the
//! recorded actions newest-first.  Undo actions are best-effort: a failure
//! is logged and the remaining actions still run, and nothing here replaces
//! the error that caused the unwind.

use crate::context::ProvisionContext;
use provision_common::ids::ImageId;
use provision_common::ids::NodeId;
use slog::Logger;
use slog::info;
use slog::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum UndoAction {
    /// Force-delete a node along with its disks.
    DeleteNode(NodeId),
    /// Delete an image object on the provider.
    DeleteImage(ImageId),
    /// Remove an image label reserved in the local store.
    ReleaseImageLabel(String),
}

pub(crate) struct UndoLog {
    log: Logger,
    actions: Vec<UndoAction>,
}

impl UndoLog {
    pub fn new(log: &Logger) -> UndoLog {
        UndoLog { log: log.clone(), actions: Vec::new() }
    }

    pub fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    /// The workflow succeeded: forget everything without undoing it.
    pub fn disarm(mut self) {
        self.actions.clear();
    }

    /// Runs every recorded action, newest first.
    pub async fn unwind(mut self, ctx: &ProvisionContext) {
        while let Some(action) = self.actions.pop() {
            info!(self.log, "undo"; "action" => ?action);
            match &action {
                UndoAction::DeleteNode(node_id) => {
                    let result = ctx.cloud.delete_node(*node_id, true).await;
                    if let Err(err) = result {
                        warn!(self.log, "failed to delete node";
                            "node_id" => *node_id,
                            "error" => %err,
                        );
                    }
                }
                UndoAction::DeleteImage(image_id) => {
                    if let Err(err) = ctx.cloud.delete_image(image_id).await {
                        warn!(self.log, "failed to delete image";
                            "image_id" => image_id,
                            "error" => %err,
                        );
                    }
                }
                UndoAction::ReleaseImageLabel(label) => {
                    if let Err(err) = ctx.store.remove(label).await {
                        warn!(self.log, "failed to release image label";
                            "label" => label,
                            "error" => %err,
                        );
                    }
                }
            }
        }
    }
}

impl Drop for UndoLog {
    fn drop(&mut self) {
        if !self.actions.is_empty() {
            warn!(self.log, "undo log dropped without unwinding";
                "actions" => ?self.actions,
            );
        }
    }
}
