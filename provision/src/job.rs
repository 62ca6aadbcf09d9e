// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting on remote jobs

use crate::cloud::CloudApi;
use crate::cloud::JobStatus;
use provision_common::ids::JobId;
use provision_common::ids::NodeId;
use provision_common::poll::PollPolicy;
use slog::Logger;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;

/// How a single job wait ended
///
/// `finished` is false when the job was unknown to the provider or did not
/// reach a terminal state within the polling bound; `succeeded` is only
/// meaningful when `finished` is true.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobWait {
    pub finished: bool,
    pub succeeded: bool,
}

impl JobWait {
    const UNFINISHED: JobWait = JobWait { finished: false, succeeded: false };

    /// Whether the job finished and reported success.
    pub fn is_success(&self) -> bool {
        self.finished && self.succeeded
    }
}

/// The outcome of one job within [`JobTracker::wait_for_jobs`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobOutcome {
    pub node_id: NodeId,
    pub job_id: JobId,
    pub finished: bool,
    pub succeeded: bool,
}

impl JobOutcome {
    fn new(node_id: NodeId, job_id: JobId, wait: JobWait) -> Self {
        JobOutcome {
            node_id,
            job_id,
            finished: wait.finished,
            succeeded: wait.succeeded,
        }
    }

    pub fn is_success(&self) -> bool {
        self.finished && self.succeeded
    }
}

/// Polls the provider for completion of asynchronous jobs
#[derive(Clone)]
pub struct JobTracker {
    log: Logger,
    cloud: Arc<dyn CloudApi>,
    policy: PollPolicy,
}

impl JobTracker {
    pub fn new(
        log: &Logger,
        cloud: Arc<dyn CloudApi>,
        policy: PollPolicy,
    ) -> Self {
        JobTracker {
            log: log.new(o!("component" => "JobTracker")),
            cloud,
            policy,
        }
    }

    /// Waits for one job to reach a terminal state.
    ///
    /// Sleeps one poll interval before every status query.  Stops early if
    /// the provider doesn't know about the job.  Running out of polls is not
    /// an error: the job is reported as unfinished.
    pub async fn wait_for_job(
        &self,
        node_id: NodeId,
        job_id: JobId,
    ) -> JobWait {
        let log = self.log.new(o!("node_id" => node_id, "job_id" => job_id));

        for attempt in 1..=self.policy.poll_count() {
            tokio::time::sleep(self.policy.interval).await;

            match self.cloud.job_status(node_id, job_id).await {
                Ok(JobStatus::Finished { succeeded }) => {
                    info!(log, "finished job"; "succeeded" => succeeded);
                    return JobWait { finished: true, succeeded };
                }
                Ok(JobStatus::NotFound) => {
                    error!(log, "no such job");
                    return JobWait::UNFINISHED;
                }
                Ok(JobStatus::Pending) => {
                    debug!(log, "job still pending"; "attempt" => attempt);
                }
                Err(err) => {
                    warn!(
                        log,
                        "failed to query job status";
                        "attempt" => attempt,
                        "retryable" => err.retryable(),
                        "error" => %err,
                    );
                }
            }
        }

        warn!(
            log,
            "gave up waiting for job";
            "timeout_secs" => self.policy.timeout.as_secs(),
        );
        JobWait::UNFINISHED
    }

    /// Waits for many jobs at once.
    ///
    /// Every `(node, job)` pair is waited on by its own task.  The call
    /// returns once all of them are done, with exactly one outcome per pair
    /// in no particular order.  A job that fails or times out does not stop
    /// the others; callers decide what the combined outcome means.
    pub async fn wait_for_jobs(
        &self,
        jobs: &[(NodeId, JobId)],
    ) -> Vec<JobOutcome> {
        let mut set = JoinSet::new();
        let mut pending = BTreeMap::new();

        for &(node_id, job_id) in jobs {
            let tracker = self.clone();
            let handle = set.spawn(async move {
                let wait = tracker.wait_for_job(node_id, job_id).await;
                JobOutcome::new(node_id, job_id, wait)
            });
            pending.insert(handle.id(), (node_id, job_id));
        }

        let mut outcomes = Vec::with_capacity(jobs.len());
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((task_id, outcome)) => {
                    pending.remove(&task_id);
                    outcomes.push(outcome);
                }
                Err(join_error) => {
                    // The wait itself blew up; account for its job as
                    // unfinished so no pair goes missing from the result.
                    let Some((node_id, job_id)) =
                        pending.remove(&join_error.id())
                    else {
                        continue;
                    };
                    error!(
                        self.log,
                        "job wait task failed";
                        "node_id" => node_id,
                        "job_id" => job_id,
                        "error" => %join_error,
                    );
                    outcomes.push(JobOutcome::new(
                        node_id,
                        job_id,
                        JobWait::UNFINISHED,
                    ));
                }
            }
        }

        outcomes
    }
}
