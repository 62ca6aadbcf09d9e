// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded, fixed-interval polling policies.
//!
//! Remote jobs and freshly booted nodes are waited on by sleeping for a fixed
//! interval and then checking, up to `timeout / interval` times.  There is no
//! backoff: the provider's jobs finish on the order of tens of seconds and we
//! want a predictable upper bound on how long a workflow step can block.

use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// How often, and for how long, to poll for a condition.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PollPolicy {
    #[serde(rename = "interval_secs", with = "secs")]
    pub interval: Duration,
    #[serde(rename = "timeout_secs", with = "secs")]
    pub timeout: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Returns the policy used to wait on remote jobs: every 5 seconds for up
    /// to 4 minutes.
    pub const fn remote_job() -> Self {
        const INTERVAL: Duration = Duration::from_secs(5);
        const TIMEOUT: Duration = Duration::from_secs(240);
        Self::new(INTERVAL, TIMEOUT)
    }

    /// Returns the policy used to wait for a booted node to answer before
    /// provisioning it: every 10 seconds for up to a minute.
    pub const fn reachability() -> Self {
        const INTERVAL: Duration = Duration::from_secs(10);
        const TIMEOUT: Duration = Duration::from_secs(60);
        Self::new(INTERVAL, TIMEOUT)
    }

    /// Number of checks made before giving up.
    ///
    /// An interval under a millisecond would poll forever, so it is treated
    /// as a single check.
    pub fn poll_count(&self) -> u32 {
        let interval = self.interval.as_millis();
        if interval == 0 {
            return 1;
        }
        let count = self.timeout.as_millis() / interval;
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}

mod secs {
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_poll_count() {
        assert_eq!(PollPolicy::remote_job().poll_count(), 48);
        assert_eq!(PollPolicy::reachability().poll_count(), 6);

        let odd = PollPolicy::new(
            Duration::from_secs(7),
            Duration::from_secs(20),
        );
        assert_eq!(odd.poll_count(), 2);

        let degenerate = PollPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(degenerate.poll_count(), 1);
    }

    #[test]
    fn test_policy_from_toml() {
        let policy: PollPolicy =
            toml::from_str("interval_secs = 2\ntimeout_secs = 30\n").unwrap();
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.poll_count(), 15);
    }
}
