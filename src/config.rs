// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replication tunables.

use serde::Deserialize;

/// Default ceiling on the interval between forced checkpoints. Large on
/// purpose: in steady state the proxy's divergence verdicts drive
/// checkpointing, not the timer.
pub const DEFAULT_CHECKPOINT_PERIOD_MS: u64 = 10_000;

/// Grace the secondary grants management to order a takeover before it
/// concludes the primary is still alive and abandons.
pub const DEFAULT_TAKEOVER_GRACE_MS: u64 = 2_000;

/// Tunables for a replication session.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Force a checkpoint when this much time passes without a divergence
    /// trigger. Adjustable at runtime through the management handle.
    pub checkpoint_period_ms: u64,

    /// How long a failing secondary waits for a failover decision before
    /// presuming the primary alive and exiting.
    pub takeover_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint_period_ms: DEFAULT_CHECKPOINT_PERIOD_MS,
            takeover_grace_ms: DEFAULT_TAKEOVER_GRACE_MS,
        }
    }
}

impl Config {
    /// Parses a config from its TOML representation.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.checkpoint_period_ms, 10_000);
        assert_eq!(config.takeover_grace_ms, 2_000);
    }

    #[test]
    fn parse_partial_toml() {
        let config = Config::from_toml("checkpoint_period_ms = 200").unwrap();
        assert_eq!(config.checkpoint_period_ms, 200);
        assert_eq!(config.takeover_grace_ms, DEFAULT_TAKEOVER_GRACE_MS);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_toml("checkpoint_floor = 1").is_err());
    }
}
