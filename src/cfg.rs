// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Static group configuration: the replica set, the failure bound it was
//! sized for, the identity of the local client, and the protocol deadlines.
//!
//! A configuration is usually written once as TOML and shared by every
//! client and replica in a group:
//!
//! ```toml
//! n = 3
//! f = 1
//!
//! [client]
//! client_id = 7
//! ir_id = 7
//! nearest_replica = 0
//!
//! [[replicas]]
//! id = 0
//! host = "localhost"
//! port = 51729
//!
//! [[replicas]]
//! id = 1
//! host = "localhost"
//! port = 51730
//!
//! [[replicas]]
//! id = 2
//! host = "localhost"
//! port = 51731
//! ```

use crate::{ClientId, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub type ReplicaId = u64;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaAddress {
    pub host: String,
    pub port: u16,
}

impl ReplicaAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ReplicaAddress {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ReplicaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Who the local client is. `client_id` stamps transactions and
/// timestamps; `ir_id` stamps IR operation ids. `nearest_replica` serves
/// unlogged reads.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client_id: ClientId,
    pub ir_id: ClientId,
    pub nearest_replica: ReplicaId,
}

impl ClientConfig {
    pub fn new(client_id: ClientId, nearest_replica: ReplicaId) -> Self {
        ClientConfig {
            client_id,
            ir_id: client_id,
            nearest_replica,
        }
    }
}

fn default_fast_path_window_ms() -> u64 {
    1000
}

fn default_quorum_timeout_ms() -> u64 {
    5000
}

fn default_finalize_timeout_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub n: usize,
    pub f: usize,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(with = "replica_list")]
    pub replicas: BTreeMap<ReplicaId, ReplicaAddress>,
    /// How long a consensus invocation waits for a fast-path supermajority
    /// before settling for the slow path.
    #[serde(default = "default_fast_path_window_ms")]
    pub fast_path_window_ms: u64,
    /// Overall deadline for collecting a quorum of replies.
    #[serde(default = "default_quorum_timeout_ms")]
    pub quorum_timeout_ms: u64,
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,
    /// Times a transaction is re-prepared at a later timestamp after a
    /// RETRY before giving up. Zero aborts on the first RETRY.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// TOML keys are strings, so the replica map is written as an array of
// tables carrying their own ids.
mod replica_list {
    use super::{ReplicaAddress, ReplicaId};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        id: ReplicaId,
        host: String,
        port: u16,
    }

    pub fn serialize<S: Serializer>(
        replicas: &BTreeMap<ReplicaId, ReplicaAddress>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = replicas
            .iter()
            .map(|(id, address)| Entry {
                id: *id,
                host: address.host.clone(),
                port: address.port,
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ReplicaId, ReplicaAddress>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|e| (e.id, ReplicaAddress::new(e.host, e.port)))
            .collect())
    }
}

impl Config {
    /// A configuration tolerating the largest number of failures the
    /// replica set allows, with default deadlines.
    pub fn new(client: ClientConfig, replicas: BTreeMap<ReplicaId, ReplicaAddress>) -> Self {
        let n = replicas.len();
        Config {
            n,
            f: n.saturating_sub(1) / 2,
            client,
            replicas,
            fast_path_window_ms: default_fast_path_window_ms(),
            quorum_timeout_ms: default_quorum_timeout_ms(),
            finalize_timeout_ms: default_finalize_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(Error::Config("no replicas configured".into()));
        }
        if self.replicas.len() != self.n {
            return Err(Error::Config(format!(
                "n = {} but {} replica addresses given",
                self.n,
                self.replicas.len()
            )));
        }
        if 2 * self.f + 1 > self.n {
            return Err(Error::Config(format!(
                "{} replicas cannot tolerate {} failures",
                self.n, self.f
            )));
        }
        if !self.replicas.contains_key(&self.client.nearest_replica) {
            return Err(Error::UnknownReplica(self.client.nearest_replica));
        }
        Ok(())
    }

    pub fn quorum_size(&self) -> usize {
        self.n - self.f
    }

    /// A consensus operation finishes in one round trip only when strictly
    /// more than this many replicas return the identical result. With
    /// `f = 0` a single replica never exceeds it, so every consensus
    /// operation takes the slow path.
    pub fn fast_path_threshold(&self) -> usize {
        (3 * self.f) / 2 + 1
    }

    pub fn fast_path_window(&self) -> Duration {
        Duration::from_millis(self.fast_path_window_ms)
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replicas(n: u64) -> BTreeMap<ReplicaId, ReplicaAddress> {
        (0..n)
            .map(|i| (i, ReplicaAddress::new("localhost", 51729 + i as u16)))
            .collect()
    }

    #[test]
    fn quorum_sizes() {
        let one = Config::new(ClientConfig::new(1, 0), replicas(1));
        assert_eq!((one.f, one.quorum_size(), one.fast_path_threshold()), (0, 1, 1));

        let three = Config::new(ClientConfig::new(1, 0), replicas(3));
        // Only a unanimous reply beats a threshold of 2 out of 3.
        assert_eq!((three.f, three.quorum_size(), three.fast_path_threshold()), (1, 2, 2));

        let five = Config::new(ClientConfig::new(1, 0), replicas(5));
        assert_eq!((five.f, five.quorum_size(), five.fast_path_threshold()), (2, 3, 4));
    }

    #[test]
    fn parses_toml_with_defaults() {
        let config = Config::from_toml_str(
            r#"
            n = 3
            f = 1
            quorum_timeout_ms = 250

            [client]
            client_id = 7
            ir_id = 8
            nearest_replica = 2

            [[replicas]]
            id = 0
            host = "localhost"
            port = 51729

            [[replicas]]
            id = 1
            host = "localhost"
            port = 51730

            [[replicas]]
            id = 2
            host = "10.0.0.3"
            port = 51731
            "#,
        )
        .unwrap();
        assert_eq!(config.client.ir_id, 8);
        assert_eq!(config.replicas[&2].to_string(), "10.0.0.3:51731");
        assert_eq!(config.quorum_timeout(), Duration::from_millis(250));
        assert_eq!(config.fast_path_window(), Duration::from_millis(1000));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn rejects_inconsistent_configs() {
        let mut config = Config::new(ClientConfig::new(1, 0), replicas(3));
        config.f = 2;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::new(ClientConfig::new(1, 9), replicas(3));
        assert!(matches!(config.validate(), Err(Error::UnknownReplica(9))));
        config.client.nearest_replica = 0;
        config.n = 4;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        assert!(matches!(
            Config::from_toml_str("n = \"three\""),
            Err(Error::Toml(_))
        ));
    }
}
