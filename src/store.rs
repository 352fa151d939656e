// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Multi-version key-value storage consulted by the OCC certifier.
//!
//! Each key maps to its versions ordered by write time, and to a table of
//! when each version was last read by a committed transaction. The maps are
//! `im` persistent maps, so cloning a store (and with it a whole replica
//! state, as the model checker does at every step) shares structure rather
//! than copying it.
//!
//! The store does no locking of its own: it is owned by exactly one
//! [`crate::TapirReplica`], and that replica's single lock linearizes every
//! operation on every key.

use crate::Timestamp;
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::ops::Bound;
use tracing::debug;

/// One version of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: String,
    pub write_time: Timestamp,
}

type Versions = OrdMap<Timestamp, String>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct VersionStore {
    versions: OrdMap<String, Versions>,
    // key -> (write time of a version -> latest commit time of a read of it)
    last_reads: OrdMap<String, OrdMap<Timestamp, Timestamp>>,
}

fn versioned(write_time: &Timestamp, value: &str) -> VersionedValue {
    VersionedValue {
        value: value.to_string(),
        write_time: *write_time,
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the latest version of `key`, if it was ever written.
    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.versions
            .get(key)
            .and_then(|versions| versions.get_max())
            .map(|(time, value)| versioned(time, value))
    }

    /// Returns the version of `key` valid at `time`: the one with the
    /// greatest write time not after `time`.
    pub fn get_at(&self, key: &str, time: Timestamp) -> Option<VersionedValue> {
        self.versions
            .get(key)
            .and_then(|versions| versions.range(..=time).next_back())
            .map(|(time, value)| versioned(time, value))
    }

    /// Adds a version. Callers are responsible for choosing `time`; the
    /// store keeps versions ordered whatever order they arrive in.
    pub fn put(&mut self, key: &str, value: impl Into<String>, time: Timestamp) {
        let value = value.into();
        match self.versions.get_mut(key) {
            Some(versions) => {
                if let Some(old) = versions.insert(time, value) {
                    // A re-applied commit writes the same value again.
                    if versions.get(&time) != Some(&old) {
                        debug!(key, %time, %old, "replaced version with the same write time");
                    }
                }
            }
            None => {
                self.versions.insert(key.to_string(), OrdMap::unit(time, value));
            }
        }
    }

    /// Records that the version of `key` written at `read_time` was read by a
    /// transaction that committed at `commit_time`. Only the latest such
    /// commit is remembered.
    pub fn commit_get(&mut self, key: &str, read_time: Timestamp, commit_time: Timestamp) {
        match self.last_reads.get_mut(key) {
            Some(reads) => {
                let latest = reads
                    .get(&read_time)
                    .map_or(commit_time, |prev| (*prev).max(commit_time));
                reads.insert(read_time, latest);
            }
            None => {
                self.last_reads
                    .insert(key.to_string(), OrdMap::unit(read_time, commit_time));
            }
        }
    }

    /// Returns the latest read-commit time recorded against the version of
    /// `key` valid at `time`, if that version exists and was ever read.
    pub fn get_last_read(&self, key: &str, time: Timestamp) -> Option<Timestamp> {
        let version = self.get_at(key, time)?;
        self.last_reads
            .get(key)
            .and_then(|reads| reads.get(&version.write_time))
            .copied()
    }

    /// Returns the validity interval `[start, end)` of the version of `key`
    /// valid at `time`. `end` is `None` while that version is the latest.
    pub fn get_range(&self, key: &str, time: Timestamp) -> Option<(Timestamp, Option<Timestamp>)> {
        let versions = self.versions.get(key)?;
        let (start, _) = versions.range(..=time).next_back()?;
        let end = versions
            .range((Bound::Excluded(*start), Bound::Unbounded))
            .next()
            .map(|(t, _)| *t);
        Some((*start, end))
    }

    pub fn version_count(&self, key: &str) -> usize {
        self.versions.get(key).map_or(0, |versions| versions.len())
    }
}
