// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ClientId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Transactions are numbered per client; pairing the sequence number with
/// the client id makes the id unique across the whole system, which matters
/// because replicas key their prepared set by it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxnId {
    pub client_id: ClientId,
    pub seq: u64,
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.client_id, self.seq)
    }
}

/// The client-side buffer of one transaction: what it read (and which
/// version it read), and what it intends to write. Nothing here touches a
/// replica until commit time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub read_set: BTreeMap<String, String>,
    /// Write time of the version each read observed.
    pub read_time: BTreeMap<String, Timestamp>,
    pub write_set: BTreeMap<String, String>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Transaction {
            id,
            ..Default::default()
        }
    }

    pub fn add_read(&mut self, key: impl Into<String>, value: impl Into<String>, version: Timestamp) {
        let key = key.into();
        self.read_time.insert(key.clone(), version);
        self.read_set.insert(key, value.into());
    }

    pub fn add_write(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.write_set.insert(key.into(), value.into());
    }

    /// Looks a key up in the local buffers: the write set shadows the read
    /// set, so a transaction always sees its own writes.
    pub fn buffered(&self, key: &str) -> Option<&str> {
        self.write_set
            .get(key)
            .or_else(|| self.read_set.get(key))
            .map(String::as_str)
    }

    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }
}
