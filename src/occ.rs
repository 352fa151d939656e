// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The replica side of TAPIR: an optimistic-concurrency certifier sitting in
//! front of a [`VersionStore`].
//!
//! `TapirReplica` is a plain state machine with no locking and no I/O, in
//! the same spirit as a stepped participant: it can be cloned, hashed and
//! driven by a model checker. [`TapirServer`] is the thin shared wrapper
//! that puts it behind one lock and plugs it into IR as upcalls.

use crate::{
    AppReplica, Error, OpType, ReplicaId, ReplyStatus, Request, Response, Result, Timestamp,
    Transaction, TxnId, VersionStore,
};
use im::OrdMap;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::{debug, trace, warn};

/// A transaction this replica has certified, waiting for commit or abort.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimedTransaction {
    pub txn: Transaction,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TapirReplica {
    id: ReplicaId,
    store: VersionStore,
    prepared: OrdMap<TxnId, TimedTransaction>,
}

impl TapirReplica {
    pub fn new(id: ReplicaId) -> Self {
        TapirReplica {
            id,
            store: VersionStore::new(),
            prepared: OrdMap::new(),
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn prepared(&self, txn_id: TxnId) -> Option<&TimedTransaction> {
        self.prepared.get(&txn_id)
    }

    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    /// Certifies `txn` at `timestamp`. Re-preparing at the timestamp already
    /// certified is a no-op returning OK; preparing at a different timestamp
    /// throws away the old certification and starts over.
    pub fn prepare(&mut self, txn: &Transaction, timestamp: Timestamp) -> Response {
        if let Some(existing) = self.prepared.get(&txn.id) {
            if existing.timestamp == timestamp {
                trace!(replica = self.id, txn = %txn.id, "already prepared");
                return Response::ok();
            }
            debug!(replica = self.id, txn = %txn.id, old = %existing.timestamp,
                   new = %timestamp, "re-preparing at new timestamp");
            self.prepared.remove(&txn.id);
        }
        let response = self.occ_check(txn, timestamp);
        debug!(replica = self.id, txn = %txn.id, ts = %timestamp,
               status = ?response.status, "prepare");
        response
    }

    fn occ_check(&mut self, txn: &Transaction, timestamp: Timestamp) -> Response {
        let prepared_reads = self.prepared_reads();
        let prepared_writes = self.prepared_writes();

        for (key, version) in txn.read_time.iter() {
            if let Some(latest) = self.store.get(key) {
                if *version < latest.write_time {
                    return Response::new(ReplyStatus::Abort);
                }
            }
            if let Some(earliest_write) = prepared_writes.get(key.as_str()) {
                if version < earliest_write {
                    return Response::new(ReplyStatus::Abstain);
                }
            }
        }

        for key in txn.write_set.keys() {
            if let Some(latest_read) = prepared_reads.get(key.as_str()) {
                if timestamp < *latest_read {
                    return Response::with_time(ReplyStatus::Retry, *latest_read);
                }
            }
            if let Some(last_read) = self.store.get_last_read(key, timestamp) {
                if timestamp < last_read {
                    return Response::with_time(ReplyStatus::Retry, last_read);
                }
            }
        }

        self.prepared.insert(
            txn.id,
            TimedTransaction {
                txn: txn.clone(),
                timestamp,
            },
        );
        Response::ok()
    }

    // Latest prepared timestamp among transactions reading each key.
    fn prepared_reads(&self) -> BTreeMap<&str, Timestamp> {
        let mut reads: BTreeMap<&str, Timestamp> = BTreeMap::new();
        for timed in self.prepared.values() {
            for key in timed.txn.read_set.keys() {
                let entry = reads.entry(key.as_str()).or_insert(timed.timestamp);
                *entry = (*entry).max(timed.timestamp);
            }
        }
        reads
    }

    // Earliest prepared timestamp among transactions writing each key.
    fn prepared_writes(&self) -> BTreeMap<&str, Timestamp> {
        let mut writes: BTreeMap<&str, Timestamp> = BTreeMap::new();
        for timed in self.prepared.values() {
            for key in timed.txn.write_set.keys() {
                let entry = writes.entry(key.as_str()).or_insert(timed.timestamp);
                *entry = (*entry).min(timed.timestamp);
            }
        }
        writes
    }

    /// Reads the latest committed version of `key`. Prepared writes are
    /// never visible here.
    pub fn read(&self, key: &str) -> Result<(String, Timestamp)> {
        self.store
            .get(key)
            .map(|v| (v.value, v.write_time))
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Applies a transaction at `timestamp`. The prepared entry is used if
    /// there is one; otherwise the transaction carried by the commit is
    /// adopted. Having neither means a commit arrived for a transaction no
    /// quorum could have prepared.
    pub fn commit(
        &mut self,
        txn_id: TxnId,
        timestamp: Timestamp,
        carried: Option<&Transaction>,
    ) -> Result<()> {
        let timed = match self.prepared.remove(&txn_id) {
            Some(timed) => timed,
            None => match carried {
                Some(txn) => {
                    debug!(replica = self.id, txn = %txn_id, "commit of unprepared transaction");
                    TimedTransaction {
                        txn: txn.clone(),
                        timestamp,
                    }
                }
                None => {
                    return Err(Error::protocol(format!(
                        "commit of unknown transaction {} at replica {}",
                        txn_id, self.id
                    )))
                }
            },
        };
        for (key, version) in timed.txn.read_time.iter() {
            self.store.commit_get(key, *version, timestamp);
        }
        for (key, value) in timed.txn.write_set.iter() {
            self.store.put(key, value.clone(), timestamp);
        }
        debug!(replica = self.id, txn = %txn_id, ts = %timestamp,
               writes = timed.txn.write_set.len(), "committed");
        Ok(())
    }

    pub fn abort(&mut self, txn_id: TxnId) {
        if self.prepared.remove(&txn_id).is_some() {
            debug!(replica = self.id, txn = %txn_id, "aborted prepared transaction");
        }
    }
}

/// A [`TapirReplica`] behind a lock, exposed to IR through the three
/// upcalls. The one lock covers the prepared set and the store together, so
/// certification and application never interleave.
#[derive(Debug)]
pub struct TapirServer {
    replica: Mutex<TapirReplica>,
}

impl TapirServer {
    pub fn new(id: ReplicaId) -> Self {
        TapirServer {
            replica: Mutex::new(TapirReplica::new(id)),
        }
    }

    /// Runs `f` with exclusive access to the replica state.
    pub fn with_replica<T>(&self, f: impl FnOnce(&mut TapirReplica) -> T) -> T {
        let mut replica = self.replica.lock().expect("tapir replica lock");
        f(&mut replica)
    }
}

impl AppReplica for TapirServer {
    fn exec_inconsistent_upcall(&self, request: &Request) -> Result<()> {
        match request.op {
            OpType::Commit => {
                let commit = request.commit_payload()?;
                self.with_replica(|r| r.commit(request.txn_id, commit.timestamp, commit.txn.as_ref()))
            }
            OpType::Abort => {
                self.with_replica(|r| r.abort(request.txn_id));
                Ok(())
            }
            op => {
                warn!(?op, "unrecognized inconsistent operation");
                Err(Error::protocol(format!("{:?} is not an inconsistent operation", op)))
            }
        }
    }

    fn exec_consensus_upcall(&self, request: &Request) -> Result<Response> {
        match request.op {
            OpType::Prepare => {
                let prepare = request.prepare_payload()?;
                Ok(self.with_replica(|r| r.prepare(&prepare.txn, prepare.timestamp)))
            }
            op => Err(Error::protocol(format!("{:?} is not a consensus operation", op))),
        }
    }

    fn exec_unlogged_upcall(&self, request: &Request) -> Result<Response> {
        match request.op {
            OpType::Get => {
                let get = request.get_payload()?;
                let (value, version) = self.with_replica(|r| r.read(&get.key))?;
                Ok(Response::read(value, version))
            }
            op => Err(Error::protocol(format!("{:?} is not an unlogged operation", op))),
        }
    }
}
