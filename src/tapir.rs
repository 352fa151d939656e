// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The transaction driver applications talk to.
//!
//! Reads and writes are buffered locally; nothing is replicated until
//! commit. Commit certifies the transaction as an IR consensus operation
//! (PREPARE), merging divergent replica verdicts with [`decide`], and then
//! applies it as an IR inconsistent operation (COMMIT).
//!
//! A client runs one transaction at a time. `begin` takes the only permit
//! of a semaphore and the transaction holds it until it commits or aborts,
//! so a second `begin` waits for the first transaction to finish.

use crate::{
    ClientId, Clock, Config, Error, IrClient, ReplicaId, ReplyStatus, Request, Response, Result,
    Timestamp, Transaction, Transport, TxnId,
};
use pergola::{LatticeElt, MaxDef};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

type RetryTimeLE = LatticeElt<MaxDef<Option<Timestamp>>>;

/// Merges the PREPARE replies of at least a quorum of replicas into one
/// verdict. Any ABORT wins outright. Then a quorum of OKs commits, a quorum
/// of ABSTAINs aborts, and any RETRY asks the client to try again after the
/// latest timestamp any replica suggested. Anything else aborts.
pub fn decide(results: &[Response], quorum_size: usize) -> Response {
    let mut ok_count = 0;
    let mut abstain_count = 0;
    let mut retry_time = RetryTimeLE::new_from(None);
    let mut saw_retry = false;

    for result in results {
        match result.status {
            ReplyStatus::Abort => return Response::new(ReplyStatus::Abort),
            ReplyStatus::Ok => ok_count += 1,
            ReplyStatus::Abstain => abstain_count += 1,
            ReplyStatus::Retry => {
                saw_retry = true;
                retry_time = &retry_time + &RetryTimeLE::new_from(result.timestamp);
            }
        }
    }

    if ok_count >= quorum_size {
        Response::ok()
    } else if abstain_count >= quorum_size {
        Response::new(ReplyStatus::Abort)
    } else if saw_retry {
        Response {
            status: ReplyStatus::Retry,
            value: String::new(),
            timestamp: retry_time.value,
        }
    } else {
        Response::new(ReplyStatus::Abort)
    }
}

/// How a commit attempt ended when nothing went wrong underneath.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Timestamp),
    /// The replicas refused; carries the last decided status.
    Aborted(ReplyStatus),
}

impl CommitOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

struct Active {
    txn: Transaction,
    _permit: OwnedSemaphorePermit,
}

pub struct TapirClient {
    clock: Clock,
    next_txn: AtomicU64,
    nearest_replica: ReplicaId,
    max_retries: u32,
    ir: IrClient,
    slot: Arc<Semaphore>,
    active: Mutex<Option<Active>>,
}

impl TapirClient {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        TapirClient {
            clock: Clock::new(config.client.client_id),
            next_txn: AtomicU64::new(1),
            nearest_replica: config.client.nearest_replica,
            max_retries: config.max_retries,
            ir: IrClient::new(config, transport),
            slot: Arc::new(Semaphore::new(1)),
            active: Mutex::new(None),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.clock.id()
    }

    pub fn ir(&self) -> &IrClient {
        &self.ir
    }

    /// Starts a transaction, waiting for the previous one to finish first.
    pub async fn begin(&self) -> Result<TxnId> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::protocol("transaction slot closed"))?;
        let id = TxnId {
            client_id: self.clock.id(),
            seq: self.next_txn.fetch_add(1, Ordering::SeqCst),
        };
        debug!(txn = %id, "begin");
        *self.lock_active() = Some(Active {
            txn: Transaction::new(id),
            _permit: permit,
        });
        Ok(id)
    }

    /// Reads `key`, preferring the transaction's own buffers over the
    /// nearest replica. A value fetched from the replica is remembered
    /// along with its version so commit can validate it.
    pub async fn read(&self, key: &str) -> Result<String> {
        let (txn_id, buffered) = self.with_active(|txn| {
            (txn.id, txn.buffered(key).map(str::to_string))
        })?;
        if let Some(value) = buffered {
            return Ok(value);
        }

        let request = Request::get(txn_id, key, Some(self.clock.tick()));
        let response = match self.ir.invoke_unlogged(self.nearest_replica, request).await {
            Ok(response) => response,
            Err(Error::KeyNotFound(key)) => return Err(Error::KeyNotFound(key)),
            Err(e) => {
                warn!(txn = %txn_id, error = %e, "read failed, aborting");
                self.abort().await;
                return Err(e);
            }
        };
        let version = response
            .timestamp
            .ok_or_else(|| Error::protocol(format!("read of {:?} without a version", key)))?;
        self.with_active(|txn| txn.add_read(key, response.value.clone(), version))?;
        Ok(response.value)
    }

    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        self.with_active(|txn| txn.add_write(key, value))
    }

    /// Tries to commit the active transaction, reporting why it did not.
    /// Errors from the replication layer abort the transaction too.
    pub async fn try_commit(&self) -> Result<CommitOutcome> {
        let active = self.lock_active().take().ok_or(Error::NoActiveTransaction)?;
        let txn = active.txn.clone();
        let quorum_size = self.ir.quorum_size();

        let mut timestamp = self.clock.tick();
        let mut retries = 0;
        let decided = loop {
            let prepare = Request::prepare(txn.clone(), timestamp);
            let decided = match self
                .ir
                .invoke_consensus(prepare, |results| decide(results, quorum_size))
                .await
            {
                Ok(decided) => decided,
                Err(e) => {
                    warn!(txn = %txn.id, error = %e, "prepare failed, aborting");
                    self.send_abort(txn.id).await;
                    return Err(e);
                }
            };
            match (decided.status, decided.timestamp) {
                (ReplyStatus::Retry, Some(suggested)) if retries < self.max_retries => {
                    self.clock.observe(suggested);
                    timestamp = self.clock.tick();
                    retries += 1;
                    debug!(txn = %txn.id, retry = retries, ts = %timestamp, "retrying prepare");
                }
                _ => break decided,
            }
        };

        if !decided.is_ok() {
            info!(txn = %txn.id, status = ?decided.status, "transaction aborted");
            self.send_abort(txn.id).await;
            return Ok(CommitOutcome::Aborted(decided.status));
        }

        let txn_id = txn.id;
        let commit = Request::commit(txn_id, timestamp, Some(txn));
        if let Err(e) = self.ir.invoke_inconsistent(commit).await {
            // Replicas that prepared but never saw the commit would keep
            // blocking conflicting prepares.
            warn!(txn = %txn_id, error = %e, "commit not acknowledged, aborting");
            self.send_abort(txn_id).await;
            return Err(e);
        }
        info!(txn = %txn_id, ts = %timestamp, "transaction committed");
        drop(active);
        Ok(CommitOutcome::Committed(timestamp))
    }

    /// Commits the active transaction, returning whether it took effect.
    pub async fn commit(&self) -> bool {
        match self.try_commit().await {
            Ok(outcome) => outcome.is_committed(),
            Err(e) => {
                warn!(client = self.client_id(), error = %e, "commit failed");
                false
            }
        }
    }

    /// Abandons the active transaction, if any, releasing whatever the
    /// replicas had prepared for it.
    pub async fn abort(&self) {
        let active = self.lock_active().take();
        if let Some(active) = active {
            debug!(txn = %active.txn.id, "abort");
            self.send_abort(active.txn.id).await;
        }
    }

    async fn send_abort(&self, txn_id: TxnId) {
        if let Err(e) = self.ir.invoke_inconsistent(Request::abort(txn_id)).await {
            warn!(txn = %txn_id, error = %e, "abort not acknowledged");
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<Active>> {
        self.active.lock().expect("tapir active transaction lock")
    }

    fn with_active<T>(&self, f: impl FnOnce(&mut Transaction) -> T) -> Result<T> {
        let mut active = self.lock_active();
        let active = active.as_mut().ok_or(Error::NoActiveTransaction)?;
        Ok(f(&mut active.txn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(time: u64) -> Response {
        Response::with_time(ReplyStatus::Retry, Timestamp::new(time, 9))
    }

    fn status(s: ReplyStatus) -> Response {
        Response::new(s)
    }

    #[test]
    fn abort_short_circuits() {
        let results = vec![Response::ok(), Response::ok(), status(ReplyStatus::Abort)];
        assert_eq!(decide(&results, 2).status, ReplyStatus::Abort);
        let results = vec![retry(5), status(ReplyStatus::Abort), retry(7)];
        assert_eq!(decide(&results, 2).status, ReplyStatus::Abort);
    }

    #[test]
    fn ok_quorum_commits() {
        let results = vec![Response::ok(), Response::ok(), retry(5)];
        assert!(decide(&results, 2).is_ok());
        let results = vec![Response::ok()];
        assert!(decide(&results, 1).is_ok());
    }

    #[test]
    fn abstain_quorum_aborts() {
        let results = vec![
            status(ReplyStatus::Abstain),
            status(ReplyStatus::Abstain),
            retry(5),
        ];
        assert_eq!(decide(&results, 2).status, ReplyStatus::Abort);
    }

    #[test]
    fn any_retry_asks_for_latest_time() {
        let results = vec![Response::ok(), retry(5), retry(8)];
        let decided = decide(&results, 2);
        assert_eq!(decided.status, ReplyStatus::Retry);
        assert_eq!(decided.timestamp, Some(Timestamp::new(8, 9)));
    }

    #[test]
    fn anything_else_aborts() {
        let results = vec![Response::ok(), status(ReplyStatus::Abstain)];
        assert_eq!(decide(&results, 2).status, ReplyStatus::Abort);
        assert_eq!(decide(&[], 1).status, ReplyStatus::Abort);
    }
}
