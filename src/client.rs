// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The client half of Inconsistent Replication.
//!
//! Every invocation fans a propose out to all replicas, one task per
//! replica, and a single collector counts what comes back on a channel
//! until it has a quorum or the deadline passes. Each task always sends
//! exactly one outcome, so the collector never waits on a replica that
//! has already failed.
//!
//! Finalize messages are sent in the background. Before starting the next
//! invocation the client waits for the previous finalizes to land (or time
//! out), so replicas observe one client's operations in the order it issued
//! them.

use crate::{
    ClientId, Config, Error, Message, OperationId, ProtoType, ReplicaId, Request, Response,
    Result, Transport,
};
use futures::future::join_all;
use itertools::Itertools;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

type Outcome = (ReplicaId, Result<Message>);

pub struct IrClient {
    client_id: ClientId,
    replicas: Vec<ReplicaId>,
    quorum_size: usize,
    fast_path_threshold: usize,
    fast_path_window: Duration,
    quorum_timeout: Duration,
    finalize_timeout: Duration,
    next_seq: AtomicU64,
    transport: Arc<dyn Transport>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl IrClient {
    pub fn new(config: &Config, transport: Arc<dyn Transport>) -> Self {
        IrClient {
            client_id: config.client.ir_id,
            replicas: config.replicas.keys().copied().collect(),
            quorum_size: config.quorum_size(),
            fast_path_threshold: config.fast_path_threshold(),
            fast_path_window: config.fast_path_window(),
            quorum_timeout: config.quorum_timeout(),
            finalize_timeout: config.finalize_timeout(),
            next_seq: AtomicU64::new(1),
            transport,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    pub fn fast_path_threshold(&self) -> usize {
        self.fast_path_threshold
    }

    fn next_operation_id(&self) -> OperationId {
        OperationId {
            client_id: self.client_id,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Runs `request` on every replica without agreeing on order or
    /// result. Returns once a quorum has acknowledged the propose; the
    /// finalize follows in the background.
    pub async fn invoke_inconsistent(&self, request: Request) -> Result<()> {
        self.settle_finalizes().await;
        let op = self.next_operation_id();
        let mut rx = self.fan_out(Message::propose(op, request.clone(), ProtoType::Inconsistent));

        let deadline = Instant::now() + self.quorum_timeout;
        let mut acks = 0;
        let mut failed = 0;
        while acks < self.quorum_size && acks + failed < self.replicas.len() {
            let Ok(Some((replica, outcome))) = time::timeout_at(deadline, rx.recv()).await else {
                break;
            };
            match outcome.and_then(Message::into_response) {
                Ok(_) => acks += 1,
                Err(e) => {
                    debug!(%op, replica, error = %e, "no ack");
                    failed += 1;
                }
            }
        }
        if acks < self.quorum_size {
            warn!(%op, acks, quorum = self.quorum_size, "inconsistent operation lacks quorum");
            return Err(Error::QuorumUnreachable {
                received: acks,
                needed: self.quorum_size,
            });
        }

        trace!(%op, acks, "inconsistent quorum reached");
        self.dispatch_finalize(Message::finalize(op, request, Some(ProtoType::Inconsistent), None));
        Ok(())
    }

    /// Runs `request` on every replica and agrees on one result. If
    /// strictly more than the fast-path threshold of replicas return the
    /// identical result within the fast-path window, that result stands and
    /// `decide` is never called. Otherwise `decide` merges the replies of at
    /// least a quorum.
    pub async fn invoke_consensus<F>(&self, request: Request, decide: F) -> Result<Response>
    where
        F: FnOnce(&[Response]) -> Response,
    {
        self.settle_finalizes().await;
        let op = self.next_operation_id();
        let mut rx = self.fan_out(Message::propose(op, request.clone(), ProtoType::Consensus));

        let start = Instant::now();
        let fast_deadline = start + self.fast_path_window;
        let deadline = start + self.quorum_timeout;
        let mut replies: Vec<Response> = Vec::with_capacity(self.replicas.len());
        let mut failed = 0;

        loop {
            let in_window = Instant::now() < fast_deadline;
            if in_window {
                if let Some(agreed) = self.fast_path_result(&replies) {
                    debug!(%op, replies = replies.len(), status = ?agreed.status, "fast path");
                    self.dispatch_finalize(Message::finalize(
                        op,
                        request,
                        Some(ProtoType::Consensus),
                        Some(agreed.clone()),
                    ));
                    return Ok(agreed);
                }
            } else if replies.len() >= self.quorum_size {
                break;
            }
            if replies.len() + failed == self.replicas.len() {
                break;
            }
            let wait_until = if in_window { fast_deadline } else { deadline };
            match time::timeout_at(wait_until, rx.recv()).await {
                Ok(Some((replica, outcome))) => match outcome.and_then(Message::into_response) {
                    Ok(response) => replies.push(response),
                    Err(e) => {
                        debug!(%op, replica, error = %e, "no reply");
                        failed += 1;
                    }
                },
                Ok(None) => break,
                // The fast-path window closing is not the end; the overall
                // deadline is.
                Err(_) if in_window => continue,
                Err(_) => break,
            }
        }

        if replies.len() < self.quorum_size {
            warn!(%op, replies = replies.len(), quorum = self.quorum_size,
                  "consensus operation lacks quorum");
            return Err(Error::QuorumUnreachable {
                received: replies.len(),
                needed: self.quorum_size,
            });
        }

        let decided = decide(&replies);
        debug!(%op, replies = replies.len(), status = ?decided.status, "slow path decided");
        self.dispatch_finalize(Message::finalize(
            op,
            request,
            Some(ProtoType::Consensus),
            Some(decided.clone()),
        ));
        Ok(decided)
    }

    /// Sends `request` to one replica, bypassing the record.
    pub async fn invoke_unlogged(&self, replica: ReplicaId, request: Request) -> Result<Response> {
        self.settle_finalizes().await;
        let op = self.next_operation_id();
        let msg = Message::finalize(op, request, None, None);
        match time::timeout(self.quorum_timeout, self.transport.call(replica, msg)).await {
            Ok(reply) => reply?.into_response(),
            Err(_) => Err(Error::Transport {
                replica,
                reason: format!("unlogged {} timed out", op),
            }),
        }
    }

    /// Waits for every finalize dispatched so far. Each one is bounded by
    /// the finalize timeout.
    pub async fn settle_finalizes(&self) {
        let pending = std::mem::take(&mut *self.in_flight.lock().expect("ir in-flight lock"));
        if pending.is_empty() {
            return;
        }
        for joined in join_all(pending).await {
            if let Err(e) = joined {
                warn!(client = self.client_id, error = %e, "finalize task failed");
            }
        }
    }

    fn fast_path_result(&self, replies: &[Response]) -> Option<Response> {
        replies
            .iter()
            .counts()
            .into_iter()
            .find(|(_, count)| *count > self.fast_path_threshold)
            .map(|(response, _)| response.clone())
    }

    fn fan_out(&self, msg: Message) -> mpsc::Receiver<Outcome> {
        let (tx, rx) = mpsc::channel::<Outcome>(self.replicas.len().max(1));
        for replica in self.replicas.iter().copied() {
            let transport = self.transport.clone();
            let tx = tx.clone();
            let msg = msg.clone();
            let rpc_timeout = self.quorum_timeout;
            tokio::spawn(async move {
                let outcome = match time::timeout(rpc_timeout, transport.call(replica, msg)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::Transport {
                        replica,
                        reason: "propose timed out".into(),
                    }),
                };
                let _ = tx.send((replica, outcome)).await;
            });
        }
        rx
    }

    fn dispatch_finalize(&self, msg: Message) {
        let op = msg.operation_id;
        let handles = self.replicas.iter().copied().map(|replica| {
            let transport = self.transport.clone();
            let msg = msg.clone();
            let finalize_timeout = self.finalize_timeout;
            tokio::spawn(async move {
                match time::timeout(finalize_timeout, transport.call(replica, msg)).await {
                    Ok(Ok(_)) => trace!(%op, replica, "finalized"),
                    Ok(Err(e)) => debug!(%op, replica, error = %e, "finalize failed"),
                    Err(_) => debug!(%op, replica, "finalize timed out"),
                }
            })
        });
        let mut in_flight = self.in_flight.lock().expect("ir in-flight lock");
        in_flight.extend(handles);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AppReplica, ClientConfig, IrReplica, LocalNetwork, RecordState, ReplicaAddress,
        ReplyStatus, Timestamp, Transaction, TxnId,
    };
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;

    /// Answers every consensus op with one fixed response.
    struct Fixed(Response);

    impl AppReplica for Fixed {
        fn exec_inconsistent_upcall(&self, _request: &Request) -> Result<()> {
            Ok(())
        }

        fn exec_consensus_upcall(&self, _request: &Request) -> Result<Response> {
            Ok(self.0.clone())
        }

        fn exec_unlogged_upcall(&self, _request: &Request) -> Result<Response> {
            Ok(Response::read("v", Timestamp::new(1, 0)))
        }
    }

    struct Group {
        net: LocalNetwork,
        config: Config,
        replicas: Vec<Arc<IrReplica>>,
    }

    impl Group {
        fn start(answers: Vec<Response>) -> Self {
            let net = LocalNetwork::new();
            let addresses: BTreeMap<ReplicaId, ReplicaAddress> = (0..answers.len() as u64)
                .map(|i| (i, ReplicaAddress::new("localhost", 52000 + i as u16)))
                .collect();
            let replicas = answers
                .into_iter()
                .enumerate()
                .map(|(i, answer)| {
                    let id = i as ReplicaId;
                    IrReplica::start(id, addresses[&id].clone(), Arc::new(Fixed(answer)), &net)
                        .unwrap()
                })
                .collect();
            let mut config = Config::new(ClientConfig::new(1, 0), addresses);
            config.quorum_timeout_ms = 3000;
            Group {
                net,
                config,
                replicas,
            }
        }

        fn client(&self) -> IrClient {
            let transport = self.net.transport(self.config.replicas.clone());
            IrClient::new(&self.config, Arc::new(transport))
        }
    }

    fn prepare() -> Request {
        let id = TxnId {
            client_id: 1,
            seq: 1,
        };
        Request::prepare(Transaction::new(id), Timestamp::new(10, 1))
    }

    fn commit() -> Request {
        let id = TxnId {
            client_id: 1,
            seq: 1,
        };
        Request::commit(id, Timestamp::new(10, 1), Some(Transaction::new(id)))
    }

    #[tokio::test]
    async fn fast_path_skips_decide() {
        let group = Group::start(vec![Response::ok(), Response::ok(), Response::ok()]);
        let client = group.client();
        let called = AtomicBool::new(false);
        let result = client
            .invoke_consensus(prepare(), |_| {
                called.store(true, Ordering::SeqCst);
                Response::new(ReplyStatus::Abort)
            })
            .await
            .unwrap();
        assert_eq!(result, Response::ok());
        assert!(!called.load(Ordering::SeqCst));

        client.settle_finalizes().await;
        let op = OperationId {
            client_id: 1,
            seq: 1,
        };
        for replica in &group.replicas {
            assert_eq!(replica.record_state(&op), Some(RecordState::Finalized));
        }
    }

    #[tokio::test]
    async fn divergent_replies_go_through_decide() {
        let group = Group::start(vec![
            Response::ok(),
            Response::new(ReplyStatus::Abstain),
            Response::with_time(ReplyStatus::Retry, Timestamp::new(20, 2)),
        ]);
        let client = group.client();
        let mut seen = 0;
        let result = client
            .invoke_consensus(prepare(), |replies| {
                seen = replies.len();
                Response::new(ReplyStatus::Abort)
            })
            .await
            .unwrap();
        assert_eq!(result.status, ReplyStatus::Abort);
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn two_of_three_agreeing_is_not_fast() {
        let group = Group::start(vec![
            Response::ok(),
            Response::ok(),
            Response::new(ReplyStatus::Abstain),
        ]);
        group
            .net
            .set_delay(&group.config.replicas[&2], Duration::from_millis(200));
        let client = group.client();
        assert_eq!(client.fast_path_threshold(), 2);

        let called = AtomicBool::new(false);
        let mut seen = 0;
        let result = client
            .invoke_consensus(prepare(), |replies| {
                called.store(true, Ordering::SeqCst);
                seen = replies.len();
                Response::new(ReplyStatus::Abort)
            })
            .await
            .unwrap();
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(seen, 3);
        assert_eq!(result.status, ReplyStatus::Abort);
    }

    #[tokio::test]
    async fn slow_replica_falls_back_to_decide_after_window() {
        let mut group = Group::start(vec![Response::ok(), Response::ok(), Response::ok()]);
        group.config.fast_path_window_ms = 100;
        group
            .net
            .set_delay(&group.config.replicas[&2], Duration::from_secs(2));
        let client = group.client();
        let started = std::time::Instant::now();
        let mut seen = 0;
        let result = client
            .invoke_consensus(prepare(), |replies| {
                seen = replies.len();
                Response::ok()
            })
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(seen, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn single_replica_always_decides() {
        let group = Group::start(vec![Response::ok()]);
        let client = group.client();
        let called = AtomicBool::new(false);
        let result = client
            .invoke_consensus(prepare(), |replies| {
                called.store(true, Ordering::SeqCst);
                replies[0].clone()
            })
            .await
            .unwrap();
        assert!(result.is_ok());
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inconsistent_needs_a_quorum() {
        let group = Group::start(vec![Response::ok(), Response::ok(), Response::ok()]);
        let client = group.client();
        client.invoke_inconsistent(commit()).await.unwrap();

        group.replicas[1].stop();
        group.replicas[2].stop();
        let err = client.invoke_inconsistent(commit()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::QuorumUnreachable {
                received: 1,
                needed: 2
            }
        ));
        let err = client
            .invoke_consensus(prepare(), |_| Response::ok())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuorumUnreachable { .. }));
    }

    #[tokio::test]
    async fn unlogged_reads_one_replica() {
        let group = Group::start(vec![Response::ok(), Response::ok(), Response::ok()]);
        let client = group.client();
        let id = TxnId {
            client_id: 1,
            seq: 1,
        };
        let reply = client
            .invoke_unlogged(2, Request::get(id, "k", None))
            .await
            .unwrap();
        assert_eq!(reply.value, "v");
        assert_eq!(group.replicas[2].record_len(), 0);

        group.replicas[2].stop();
        assert!(matches!(
            client.invoke_unlogged(2, Request::get(id, "k", None)).await,
            Err(Error::Transport { replica: 2, .. })
        ));
    }
}
