// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The replica half of Inconsistent Replication.
//!
//! An [`IrReplica`] keeps the operation [`Record`] and routes each incoming
//! propose or finalize to one of the three upcalls of the application it
//! replicates. It knows nothing about what the operations mean beyond their
//! [`OpType`]; the application behind [`AppReplica`] does the work.

use crate::{
    Error, LocalNetwork, Message, MessageHandler, MsgType, OpType, OperationId, ProtoType,
    Record, RecordState, ReplicaAddress, ReplicaId, ReplyStatus, Request, Response, Result,
};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

/// The application side of a replica.
pub trait AppReplica: Send + Sync + 'static {
    /// Runs an operation that needs no agreement on order or result.
    fn exec_inconsistent_upcall(&self, request: &Request) -> Result<()>;
    /// Runs an operation whose result replicas must agree on.
    fn exec_consensus_upcall(&self, request: &Request) -> Result<Response>;
    /// Runs a read that bypasses the record entirely.
    fn exec_unlogged_upcall(&self, request: &Request) -> Result<Response>;
}

pub struct IrReplica {
    id: ReplicaId,
    address: ReplicaAddress,
    app: Arc<dyn AppReplica>,
    record: Mutex<Record>,
    network: Mutex<Option<LocalNetwork>>,
}

impl IrReplica {
    /// A replica that is not yet reachable; see [`IrReplica::start`].
    pub fn new(id: ReplicaId, address: ReplicaAddress, app: Arc<dyn AppReplica>) -> Self {
        IrReplica {
            id,
            address,
            app,
            record: Mutex::new(Record::new()),
            network: Mutex::new(None),
        }
    }

    /// Creates a replica and makes it reachable at `address` on `network`.
    pub fn start(
        id: ReplicaId,
        address: ReplicaAddress,
        app: Arc<dyn AppReplica>,
        network: &LocalNetwork,
    ) -> Result<Arc<Self>> {
        let replica = Arc::new(Self::new(id, address, app));
        network.listen(&replica.address, replica.clone())?;
        *replica.network.lock().expect("replica network lock") = Some(network.clone());
        info!(replica = id, address = %replica.address, "replica listening");
        Ok(replica)
    }

    /// Stops accepting messages. The record is kept.
    pub fn stop(&self) {
        if let Some(network) = self.network.lock().expect("replica network lock").take() {
            network.close(&self.address);
            info!(replica = self.id, address = %self.address, "replica stopped");
        }
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn address(&self) -> &ReplicaAddress {
        &self.address
    }

    pub fn record_state(&self, op: &OperationId) -> Option<RecordState> {
        self.lock_record().state(op)
    }

    pub fn record_len(&self) -> usize {
        self.lock_record().len()
    }

    fn lock_record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().expect("ir record lock")
    }

    fn is_finalized(&self, op: &OperationId) -> bool {
        self.lock_record().state(op) == Some(RecordState::Finalized)
    }

    pub fn handle_operation(&self, msg: Message) -> Result<Message> {
        let op = msg.operation_id;
        let outcome = match msg.msg_type {
            MsgType::Propose => match msg.request {
                Some(request) => self.on_propose(op, request, msg.proto_type),
                None => Err(Error::protocol(format!("propose {} without request", op))),
            },
            MsgType::Finalize => match msg.request {
                Some(request) => self.on_finalize(op, request, msg.proto_type, msg.response),
                None => Err(Error::protocol(format!("finalize {} without request", op))),
            },
            kind => Err(Error::protocol(format!(
                "replica cannot handle {:?} for {}",
                kind, op
            ))),
        };
        if let Err(e) = &outcome {
            warn!(replica = self.id, %op, error = %e, "rejected message");
        }
        outcome
    }

    fn on_propose(
        &self,
        op: OperationId,
        request: Request,
        proto_type: Option<ProtoType>,
    ) -> Result<Message> {
        let proto_type = proto_type
            .ok_or_else(|| Error::protocol(format!("propose {} without protocol type", op)))?;

        if let Some(entry) = self.lock_record().get(&op) {
            trace!(replica = self.id, %op, "duplicate propose");
            let response = entry.result.clone().unwrap_or_else(Response::ok);
            return Ok(Message::reply(op, response));
        }

        let result = match proto_type {
            ProtoType::Consensus => Some(self.app.exec_consensus_upcall(&request)?),
            ProtoType::Inconsistent => None,
        };
        let response = result.clone().unwrap_or_else(Response::ok);
        self.lock_record().propose(op, request, proto_type, result);
        debug!(replica = self.id, %op, ?proto_type, status = ?response.status, "tentative");
        Ok(Message::reply(op, response))
    }

    fn on_finalize(
        &self,
        op: OperationId,
        request: Request,
        proto_type: Option<ProtoType>,
        decided: Option<Response>,
    ) -> Result<Message> {
        match request.op {
            OpType::Prepare => {
                let executed = self
                    .lock_record()
                    .get(&op)
                    .map_or(false, |entry| entry.result.is_some());
                if !executed {
                    let local = self.app.exec_consensus_upcall(&request)?;
                    debug!(replica = self.id, %op, status = ?local.status, "late prepare");
                }
                let decided_status = decided.as_ref().map(|r| r.status);
                self.lock_record()
                    .finalize(op, request, ProtoType::Consensus, decided);
                debug!(replica = self.id, %op, decided = ?decided_status, "finalized");
                Ok(Message::reply(
                    op,
                    Response {
                        status: ReplyStatus::Ok,
                        value: "ok".into(),
                        timestamp: None,
                    },
                ))
            }
            OpType::Get => {
                let response = self.app.exec_unlogged_upcall(&request)?;
                Ok(Message::reply(op, response))
            }
            OpType::Abort => {
                if !self.is_finalized(&op) {
                    self.app.exec_inconsistent_upcall(&request)?;
                }
                let proto_type = proto_type.unwrap_or(ProtoType::Inconsistent);
                self.lock_record().finalize(op, request, proto_type, None);
                Ok(Message::reply(op, Response::new(ReplyStatus::Abort)))
            }
            OpType::Commit => match proto_type {
                Some(ProtoType::Consensus) => {
                    let response = self.app.exec_consensus_upcall(&request)?;
                    Ok(Message::reply(op, response))
                }
                Some(ProtoType::Inconsistent) => {
                    if !self.is_finalized(&op) {
                        self.app.exec_inconsistent_upcall(&request)?;
                    }
                    self.lock_record()
                        .finalize(op, request, ProtoType::Inconsistent, None);
                    debug!(replica = self.id, %op, "commit finalized");
                    Ok(Message::reply(op, Response::ok()))
                }
                None => Err(Error::protocol(format!(
                    "commit {} without protocol type",
                    op
                ))),
            },
        }
    }
}

impl MessageHandler for IrReplica {
    fn handle_operation(&self, msg: Message) -> Result<Message> {
        IrReplica::handle_operation(self, msg)
    }
}
