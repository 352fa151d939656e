// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ClientId, Error, Result, Timestamp, Transaction, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four TAPIR operations carried over IR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OpType {
    Get,
    Prepare,
    Commit,
    Abort,
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ReplyStatus {
    #[default]
    Ok,
    Abort,
    Retry,
    Abstain,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GetMessage {
    pub key: String,
    pub timestamp: Option<Timestamp>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrepareMessage {
    pub txn: Transaction,
    pub timestamp: Timestamp,
}

/// Commit carries the transaction along with its timestamp, so a replica
/// that missed the prepare can still apply the writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitMessage {
    pub timestamp: Timestamp,
    pub txn: Option<Transaction>,
}

/// A TAPIR request. Exactly one of the payloads is set, matching `op`
/// (ABORT has none); the constructors below are the way to build one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub op: OpType,
    pub txn_id: TxnId,
    pub get: Option<GetMessage>,
    pub prepare: Option<PrepareMessage>,
    pub commit: Option<CommitMessage>,
}

impl Request {
    fn bare(op: OpType, txn_id: TxnId) -> Self {
        Request {
            op,
            txn_id,
            get: None,
            prepare: None,
            commit: None,
        }
    }

    pub fn get(txn_id: TxnId, key: impl Into<String>, timestamp: Option<Timestamp>) -> Self {
        Request {
            get: Some(GetMessage {
                key: key.into(),
                timestamp,
            }),
            ..Self::bare(OpType::Get, txn_id)
        }
    }

    pub fn prepare(txn: Transaction, timestamp: Timestamp) -> Self {
        let txn_id = txn.id;
        Request {
            prepare: Some(PrepareMessage { txn, timestamp }),
            ..Self::bare(OpType::Prepare, txn_id)
        }
    }

    pub fn commit(txn_id: TxnId, timestamp: Timestamp, txn: Option<Transaction>) -> Self {
        Request {
            commit: Some(CommitMessage { timestamp, txn }),
            ..Self::bare(OpType::Commit, txn_id)
        }
    }

    pub fn abort(txn_id: TxnId) -> Self {
        Self::bare(OpType::Abort, txn_id)
    }

    pub fn get_payload(&self) -> Result<&GetMessage> {
        self.get
            .as_ref()
            .ok_or_else(|| Error::protocol(format!("{:?} request without get payload", self.op)))
    }

    pub fn prepare_payload(&self) -> Result<&PrepareMessage> {
        self.prepare.as_ref().ok_or_else(|| {
            Error::protocol(format!("{:?} request without prepare payload", self.op))
        })
    }

    pub fn commit_payload(&self) -> Result<&CommitMessage> {
        self.commit.as_ref().ok_or_else(|| {
            Error::protocol(format!("{:?} request without commit payload", self.op))
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub status: ReplyStatus,
    pub value: String,
    pub timestamp: Option<Timestamp>,
}

impl Response {
    pub fn new(status: ReplyStatus) -> Self {
        Response {
            status,
            ..Default::default()
        }
    }

    pub fn ok() -> Self {
        Self::new(ReplyStatus::Ok)
    }

    pub fn with_time(status: ReplyStatus, timestamp: Timestamp) -> Self {
        Response {
            status,
            value: String::new(),
            timestamp: Some(timestamp),
        }
    }

    pub fn read(value: impl Into<String>, version: Timestamp) -> Self {
        Response {
            status: ReplyStatus::Ok,
            value: value.into(),
            timestamp: Some(version),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }
}

/// IR message kinds. Replicas only ever receive `Propose` and `Finalize`;
/// `Reply` and `Confirm` flow back to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    Propose,
    Reply,
    Finalize,
    Confirm,
}

/// Which IR operation class a request belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtoType {
    Consensus,
    Inconsistent,
}

/// Identifies one IR invocation: the invoking client plus its own counter.
/// A propose and the finalize that follows it share an id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OperationId {
    pub client_id: ClientId,
    pub seq: u64,
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}.{}", self.client_id, self.seq)
    }
}

/// The envelope exchanged between IR clients and replicas. Unlogged reads
/// travel as an untagged `Finalize` carrying a GET.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MsgType,
    pub operation_id: OperationId,
    pub request: Option<Request>,
    pub response: Option<Response>,
    pub proto_type: Option<ProtoType>,
}

impl Message {
    pub fn propose(operation_id: OperationId, request: Request, proto_type: ProtoType) -> Self {
        Message {
            msg_type: MsgType::Propose,
            operation_id,
            request: Some(request),
            response: None,
            proto_type: Some(proto_type),
        }
    }

    pub fn finalize(
        operation_id: OperationId,
        request: Request,
        proto_type: Option<ProtoType>,
        decided: Option<Response>,
    ) -> Self {
        Message {
            msg_type: MsgType::Finalize,
            operation_id,
            request: Some(request),
            response: decided,
            proto_type,
        }
    }

    pub fn reply(operation_id: OperationId, response: Response) -> Self {
        Message {
            msg_type: MsgType::Reply,
            operation_id,
            request: None,
            response: Some(response),
            proto_type: None,
        }
    }

    pub fn confirm(operation_id: OperationId) -> Self {
        Message {
            msg_type: MsgType::Confirm,
            operation_id,
            request: None,
            response: None,
            proto_type: None,
        }
    }

    /// Unwraps the response of a reply, treating anything else as a
    /// protocol violation by the sender.
    pub fn into_response(self) -> Result<Response> {
        match (self.msg_type, self.response) {
            (MsgType::Reply, Some(response)) => Ok(response),
            (msg_type, _) => Err(Error::protocol(format!(
                "expected reply with response for {}, got {:?}",
                self.operation_id, msg_type
            ))),
        }
    }
}
