// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements Inconsistent Replication (IR), a replication
 * protocol that gives up on ordering whatever it can, and a small
 * transactional key-value store in the style of TAPIR layered on top of it.
 *
 * IR offers two kinds of replicated operation:
 *
 *   - _Inconsistent_ operations, which every replica executes in whatever
 *     order they arrive. They only need a quorum of acknowledgements and
 *     never need agreement on a result.
 *
 *   - _Consensus_ operations, which every replica executes tentatively and
 *     whose results must be reconciled. If enough replicas return the same
 *     result quickly, that result stands (the fast path). Otherwise a
 *     client-supplied `decide` function merges the replies of a quorum into
 *     one result (the slow path). Either way the chosen result is then
 *     finalized at every replica.
 *
 * Reads that need neither go straight to one replica as _unlogged_
 * operations.
 *
 * The transactional layer buffers reads and writes at the client and
 * validates them at commit time with optimistic concurrency control: the
 * PREPARE that certifies a transaction is a consensus operation, and the
 * COMMIT or ABORT that follows it is an inconsistent one. Replicas keep a
 * multi-versioned store, so validation can reason about exactly which
 * version each read saw.
 *
 * Replicas are in-process objects reached through the [`Transport`] trait;
 * [`LocalNetwork`] is an in-process implementation of it with enough fault
 * injection (stopped replicas, delayed replicas) to exercise the quorum
 * logic.
 *
 * There is no persistence, no view change and no garbage collection of old
 * versions.
 *
 * ## Reference
 *
 * Irene Zhang, Naveen Kr. Sharma, Adriana Szekeres, Arvind Krishnamurthy,
 * Dan R. K. Ports. Building Consistent Transactions with Inconsistent
 * Replication. SOSP 2015.
 *
 * https://syslab.cs.washington.edu/papers/tapir-tr-v2.pdf
 *
 * ## Name
 *
 * TAPIR stands for the Transactional Application Protocol for Inconsistent
 * Replication. Wikipedia:
 *
 * > Tapirs are large, herbivorous mammals, similar in shape to a pig, with
 * > a short, prehensile nose trunk.
 */

mod cfg;
mod client;
mod error;
mod message;
mod occ;
mod record;
mod replica;
mod store;
mod tapir;
mod timestamp;
mod transaction;
mod transport;

pub use cfg::{ClientConfig, Config, ReplicaAddress, ReplicaId};
pub use client::IrClient;
pub use error::{Error, Result};
pub use message::{
    CommitMessage, GetMessage, Message, MsgType, OpType, OperationId, PrepareMessage, ProtoType,
    ReplyStatus, Request, Response,
};
pub use occ::{TapirReplica, TapirServer, TimedTransaction};
pub use record::{Record, RecordEntry, RecordState};
pub use replica::{AppReplica, IrReplica};
pub use store::{VersionStore, VersionedValue};
pub use tapir::{decide, CommitOutcome, TapirClient};
pub use timestamp::{ClientId, Clock, Timestamp};
pub use transaction::{Transaction, TxnId};
pub use transport::{LocalNetwork, LocalTransport, MessageHandler, Transport};


#[cfg(test)]
mod stateright_tests;
