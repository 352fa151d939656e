// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::ReplicaId;

/// Errors surfaced by the replication and transaction layers.
///
/// Conflict outcomes (ABORT, ABSTAIN, RETRY) are not errors; they travel as
/// [`crate::ReplyStatus`] values. Errors are reserved for things that went
/// wrong with the protocol or the plumbing underneath it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("quorum unreachable: {received} of {needed} replicas replied in time")]
    QuorumUnreachable { received: usize, needed: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("key {0:?} not found")]
    KeyNotFound(String),

    #[error("replica {replica} unreachable: {reason}")]
    Transport { replica: ReplicaId, reason: String },

    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),

    #[error("address {0} already in use")]
    AddressInUse(String),

    #[error("no active transaction")]
    NoActiveTransaction,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
