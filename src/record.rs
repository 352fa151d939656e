// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{OperationId, ProtoType, Request, Response};
use pergola::{LatticeElt, MaxDef, MaxUnitDefault};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a logged operation at one replica. The derived order is the
/// lattice order: an entry can only move from `Tentative` to `Finalized`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RecordState {
    #[default]
    Tentative,
    Finalized,
}

impl MaxUnitDefault for RecordState {}

type RecordStateLE = LatticeElt<MaxDef<RecordState>>;

/// What a replica remembers about one IR operation. `result` is the value
/// the replica produced when it executed the operation (consensus
/// operations only), or the decided value once finalized.
#[derive(Clone, Debug)]
pub struct RecordEntry {
    pub request: Request,
    pub proto_type: ProtoType,
    state: RecordStateLE,
    pub result: Option<Response>,
}

impl RecordEntry {
    pub fn state(&self) -> RecordState {
        self.state.value
    }
}

/// The replica-local operation log. This is the replication protocol's own
/// bookkeeping, kept separately from whatever the application tracks.
#[derive(Clone, Debug, Default)]
pub struct Record {
    entries: BTreeMap<OperationId, RecordEntry>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, op: &OperationId) -> Option<&RecordEntry> {
        self.entries.get(op)
    }

    pub fn state(&self, op: &OperationId) -> Option<RecordState> {
        self.entries.get(op).map(RecordEntry::state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logs `op` as tentative. A repeated propose leaves an existing entry
    /// (and its state) alone and returns it.
    pub fn propose(
        &mut self,
        op: OperationId,
        request: Request,
        proto_type: ProtoType,
        result: Option<Response>,
    ) -> &RecordEntry {
        self.entries.entry(op).or_insert_with(|| RecordEntry {
            request,
            proto_type,
            state: RecordStateLE::new_from(RecordState::Tentative),
            result,
        })
    }

    /// Marks `op` finalized, creating the entry if the propose never
    /// arrived here. A decided result, when given, replaces the tentative
    /// one.
    pub fn finalize(
        &mut self,
        op: OperationId,
        request: Request,
        proto_type: ProtoType,
        decided: Option<Response>,
    ) {
        let finalized = RecordStateLE::new_from(RecordState::Finalized);
        let entry = self.entries.entry(op).or_insert_with(|| RecordEntry {
            request,
            proto_type,
            state: RecordStateLE::new_from(RecordState::Tentative),
            result: None,
        });
        entry.state = &entry.state + &finalized;
        if decided.is_some() {
            entry.result = decided;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TxnId;

    fn op(seq: u64) -> OperationId {
        OperationId { client_id: 1, seq }
    }

    fn req() -> Request {
        Request::abort(TxnId {
            client_id: 1,
            seq: 1,
        })
    }

    #[test]
    fn propose_then_finalize() {
        let mut record = Record::new();
        assert!(record.is_empty());
        record.propose(op(1), req(), ProtoType::Inconsistent, None);
        assert_eq!(record.state(&op(1)), Some(RecordState::Tentative));
        record.finalize(op(1), req(), ProtoType::Inconsistent, None);
        assert_eq!(record.state(&op(1)), Some(RecordState::Finalized));
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn late_propose_does_not_demote() {
        let mut record = Record::new();
        record.finalize(op(1), req(), ProtoType::Consensus, Some(Response::ok()));
        let entry = record.propose(op(1), req(), ProtoType::Consensus, None);
        assert_eq!(entry.state(), RecordState::Finalized);
        assert_eq!(entry.result, Some(Response::ok()));
    }

    #[test]
    fn decided_result_replaces_tentative_one() {
        let mut record = Record::new();
        let abstain = Response::new(crate::ReplyStatus::Abstain);
        record.propose(op(2), req(), ProtoType::Consensus, Some(abstain));
        record.finalize(op(2), req(), ProtoType::Consensus, Some(Response::ok()));
        assert_eq!(record.get(&op(2)).unwrap().result, Some(Response::ok()));
    }
}
