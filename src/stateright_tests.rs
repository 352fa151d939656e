// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

// Exhaustively interleaves two read-modify-writes of the same key against
// one certifier. Both read the version written at time 1; whatever order
// their prepares, commits and aborts arrive in, at most one may commit.

use crate::{ReplyStatus, TapirReplica, Timestamp, Transaction, TxnId};
use stateright::{Checker, Model, Property};

const KEY: &str = "k";
const TIMES: [u64; 2] = [10, 20];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Phase {
    Idle,
    Prepared(Timestamp),
    Committed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct OccState {
    replica: TapirReplica,
    phases: [Phase; 2],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Step {
    Prepare(usize, u64),
    Commit(usize),
    Abort(usize),
}

struct OccModel {
    txns: [Transaction; 2],
}

impl OccModel {
    fn new() -> Self {
        let rmw = |i: usize| {
            let mut txn = Transaction::new(TxnId {
                client_id: i as u64 + 1,
                seq: 1,
            });
            txn.add_read(KEY, "v0", Timestamp::new(1, 0));
            txn.add_write(KEY, format!("v{}", i + 1));
            txn
        };
        OccModel {
            txns: [rmw(0), rmw(1)],
        }
    }
}

impl Model for OccModel {
    type State = OccState;
    type Action = Step;

    fn init_states(&self) -> Vec<Self::State> {
        let mut replica = TapirReplica::new(0);
        let mut seed = Transaction::new(TxnId {
            client_id: 0,
            seq: 1,
        });
        seed.add_write(KEY, "v0");
        replica.commit(seed.id, Timestamp::new(1, 0), Some(&seed)).unwrap();
        vec![OccState {
            replica,
            phases: [Phase::Idle, Phase::Idle],
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (i, phase) in state.phases.iter().enumerate() {
            match phase {
                Phase::Idle => {
                    for time in TIMES {
                        actions.push(Step::Prepare(i, time));
                    }
                }
                Phase::Prepared(_) => {
                    actions.push(Step::Commit(i));
                    actions.push(Step::Abort(i));
                }
                Phase::Committed | Phase::Aborted => {}
            }
        }
    }

    fn next_state(&self, last: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = last.clone();
        match action {
            Step::Prepare(i, time) => {
                let txn = &self.txns[i];
                let ts = Timestamp::new(time, txn.id.client_id);
                next.phases[i] = match next.replica.prepare(txn, ts).status {
                    ReplyStatus::Ok => Phase::Prepared(ts),
                    ReplyStatus::Retry => Phase::Idle,
                    ReplyStatus::Abort | ReplyStatus::Abstain => {
                        next.replica.abort(txn.id);
                        Phase::Aborted
                    }
                };
            }
            Step::Commit(i) => {
                let Phase::Prepared(ts) = last.phases[i] else {
                    return None;
                };
                next.replica.commit(self.txns[i].id, ts, None).ok()?;
                next.phases[i] = Phase::Committed;
            }
            Step::Abort(i) => {
                next.replica.abort(self.txns[i].id);
                next.phases[i] = Phase::Aborted;
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("at most one commits", |_: &OccModel, state: &OccState| {
                state
                    .phases
                    .iter()
                    .filter(|p| **p == Phase::Committed)
                    .count()
                    <= 1
            }),
            Property::always("no lost update", |_: &OccModel, state: &OccState| {
                state.replica.store().version_count(KEY) <= 2
            }),
            Property::always("prepared matches phases", |_: &OccModel, state: &OccState| {
                let prepared = state
                    .phases
                    .iter()
                    .filter(|p| matches!(p, Phase::Prepared(_)))
                    .count();
                state.replica.prepared_count() == prepared
            }),
            Property::sometimes("something commits", |_: &OccModel, state: &OccState| {
                state.phases.contains(&Phase::Committed)
            }),
        ]
    }
}

#[test]
fn read_modify_writes_never_both_commit() {
    OccModel::new()
        .checker()
        .threads(num_cpus::get())
        .spawn_bfs()
        .join()
        .assert_properties();
}
