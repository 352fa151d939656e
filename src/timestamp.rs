// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use pergola::MaxUnitDefault;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A client identifier, used both to tag timestamps and to scope
/// transaction and operation ids.
pub type ClientId = u64;

/// `Timestamp`s are the logical clock of the system: a wall-clock reading
/// paired with the id of the client that took it. They order first by `time`
/// and then by `id`, so two clients reading the same clock tick still get
/// distinct, totally-ordered timestamps.
///
/// The field order matters: the derived `Ord` compares `time` before `id`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub time: u64,
    pub id: ClientId,
}

impl Timestamp {
    pub const fn new(time: u64, id: ClientId) -> Self {
        Timestamp { time, id }
    }
}

// The default is the least timestamp, so it is the unit of a max-lattice.
impl MaxUnitDefault for Timestamp {}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.time, self.id)
    }
}

fn wall_clock_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .min(u128::from(u64::MAX)) as u64
}

/// Per-client source of timestamps. Every `tick` is strictly later than the
/// previous one from the same clock even if the wall clock stalls or steps
/// backwards, and `observe` pushes the clock past a timestamp learned from
/// elsewhere (a replica asking us to retry later, say).
#[derive(Debug)]
pub struct Clock {
    id: ClientId,
    last: AtomicU64,
}

impl Clock {
    pub fn new(id: ClientId) -> Self {
        Clock {
            id,
            last: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn tick(&self) -> Timestamp {
        let now = wall_clock_nanos();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        Timestamp::new(now.max(prev.saturating_add(1)), self.id)
    }

    pub fn observe(&self, ts: Timestamp) {
        self.last.fetch_max(ts.time, Ordering::SeqCst);
    }
}
