// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The call-with-timeout primitive IR clients use to reach replicas, and an
//! in-process network implementing it.

use crate::{Error, Message, ReplicaAddress, ReplicaId, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::trace;

/// Client side of the wire: deliver one message to a replica and return
/// its answer. Implementations report unreachable replicas as errors; the
/// IR client treats those as missing votes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, target: ReplicaId, msg: Message) -> Result<Message>;
}

/// Server side of the wire.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_operation(&self, msg: Message) -> Result<Message>;
}

#[derive(Default)]
struct Listeners {
    handlers: HashMap<ReplicaAddress, Arc<dyn MessageHandler>>,
    delays: HashMap<ReplicaAddress, Duration>,
}

/// An in-process stand-in for the network: handlers listen on addresses,
/// and calls to an address nobody listens on fail the way a refused
/// connection would. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    listeners: Arc<RwLock<Listeners>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&self, address: &ReplicaAddress, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut listeners = self.listeners.write().expect("network listeners lock");
        if listeners.handlers.contains_key(address) {
            return Err(Error::AddressInUse(address.to_string()));
        }
        listeners.handlers.insert(address.clone(), handler);
        Ok(())
    }

    /// Stops delivering to `address`. Returns whether anything was
    /// listening there.
    pub fn close(&self, address: &ReplicaAddress) -> bool {
        let mut listeners = self.listeners.write().expect("network listeners lock");
        listeners.handlers.remove(address).is_some()
    }

    pub fn is_listening(&self, address: &ReplicaAddress) -> bool {
        let listeners = self.listeners.read().expect("network listeners lock");
        listeners.handlers.contains_key(address)
    }

    /// Delays every message delivered to `address` by `delay`.
    pub fn set_delay(&self, address: &ReplicaAddress, delay: Duration) {
        let mut listeners = self.listeners.write().expect("network listeners lock");
        listeners.delays.insert(address.clone(), delay);
    }

    pub fn clear_delay(&self, address: &ReplicaAddress) {
        let mut listeners = self.listeners.write().expect("network listeners lock");
        listeners.delays.remove(address);
    }

    /// Returns a transport that resolves replica ids through `addresses`.
    pub fn transport(&self, addresses: BTreeMap<ReplicaId, ReplicaAddress>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            addresses,
        }
    }

    fn delay(&self, address: &ReplicaAddress) -> Option<Duration> {
        let listeners = self.listeners.read().expect("network listeners lock");
        listeners.delays.get(address).copied()
    }

    fn handler(&self, address: &ReplicaAddress) -> Option<Arc<dyn MessageHandler>> {
        let listeners = self.listeners.read().expect("network listeners lock");
        listeners.handlers.get(address).cloned()
    }
}

pub struct LocalTransport {
    network: LocalNetwork,
    addresses: BTreeMap<ReplicaId, ReplicaAddress>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, target: ReplicaId, msg: Message) -> Result<Message> {
        let address = self
            .addresses
            .get(&target)
            .ok_or(Error::UnknownReplica(target))?;
        if let Some(delay) = self.network.delay(address) {
            tokio::time::sleep(delay).await;
        }
        let handler = self.network.handler(address).ok_or_else(|| Error::Transport {
            replica: target,
            reason: format!("connection refused at {}", address),
        })?;
        trace!(replica = target, op = %msg.operation_id, kind = ?msg.msg_type, "deliver");
        handler.handle_operation(msg)
    }
}
