// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use gridvm_proto::RuntimeId;

/// The peer table: `runtime_id → (ip, port)`.
///
/// The net handler is the sole mutator; the runtime and the shell read
/// snapshots for listings and migration target checks.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    inner: Arc<Mutex<HashMap<RuntimeId, SocketAddr>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: RuntimeId, addr: SocketAddr) {
        self.inner.lock().unwrap().insert(id, addr);
    }

    pub fn remove(&self, id: &RuntimeId) -> Option<SocketAddr> {
        self.inner.lock().unwrap().remove(id)
    }

    pub fn get(&self, id: &RuntimeId) -> Option<SocketAddr> {
        self.inner.lock().unwrap().get(id).copied()
    }

    pub fn contains(&self, id: &RuntimeId) -> bool {
        self.inner.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot for stable shell listings.
    pub fn snapshot(&self) -> Vec<(RuntimeId, SocketAddr)> {
        let mut peers: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .iter()
            .map(|(id, addr)| (id.clone(), *addr))
            .collect();
        peers.sort_by(|a, b| a.0.cmp(&b.0));
        peers
    }
}
