//! Naming and lookup: the local registry, cross-node resolution messages,
//! and the response cache.
//!
//! Every pool answers lookups through its index server endpoint (a
//! well-known uid); callers cache responses for `lookup_ttl` and drop
//! cached routes when the peer goes away.

use crate::actor::cell::CellHandle;
use crate::error::{PoolError, Result};
use caravel_transport::control::ActorLoad;
use caravel_transport::{ActorRef, ActorUid, Address};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Well-known uid of the lookup endpoint every pool exposes.
pub const INDEX_SERVER_UID: &str = "IndexServer";

/// Local registry: uid → live cell. Sole owner of cell handles.
pub struct Registry {
    entries: Mutex<HashMap<ActorUid, CellHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a freshly created cell. Fails with `Duplicate` when the uid
    /// is taken.
    pub fn insert(&self, handle: CellHandle) -> Result<()> {
        let mut entries = self.entries.lock().expect("registry poisoned");
        let uid = handle.actor_ref().uid.clone();
        if entries.contains_key(&uid) {
            return Err(PoolError::Duplicate(uid.to_string()));
        }
        entries.insert(uid, handle);
        Ok(())
    }

    pub fn remove(&self, uid: &ActorUid) -> Option<CellHandle> {
        self.entries.lock().expect("registry poisoned").remove(uid)
    }

    pub fn get(&self, uid: &ActorUid) -> Option<CellHandle> {
        self.entries
            .lock()
            .expect("registry poisoned")
            .get(uid)
            .cloned()
    }

    pub fn contains(&self, uid: &ActorUid) -> bool {
        self.entries
            .lock()
            .expect("registry poisoned")
            .contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn uids(&self) -> Vec<ActorUid> {
        self.entries
            .lock()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Load sample for heartbeat piggyback.
    pub fn loads(&self) -> Vec<ActorLoad> {
        self.entries
            .lock()
            .expect("registry poisoned")
            .iter()
            .map(|(uid, cell)| ActorLoad {
                uid: uid.clone(),
                inbox_len: cell.inbox_len() as u64,
            })
            .collect()
    }

}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-node lookup request, sent to a pool's index server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub uid: ActorUid,
}

/// Lookup response: the actor's full address (including sub-pool
/// narrowing) when found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub address: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    endpoint: String,
    uid: ActorUid,
}

/// TTL cache for lookup responses.
///
/// Entries expire after `lookup_ttl` and are dropped eagerly when the
/// endpoint that served them disconnects.
pub struct LookupCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, (ActorRef, Instant)>>,
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, pool: &Address, uid: &ActorUid) -> Option<ActorRef> {
        let key = CacheKey {
            endpoint: pool.endpoint_key(),
            uid: uid.clone(),
        };
        let mut entries = self.entries.lock().expect("lookup cache poisoned");
        match entries.get(&key) {
            Some((actor_ref, stored_at)) if stored_at.elapsed() < self.ttl => {
                Some(actor_ref.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, pool: &Address, actor_ref: ActorRef) {
        let key = CacheKey {
            endpoint: pool.endpoint_key(),
            uid: actor_ref.uid.clone(),
        };
        self.entries
            .lock()
            .expect("lookup cache poisoned")
            .insert(key, (actor_ref, Instant::now()));
    }

    /// Drop every cached route served by an endpoint (PeerGone).
    pub fn invalidate_endpoint(&self, pool: &Address) {
        let endpoint = pool.endpoint_key();
        self.entries
            .lock()
            .expect("lookup cache poisoned")
            .retain(|key, _| key.endpoint != endpoint);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lookup cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
