//! The response cache.
//!
//! One entry per `(server ip, query, bailiwick)`.  The bailiwick is part of
//! the key because it decides which records in the response were usable:
//! caching without it could leak out-of-bailiwick RRs from one context into
//! another where they would be treated as authoritative.
//!
//! Entries live for the whole process and are never invalidated during a
//! traversal, so re-running a query against a warm cache reproduces the
//! first run exactly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use hickory_proto::op::Query;

use crate::response::DecodedResponse;
use crate::util::types::Bailiwick;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] response cache mutex poisoned, cannot recover from this - aborting";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub server_ip: IpAddr,
    pub query: Query,
    pub bailiwick: Bailiwick,
}

/// A cloneable handle to the process-wide response cache.
///
/// Invoking `clone` gives a new handle referring to the same underlying
/// store, which is how the main traversal and its server-resolution
/// sub-traversals share responses.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    entries: Arc<Mutex<HashMap<CacheKey, DecodedResponse>>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        ResponseCache::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<DecodedResponse> {
        self.entries
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get(key)
            .cloned()
    }

    pub fn insert(&self, key: CacheKey, response: DecodedResponse) {
        self.entries
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .insert(key, response);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect(MUTEX_POISON_MESSAGE).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
