//! # DHT Contract and In-Memory Backend
//!
//! The secure overlay consumes the underlying key/value store through the
//! [`DhtBackend`] trait: asynchronous `put`/`get`/`listen` plus a value-type
//! registry consulted by storage nodes. Kademlia routing, iterative lookup
//! and republish scheduling live behind that trait and are not re-specified
//! here.
//!
//! [`MemoryDht`] implements the contract as a single-node overlay. It is
//! the storage-node half of the system: it enforces the registered store
//! and edit policies, expires values by type, notifies long-lived
//! listeners, and keeps the announce ledger backing
//! [`DhtBackend::announced`]. It also serves as an isolated overlay for
//! tests and local tooling.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::infohash::InfoHash;
use crate::value::{random_value_id, TypeSpec, Value, ValueFilter, ValueId, INVALID_ID};

/// Callback receiving batches of values from `get` and `listen`.
/// Returning `false` terminates the lookup or subscription.
pub type ValueCallback = Box<dyn FnMut(&[Arc<Value>]) -> bool + Send>;

/// Handle for cancelling a `listen` subscription.
pub type ListenToken = u64;

/// The slice of the underlying DHT the secure overlay depends on.
#[async_trait]
pub trait DhtBackend: Send + Sync + 'static {
    /// Node id of the local node.
    fn local_id(&self) -> InfoHash;

    /// Register a value type whose policies gate stores and edits.
    fn register_type(&self, spec: TypeSpec);

    /// Register a value type without policy enforcement.
    fn register_insecure_type(&self, spec: TypeSpec);

    /// Announce a value at `key`. Resolves once the operation completes,
    /// with `true` if the value was accepted.
    async fn put(&self, key: InfoHash, value: Value) -> Result<bool>;

    /// Look up values at `key`. `value_cb` may be invoked multiple times
    /// with batches of values; returning `false` ends the lookup early.
    /// Resolves with `true` when the lookup ran to completion.
    async fn get(
        &self,
        key: InfoHash,
        value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> Result<bool>;

    /// Subscribe to values at `key`. Current values are delivered
    /// immediately, later accepted values as they arrive.
    fn listen(&self, key: InfoHash, value_cb: ValueCallback, filter: Option<ValueFilter>)
        -> ListenToken;

    /// Cancel a subscription created by [`DhtBackend::listen`].
    fn cancel_listen(&self, token: ListenToken);

    /// The value this node is currently announcing at `(key, id)`, if any.
    fn announced(&self, key: InfoHash, id: ValueId) -> Option<Value>;
}

// ============================================================================
// In-Memory Backend
// ============================================================================

/// Fallback expiration for values of unregistered types.
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(60 * 60);

struct StoredEntry {
    value: Arc<Value>,
    expires_at: Instant,
}

struct Listener {
    key: InfoHash,
    value_cb: ValueCallback,
    filter: Option<ValueFilter>,
}

#[derive(Default)]
struct DhtInner {
    types: HashMap<u16, TypeSpec>,
    /// Per-key values, keyed by value id within the key.
    storage: HashMap<InfoHash, Vec<StoredEntry>>,
    /// Values the local node announces, for [`DhtBackend::announced`].
    announces: HashMap<(InfoHash, ValueId), Value>,
    listeners: HashMap<ListenToken, Listener>,
    next_token: ListenToken,
}

/// Single-node in-memory DHT honouring the registered value-type policies.
pub struct MemoryDht {
    id: InfoHash,
    inner: Mutex<DhtInner>,
}

impl MemoryDht {
    pub fn new(id: InfoHash) -> Self {
        Self { id, inner: Mutex::new(DhtInner::default()) }
    }

    /// Ingest a value as if stored by a remote node.
    ///
    /// This is the storage-node entry point: the registered store or edit
    /// policy decides acceptance. Returns `true` if the value was stored.
    pub fn ingest(&self, key: InfoHash, value: Value, from: InfoHash) -> bool {
        self.ingest_from(key, value, from, None)
    }

    pub fn ingest_from(
        &self,
        key: InfoHash,
        value: Value,
        from: InfoHash,
        addr: Option<SocketAddr>,
    ) -> bool {
        let value = Arc::new(value);
        let accepted = {
            let mut inner = self.inner.lock().expect("dht state poisoned");
            inner.expire(&key);

            let spec = inner.types.get(&value.value_type).cloned();
            let existing = inner
                .storage
                .get(&key)
                .and_then(|entries| entries.iter().find(|e| e.value.id == value.id))
                .map(|e| e.value.clone());

            let allowed = match (&existing, &spec) {
                (Some(old), Some(spec)) => {
                    (spec.edit_policy)(&key, old.as_ref(), value.as_ref(), &from, addr)
                }
                (None, Some(spec)) => (spec.store_policy)(&key, value.as_ref(), &from, addr),
                // Unregistered types are stored as-is; consumers filter.
                (_, None) => true,
            };
            if !allowed {
                debug!(key = %key, value_id = value.id, "value rejected by policy");
                return false;
            }

            let expiration =
                spec.map(|s| s.expiration).unwrap_or(DEFAULT_EXPIRATION);
            let entry = StoredEntry { value: value.clone(), expires_at: Instant::now() + expiration };
            let entries = inner.storage.entry(key).or_default();
            if let Some(slot) = entries.iter_mut().find(|e| e.value.id == value.id) {
                *slot = entry;
            } else {
                entries.push(entry);
            }
            true
        };

        if accepted {
            self.notify(&key, &value);
        }
        accepted
    }

    /// Deliver a freshly accepted value to the listeners on its key.
    fn notify(&self, key: &InfoHash, value: &Arc<Value>) {
        // Callbacks run outside the lock; they may re-enter the backend.
        let mut to_notify = {
            let mut inner = self.inner.lock().expect("dht state poisoned");
            let tokens: Vec<ListenToken> = inner
                .listeners
                .iter()
                .filter(|(_, l)| l.key == *key)
                .map(|(t, _)| *t)
                .collect();
            tokens
                .into_iter()
                .filter_map(|t| inner.listeners.remove(&t).map(|l| (t, l)))
                .collect::<Vec<_>>()
        };

        let batch = [value.clone()];
        let mut keep = Vec::new();
        for (token, mut listener) in to_notify.drain(..) {
            let pass = listener
                .filter
                .as_ref()
                .map(|f| f(value.as_ref()))
                .unwrap_or(true);
            let alive = if pass { (listener.value_cb)(&batch) } else { true };
            if alive {
                keep.push((token, listener));
            }
        }

        let mut inner = self.inner.lock().expect("dht state poisoned");
        for (token, listener) in keep {
            inner.listeners.insert(token, listener);
        }
    }

    fn matching_values(&self, key: &InfoHash, filter: &Option<ValueFilter>) -> Vec<Arc<Value>> {
        let mut inner = self.inner.lock().expect("dht state poisoned");
        inner.expire(key);
        inner
            .storage
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|e| e.value.clone())
                    .filter(|v| filter.as_ref().map(|f| f(v.as_ref())).unwrap_or(true))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl DhtInner {
    fn expire(&mut self, key: &InfoHash) {
        if let Some(entries) = self.storage.get_mut(key) {
            let now = Instant::now();
            entries.retain(|e| e.expires_at > now);
            if entries.is_empty() {
                self.storage.remove(key);
            }
        }
    }
}

#[async_trait]
impl DhtBackend for MemoryDht {
    fn local_id(&self) -> InfoHash {
        self.id
    }

    fn register_type(&self, spec: TypeSpec) {
        let mut inner = self.inner.lock().expect("dht state poisoned");
        inner.types.insert(spec.id, spec);
    }

    fn register_insecure_type(&self, spec: TypeSpec) {
        // Same registry; "insecure" only means the caller did not wrap the
        // policies.
        self.register_type(spec);
    }

    async fn put(&self, key: InfoHash, mut value: Value) -> Result<bool> {
        if value.id == INVALID_ID {
            value.id = random_value_id();
        }
        {
            let mut inner = self.inner.lock().expect("dht state poisoned");
            inner.announces.insert((key, value.id), value.clone());
        }
        let accepted = self.ingest(key, value, self.id);
        if !accepted {
            warn!(key = %key, "local put rejected by storage policy");
        }
        Ok(accepted)
    }

    async fn get(
        &self,
        key: InfoHash,
        mut value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> Result<bool> {
        let values = self.matching_values(&key, &filter);
        if !values.is_empty() {
            value_cb(&values);
        }
        Ok(true)
    }

    fn listen(
        &self,
        key: InfoHash,
        mut value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> ListenToken {
        let values = self.matching_values(&key, &filter);
        let alive = if values.is_empty() { true } else { value_cb(&values) };

        let mut inner = self.inner.lock().expect("dht state poisoned");
        inner.next_token += 1;
        let token = inner.next_token;
        if alive {
            inner.listeners.insert(token, Listener { key, value_cb, filter });
        }
        token
    }

    fn cancel_listen(&self, token: ListenToken) {
        let mut inner = self.inner.lock().expect("dht state poisoned");
        inner.listeners.remove(&token);
    }

    fn announced(&self, key: InfoHash, id: ValueId) -> Option<Value> {
        let inner = self.inner.lock().expect("dht state poisoned");
        inner.announces.get(&(key, id)).cloned()
    }
}
