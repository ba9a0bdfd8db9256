//! # Certificate Resolver
//!
//! Maps a node id to that node's certificate. Resolution tries, in order:
//! the local identity, the in-memory cache, an optional local-store hook,
//! and finally a DHT lookup on the reserved certificate type at the key
//! equal to the node id. The first value whose embedded public key hashes
//! to the requested id wins and terminates the lookup.
//!
//! The cache lives for the process lifetime; entries are only ever
//! overwritten, never evicted. Concurrent lookups for the same id are not
//! coalesced, so callers may observe duplicate DHT traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::crypto::Certificate;
use crate::dht::{DhtBackend, ValueCallback};
use crate::infohash::InfoHash;
use crate::value::{Value, CERTIFICATE_TYPE};

/// Hook consulted before the DHT: returns certificates the application
/// already stores locally for a node id.
pub type LocalQuery = Box<dyn Fn(&InfoHash) -> Vec<Arc<Certificate>> + Send + Sync>;

type CertificateCache = Arc<Mutex<HashMap<InfoHash, Arc<Certificate>>>>;

pub struct CertificateResolver<D: DhtBackend> {
    dht: Arc<D>,
    local_id: InfoHash,
    local_certificate: Option<Arc<Certificate>>,
    cache: CertificateCache,
    local_query: Option<LocalQuery>,
}

impl<D: DhtBackend> CertificateResolver<D> {
    pub fn new(
        dht: Arc<D>,
        local_id: InfoHash,
        local_certificate: Option<Arc<Certificate>>,
    ) -> Self {
        Self {
            dht,
            local_id,
            local_certificate,
            cache: Arc::new(Mutex::new(HashMap::new())),
            local_query: None,
        }
    }

    /// Install the local-store hook consulted before DHT lookups.
    pub fn set_local_query(&mut self, query: LocalQuery) {
        self.local_query = Some(query);
    }

    /// Certificate for `node` if already known: the local identity or a
    /// cache entry. Never touches the network.
    pub fn cached(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        if *node == self.local_id {
            return self.local_certificate.clone();
        }
        self.cache.lock().expect("certificate cache poisoned").get(node).cloned()
    }

    /// Resolve the certificate for `node`.
    ///
    /// Resolves at most once per call; `None` means every source was
    /// exhausted without a matching certificate. Local sources answer
    /// without a DHT lookup.
    pub async fn find(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        if let Some(cert) = self.cached(node) {
            debug!(node = %node, "using cached certificate");
            return Some(cert);
        }

        if let Some(query) = &self.local_query {
            if let Some(cert) = query(node).into_iter().next() {
                debug!(node = %node, "using certificate from local store");
                self.cache
                    .lock()
                    .expect("certificate cache poisoned")
                    .insert(*node, cert.clone());
                return Some(cert);
            }
        }

        let found: Arc<Mutex<Option<Arc<Certificate>>>> = Arc::new(Mutex::new(None));
        let cache = self.cache.clone();
        let target = *node;
        let slot = found.clone();
        let value_cb: ValueCallback = Box::new(move |values| {
            let mut slot = slot.lock().expect("resolver state poisoned");
            if slot.is_some() {
                return false;
            }
            for value in values {
                if let Some(cert) = register_in_cache(&cache, &target, &value.data) {
                    debug!(node = %target, "found certificate on the network");
                    *slot = Some(cert);
                    // Terminate the iterative lookup.
                    return false;
                }
            }
            true
        });

        let _ = self
            .dht
            .get(*node, value_cb, Some(Value::type_filter(CERTIFICATE_TYPE)))
            .await;

        let resolved = found.lock().expect("resolver state poisoned").take();
        if resolved.is_none() {
            debug!(node = %node, "certificate lookup exhausted");
        }
        resolved
    }

    /// Parse `bytes` and cache the certificate under `node`, but only if
    /// the embedded public key hashes to that id. A mismatch is rejected
    /// silently.
    pub fn register(&self, node: &InfoHash, bytes: &[u8]) -> Option<Arc<Certificate>> {
        register_in_cache(&self.cache, node, bytes)
    }

    /// Cache a certificate the application already trusts, keyed by its
    /// own id.
    pub fn register_trusted(&self, certificate: Arc<Certificate>) {
        self.cache
            .lock()
            .expect("certificate cache poisoned")
            .insert(certificate.id(), certificate);
    }
}

fn register_in_cache(
    cache: &CertificateCache,
    node: &InfoHash,
    bytes: &[u8],
) -> Option<Arc<Certificate>> {
    let cert = match Certificate::from_bytes(bytes) {
        Ok(cert) => Arc::new(cert),
        Err(_) => return None,
    };
    if cert.id() != *node {
        debug!(
            node = %node,
            certificate = %cert.id(),
            "certificate does not match node id"
        );
        return None;
    }
    cache.lock().expect("certificate cache poisoned").insert(*node, cert.clone());
    Some(cert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_identity, MIN_KEY_BITS};
    use crate::dht::MemoryDht;
    use crate::value::certificate_type;
    use std::sync::OnceLock;

    fn identity(name: &'static str) -> &'static crate::crypto::Identity {
        static A: OnceLock<crate::crypto::Identity> = OnceLock::new();
        static B: OnceLock<crate::crypto::Identity> = OnceLock::new();
        let slot = if name == "alice" { &A } else { &B };
        slot.get_or_init(|| generate_identity(name, None, MIN_KEY_BITS).expect("identity failed"))
    }

    fn backend() -> Arc<MemoryDht> {
        let dht = Arc::new(MemoryDht::new(InfoHash::random()));
        dht.register_insecure_type(certificate_type());
        dht
    }

    async fn publish(dht: &Arc<MemoryDht>, identity: &crate::crypto::Identity) {
        let cert = identity.certificate();
        let mut value = Value::with_id(CERTIFICATE_TYPE, cert.to_der(true), 1);
        value.seq = 1;
        assert!(dht.put(cert.id(), value).await.expect("publish failed"));
    }

    #[tokio::test]
    async fn self_lookup_answers_locally() {
        let alice = identity("alice");
        let dht = backend();
        let local_id = InfoHash::get(b"node:whatever");
        let resolver =
            CertificateResolver::new(dht, local_id, Some(alice.certificate().clone()));

        // No certificate was ever published; a DHT lookup would find nothing.
        let cert = resolver.find(&local_id).await.expect("self lookup failed");
        assert_eq!(cert.id(), alice.certificate().id());
    }

    #[tokio::test]
    async fn network_lookup_finds_published_certificate() {
        let alice = identity("alice");
        let dht = backend();
        publish(&dht, alice).await;

        let resolver = CertificateResolver::new(dht, InfoHash::random(), None);
        let target = alice.certificate().id();

        let cert = resolver.find(&target).await.expect("lookup failed");
        assert_eq!(cert.id(), target);

        // Second lookup is served from the cache.
        assert!(resolver.cached(&target).is_some());
    }

    #[tokio::test]
    async fn lookup_exhaustion_returns_none() {
        let dht = backend();
        let resolver = CertificateResolver::new(dht, InfoHash::random(), None);
        assert!(resolver.find(&InfoHash::get(b"nobody")).await.is_none());
    }

    #[tokio::test]
    async fn mismatched_certificate_is_skipped() {
        let alice = identity("alice");
        let bob = identity("bob");
        let dht = backend();

        // A hostile node published Bob's certificate under Alice's id.
        let target = alice.certificate().id();
        let mut value = Value::with_id(CERTIFICATE_TYPE, bob.certificate().to_der(true), 1);
        value.seq = 1;
        assert!(dht.put(target, value).await.expect("put failed"));

        let resolver = CertificateResolver::new(dht, InfoHash::random(), None);
        assert!(resolver.find(&target).await.is_none());
    }

    #[tokio::test]
    async fn local_query_hook_short_circuits() {
        let alice = identity("alice");
        let dht = backend();
        let mut resolver = CertificateResolver::new(dht, InfoHash::random(), None);

        let cert = alice.certificate().clone();
        let hook_cert = cert.clone();
        resolver.set_local_query(Box::new(move |node| {
            if *node == hook_cert.id() {
                vec![hook_cert.clone()]
            } else {
                Vec::new()
            }
        }));

        let resolved = resolver.find(&cert.id()).await.expect("hook lookup failed");
        assert_eq!(resolved.id(), cert.id());
        assert!(resolver.cached(&cert.id()).is_some());
    }

    #[test]
    fn register_rejects_mismatched_id() {
        let alice = identity("alice");
        let bob = identity("bob");
        let resolver =
            CertificateResolver::new(backend(), InfoHash::random(), None);

        let wrong = resolver.register(&alice.certificate().id(), &bob.certificate().to_der(true));
        assert!(wrong.is_none());
        assert!(resolver.cached(&alice.certificate().id()).is_none());

        let right = resolver.register(&bob.certificate().id(), &bob.certificate().to_der(true));
        assert!(right.is_some());
    }

    #[test]
    fn register_trusted_is_unconditional() {
        let alice = identity("alice");
        let resolver = CertificateResolver::new(backend(), InfoHash::random(), None);

        resolver.register_trusted(alice.certificate().clone());
        assert!(resolver.cached(&alice.certificate().id()).is_some());
    }
}
