//! # High-Level Secure Node API
//!
//! This module provides the main entry point for the secure overlay. A
//! [`SecureNode`] combines the underlying DHT backend, the certificate
//! resolver and the value envelope into a single interface:
//!
//! - `put`: plain publication, passed through unchanged
//! - `put_signed`: monotonic, owner-bound publication
//! - `put_encrypted`: end-to-end confidential delivery to a node id
//! - `get` / `listen`: reads with signature verification and
//!   recipient-only decryption applied before values reach the caller
//!
//! ## Trust Model
//!
//! Incoming values are filtered, never fatal: a hostile peer cannot abort
//! a subscription. Encrypted values addressed to someone else are dropped
//! silently; values with bad signatures are dropped with a warning.
//!
//! ## Startup
//!
//! Construction registers the secured value types, asserts that the
//! identity's private key matches its certificate, and publishes the
//! certificate at the node's own id before any user operation runs.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::crypto::{Certificate, Identity, PrivateKey, PublicKey};
use crate::dht::{DhtBackend, ListenToken, MemoryDht, ValueCallback};
use crate::infohash::InfoHash;
use crate::policy::secure_type;
use crate::resolver::{CertificateResolver, LocalQuery};
use crate::value::{
    certificate_type, decrypt_value, encrypt_value, random_value_id, sign_value, user_data_type,
    Value, ValueFilter, CERTIFICATE_TYPE, INVALID_ID,
};

/// The secure overlay facade over a DHT backend.
///
/// Key and certificate are held by shared ownership so in-flight
/// operations keep them alive across suspension points.
pub struct SecureNode<D: DhtBackend> {
    dht: Arc<D>,
    /// Identity id: the certificate id, or the routing id when anonymous.
    /// Recipients of encrypted values are named by this id.
    id: InfoHash,
    key: Option<Arc<PrivateKey>>,
    certificate: Option<Arc<Certificate>>,
    resolver: CertificateResolver<D>,
}

impl SecureNode<MemoryDht> {
    /// Create an isolated single-node overlay backed by [`MemoryDht`].
    ///
    /// With an identity the node id is derived from the certificate (see
    /// [`SecureNode::node_id_for`]); anonymous nodes get a random id.
    pub async fn standalone(identity: Option<Identity>) -> Result<Self> {
        let id = match &identity {
            Some(identity) => Self::node_id_for(identity.certificate()),
            None => InfoHash::random(),
        };
        Self::with_backend(Arc::new(MemoryDht::new(id)), identity).await
    }
}

impl<D: DhtBackend> SecureNode<D> {
    /// Node id for an identity: the hash of `"node:"` followed by the hex
    /// certificate id, so multiple logical identities under one keypair
    /// collide deterministically on the overlay.
    pub fn node_id_for(certificate: &Certificate) -> InfoHash {
        InfoHash::get(format!("node:{}", certificate.id()).as_bytes())
    }

    /// Wrap an existing backend.
    ///
    /// Registers the secured default value types and the certificate type,
    /// then publishes the local certificate at its own id. The self-announce
    /// completes before this constructor returns, so it precedes any user
    /// operation.
    pub async fn with_backend(dht: Arc<D>, identity: Option<Identity>) -> Result<Self> {
        dht.register_type(secure_type(user_data_type()));
        dht.register_insecure_type(certificate_type());

        let (key, certificate) = match identity {
            Some(identity) => {
                // The Identity constructor enforces this, but assert it here
                // too: a mismatched pair must never come up.
                if identity.private_key().public_key().id() != identity.certificate().id() {
                    bail!("provided certificate doesn't match private key");
                }
                (
                    Some(identity.private_key().clone()),
                    Some(identity.certificate().clone()),
                )
            }
            None => (None, None),
        };

        // The identity id names this node for certificate resolution and
        // encrypted delivery; the routing id only places it on the overlay.
        let id = certificate
            .as_ref()
            .map(|c| c.id())
            .unwrap_or_else(|| dht.local_id());
        let resolver = CertificateResolver::new(dht.clone(), id, certificate.clone());
        let node = Self { dht, id, key, certificate, resolver };

        if let Some(certificate) = &node.certificate {
            let cert_id = certificate.id();
            let mut value = Value::with_id(CERTIFICATE_TYPE, certificate.to_der(true), 1);
            value.seq = 1;
            match node.dht.put(cert_id, value).await {
                Ok(true) => info!(id = %cert_id, "public key announced"),
                Ok(false) | Err(_) => warn!(id = %cert_id, "error while announcing public key"),
            }
        }

        Ok(node)
    }

    /// The id other nodes use to address this one: the certificate id, or
    /// the backend's routing id for anonymous nodes.
    pub fn id(&self) -> InfoHash {
        self.id
    }

    /// The routing id of the underlying DHT node.
    pub fn local_id(&self) -> InfoHash {
        self.dht.local_id()
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.key.as_deref().map(PrivateKey::public_key)
    }

    pub fn certificate(&self) -> Option<&Arc<Certificate>> {
        self.certificate.as_ref()
    }

    pub fn backend(&self) -> &Arc<D> {
        &self.dht
    }

    // ------------------------------------------------------------------
    // Certificates
    // ------------------------------------------------------------------

    /// Resolve the certificate for a node id (cache, local hook, then
    /// network). `None` when every source is exhausted.
    pub async fn find_certificate(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        self.resolver.find(node).await
    }

    /// Certificate for `node` if already known locally.
    pub fn cached_certificate(&self, node: &InfoHash) -> Option<Arc<Certificate>> {
        self.resolver.cached(node)
    }

    /// Register certificate bytes for a node id; silently rejected unless
    /// the certificate's key hashes to that id.
    pub fn register_certificate(&self, node: &InfoHash, bytes: &[u8]) -> Option<Arc<Certificate>> {
        self.resolver.register(node, bytes)
    }

    /// Cache a certificate the application already trusts.
    pub fn register_trusted_certificate(&self, certificate: Arc<Certificate>) {
        self.resolver.register_trusted(certificate);
    }

    /// Install the hook consulted for certificates before the network.
    pub fn set_local_certificate_store(&mut self, query: LocalQuery) {
        self.resolver.set_local_query(query);
    }

    // ------------------------------------------------------------------
    // Envelope operations
    // ------------------------------------------------------------------

    /// Sign a value with the local key.
    pub fn sign(&self, value: &mut Value) -> Result<()> {
        let key = self.key.as_ref().context("no private key to sign with")?;
        sign_value(key, value).context("signing value failed")
    }

    /// Sign and seal a value for a recipient public key.
    pub fn encrypt(&self, value: Value, to: &PublicKey) -> Result<Value> {
        let key = self.key.as_ref().context("no private key to sign with")?;
        encrypt_value(key, to, value).context("encrypting value failed")
    }

    /// Open a sealed value with the local key.
    pub fn decrypt(&self, value: &Value) -> Result<Value> {
        let key = self.key.as_ref().context("no private key to decrypt with")?;
        decrypt_value(key, value).context("decrypting value failed")
    }

    // ------------------------------------------------------------------
    // DHT operations
    // ------------------------------------------------------------------

    /// Plain put, delegated to the backend unchanged.
    pub async fn put(&self, key: InfoHash, value: Value) -> Result<bool> {
        self.dht.put(key, value).await
    }

    /// Publish a signed value with a monotonic sequence number.
    ///
    /// A fresh random id is assigned when the value has none. The sequence
    /// number is advanced past both the value this node is already
    /// announcing and any value with the same id found on the network, so
    /// the edit policy at storage nodes accepts the replacement.
    pub async fn put_signed(&self, key: InfoHash, mut value: Value) -> Result<bool> {
        if self.key.is_none() {
            bail!("no private key to sign with");
        }
        if value.id == INVALID_ID {
            value.id = random_value_id();
        }

        // Already announcing this value locally?
        if let Some(previous) = self.dht.announced(key, value.id) {
            debug!(key = %key, value_id = value.id, "found previous value being announced");
            if value.seq <= previous.seq {
                value.seq = previous.seq.wrapping_add(1);
            }
        }

        // Survey the network for values with the same id before signing.
        let own_key_id = self.public_key().map(PublicKey::id);
        let survey: Arc<std::sync::Mutex<u16>> = Arc::new(std::sync::Mutex::new(0));
        let highest = survey.clone();
        let survey_cb: ValueCallback = Box::new(move |values| {
            let mut highest = highest.lock().expect("survey state poisoned");
            for v in values {
                if !v.is_signed() {
                    warn!(value_id = v.id, "existing unsigned value at this location");
                } else if v.owner.as_ref().map(PublicKey::id) != own_key_id {
                    warn!(value_id = v.id, "existing signed value belongs to someone else");
                }
                *highest = (*highest).max(v.seq);
            }
            true
        });
        self.get(key, survey_cb, Some(Value::id_filter(value.id))).await?;

        let network_seq = *survey.lock().expect("survey state poisoned");
        if value.seq <= network_seq {
            value.seq = network_seq.wrapping_add(1);
        }

        self.sign(&mut value)?;
        self.dht.put(key, value).await
    }

    /// Seal a value for the node identified by `to` and publish it.
    ///
    /// The recipient's certificate is resolved first; without one the
    /// operation resolves to `false` and nothing is published.
    pub async fn put_encrypted(&self, key: InfoHash, to: InfoHash, value: Value) -> Result<bool> {
        let Some(certificate) = self.resolver.find(&to).await else {
            warn!(recipient = %to, "no certificate found for recipient");
            return Ok(false);
        };
        debug!(recipient = %certificate.id(), "encrypting data for recipient");
        let sealed = self.encrypt(value, certificate.public_key())?;
        self.dht.put(key, sealed).await
    }

    /// Look up values at `key`, with the incoming filter applied: sealed
    /// values are decrypted (recipient-only), signed values verified, and
    /// only then does the user filter and callback run.
    pub async fn get(
        &self,
        key: InfoHash,
        value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> Result<bool> {
        self.dht.get(key, self.incoming_filter(value_cb, filter), None).await
    }

    /// Convenience form of [`SecureNode::get`] collecting the verified
    /// values.
    pub async fn get_values(
        &self,
        key: InfoHash,
        filter: Option<ValueFilter>,
    ) -> Result<Vec<Arc<Value>>> {
        let sink: Arc<std::sync::Mutex<Vec<Arc<Value>>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let out = sink.clone();
        let cb: ValueCallback = Box::new(move |values| {
            out.lock().expect("get sink poisoned").extend_from_slice(values);
            true
        });
        self.get(key, cb, filter).await?;
        let mut sink = sink.lock().expect("get sink poisoned");
        Ok(std::mem::take(&mut sink))
    }

    /// Long-lived subscription with the same incoming filter as
    /// [`SecureNode::get`].
    pub fn listen(
        &self,
        key: InfoHash,
        value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> ListenToken {
        self.dht.listen(key, self.incoming_filter(value_cb, filter), None)
    }

    pub fn cancel_listen(&self, token: ListenToken) {
        self.dht.cancel_listen(token);
    }

    /// Wrap a user callback with signature verification and
    /// recipient-only decryption.
    ///
    /// Drops, per value: sealed values when no key is present, sealed
    /// values addressed to other nodes (silently), anything failing
    /// decryption or signature verification (with a warning). The user
    /// filter runs on the recovered plaintext value.
    fn incoming_filter(
        &self,
        mut value_cb: ValueCallback,
        filter: Option<ValueFilter>,
    ) -> ValueCallback {
        let key = self.key.clone();
        let local_id = self.id;
        Box::new(move |values| {
            let mut passed: Vec<Arc<Value>> = Vec::new();
            for value in values {
                if value.is_encrypted() {
                    let Some(key) = &key else { continue };
                    match decrypt_value(key, value) {
                        Ok(inner) => {
                            if inner.recipient != Some(local_id) {
                                // Someone else's mail; not an error.
                                continue;
                            }
                            let verified = inner
                                .owner
                                .as_ref()
                                .map(|o| o.check_signature(&inner.to_sign(), &inner.signature))
                                .unwrap_or(false);
                            if !verified {
                                warn!(value_id = value.id, "signature verification failed");
                                continue;
                            }
                            if filter.as_ref().map(|f| f(&inner)).unwrap_or(true) {
                                passed.push(Arc::new(inner));
                            }
                        }
                        Err(e) => {
                            warn!(value_id = value.id, error = %e, "could not decrypt value");
                        }
                    }
                } else if value.is_signed() {
                    let verified = value
                        .owner
                        .as_ref()
                        .map(|o| o.check_signature(&value.to_sign(), &value.signature))
                        .unwrap_or(false);
                    if !verified {
                        warn!(value_id = value.id, "signature verification failed");
                        continue;
                    }
                    if filter.as_ref().map(|f| f(value.as_ref())).unwrap_or(true) {
                        passed.push(value.clone());
                    }
                } else if filter.as_ref().map(|f| f(value.as_ref())).unwrap_or(true) {
                    passed.push(value.clone());
                }
            }
            if passed.is_empty() {
                return true;
            }
            value_cb(&passed)
        })
    }
}
