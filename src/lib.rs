//! # Veilmesh - Secure Value Overlay for Kademlia-style DHTs
//!
//! Veilmesh turns an untrusted peer-to-peer key/value store into a medium
//! where participants can:
//!
//! - **Publish** values carrying a verifiable author identity
//! - **Edit** those values under a monotonic ownership discipline
//! - **Deliver** end-to-end confidential messages to a recipient named by
//!   its node id
//!
//! ## Architecture
//!
//! The underlying DHT (routing, iterative lookup, republish scheduling,
//! sockets) is consumed through the [`DhtBackend`] trait. Everything above
//! it is cryptographic policy:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `infohash` | Fixed-width ids for keys and nodes |
//! | `crypto` | RSA keypairs, X.509 certificate chains, AES-GCM envelope |
//! | `value` | DHT records, canonical sign/encrypt encodings, value types |
//! | `policy` | Store/edit predicate wrapping for secured types |
//! | `resolver` | Node id to certificate resolution with caching |
//! | `dht` | Backend contract and an in-memory single-node overlay |
//! | `node` | [`SecureNode`] facade: put, put_signed, put_encrypted, get, listen |
//!
//! ## Security Model
//!
//! - A node id is bound to a keypair: `id == hash(SPKI)` is checked
//!   wherever a certificate is accepted; no external CA is needed
//! - Storage nodes verify signatures and enforce owner and sequence rules
//!   through the registered value-type policies
//! - Encrypted values are opaque to storage nodes; only the recipient can
//!   open them, and the plaintext inside is self-authenticating
//! - Hostile input is dropped per value, never fatal to a subscription

mod crypto;
mod dht;
mod infohash;
mod node;
mod policy;
mod resolver;
mod value;

pub use crypto::{
    aes_decrypt, aes_encrypt, generate_identity, generate_identity_with_alt_names, AltNameKind,
    Certificate, CryptoError, DecryptError, Identity, PrivateKey, PublicKey, DEFAULT_KEY_BITS,
    MIN_KEY_BITS,
};
pub use dht::{DhtBackend, ListenToken, MemoryDht, ValueCallback};
pub use infohash::{distance_cmp, InfoHash, HASH_LEN};
pub use node::SecureNode;
pub use policy::secure_type;
pub use resolver::{CertificateResolver, LocalQuery};
pub use value::{
    certificate_type, decrypt_value, encrypt_value, sign_value, user_data_type, EditPolicy,
    StorePolicy, TypeSpec, Value, ValueFilter, ValueFlags, ValueId, CERTIFICATE_TYPE, INVALID_ID,
    USER_DATA,
};
