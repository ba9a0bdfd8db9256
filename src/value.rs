//! # Values and Value Types
//!
//! A [`Value`] is a record stored on the DHT at some key, carrying metadata
//! describing how it is signed and/or encrypted. Values stored at the same
//! key are distinguished by a 64-bit value id.
//!
//! Two canonical byte encodings are defined here:
//!
//! - [`Value::to_sign`]: the signature input, a deterministic
//!   length-prefixed little-endian encoding of
//!   `(id, type, seq, flags, owner SPKI, recipient, data)`
//! - [`Value::to_encrypt`]: `to_sign || sig_len || signature`, the envelope
//!   encryption input
//!
//! Determinism matters: storage nodes accept a re-announce at an unchanged
//! sequence number only when the `to_sign` bytes are identical, so any
//! non-canonical field ordering would spuriously reject re-announces.
//!
//! [`TypeSpec`] describes a registered value type: a type id, a default
//! expiration, and the store/edit policy predicates a storage node consults
//! before accepting a new or replacement value.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::crypto::{CryptoError, DecryptError, PrivateKey, PublicKey};
use crate::infohash::{InfoHash, HASH_LEN};

/// Record id distinguishing values stored at the same key.
pub type ValueId = u64;

/// The reserved "unset" value id; operations assign a random id in its place.
pub const INVALID_ID: ValueId = 0;

/// A random record id, never [`INVALID_ID`].
pub fn random_value_id() -> ValueId {
    use rand::RngCore;
    loop {
        let id = rand::rngs::OsRng.next_u64();
        if id != INVALID_ID {
            return id;
        }
    }
}

// ============================================================================
// Flags
// ============================================================================

/// How a value is signed / encrypted, three bits on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueFlags {
    pub signed: bool,
    pub encrypted: bool,
    pub has_recipient: bool,
}

impl ValueFlags {
    pub fn new(signed: bool, encrypted: bool, has_recipient: bool) -> Self {
        Self { signed, encrypted, has_recipient }
    }

    pub fn bits(&self) -> u8 {
        (self.signed as u8) | ((self.encrypted as u8) << 1) | ((self.has_recipient as u8) << 2)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            signed: bits & 0b001 != 0,
            encrypted: bits & 0b010 != 0,
            has_recipient: bits & 0b100 != 0,
        }
    }
}

// ============================================================================
// Value
// ============================================================================

/// A record stored on the DHT.
///
/// Plain values carry only `data`. Signed values add `owner` and
/// `signature`. Encrypted values appear on the wire with only
/// `(id, type, flags, cypher)` populated; the remaining fields are
/// recovered by decryption.
#[derive(Debug, Clone, Default)]
pub struct Value {
    pub id: ValueId,
    pub value_type: u16,
    pub seq: u16,
    pub flags: ValueFlags,
    /// Public key of the signer. Populated iff signed.
    pub owner: Option<PublicKey>,
    /// Recipient node id. Populated iff encrypted (optionally for signed).
    pub recipient: Option<InfoHash>,
    pub data: Vec<u8>,
    /// Populated iff signed.
    pub signature: Vec<u8>,
    /// Encrypted form of the record. Populated iff encrypted.
    pub cypher: Vec<u8>,
}

impl Value {
    pub fn new(value_type: u16, data: Vec<u8>) -> Self {
        Self { value_type, data, ..Default::default() }
    }

    pub fn with_id(value_type: u16, data: Vec<u8>, id: ValueId) -> Self {
        Self { id, value_type, data, ..Default::default() }
    }

    pub fn is_signed(&self) -> bool {
        self.flags.signed
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.encrypted
    }

    /// Set the recipient and flag its presence.
    pub fn set_recipient(&mut self, recipient: InfoHash) {
        self.recipient = Some(recipient);
        self.flags.has_recipient = true;
    }

    /// The canonical signature input.
    pub fn to_sign(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.data.len());
        self.pack_to_sign(&mut out);
        out
    }

    fn pack_to_sign(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.value_type.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.push(self.flags.bits());
        match &self.owner {
            Some(owner) => {
                let spki = owner.to_spki_der();
                out.extend_from_slice(&(spki.len() as u32).to_le_bytes());
                out.extend_from_slice(spki);
            }
            None => out.extend_from_slice(&0u32.to_le_bytes()),
        }
        out.extend_from_slice(self.recipient.unwrap_or_else(InfoHash::zero).as_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    /// The canonical envelope encryption input: `to_sign` plus the
    /// length-prefixed signature.
    pub fn to_encrypt(&self) -> Vec<u8> {
        let mut out = self.to_sign();
        out.extend_from_slice(&(self.signature.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse the body recovered from an encryption envelope, the inverse of
    /// [`Value::to_encrypt`].
    pub fn unpack_body(bytes: &[u8]) -> Result<Self, DecryptError> {
        let mut r = Reader::new(bytes);
        let id = r.u64()?;
        let value_type = r.u16()?;
        let seq = r.u16()?;
        let flags = ValueFlags::from_bits(r.u8()?);
        let owner_len = r.u32()? as usize;
        let owner = if owner_len == 0 {
            None
        } else {
            let spki = r.bytes(owner_len)?;
            Some(PublicKey::from_spki_der(spki).map_err(|_| DecryptError::MalformedPlaintext)?)
        };
        let mut recipient_bytes = [0u8; HASH_LEN];
        recipient_bytes.copy_from_slice(r.bytes(HASH_LEN)?);
        let recipient = InfoHash::from_bytes(recipient_bytes);
        let data_len = r.u32()? as usize;
        let data = r.bytes(data_len)?.to_vec();
        let sig_len = r.u32()? as usize;
        let signature = r.bytes(sig_len)?.to_vec();
        if !r.is_empty() {
            return Err(DecryptError::MalformedPlaintext);
        }
        Ok(Self {
            id,
            value_type,
            seq,
            flags,
            owner,
            recipient: if recipient.is_zero() { None } else { Some(recipient) },
            data,
            signature,
            cypher: Vec::new(),
        })
    }

    /// Full wire encoding.
    ///
    /// Encrypted values carry only `(id, type, flags, cypher)`; all other
    /// fields are absent and recovered by decryption.
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.value_type.to_le_bytes());
        out.push(self.flags.bits());
        if self.is_encrypted() {
            out.extend_from_slice(&(self.cypher.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.cypher);
        } else {
            out.extend_from_slice(&self.seq.to_le_bytes());
            match &self.owner {
                Some(owner) => {
                    let spki = owner.to_spki_der();
                    out.extend_from_slice(&(spki.len() as u32).to_le_bytes());
                    out.extend_from_slice(spki);
                }
                None => out.extend_from_slice(&0u32.to_le_bytes()),
            }
            out.extend_from_slice(self.recipient.unwrap_or_else(InfoHash::zero).as_bytes());
            out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.data);
            out.extend_from_slice(&(self.signature.len() as u32).to_le_bytes());
            out.extend_from_slice(&self.signature);
        }
        out
    }

    /// Inverse of [`Value::pack`].
    pub fn unpack(bytes: &[u8]) -> Result<Self, DecryptError> {
        let mut r = Reader::new(bytes);
        let id = r.u64()?;
        let value_type = r.u16()?;
        let flags = ValueFlags::from_bits(r.u8()?);
        if flags.encrypted {
            let cypher_len = r.u32()? as usize;
            let cypher = r.bytes(cypher_len)?.to_vec();
            if !r.is_empty() {
                return Err(DecryptError::MalformedPlaintext);
            }
            return Ok(Self { id, value_type, flags, cypher, ..Default::default() });
        }
        let seq = r.u16()?;
        let owner_len = r.u32()? as usize;
        let owner = if owner_len == 0 {
            None
        } else {
            let spki = r.bytes(owner_len)?;
            Some(PublicKey::from_spki_der(spki).map_err(|_| DecryptError::MalformedPlaintext)?)
        };
        let mut recipient_bytes = [0u8; HASH_LEN];
        recipient_bytes.copy_from_slice(r.bytes(HASH_LEN)?);
        let recipient = InfoHash::from_bytes(recipient_bytes);
        let data_len = r.u32()? as usize;
        let data = r.bytes(data_len)?.to_vec();
        let sig_len = r.u32()? as usize;
        let signature = r.bytes(sig_len)?.to_vec();
        if !r.is_empty() {
            return Err(DecryptError::MalformedPlaintext);
        }
        Ok(Self {
            id,
            value_type,
            seq,
            flags,
            owner,
            recipient: if recipient.is_zero() { None } else { Some(recipient) },
            data,
            signature,
            cypher: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    /// Keep values of one type.
    pub fn type_filter(value_type: u16) -> ValueFilter {
        Arc::new(move |v: &Value| v.value_type == value_type)
    }

    /// Keep values with one record id.
    pub fn id_filter(id: ValueId) -> ValueFilter {
        Arc::new(move |v: &Value| v.id == id)
    }

    /// Keep values addressed to one recipient.
    pub fn recipient_filter(recipient: InfoHash) -> ValueFilter {
        Arc::new(move |v: &Value| v.recipient == Some(recipient))
    }

    /// Conjunction of two filters.
    pub fn chain_filters(first: ValueFilter, second: ValueFilter) -> ValueFilter {
        Arc::new(move |v: &Value| first(v) && second(v))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if self.id != other.id {
            return false;
        }
        if self.is_encrypted() {
            return self.cypher == other.cypher;
        }
        self.owner == other.owner
            && self.value_type == other.value_type
            && self.data == other.data
            && self.signature == other.signature
    }
}

/// Bounds-checked little-endian reader for the canonical encodings.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecryptError> {
        if self.bytes.len() < n {
            return Err(DecryptError::MalformedPlaintext);
        }
        let (head, tail) = self.bytes.split_at(n);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecryptError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecryptError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecryptError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecryptError> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ============================================================================
// Envelope Operations
// ============================================================================

/// Sign a value in place: sets the owner to the signing key, flags it as
/// signed, and attaches the signature over [`Value::to_sign`].
///
/// Fails if the value is already encrypted; the ciphertext is opaque and
/// cannot be re-signed.
pub fn sign_value(key: &PrivateKey, value: &mut Value) -> Result<(), CryptoError> {
    if value.is_encrypted() {
        return Err(CryptoError::AlreadyEncrypted);
    }
    value.owner = Some(key.public_key().clone());
    value.flags = ValueFlags::new(true, false, value.flags.has_recipient);
    value.signature = key.sign(&value.to_sign())?;
    Ok(())
}

/// Encrypt a value for `to`.
///
/// The value is first addressed to the recipient and signed (so the
/// plaintext inside the envelope is self-authenticating), then a new value
/// with the same id is returned whose `cypher` holds the RSA-OAEP envelope
/// of [`Value::to_encrypt`]. Every other field of the result is empty.
pub fn encrypt_value(
    key: &PrivateKey,
    to: &PublicKey,
    mut value: Value,
) -> Result<Value, CryptoError> {
    if value.is_encrypted() {
        return Err(CryptoError::AlreadyEncrypted);
    }
    value.set_recipient(to.id());
    sign_value(key, &mut value)?;

    let mut sealed = Value { id: value.id, value_type: value.value_type, ..Default::default() };
    sealed.cypher = to.encrypt(&value.to_encrypt())?;
    sealed.flags = ValueFlags::new(true, true, true);
    Ok(sealed)
}

/// Recover the inner value from an encryption envelope.
///
/// Fails with [`DecryptError::NotEncrypted`] when the value carries no
/// ciphertext, [`DecryptError::BlockFailed`]/[`DecryptError::BadLength`]
/// when the local key cannot open it, and
/// [`DecryptError::MalformedPlaintext`] when the recovered bytes do not
/// parse as a value body.
pub fn decrypt_value(key: &PrivateKey, value: &Value) -> Result<Value, DecryptError> {
    if !value.is_encrypted() {
        return Err(DecryptError::NotEncrypted);
    }
    let plain = key.decrypt(&value.cypher)?;
    let mut inner = Value::unpack_body(&plain)?;
    inner.id = value.id;
    Ok(inner)
}

// ============================================================================
// Value Types
// ============================================================================

/// Store-policy predicate: `(key, value, from_node, from_addr)`.
pub type StorePolicy =
    Arc<dyn Fn(&InfoHash, &Value, &InfoHash, Option<SocketAddr>) -> bool + Send + Sync>;

/// Edit-policy predicate: `(key, old, new, from_node, from_addr)`.
pub type EditPolicy =
    Arc<dyn Fn(&InfoHash, &Value, &Value, &InfoHash, Option<SocketAddr>) -> bool + Send + Sync>;

/// Per-value filter applied before values are handed to user callbacks.
pub type ValueFilter = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Description of a registered value type.
#[derive(Clone)]
pub struct TypeSpec {
    pub id: u16,
    pub name: &'static str,
    pub expiration: Duration,
    pub store_policy: StorePolicy,
    pub edit_policy: EditPolicy,
}

impl TypeSpec {
    /// A type with the default policies: store anything, refuse edits.
    pub fn new(id: u16, name: &'static str, expiration: Duration) -> Self {
        Self {
            id,
            name,
            expiration,
            store_policy: Arc::new(|_, _, _, _| true),
            edit_policy: Arc::new(|_, _, _, _, _| false),
        }
    }
}

impl std::fmt::Debug for TypeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Default user-data type tag.
pub const USER_DATA: u16 = 0;

/// Reserved type tag for certificate publication.
pub const CERTIFICATE_TYPE: u16 = 8;

/// The generic user-data type.
///
/// Edits are allowed at the type level; ownership and sequence enforcement
/// for signed values happens in the secure policy wrapper.
pub fn user_data_type() -> TypeSpec {
    let mut spec = TypeSpec::new(USER_DATA, "UserData", Duration::from_secs(60 * 60));
    spec.edit_policy = Arc::new(|_, _, _, _, _| true);
    spec
}

/// The certificate publication type.
///
/// Values of this type are node certificates stored at the node's own id.
/// Consumers verify `id == hash(public key)` themselves, so storage nodes
/// accept stores and replacements freely.
pub fn certificate_type() -> TypeSpec {
    let mut spec =
        TypeSpec::new(CERTIFICATE_TYPE, "Certificate", Duration::from_secs(24 * 60 * 60));
    spec.edit_policy = Arc::new(|_, _, _, _, _| true);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{other_key, test_key};

    fn sample_value() -> Value {
        let mut v = Value::with_id(USER_DATA, b"hello overlay".to_vec(), 42);
        v.seq = 3;
        v
    }

    #[test]
    fn flags_bits_roundtrip() {
        for bits in 0..8u8 {
            assert_eq!(ValueFlags::from_bits(bits).bits(), bits);
        }
        let f = ValueFlags::new(true, false, true);
        assert_eq!(f.bits(), 0b101);
    }

    #[test]
    fn to_sign_is_deterministic() {
        let v = sample_value();
        assert_eq!(v.to_sign(), v.to_sign());

        let mut other = v.clone();
        other.seq += 1;
        assert_ne!(v.to_sign(), other.to_sign());
    }

    #[test]
    fn sign_attaches_owner_and_verifies() {
        let key = test_key();
        let mut v = sample_value();
        sign_value(key, &mut v).expect("sign failed");

        assert!(v.is_signed());
        assert!(!v.is_encrypted());
        assert_eq!(v.owner.as_ref().expect("owner missing").id(), key.public_key().id());
        assert!(key.public_key().check_signature(&v.to_sign(), &v.signature));
    }

    #[test]
    fn sign_rejects_encrypted_value() {
        let key = test_key();
        let mut v = sample_value();
        v.flags.encrypted = true;
        assert!(matches!(sign_value(key, &mut v), Err(CryptoError::AlreadyEncrypted)));
    }

    #[test]
    fn encrypt_decrypt_roundtrip_preserves_metadata() {
        let alice = test_key();
        let bob = other_key();

        let sealed = encrypt_value(alice, bob.public_key(), sample_value()).expect("encrypt failed");
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.id, 42);
        assert!(sealed.data.is_empty());
        assert!(sealed.owner.is_none());
        assert!(!sealed.cypher.is_empty());

        let inner = decrypt_value(bob, &sealed).expect("decrypt failed");
        assert_eq!(inner.id, 42);
        assert_eq!(inner.seq, 3);
        assert_eq!(inner.data, b"hello overlay");
        assert_eq!(inner.recipient, Some(bob.public_key().id()));
        let owner = inner.owner.as_ref().expect("owner missing");
        assert_eq!(owner.id(), alice.public_key().id());
        assert!(owner.check_signature(&inner.to_sign(), &inner.signature));
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let alice = test_key();
        let bob = other_key();

        let sealed = encrypt_value(alice, bob.public_key(), sample_value()).expect("encrypt failed");
        assert!(matches!(
            decrypt_value(alice, &sealed),
            Err(DecryptError::BlockFailed)
        ));
    }

    #[test]
    fn decrypt_requires_encrypted_flag() {
        let key = test_key();
        assert!(matches!(
            decrypt_value(key, &sample_value()),
            Err(DecryptError::NotEncrypted)
        ));
    }

    #[test]
    fn unpack_body_rejects_trailing_garbage() {
        let key = test_key();
        let mut v = sample_value();
        sign_value(key, &mut v).expect("sign failed");

        let mut body = v.to_encrypt();
        assert!(Value::unpack_body(&body).is_ok());
        body.push(0);
        assert!(matches!(
            Value::unpack_body(&body),
            Err(DecryptError::MalformedPlaintext)
        ));
        assert!(matches!(
            Value::unpack_body(&body[..body.len() - 10]),
            Err(DecryptError::MalformedPlaintext)
        ));
    }

    #[test]
    fn wire_pack_roundtrip_signed() {
        let key = test_key();
        let mut v = sample_value();
        v.set_recipient(InfoHash::get(b"someone"));
        sign_value(key, &mut v).expect("sign failed");

        let unpacked = Value::unpack(&v.pack()).expect("unpack failed");
        assert_eq!(unpacked, v);
        assert_eq!(unpacked.seq, v.seq);
        assert_eq!(unpacked.recipient, v.recipient);
        assert_eq!(unpacked.to_sign(), v.to_sign());
    }

    #[test]
    fn wire_pack_encrypted_carries_cypher_only() {
        let alice = test_key();
        let bob = other_key();
        let sealed = encrypt_value(alice, bob.public_key(), sample_value()).expect("encrypt failed");

        let bytes = sealed.pack();
        let unpacked = Value::unpack(&bytes).expect("unpack failed");
        assert!(unpacked.is_encrypted());
        assert_eq!(unpacked.id, sealed.id);
        assert_eq!(unpacked.cypher, sealed.cypher);
        assert!(unpacked.data.is_empty());
        assert!(unpacked.owner.is_none());
        assert!(unpacked.recipient.is_none());

        let inner = decrypt_value(bob, &unpacked).expect("decrypt failed");
        assert_eq!(inner.data, b"hello overlay");
    }

    #[test]
    fn filters_compose() {
        let mut v = sample_value();
        v.set_recipient(InfoHash::get(b"bob"));

        assert!(Value::type_filter(USER_DATA)(&v));
        assert!(!Value::type_filter(CERTIFICATE_TYPE)(&v));
        assert!(Value::id_filter(42)(&v));
        assert!(!Value::id_filter(43)(&v));
        assert!(Value::recipient_filter(InfoHash::get(b"bob"))(&v));

        let both = Value::chain_filters(Value::type_filter(USER_DATA), Value::id_filter(42));
        assert!(both(&v));
        let neither = Value::chain_filters(Value::type_filter(USER_DATA), Value::id_filter(7));
        assert!(!neither(&v));
    }
}
