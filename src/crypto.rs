//! # Cryptographic Identities
//!
//! This module provides the identity model for the secure overlay:
//!
//! - [`PrivateKey`] / [`PublicKey`]: RSA keypairs for signing and envelope
//!   encryption
//! - [`Certificate`]: X.509 certificates with subject-to-issuer chain links
//! - [`Identity`]: a private key paired with a certificate for the same key
//! - [`aes_encrypt`] / [`aes_decrypt`]: AES-GCM with an embedded random nonce
//!
//! ## Identity Model
//!
//! A key's id is the BLAKE3 hash of its canonical SPKI DER encoding, so the
//! id is stable across serializations. A certificate's id is the id of its
//! embedded public key. Trust is anchored by `id == hash(public key)`; the
//! issuer chain is carried as metadata and is not path-validated here.
//!
//! ## Primitive Choices
//!
//! Part of the interoperability contract of the overlay:
//!
//! - Signatures: RSA PKCS#1 v1.5 over SHA-512
//! - Asymmetric encryption: RSA-OAEP with SHA-256, chained one ciphertext
//!   block per plaintext block
//! - Symmetric encryption: AES-GCM, `nonce(12) || ciphertext || tag(16)`

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Sha256, Sha512};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::infohash::InfoHash;

// ============================================================================
// Error Types
// ============================================================================

/// Low-level cryptographic failure: key or certificate parsing, generation,
/// certificate construction, signing setup.
#[derive(Debug)]
pub enum CryptoError {
    /// Requested RSA modulus is below the minimum of [`MIN_KEY_BITS`].
    KeyTooShort(usize),
    /// RSA key generation failed.
    KeyGeneration(String),
    /// Key bytes did not parse as a valid key.
    InvalidKey,
    /// Certificate bytes did not parse as PEM or DER.
    CertificateParse,
    /// Certificate construction failed.
    CertificateBuild(String),
    /// Symmetric key length is not 16, 24 or 32 bytes.
    BadSymmetricKeyLength(usize),
    /// Signing failed.
    Sign(String),
    /// Asymmetric or symmetric encryption failed.
    Encrypt,
    /// A value operation was attempted on a value in the wrong envelope
    /// state (e.g. signing an already-encrypted value).
    AlreadyEncrypted,
    /// Certificate public-key id does not match the private key's id.
    IdentityMismatch,
    /// Wrapped decryption failure.
    Decrypt(DecryptError),
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CryptoError::KeyTooShort(bits) => {
                write!(f, "key length {} is below the {} bit minimum", bits, MIN_KEY_BITS)
            }
            CryptoError::KeyGeneration(e) => write!(f, "key generation failed: {}", e),
            CryptoError::InvalidKey => write!(f, "invalid key encoding"),
            CryptoError::CertificateParse => write!(f, "could not read certificate"),
            CryptoError::CertificateBuild(e) => write!(f, "certificate construction failed: {}", e),
            CryptoError::BadSymmetricKeyLength(n) => {
                write!(f, "symmetric key must be 16, 24 or 32 bytes, got {}", n)
            }
            CryptoError::Sign(e) => write!(f, "signing failed: {}", e),
            CryptoError::Encrypt => write!(f, "encryption failed"),
            CryptoError::AlreadyEncrypted => write!(f, "value is already encrypted"),
            CryptoError::IdentityMismatch => {
                write!(f, "certificate does not match the private key")
            }
            CryptoError::Decrypt(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CryptoError {}

/// Decryption produced no valid plaintext.
///
/// Kept distinct from [`CryptoError`] so callers can tell a hostile or
/// misaddressed ciphertext from a local crypto failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptError {
    /// The value carries no ciphertext.
    NotEncrypted,
    /// Ciphertext length is not a multiple of the RSA modulus size.
    BadLength,
    /// Ciphertext is shorter than the nonce and tag overhead.
    Truncated,
    /// An OAEP block or the AEAD tag failed to decrypt.
    BlockFailed,
    /// Recovered plaintext does not parse as a value body.
    MalformedPlaintext,
}

impl std::fmt::Display for DecryptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecryptError::NotEncrypted => write!(f, "value is not encrypted"),
            DecryptError::BadLength => write!(f, "ciphertext length is not block-aligned"),
            DecryptError::Truncated => write!(f, "ciphertext is truncated"),
            DecryptError::BlockFailed => write!(f, "decryption failed"),
            DecryptError::MalformedPlaintext => write!(f, "decrypted bytes are malformed"),
        }
    }
}

impl std::error::Error for DecryptError {}

impl From<DecryptError> for CryptoError {
    fn from(e: DecryptError) -> Self {
        CryptoError::Decrypt(e)
    }
}

// ============================================================================
// Symmetric Envelope (AES-GCM)
// ============================================================================

type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;

/// AES-GCM nonce length in bytes, embedded at the front of the ciphertext.
const GCM_NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes, appended by the cipher.
const GCM_TAG_LEN: usize = 16;

fn aes_seal<C: Aead + KeyInit>(key: &[u8], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::BadSymmetricKeyLength(key.len()))?;
    cipher
        .encrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), data)
        .map_err(|_| CryptoError::Encrypt)
}

fn aes_open<C: Aead + KeyInit>(key: &[u8], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = C::new_from_slice(key).map_err(|_| CryptoError::BadSymmetricKeyLength(key.len()))?;
    cipher
        .decrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), data)
        .map_err(|_| CryptoError::Decrypt(DecryptError::BlockFailed))
}

/// Encrypt `data` with AES-GCM under `key` (16, 24 or 32 bytes).
///
/// A fresh 12-byte random nonce is generated per call and prepended:
/// the output layout is `nonce || ciphertext || tag`.
pub fn aes_encrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = match key.len() {
        16 => aes_seal::<Aes128Gcm>(key, &nonce, data)?,
        24 => aes_seal::<Aes192Gcm>(key, &nonce, data)?,
        32 => aes_seal::<Aes256Gcm>(key, &nonce, data)?,
        n => return Err(CryptoError::BadSymmetricKeyLength(n)),
    };
    let mut out = Vec::with_capacity(GCM_NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt the `nonce || ciphertext || tag` layout produced by
/// [`aes_encrypt`]. Truncation and tag mismatch surface as
/// [`CryptoError::Decrypt`].
pub fn aes_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if !matches!(key.len(), 16 | 24 | 32) {
        return Err(CryptoError::BadSymmetricKeyLength(key.len()));
    }
    if data.len() < GCM_NONCE_LEN + GCM_TAG_LEN {
        return Err(CryptoError::Decrypt(DecryptError::Truncated));
    }
    let (nonce, sealed) = data.split_at(GCM_NONCE_LEN);
    match key.len() {
        16 => aes_open::<Aes128Gcm>(key, nonce, sealed),
        24 => aes_open::<Aes192Gcm>(key, nonce, sealed),
        _ => aes_open::<Aes256Gcm>(key, nonce, sealed),
    }
}

// ============================================================================
// RSA Keys
// ============================================================================

/// Minimum accepted RSA modulus length in bits.
pub const MIN_KEY_BITS: usize = 2048;

/// Default RSA modulus length for new identities.
pub const DEFAULT_KEY_BITS: usize = 4096;

/// SHA-256 digest length, fixed by the OAEP parameter choice.
const OAEP_HASH_LEN: usize = 32;

/// An RSA public key.
///
/// The key id is `InfoHash::get(SPKI-DER)`; the SPKI encoding is computed
/// once at construction so the id is stable however the key was imported.
#[derive(Clone)]
pub struct PublicKey {
    key: RsaPublicKey,
    spki: Vec<u8>,
}

impl PublicKey {
    pub fn from_rsa(key: RsaPublicKey) -> Result<Self, CryptoError> {
        let spki = key
            .to_public_key_der()
            .map_err(|_| CryptoError::InvalidKey)?
            .as_bytes()
            .to_vec();
        Ok(Self { key, spki })
    }

    /// Import from SPKI DER. The stored encoding is re-canonicalised so the
    /// id does not depend on the caller's serializer.
    pub fn from_spki_der(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_rsa(key)
    }

    /// The key id: hash of the canonical SPKI encoding.
    pub fn id(&self) -> InfoHash {
        InfoHash::get(&self.spki)
    }

    pub fn to_spki_der(&self) -> &[u8] {
        &self.spki
    }

    /// Verify an RSA PKCS#1 v1.5 / SHA-512 signature.
    ///
    /// Returns `false` for any signature that fails to verify, malformed
    /// ones included; verification never errors.
    pub fn check_signature(&self, data: &[u8], signature: &[u8]) -> bool {
        use rsa::signature::Verifier;
        let Ok(sig) = rsa::pkcs1v15::Signature::try_from(signature) else {
            return false;
        };
        rsa::pkcs1v15::VerifyingKey::<Sha512>::new(self.key.clone())
            .verify(data, &sig)
            .is_ok()
    }

    /// Largest plaintext that fits one RSA-OAEP block under this key.
    pub fn max_block_len(&self) -> usize {
        self.key.size() - 2 * OAEP_HASH_LEN - 2
    }

    /// RSA-OAEP encryption with block chaining.
    ///
    /// The plaintext is split into blocks of [`Self::max_block_len`] bytes
    /// and each block becomes one modulus-sized ciphertext block,
    /// concatenated in order.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let max_block = self.max_block_len();
        let mut out = Vec::with_capacity((data.len() / max_block + 1) * self.key.size());
        let mut rest = data;
        loop {
            let take = rest.len().min(max_block);
            let (block, tail) = rest.split_at(take);
            let sealed = self
                .key
                .encrypt(&mut OsRng, Oaep::new::<Sha256>(), block)
                .map_err(|_| CryptoError::Encrypt)?;
            out.extend_from_slice(&sealed);
            rest = tail;
            if rest.is_empty() {
                break;
            }
        }
        Ok(out)
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.spki == other.spki
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", &self.id().to_hex()[..16])
    }
}

/// An RSA private key with its derived [`PublicKey`].
pub struct PrivateKey {
    key: RsaPrivateKey,
    public: PublicKey,
}

impl PrivateKey {
    /// Generate a new RSA key with a modulus of `bits` (at least
    /// [`MIN_KEY_BITS`]). Generation is CPU-heavy and should happen before
    /// the node starts serving traffic.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        if bits < MIN_KEY_BITS {
            return Err(CryptoError::KeyTooShort(bits));
        }
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Self::from_rsa(key)
    }

    pub fn from_rsa(key: RsaPrivateKey) -> Result<Self, CryptoError> {
        let public = PublicKey::from_rsa(RsaPublicKey::from(&key))?;
        Ok(Self { key, public })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Plain PKCS#8 DER export.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .key
            .to_pkcs8_der()
            .map_err(|_| CryptoError::InvalidKey)?
            .as_bytes()
            .to_vec())
    }

    pub fn from_pkcs8_der(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs8_der(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_rsa(key)
    }

    /// Export to a password-protected blob (PKCS#8 PBES2 encrypted DER).
    pub fn export_protected(&self, password: &str) -> Result<Vec<u8>, CryptoError> {
        Ok(self
            .key
            .to_pkcs8_encrypted_der(&mut OsRng, password.as_bytes())
            .map_err(|_| CryptoError::InvalidKey)?
            .as_bytes()
            .to_vec())
    }

    pub fn import_protected(bytes: &[u8], password: &str) -> Result<Self, CryptoError> {
        let key = RsaPrivateKey::from_pkcs8_encrypted_der(bytes, password.as_bytes())
            .map_err(|_| CryptoError::InvalidKey)?;
        Self::from_rsa(key)
    }

    /// RSA PKCS#1 v1.5 signature over SHA-512.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use rsa::signature::{SignatureEncoding, Signer};
        let signer = rsa::pkcs1v15::SigningKey::<Sha512>::new(self.key.clone());
        signer
            .try_sign(data)
            .map(|sig| sig.to_vec())
            .map_err(|e| CryptoError::Sign(e.to_string()))
    }

    /// Inverse of [`PublicKey::encrypt`].
    ///
    /// The input must be a whole number of modulus-sized blocks; each block
    /// is OAEP-decrypted and the plaintexts concatenated.
    pub fn decrypt(&self, cypher: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let block = self.key.size();
        if cypher.len() % block != 0 {
            return Err(DecryptError::BadLength);
        }
        let mut out = Vec::new();
        for chunk in cypher.chunks(block) {
            let plain = self
                .key
                .decrypt(Oaep::new::<Sha256>(), chunk)
                .map_err(|_| DecryptError::BlockFailed)?;
            out.extend_from_slice(&plain);
        }
        Ok(out)
    }

    fn to_signing_key_pair(&self) -> Result<rcgen::KeyPair, CryptoError> {
        let pem = self
            .key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| CryptoError::InvalidKey)?;
        rcgen::KeyPair::from_pem(&pem).map_err(|e| CryptoError::CertificateBuild(e.to_string()))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("id", &self.public.id().to_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// X.509 Certificates
// ============================================================================

/// Kind of a subject-alternative-name entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AltNameKind {
    Rfc822,
    Dns,
    Uri,
    Ip,
    Unknown,
}

/// UID attribute (0.9.2342.19200300.100.1.1), carries the hex key id.
const UID_OID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 1];

/// Certificate validity window for generated identities.
const CERTIFICATE_VALIDITY_DAYS: i64 = 3650;

/// An X.509 certificate plus an optional owning link to its issuer,
/// forming a subject-to-issuer chain.
///
/// Multiple leaves may share an intermediate; links are reference-counted
/// and never point from issuer back to subject.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: PublicKey,
    name: String,
    uid: String,
    issuer_name: String,
    issuer_uid: String,
    alt_names: Vec<(AltNameKind, String)>,
    ca: bool,
    issuer: Option<Arc<Certificate>>,
}

impl Certificate {
    /// Import a certificate or certificate chain, ordered subject to
    /// issuer. PEM is tried first, then DER; concatenated blocks of either
    /// encoding are linked into a chain.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        let ders = if looks_like_pem(data) {
            let mut ders = Vec::new();
            for item in x509_parser::pem::Pem::iter_from_buffer(data) {
                let pem = item.map_err(|_| CryptoError::CertificateParse)?;
                if pem.label == "CERTIFICATE" {
                    ders.push(pem.contents);
                }
            }
            ders
        } else {
            split_der_sequence(data)?
        };
        if ders.is_empty() {
            return Err(CryptoError::CertificateParse);
        }

        // Walk issuer-first so each certificate can own a link to the one
        // behind it.
        let mut issuer: Option<Arc<Certificate>> = None;
        for der in ders.into_iter().rev() {
            let mut cert = Self::parse_single_der(der)?;
            cert.issuer = issuer.take();
            issuer = Some(Arc::new(cert));
        }
        let leaf = issuer.ok_or(CryptoError::CertificateParse)?;
        Ok(Arc::try_unwrap(leaf).unwrap_or_else(|arc| (*arc).clone()))
    }

    fn parse_single_der(der: Vec<u8>) -> Result<Self, CryptoError> {
        let (_, cert) =
            X509Certificate::from_der(&der).map_err(|_| CryptoError::CertificateParse)?;
        let public_key = PublicKey::from_spki_der(cert.public_key().raw)?;

        let uid_oid = x509_parser::der_parser::oid!(0.9.2342.19200300.100.1.1);
        let name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let uid = cert
            .subject()
            .iter_by_oid(&uid_oid)
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let issuer_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let issuer_uid = cert
            .issuer()
            .iter_by_oid(&uid_oid)
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        let mut alt_names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for general_name in &san.value.general_names {
                alt_names.push(match general_name {
                    GeneralName::RFC822Name(s) => (AltNameKind::Rfc822, s.to_string()),
                    GeneralName::DNSName(s) => (AltNameKind::Dns, s.to_string()),
                    GeneralName::URI(s) => (AltNameKind::Uri, s.to_string()),
                    GeneralName::IPAddress(bytes) => (AltNameKind::Ip, format_ip_bytes(bytes)),
                    other => (AltNameKind::Unknown, format!("{:?}", other)),
                });
            }
        }

        Ok(Self {
            der,
            public_key,
            name,
            uid,
            issuer_name,
            issuer_uid,
            alt_names,
            ca,
            issuer: None,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Same as `public_key().id()`.
    pub fn id(&self) -> InfoHash {
        self.public_key.id()
    }

    /// Subject common name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subject UID attribute (hex key id for generated identities).
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn issuer_name(&self) -> &str {
        &self.issuer_name
    }

    pub fn issuer_uid(&self) -> &str {
        &self.issuer_uid
    }

    pub fn alt_names(&self) -> &[(AltNameKind, String)] {
        &self.alt_names
    }

    /// True iff the basic-constraints extension marks this as a CA.
    pub fn is_ca(&self) -> bool {
        self.ca
    }

    /// The issuer certificate, when this certificate was imported or
    /// generated as part of a chain.
    pub fn issuer(&self) -> Option<&Arc<Certificate>> {
        self.issuer.as_ref()
    }

    /// PEM export, subject to issuer. With `chain` the whole issuer chain
    /// is emitted as concatenated PEM blocks.
    pub fn to_pem(&self, chain: bool) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        while let Some(cert) = current {
            out.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", cert.der.clone())));
            if !chain {
                break;
            }
            current = cert.issuer.as_deref();
        }
        out
    }

    /// DER export: the certificate alone, or the chain as concatenated DER
    /// in subject-to-issuer order. The chain form is the wire encoding used
    /// for certificate publication.
    pub fn to_der(&self, chain: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(cert) = current {
            out.extend_from_slice(&cert.der);
            if !chain {
                break;
            }
            current = cert.issuer.as_deref();
        }
        out
    }

    pub(crate) fn set_issuer(&mut self, issuer: Arc<Certificate>) {
        self.issuer = Some(issuer);
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("ca", &self.ca)
            .field("chained", &self.issuer.is_some())
            .finish()
    }
}

fn looks_like_pem(data: &[u8]) -> bool {
    const MARKER: &[u8] = b"-----BEGIN";
    data.windows(MARKER.len()).any(|w| w == MARKER)
}

/// Split concatenated DER certificates by parsing each and measuring how
/// many bytes it consumed.
fn split_der_sequence(data: &[u8]) -> Result<Vec<Vec<u8>>, CryptoError> {
    let mut ders = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (next, _) =
            X509Certificate::from_der(rest).map_err(|_| CryptoError::CertificateParse)?;
        let consumed = rest.len() - next.len();
        ders.push(rest[..consumed].to_vec());
        rest = next;
    }
    Ok(ders)
}

fn format_ip_bytes(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(arr).to_string()
        }
        _ => hex::encode(bytes),
    }
}

// ============================================================================
// Identity
// ============================================================================

/// A private key and a certificate carrying the matching public key.
///
/// Both halves are shared so in-flight operations can hold them across
/// suspension points.
#[derive(Clone)]
pub struct Identity {
    key: Arc<PrivateKey>,
    certificate: Arc<Certificate>,
}

impl Identity {
    /// Pair a key with a certificate. Fails with
    /// [`CryptoError::IdentityMismatch`] if their key ids differ.
    pub fn new(key: Arc<PrivateKey>, certificate: Arc<Certificate>) -> Result<Self, CryptoError> {
        if key.public_key().id() != certificate.id() {
            return Err(CryptoError::IdentityMismatch);
        }
        Ok(Self { key, certificate })
    }

    pub fn private_key(&self) -> &Arc<PrivateKey> {
        &self.key
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.certificate
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.certificate.id())
            .field("name", &self.certificate.name())
            .finish()
    }
}

/// Generate a new identity: an RSA keypair and an X.509 certificate.
///
/// Without `ca` the certificate is a self-signed certificate authority;
/// with `ca` it is a leaf signed by that authority, with the issuer chain
/// attached.
pub fn generate_identity(
    name: &str,
    ca: Option<&Identity>,
    bits: usize,
) -> Result<Identity, CryptoError> {
    generate_identity_with_alt_names(name, ca, bits, &[])
}

/// [`generate_identity`] with caller-supplied subject-alternative-names.
pub fn generate_identity_with_alt_names(
    name: &str,
    ca: Option<&Identity>,
    bits: usize,
    alt_names: &[(AltNameKind, String)],
) -> Result<Identity, CryptoError> {
    let key = PrivateKey::generate(bits)?;
    let der = build_certificate_der(&key, name, ca, alt_names)?;
    let mut cert = Certificate::from_bytes(&der)?;
    if let Some(ca) = ca {
        cert.set_issuer(ca.certificate.clone());
    }
    Identity::new(Arc::new(key), Arc::new(cert))
}

fn build_certificate_der(
    key: &PrivateKey,
    name: &str,
    ca: Option<&Identity>,
    alt_names: &[(AltNameKind, String)],
) -> Result<Vec<u8>, CryptoError> {
    let key_pair = key.to_signing_key_pair()?;

    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = subject_dn(name, &key.public_key().id().to_hex());
    params.serial_number = Some(rcgen::SerialNumber::from(random_serial().to_vec()));
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERTIFICATE_VALIDITY_DAYS);
    for (kind, value) in alt_names {
        params.subject_alt_names.push(san_entry(*kind, value)?);
    }

    let cert = match ca {
        None => {
            params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            params.key_usages = vec![rcgen::KeyUsagePurpose::KeyCertSign];
            params.self_signed(&key_pair)
        }
        Some(ca) => {
            params.is_ca = rcgen::IsCa::ExplicitNoCa;
            params.key_usages = vec![
                rcgen::KeyUsagePurpose::DigitalSignature,
                rcgen::KeyUsagePurpose::DataEncipherment,
            ];
            let ca_key_pair = ca.key.to_signing_key_pair()?;
            let issuer = issuer_certificate(&ca.certificate, &ca_key_pair)?;
            params.signed_by(&key_pair, &issuer, &ca_key_pair)
        }
    }
    .map_err(|e| CryptoError::CertificateBuild(e.to_string()))?;

    Ok(cert.der().to_vec())
}

/// Rebuild an issuer certificate with the CA's subject name so the leaf's
/// issuer field matches certificates produced by [`generate_identity`].
fn issuer_certificate(
    cert: &Certificate,
    key_pair: &rcgen::KeyPair,
) -> Result<rcgen::Certificate, CryptoError> {
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = subject_dn(cert.name(), cert.uid());
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params
        .self_signed(key_pair)
        .map_err(|e| CryptoError::CertificateBuild(e.to_string()))
}

fn subject_dn(name: &str, uid: &str) -> rcgen::DistinguishedName {
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(name.to_string()),
    );
    dn.push(
        rcgen::DnType::CustomDnType(UID_OID.to_vec()),
        rcgen::DnValue::Utf8String(uid.to_string()),
    );
    dn
}

fn san_entry(kind: AltNameKind, value: &str) -> Result<rcgen::SanType, CryptoError> {
    let ia5 = |v: &str| {
        rcgen::Ia5String::try_from(v.to_string())
            .map_err(|e| CryptoError::CertificateBuild(e.to_string()))
    };
    Ok(match kind {
        AltNameKind::Rfc822 => rcgen::SanType::Rfc822Name(ia5(value)?),
        AltNameKind::Dns => rcgen::SanType::DnsName(ia5(value)?),
        AltNameKind::Uri => rcgen::SanType::URI(ia5(value)?),
        AltNameKind::Ip => rcgen::SanType::IpAddress(
            value
                .parse()
                .map_err(|_| CryptoError::CertificateBuild(format!("bad IP alt name: {}", value)))?,
        ),
        AltNameKind::Unknown => {
            return Err(CryptoError::CertificateBuild("unknown alt name kind".into()))
        }
    })
}

/// A positive 128-bit random serial number.
fn random_serial() -> [u8; 16] {
    let mut serial = [0u8; 16];
    OsRng.fill_bytes(&mut serial);
    serial[0] &= 0x7f;
    serial
}
