//! Catalog of supported DTLS cipher suites.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use openssl::hash::MessageDigest;

use crate::curve::CurveInfo;
use crate::error::CryptoError;
use crate::exchange::KeyExchange;
use crate::keying::RecordKeys;
use crate::srtp::AeadCipher;

/// Hash backing the PRF and transcript digest of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-256, used by the AES-128 and ChaCha20 suites.
    Sha256,
    /// SHA-384, used by the AES-256 suites.
    Sha384,
}

impl HashAlgorithm {
    /// Output length of the digest in bytes.
    pub fn size(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub(crate) fn message_digest(&self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
        }
    }
}

/// Signature algorithm family of a suite. Decides which certificate in
/// the [`CertificateSet`][crate::cert::CertificateSet] signs the key
/// exchange parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    /// ECDSA with the curve's paired digest.
    Ecdsa,
    /// RSA PKCS#1 v1.5.
    Rsa,
}

/// Key exchange family of a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    /// Ephemeral elliptic curve Diffie-Hellman. Requires the suite to be
    /// specialized for a curve before a key exchange can start.
    Ecdhe,
    /// Ephemeral finite field Diffie-Hellman (RFC 5114 2048-bit group).
    Dhe,
}

/// Record encryption of a suite. All variants are AEADs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionAlgorithm {
    /// AES-128 in Galois/Counter Mode.
    Aes128Gcm,
    /// AES-256 in Galois/Counter Mode.
    Aes256Gcm,
    /// ChaCha20 with Poly1305.
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    /// Length of the record write key in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes128Gcm => 16,
            EncryptionAlgorithm::Aes256Gcm => 32,
            EncryptionAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Length of the implicit (fixed) part of the record nonce in bytes.
    ///
    /// GCM suites carry a 4-byte fixed salt plus an 8-byte explicit nonce
    /// on the wire; ChaCha20-Poly1305 derives the full 12 bytes.
    pub fn fixed_iv_len(&self) -> usize {
        match self {
            EncryptionAlgorithm::Aes128Gcm => 4,
            EncryptionAlgorithm::Aes256Gcm => 4,
            EncryptionAlgorithm::ChaCha20Poly1305 => 12,
        }
    }

    /// Instantiate the AEAD for one direction of a session, bound to that
    /// session's derived record keys.
    ///
    /// This is the seam between negotiation and the per-packet engine.
    pub fn setup_cipher(&self, keys: &RecordKeys, send: bool) -> Result<AeadCipher, CryptoError> {
        let key = if send { keys.write_key() } else { keys.read_key() };
        AeadCipher::new(*self, key, send)
    }
}

/// One cipher suite descriptor.
///
/// A catalog entry is a template. [`CipherSuite::specialize_for_curve`]
/// produces (and caches) a clone whose key exchange is bound to a
/// specific curve. Specialized instances are shared and never mutated
/// after creation.
pub struct CipherSuite {
    /// TLS registry identifier.
    pub id: u16,
    /// IANA name of the suite.
    pub name: &'static str,
    /// Preference priority. Lower is more preferred.
    pub priority: u8,
    /// PRF/transcript hash.
    pub hash: HashAlgorithm,
    /// Key exchange family.
    pub key_exchange: KeyExchangeAlgorithm,
    /// Signature family.
    pub signature: SignatureAlgorithm,
    /// Record encryption.
    pub encryption: EncryptionAlgorithm,
    curve: Option<&'static CurveInfo>,
    // Specialized clones keyed by curve group id. At most one instance
    // per (suite, curve) for the process lifetime.
    specialized: Mutex<HashMap<u16, Arc<CipherSuite>>>,
}

impl CipherSuite {
    fn new(
        id: u16,
        name: &'static str,
        priority: u8,
        hash: HashAlgorithm,
        key_exchange: KeyExchangeAlgorithm,
        signature: SignatureAlgorithm,
        encryption: EncryptionAlgorithm,
    ) -> Self {
        CipherSuite {
            id,
            name,
            priority,
            hash,
            key_exchange,
            signature,
            encryption,
            curve: None,
            specialized: Mutex::new(HashMap::new()),
        }
    }

    /// Output length of the negotiated digest, for PRF sizing.
    pub fn hash_size(&self) -> usize {
        self.hash.size()
    }

    /// The curve this instance is bound to, if specialized.
    pub fn curve(&self) -> Option<&'static CurveInfo> {
        self.curve
    }

    /// A clone of this suite with its key exchange bound to `curve`.
    ///
    /// Cached per curve: calling twice with the same curve returns the
    /// same shared instance. Suites without an ECDHE key exchange have
    /// nothing to bind and return themselves.
    pub fn specialize_for_curve(self: &Arc<Self>, curve: &'static CurveInfo) -> Arc<CipherSuite> {
        if self.key_exchange != KeyExchangeAlgorithm::Ecdhe {
            return Arc::clone(self);
        }

        let mut cache = self.specialized.lock().unwrap();
        Arc::clone(cache.entry(curve.group_id).or_insert_with(|| {
            let mut bound = (**self).clone();
            bound.curve = Some(curve);
            Arc::new(bound)
        }))
    }

    /// Start a key exchange for one handshake under this suite.
    ///
    /// ECDHE suites must be specialized for a curve first.
    pub fn new_key_exchange(&self) -> Result<KeyExchange, CryptoError> {
        KeyExchange::new(self.key_exchange, self.curve)
    }
}

// Manual because of the Mutex field. The cache is deliberately not
// cloned; a clone starts with an empty cache of its own.
impl Clone for CipherSuite {
    fn clone(&self) -> Self {
        CipherSuite {
            id: self.id,
            name: self.name,
            priority: self.priority,
            hash: self.hash,
            key_exchange: self.key_exchange,
            signature: self.signature,
            encryption: self.encryption,
            curve: self.curve,
            specialized: Mutex::new(HashMap::new()),
        }
    }
}

impl fmt::Debug for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSuite")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("curve", &self.curve)
            .finish()
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The ordered list of cipher suites this process offers.
pub struct CipherCatalog;

static SUITES: Lazy<Vec<Arc<CipherSuite>>> = Lazy::new(|| {
    use EncryptionAlgorithm::*;
    use HashAlgorithm::*;
    use KeyExchangeAlgorithm::*;
    use SignatureAlgorithm::*;

    let mut suites = vec![
        CipherSuite::new(
            0xC02B,
            "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            0,
            Sha256,
            Ecdhe,
            Ecdsa,
            Aes128Gcm,
        ),
        CipherSuite::new(
            0xC02F,
            "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            1,
            Sha256,
            Ecdhe,
            Rsa,
            Aes128Gcm,
        ),
        CipherSuite::new(
            0xCCA9,
            "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            2,
            Sha256,
            Ecdhe,
            Ecdsa,
            ChaCha20Poly1305,
        ),
        CipherSuite::new(
            0xCCA8,
            "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            3,
            Sha256,
            Ecdhe,
            Rsa,
            ChaCha20Poly1305,
        ),
        CipherSuite::new(
            0xC02C,
            "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            4,
            Sha384,
            Ecdhe,
            Ecdsa,
            Aes256Gcm,
        ),
        CipherSuite::new(
            0xC030,
            "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            5,
            Sha384,
            Ecdhe,
            Rsa,
            Aes256Gcm,
        ),
        CipherSuite::new(
            0x009E,
            "TLS_DHE_RSA_WITH_AES_128_GCM_SHA256",
            6,
            Sha256,
            Dhe,
            Rsa,
            Aes128Gcm,
        ),
    ];

    suites.sort_by_key(|s| s.priority);
    suites.into_iter().map(Arc::new).collect()
});

impl CipherCatalog {
    /// All supported suites in ascending priority order (most preferred
    /// first). The handshake layer picks the first mutually supported
    /// entry.
    pub fn all() -> &'static [Arc<CipherSuite>] {
        &SUITES
    }

    /// Look up a suite by its TLS registry identifier.
    pub fn by_id(id: u16) -> Option<&'static Arc<CipherSuite>> {
        SUITES.iter().find(|s| s.id == id)
    }
}
