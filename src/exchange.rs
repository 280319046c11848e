//! Ephemeral key exchange for one DTLS handshake.

use std::fmt;
use std::ops::Deref;

use openssl::bn::{BigNum, BigNumContext};
use openssl::derive::Deriver;
use openssl::dh::Dh;
use openssl::ec::{EcKey, EcPoint, PointConversionForm};
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use zeroize::Zeroizing;

use crate::cert::CertificateSet;
use crate::curve::CurveInfo;
use crate::error::CryptoError;
use crate::keying::HandshakeRandoms;
use crate::suite::{CipherSuite, KeyExchangeAlgorithm, SignatureAlgorithm};

/// Wire value for a named curve in ServerKeyExchange.
const CURVE_TYPE_NAMED: u8 = 3;

/// The shared secret computed from one key exchange. Wiped on drop.
pub struct SharedSecret(Zeroizing<Vec<u8>>);

impl Deref for SharedSecret {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret")
    }
}

/// Ephemeral key pair for one ECDHE exchange.
///
/// Owned exclusively by the handshake that generated it and discarded
/// once the shared secret is computed.
pub struct KeyPair {
    key: EcKey<Private>,
}

impl KeyPair {
    fn generate(curve: &CurveInfo) -> Result<Self, CryptoError> {
        let key = EcKey::generate(curve.group())?;
        Ok(KeyPair { key })
    }

    /// The public half, SEC1 uncompressed.
    pub fn public_key_bytes(&self, curve: &CurveInfo) -> Result<Vec<u8>, CryptoError> {
        let mut ctx = BigNumContext::new()?;
        let bytes = self.key.public_key().to_bytes(
            curve.group(),
            PointConversionForm::UNCOMPRESSED,
            &mut ctx,
        )?;
        Ok(bytes)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyPair")
    }
}

/// Per-handshake key exchange state, created via
/// [`CipherSuite::new_key_exchange`][crate::suite::CipherSuite::new_key_exchange].
#[derive(Debug)]
pub enum KeyExchange {
    /// Ephemeral elliptic curve Diffie-Hellman over a bound curve.
    Ecdhe(Ecdhe),
    /// Ephemeral finite field Diffie-Hellman.
    Dhe(Dhe),
}

impl KeyExchange {
    pub(crate) fn new(
        kind: KeyExchangeAlgorithm,
        curve: Option<&'static CurveInfo>,
    ) -> Result<Self, CryptoError> {
        match kind {
            KeyExchangeAlgorithm::Ecdhe => {
                let curve = curve.ok_or(CryptoError::Negotiation(
                    "ECDHE suite not specialized for a curve",
                ))?;
                Ok(KeyExchange::Ecdhe(Ecdhe::new(curve)))
            }
            KeyExchangeAlgorithm::Dhe => Ok(KeyExchange::Dhe(Dhe::new())),
        }
    }

    /// Generate the ephemeral private key material.
    pub fn generate_private_key(&mut self) -> Result<(), CryptoError> {
        match self {
            KeyExchange::Ecdhe(v) => v.generate_private_key().map(|_| ()),
            KeyExchange::Dhe(v) => v.generate_private_key(),
        }
    }

    /// Serialize the key exchange parameters plus a detached signature
    /// over (handshake randoms ‖ params) into `out`.
    pub fn write_key_exchange_args(
        &mut self,
        out: &mut Vec<u8>,
        randoms: &HandshakeRandoms,
        certificates: &CertificateSet,
        suite: &CipherSuite,
    ) -> Result<(), CryptoError> {
        match self {
            KeyExchange::Ecdhe(v) => v.write_key_exchange_args(out, randoms, certificates, suite),
            KeyExchange::Dhe(v) => v.write_key_exchange_args(out, randoms, certificates, suite),
        }
    }

    /// Compute the shared secret from the peer's public key bytes.
    ///
    /// A malformed or out-of-curve key rejects the handshake. There is
    /// no fallback value.
    pub fn calculate_agreement(&mut self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        match self {
            KeyExchange::Ecdhe(v) => v.calculate_agreement(peer_public),
            KeyExchange::Dhe(v) => v.calculate_agreement(peer_public),
        }
    }
}

enum EcdheState {
    Idle,
    PrivateKeyGenerated(KeyPair),
    ParamsWritten(KeyPair),
    SharedSecretComputed,
}

/// ECDHE exchange bound to one curve.
///
/// State machine: Idle → PrivateKeyGenerated → ParamsWritten →
/// SharedSecretComputed. Driving it out of order is a handshake error.
pub struct Ecdhe {
    curve: &'static CurveInfo,
    state: EcdheState,
}

impl Ecdhe {
    fn new(curve: &'static CurveInfo) -> Self {
        Ecdhe {
            curve,
            state: EcdheState::Idle,
        }
    }

    /// Generate the ephemeral key pair over the bound curve.
    pub fn generate_private_key(&mut self) -> Result<&KeyPair, CryptoError> {
        if !matches!(self.state, EcdheState::Idle) {
            return Err(CryptoError::Negotiation("ephemeral key already generated"));
        }
        self.state = EcdheState::PrivateKeyGenerated(KeyPair::generate(self.curve)?);
        match &self.state {
            EcdheState::PrivateKeyGenerated(kp) => Ok(kp),
            _ => unreachable!(),
        }
    }

    fn write_key_exchange_args(
        &mut self,
        out: &mut Vec<u8>,
        randoms: &HandshakeRandoms,
        certificates: &CertificateSet,
        suite: &CipherSuite,
    ) -> Result<(), CryptoError> {
        let kp = match std::mem::replace(&mut self.state, EcdheState::Idle) {
            EcdheState::PrivateKeyGenerated(kp) => kp,
            other => {
                self.state = other;
                return Err(CryptoError::Negotiation("no ephemeral key to write"));
            }
        };

        let public = kp.public_key_bytes(self.curve)?;
        // Point length is written as a single byte. Even P-521
        // uncompressed (133 bytes) fits.
        assert!(public.len() <= u8::MAX as usize);

        let mut params = Vec::with_capacity(4 + public.len());
        params.push(CURVE_TYPE_NAMED);
        params.extend_from_slice(&self.curve.group_id.to_be_bytes());
        params.push(public.len() as u8);
        params.extend_from_slice(&public);

        let scheme = self.curve.signature_scheme_for(suite.signature);
        let signature = sign_params(
            randoms,
            &params,
            certificates,
            suite.signature,
            self.curve.message_digest(),
        )?;

        out.extend_from_slice(&params);
        out.extend_from_slice(&scheme.to_be_bytes());
        out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&signature);

        self.state = EcdheState::ParamsWritten(kp);
        Ok(())
    }

    fn calculate_agreement(&mut self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let kp = match std::mem::replace(&mut self.state, EcdheState::SharedSecretComputed) {
            EcdheState::ParamsWritten(kp) => kp,
            other => {
                self.state = other;
                return Err(CryptoError::KeyAgreement("key exchange params not written"));
            }
        };

        let group = self.curve.group();
        let mut ctx = BigNumContext::new()?;

        let point = EcPoint::from_bytes(group, peer_public, &mut ctx)
            .map_err(|_| CryptoError::KeyAgreement("malformed peer public key"))?;
        let peer_key = EcKey::from_public_key(group, &point)
            .map_err(|_| CryptoError::KeyAgreement("malformed peer public key"))?;
        peer_key
            .check_key()
            .map_err(|_| CryptoError::KeyAgreement("peer public key not on curve"))?;

        let peer = PKey::from_ec_key(peer_key)?;
        let ours = PKey::from_ec_key(kp.key)?;

        let mut deriver = Deriver::new(&ours)?;
        deriver.set_peer(&peer)?;
        let secret = deriver.derive_to_vec()?;

        Ok(SharedSecret(Zeroizing::new(secret)))
    }
}

impl fmt::Debug for Ecdhe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            EcdheState::Idle => "Idle",
            EcdheState::PrivateKeyGenerated(_) => "PrivateKeyGenerated",
            EcdheState::ParamsWritten(_) => "ParamsWritten",
            EcdheState::SharedSecretComputed => "SharedSecretComputed",
        };
        write!(f, "Ecdhe({}, {})", self.curve.name, state)
    }
}

enum DheState {
    Idle,
    PrivateKeyGenerated(Dh<Private>),
    ParamsWritten(Dh<Private>),
    SharedSecretComputed,
}

/// Finite field DHE exchange over the RFC 5114 2048-bit group.
pub struct Dhe {
    state: DheState,
}

impl Dhe {
    fn new() -> Self {
        Dhe {
            state: DheState::Idle,
        }
    }

    fn generate_private_key(&mut self) -> Result<(), CryptoError> {
        if !matches!(self.state, DheState::Idle) {
            return Err(CryptoError::Negotiation("ephemeral key already generated"));
        }
        let dh = Dh::get_2048_256()?.generate_key()?;
        self.state = DheState::PrivateKeyGenerated(dh);
        Ok(())
    }

    fn write_key_exchange_args(
        &mut self,
        out: &mut Vec<u8>,
        randoms: &HandshakeRandoms,
        certificates: &CertificateSet,
        suite: &CipherSuite,
    ) -> Result<(), CryptoError> {
        let dh = match std::mem::replace(&mut self.state, DheState::Idle) {
            DheState::PrivateKeyGenerated(dh) => dh,
            other => {
                self.state = other;
                return Err(CryptoError::Negotiation("no ephemeral key to write"));
            }
        };

        let mut params = Vec::new();
        for part in [
            dh.prime_p().to_vec(),
            dh.generator().to_vec(),
            dh.public_key().to_vec(),
        ] {
            params.extend_from_slice(&(part.len() as u16).to_be_bytes());
            params.extend_from_slice(&part);
        }

        let digest = suite.hash.message_digest();
        let scheme = match suite.hash {
            crate::suite::HashAlgorithm::Sha256 => 0x0401u16,
            crate::suite::HashAlgorithm::Sha384 => 0x0501u16,
        };
        let signature = sign_params(randoms, &params, certificates, suite.signature, digest)?;

        out.extend_from_slice(&params);
        out.extend_from_slice(&scheme.to_be_bytes());
        out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
        out.extend_from_slice(&signature);

        self.state = DheState::ParamsWritten(dh);
        Ok(())
    }

    fn calculate_agreement(&mut self, peer_public: &[u8]) -> Result<SharedSecret, CryptoError> {
        let dh = match std::mem::replace(&mut self.state, DheState::SharedSecretComputed) {
            DheState::ParamsWritten(dh) => dh,
            other => {
                self.state = other;
                return Err(CryptoError::KeyAgreement("key exchange params not written"));
            }
        };

        let peer = BigNum::from_slice(peer_public)
            .map_err(|_| CryptoError::KeyAgreement("malformed peer public key"))?;

        // Reject trivial subgroup values: require 1 < y < p-1.
        let one = BigNum::from_u32(1)?;
        let mut p_minus_1 = BigNum::new()?;
        p_minus_1.checked_sub(dh.prime_p(), &one)?;
        if peer <= one || peer >= p_minus_1 {
            return Err(CryptoError::KeyAgreement("peer public key out of range"));
        }

        let secret = dh
            .compute_key(&peer)
            .map_err(|_| CryptoError::KeyAgreement("DH agreement failed"))?;

        Ok(SharedSecret(Zeroizing::new(secret)))
    }
}

impl fmt::Debug for Dhe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            DheState::Idle => "Idle",
            DheState::PrivateKeyGenerated(_) => "PrivateKeyGenerated",
            DheState::ParamsWritten(_) => "ParamsWritten",
            DheState::SharedSecretComputed => "SharedSecretComputed",
        };
        write!(f, "Dhe({})", state)
    }
}

fn sign_params(
    randoms: &HandshakeRandoms,
    params: &[u8],
    certificates: &CertificateSet,
    signature: SignatureAlgorithm,
    digest: openssl::hash::MessageDigest,
) -> Result<Vec<u8>, CryptoError> {
    let cert = certificates.certificate_for(signature);
    let mut signer = Signer::new(digest, cert.private_key())?;
    signer.update(&randoms.client)?;
    signer.update(&randoms.server)?;
    signer.update(params)?;
    Ok(signer.sign_to_vec()?)
}
