//! Self-signed DTLS certificate generation and rotation.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use openssl::asn1::{Asn1Integer, Asn1Time, Asn1Type};
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509Name, X509};

use crate::error::CryptoError;
use crate::suite::SignatureAlgorithm;

const RSA_F4: u32 = 0x10001;

/// Validity window of a generated certificate: now-1h .. now+3 months.
const CERT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 3600);

/// Age at which the cached certificate set is regenerated.
const ROTATE_AFTER: Duration = Duration::from_secs(30 * 24 * 3600);

// libWebRTC says "WebRTC" here when doing OpenSSL, for BoringSSL they seem
// to generate a random 8 characters.
// https://webrtc.googlesource.com/src/+/1568f1b1330f94494197696fe235094e6293b258/rtc_base/rtc_certificate_generator.cc#27
//
// Pion also sets this to "WebRTC", maybe for compatibility reasons.
// https://github.com/pion/webrtc/blob/eed2bb2d3b9f204f9de1cd7e1046ca5d652778d2/constants.go#L31
const DTLS_CERT_IDENTITY: &str = "WebRTC";

/// A self-signed certificate with its private key.
#[derive(Clone)]
pub struct Certificate {
    pub(crate) pkey: PKey<Private>,
    pub(crate) x509: X509,
}

impl Certificate {
    /// Produce a (public) fingerprint of the cert.
    ///
    /// This is sent via SDP to the other peer to lock down the DTLS
    /// to this specific certificate.
    pub fn fingerprint(&self) -> Fingerprint {
        let digest: &[u8] = &self
            .x509
            .digest(MessageDigest::sha256())
            .expect("digest to fingerprint");

        Fingerprint {
            hash_func: "sha-256".into(),
            bytes: digest.to_vec(),
        }
    }

    /// DER encoding of the certificate, as sent in the handshake.
    pub fn to_der(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.x509.to_der()?)
    }

    /// The private key paired with this certificate.
    pub(crate) fn private_key(&self) -> &PKey<Private> {
        &self.pkey
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificate({})", self.fingerprint())
    }
}

/// Certificate fingerprint, verified against the one communicated in
/// the SDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Hash function used to produce the fingerprint, e.g. "sha-256".
    pub hash_func: String,
    /// Digest of the DER encoded certificate.
    pub bytes: Vec<u8>,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.hash_func)?;
        let mut first = true;
        for b in &self.bytes {
            if !first {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", b)?;
            first = false;
        }
        Ok(())
    }
}

/// The certificates in use for new handshakes, plus their generation time.
///
/// A handshake fetches the set once and holds the `Arc` for its whole
/// duration. Rotation replaces the authority's cached `Arc`, it never
/// mutates a set already handed out.
#[derive(Debug)]
pub struct CertificateSet {
    ec: Certificate,
    rsa: Certificate,
    created: SystemTime,
}

impl CertificateSet {
    fn generate(now: SystemTime) -> Result<Self, CryptoError> {
        Ok(CertificateSet {
            ec: generate_elliptic_certificate(now)?,
            rsa: generate_rsa_certificate(now)?,
            created: now,
        })
    }

    /// UTC time this set was generated.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// The certificate matching a suite's signature algorithm.
    pub fn certificate_for(&self, signature: SignatureAlgorithm) -> &Certificate {
        match signature {
            SignatureAlgorithm::Ecdsa => &self.ec,
            SignatureAlgorithm::Rsa => &self.rsa,
        }
    }
}

/// Generates and rotates the server's self-signed DTLS certificates.
///
/// Process-wide shared, read-mostly. Rotation is copy-on-write: readers
/// holding an older [`CertificateSet`] are unaffected.
#[derive(Debug, Default)]
pub struct CertificateAuthority {
    cached: Mutex<Option<Arc<CertificateSet>>>,
}

impl CertificateAuthority {
    /// Create an authority with no certificates generated yet.
    pub fn new() -> Self {
        CertificateAuthority {
            cached: Mutex::new(None),
        }
    }

    /// The current certificate set, regenerated when older than 30 days.
    ///
    /// Returns a snapshot: the caller must hold the returned `Arc` for
    /// the duration of one handshake rather than re-fetching per message,
    /// so a concurrent rotation cannot split a handshake across two sets.
    pub fn get_certificate_set(
        &self,
        now: SystemTime,
    ) -> Result<Arc<CertificateSet>, CryptoError> {
        let mut cached = self.cached.lock().unwrap();

        if let Some(set) = &*cached {
            let age = now.duration_since(set.created).unwrap_or(Duration::ZERO);
            if age <= ROTATE_AFTER {
                return Ok(Arc::clone(set));
            }
        }

        match CertificateSet::generate(now) {
            Ok(set) => {
                let set = Arc::new(set);
                *cached = Some(Arc::clone(&set));
                Ok(set)
            }
            Err(e) => {
                // Degraded state: keep serving the stale set if we have
                // one. Existing sessions continue, new handshakes get the
                // old (still valid) certificates.
                warn!("Certificate generation failed: {}", e);
                match &*cached {
                    Some(set) => Ok(Arc::clone(set)),
                    None => Err(e),
                }
            }
        }
    }
}

/// Creates a new self-signed certificate over P-256.
// The libWebRTC code we try to match is at:
// https://webrtc.googlesource.com/src/+/1568f1b1330f94494197696fe235094e6293b258/rtc_base/openssl_certificate.cc#58
pub fn generate_elliptic_certificate(now: SystemTime) -> Result<Certificate, CryptoError> {
    let generate = || -> Result<Certificate, ErrorStack> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = EcKey::generate(&group)?;
        let pkey = PKey::from_ec_key(key)?;
        let x509 = self_signed_x509(&pkey, now, MessageDigest::sha256())?;
        Ok(Certificate { pkey, x509 })
    };
    generate().map_err(CryptoError::CertificateGeneration)
}

/// Creates a new self-signed RSA-2048 certificate.
pub fn generate_rsa_certificate(now: SystemTime) -> Result<Certificate, CryptoError> {
    let generate = || -> Result<Certificate, ErrorStack> {
        let f4 = BigNum::from_u32(RSA_F4)?;
        let key = Rsa::generate_with_e(2048, &f4)?;
        let pkey = PKey::from_rsa(key)?;
        let x509 = self_signed_x509(&pkey, now, MessageDigest::sha256())?;
        Ok(Certificate { pkey, x509 })
    };
    generate().map_err(CryptoError::CertificateGeneration)
}

fn self_signed_x509(
    pkey: &PKey<Private>,
    now: SystemTime,
    digest: MessageDigest,
) -> Result<X509, ErrorStack> {
    let mut x509b = X509::builder()?;
    x509b.set_version(2)?; // X509.V3 (zero indexed)

    // For Firefox, the serial number must be unique across all certificates,
    // including those of other processes/machines! See
    // https://github.com/versatica/mediasoup/issues/127#issuecomment-474460153
    let mut serial_buf = [0u8; 16];
    openssl::rand::rand_bytes(&mut serial_buf)?;

    let serial_bn = BigNum::from_slice(&serial_buf)?;
    let serial = Asn1Integer::from_bn(&serial_bn)?;
    x509b.set_serial_number(&serial)?;

    let now_unix = unix_time(now);
    let before = Asn1Time::from_unix(now_unix - 3600)?;
    x509b.set_not_before(&before)?;
    let after = Asn1Time::from_unix(now_unix + CERT_VALIDITY.as_secs() as libc::time_t)?;
    x509b.set_not_after(&after)?;
    x509b.set_pubkey(pkey)?;

    let mut nameb = X509Name::builder()?;
    nameb.append_entry_by_nid_with_type(Nid::COMMONNAME, DTLS_CERT_IDENTITY, Asn1Type::UTF8STRING)?;
    let name = nameb.build();

    x509b.set_subject_name(&name)?;
    x509b.set_issuer_name(&name)?;

    x509b.sign(pkey, digest)?;
    Ok(x509b.build())
}

fn unix_time(t: SystemTime) -> libc::time_t {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as libc::time_t
}

#[cfg(test)]
mod test {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn elliptic_certificate_fingerprint() {
        let cert = generate_elliptic_certificate(SystemTime::now()).unwrap();
        let f = cert.fingerprint();
        assert_eq!(f.hash_func, "sha-256");
        assert_eq!(f.bytes.len(), 32);
    }

    #[test]
    fn rsa_certificate_der() {
        let cert = generate_rsa_certificate(SystemTime::now()).unwrap();
        assert!(!cert.to_der().unwrap().is_empty());
    }

    #[test]
    fn set_is_stable_under_30_days() {
        let authority = CertificateAuthority::new();
        let t0 = SystemTime::now();

        let a = authority.get_certificate_set(t0).unwrap();
        let b = authority.get_certificate_set(t0 + 29 * DAY).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn set_rotates_after_30_days() {
        let authority = CertificateAuthority::new();
        let t0 = SystemTime::now();

        let a = authority.get_certificate_set(t0).unwrap();
        let b = authority.get_certificate_set(t0 + 31 * DAY).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));

        // The old snapshot is still intact for a handshake that holds it.
        let fa = a.certificate_for(SignatureAlgorithm::Ecdsa).fingerprint();
        let fb = b.certificate_for(SignatureAlgorithm::Ecdsa).fingerprint();
        assert_ne!(fa, fb);
    }

    #[test]
    fn signature_algorithm_selects_certificate() {
        let authority = CertificateAuthority::new();
        let set = authority.get_certificate_set(SystemTime::now()).unwrap();

        let ec = set.certificate_for(SignatureAlgorithm::Ecdsa);
        let rsa = set.certificate_for(SignatureAlgorithm::Rsa);
        assert_ne!(ec.fingerprint(), rsa.fingerprint());
    }
}
