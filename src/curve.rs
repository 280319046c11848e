//! Catalog of supported elliptic curves.

use std::fmt;

use once_cell::sync::Lazy;
use openssl::ec::EcGroup;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;

use crate::suite::SignatureAlgorithm;

/// One supported elliptic curve with precomputed domain parameters.
///
/// Entries are created once when the catalog loads and shared by
/// reference across all cipher suite variants bound to the curve.
pub struct CurveInfo {
    /// Human readable curve name.
    pub name: &'static str,
    /// TLS named group identifier (IANA "Supported Groups" registry).
    pub group_id: u16,
    /// TLS signature scheme identifier paired with this curve
    /// (e.g. `ecdsa_secp256r1_sha256` = 0x0403).
    pub signature_scheme: u16,
    /// OpenSSL curve name.
    pub nid: Nid,
    digest_nid: Nid,
    group: EcGroup,
}

impl CurveInfo {
    /// Domain parameters for this curve.
    pub fn group(&self) -> &EcGroup {
        &self.group
    }

    /// Digest used when signing key exchange parameters over this curve.
    pub fn message_digest(&self) -> MessageDigest {
        MessageDigest::from_nid(self.digest_nid).expect("digest for allow-listed curve")
    }

    /// Signature scheme identifier when signing with `signature` using
    /// this curve's digest. ECDSA uses the curve's own paired scheme, RSA
    /// the PKCS#1 scheme of the same digest.
    pub fn signature_scheme_for(&self, signature: SignatureAlgorithm) -> u16 {
        match signature {
            SignatureAlgorithm::Ecdsa => self.signature_scheme,
            SignatureAlgorithm::Rsa => {
                if self.digest_nid == Nid::SHA256 {
                    0x0401
                } else if self.digest_nid == Nid::SHA384 {
                    0x0501
                } else {
                    0x0601
                }
            }
        }
    }
}

impl fmt::Debug for CurveInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CurveInfo({})", self.name)
    }
}

/// Static table of the curves this process is willing to negotiate.
///
/// Curves not in the allow-list are absent even if the underlying
/// library could do the math for them.
pub struct CurveCatalog;

// Loads lazily on first lookup. Lazy guarantees a single deterministic
// init even with concurrent first readers.
static CURVES: Lazy<Vec<CurveInfo>> = Lazy::new(|| {
    let allow = [
        ("secp256r1", 23, 0x0403, Nid::X9_62_PRIME256V1, Nid::SHA256),
        ("secp384r1", 24, 0x0503, Nid::SECP384R1, Nid::SHA384),
        ("secp521r1", 25, 0x0603, Nid::SECP521R1, Nid::SHA512),
    ];

    allow
        .into_iter()
        .map(|(name, group_id, signature_scheme, nid, digest_nid)| {
            let group = curve_group(nid).expect("domain parameters for allow-listed curve");
            CurveInfo {
                name,
                group_id,
                signature_scheme,
                nid,
                digest_nid,
                group,
            }
        })
        .collect()
});

fn curve_group(nid: Nid) -> Result<EcGroup, ErrorStack> {
    EcGroup::from_curve_name(nid)
}

impl CurveCatalog {
    /// Look up a curve by its TLS signature scheme identifier.
    pub fn lookup(signature_scheme: u16) -> Option<&'static CurveInfo> {
        CURVES.iter().find(|c| c.signature_scheme == signature_scheme)
    }

    /// Look up a curve by its TLS named group identifier.
    pub fn by_group(group_id: u16) -> Option<&'static CurveInfo> {
        CURVES.iter().find(|c| c.group_id == group_id)
    }

    /// All supported curves, most preferred first.
    pub fn all() -> &'static [CurveInfo] {
        &CURVES
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_by_signature_scheme() {
        let c = CurveCatalog::lookup(0x0403).unwrap();
        assert_eq!(c.name, "secp256r1");
        assert_eq!(c.group_id, 23);

        let c = CurveCatalog::lookup(0x0603).unwrap();
        assert_eq!(c.name, "secp521r1");
    }

    #[test]
    fn lookup_outside_allow_list() {
        // ed25519 is mathematically fine, but not allow-listed.
        assert!(CurveCatalog::lookup(0x0807).is_none());
        assert!(CurveCatalog::by_group(29).is_none());
    }

    #[test]
    fn shared_references() {
        let a = CurveCatalog::by_group(24).unwrap();
        let b = CurveCatalog::lookup(0x0503).unwrap();
        assert!(std::ptr::eq(a, b));
    }
}
