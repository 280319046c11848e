//! DTLS-SRTP key derivation.
//!
//! Turns the master secret established by the (external) handshake
//! driver into the four independent SRTP key sets of a session, plus the
//! DTLS record keys. Everything here is deterministic: identical inputs
//! always yield identical keys.

use std::fmt;
use std::ops::Deref;

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use openssl::symm::{Cipher, Crypter, Mode};

use crate::srtp::{HMAC_KEY_LEN, MASTER_KEY_LEN, MASTER_SALT_LEN};
use crate::suite::{EncryptionAlgorithm, HashAlgorithm};

/// PRF label of the DTLS-SRTP extractor (RFC 5764).
const EXTRACTOR_LABEL: &[u8] = b"EXTRACTOR-dtls_srtp";

/// AES-CM derivation label for the RTP key set.
const LABEL_RTP_BASE: u8 = 0;
/// AES-CM derivation label for the RTCP key set, offset +3.
const LABEL_RTCP_BASE: u8 = 3;

/// The client and server hello randoms of one handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeRandoms {
    /// The 32 random bytes from ClientHello.
    pub client: [u8; 32],
    /// The 32 random bytes from ServerHello.
    pub server: [u8; 32],
}

impl HandshakeRandoms {
    /// Seed for the SRTP extractor: client ‖ server.
    pub fn extractor_seed(&self) -> [u8; 64] {
        let mut seed = [0; 64];
        seed[..32].copy_from_slice(&self.client);
        seed[32..].copy_from_slice(&self.server);
        seed
    }

    // Watch out: key expansion uses (server_random ‖ client_random),
    // the reverse of the extractor seed.
    fn expansion_seed(&self) -> [u8; 64] {
        let mut seed = [0; 64];
        seed[..32].copy_from_slice(&self.server);
        seed[32..].copy_from_slice(&self.client);
        seed
    }
}

/// Keying material used as master key for SRTP.
pub struct KeyingMaterial(Zeroizing<Vec<u8>>);

impl KeyingMaterial {
    /// Wrap extracted keying material bytes.
    pub fn new(m: Vec<u8>) -> Self {
        KeyingMaterial(Zeroizing::new(m))
    }
}

impl Deref for KeyingMaterial {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for KeyingMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyingMaterial")
    }
}

/// The TLS 1.2 PRF (RFC 5246 §5) under the negotiated hash.
pub fn tls_prf(
    hash: HashAlgorithm,
    secret: &[u8],
    label: &[u8],
    seed: &[u8],
    out_len: usize,
) -> Vec<u8> {
    match hash {
        HashAlgorithm::Sha256 => p_hash::<Hmac<Sha256>>(secret, label, seed, out_len),
        HashAlgorithm::Sha384 => p_hash::<Hmac<Sha384>>(secret, label, seed, out_len),
    }
}

fn p_hash<M: Mac + KeyInit>(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let hmac = |parts: &[&[u8]]| {
        let mut m = <M as Mac>::new_from_slice(secret).expect("hmac to accept any key length");
        for p in parts {
            m.update(p);
        }
        m.finalize().into_bytes()
    };

    let mut out = Vec::with_capacity(out_len);
    let mut a = hmac(&[label, seed]);
    while out.len() < out_len {
        let block = hmac(&[a.as_slice(), label, seed]);
        out.extend_from_slice(block.as_slice());
        a = hmac(&[a.as_slice()]);
    }
    out.truncate(out_len);
    out
}

/// Run the DTLS-SRTP extractor over the master secret.
///
/// Produces `2 × (key_len + salt_len)` bytes laid out as
/// client-key ‖ server-key ‖ client-salt ‖ server-salt.
pub fn extract_srtp_keying(
    hash: HashAlgorithm,
    master_secret: &[u8; 32],
    randoms: &HandshakeRandoms,
) -> KeyingMaterial {
    let out_len = 2 * (MASTER_KEY_LEN + MASTER_SALT_LEN);
    let mat = tls_prf(
        hash,
        master_secret,
        EXTRACTOR_LABEL,
        &randoms.extractor_seed(),
        out_len,
    );
    KeyingMaterial::new(mat)
}

/// SRTP master key and salt for one direction, cut from [`KeyingMaterial`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SrtpKey {
    master: [u8; MASTER_KEY_LEN],
    salt: [u8; MASTER_SALT_LEN],
}

impl SrtpKey {
    /// Cut the client (`left`) or server (`!left`) key and salt out of
    /// the extractor output.
    pub fn new(mat: &KeyingMaterial, left: bool) -> Self {
        // layout in the material is [key_client, key_server, salt_client, salt_server]

        const ML: usize = MASTER_KEY_LEN;
        const SL: usize = MASTER_SALT_LEN;

        // offset 0, offset 1
        let (o0, o1) = if left { (0, 0) } else { (ML, SL) };

        let mut master = [0; ML];
        let mut salt = [0; SL];

        master[0..ML].copy_from_slice(&mat[o0..(o0 + ML)]);
        salt[0..SL].copy_from_slice(&mat[(ML + ML + o1)..(ML + ML + o1 + SL)]);

        SrtpKey { master, salt }
    }

    /// The AES-CM key derivation of RFC 3711 §4.3 for one label.
    pub fn derive(&self, label: u8, out: &mut [u8]) {
        let mut i = 0; // index in out

        // input layout: [salt[14] || label, round[2]] (|| is xor 7th byte)
        let mut input = [0; 16];

        input[0..14].copy_from_slice(&self.salt[..]);
        input[7] ^= label;

        let mut buf = [0; 16 + 16]; // output from each AES
        let mut round: u16 = 0; // counter for each AES round

        // loop each AES round
        loop {
            if i == out.len() {
                break;
            }

            // splice in round at bottom of input
            input[14..].copy_from_slice(&round.to_be_bytes()[..]);

            // default key derivation function, which uses AES-128 in Counter Mode
            let mut aes = Crypter::new(Cipher::aes_128_ecb(), Mode::Encrypt, &self.master, None)
                .expect("AES deriver");

            // Run AES
            let count = aes.update(&input[..], &mut buf[..]).expect("AES update");
            let rest = aes.finalize(&mut buf[count..]).expect("AES finalize");
            assert_eq!(count + rest, 16 + 16); // input len + block size

            // Copy to output. Even if we get 32 bytes of output with AES 128 ECB, we
            // only use the first 16. That matches the tests in the RFC.
            for j in buf.iter().take(16) {
                if i == out.len() {
                    break;
                }
                out[i] = *j;
                i += 1;
            }

            round += 1;
        }
    }
}

impl fmt::Debug for SrtpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SrtpKey")
    }
}

/// One (cipher key, authentication key, salt) triple. Four independent
/// instances exist per session: RTP send/receive and RTCP send/receive.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SrtpKeyMaterial {
    /// AES-CM cipher key.
    pub key: [u8; MASTER_KEY_LEN],
    /// HMAC-SHA1 authentication key.
    pub auth: [u8; HMAC_KEY_LEN],
    /// IV salt.
    pub salt: [u8; MASTER_SALT_LEN],
}

impl SrtpKeyMaterial {
    pub(crate) fn from_key(sk: &SrtpKey, base_label: u8) -> Self {
        let mut key = [0; MASTER_KEY_LEN];
        sk.derive(base_label, &mut key);

        let mut auth = [0; HMAC_KEY_LEN];
        sk.derive(base_label + 1, &mut auth);

        let mut salt = [0; MASTER_SALT_LEN];
        sk.derive(base_label + 2, &mut salt);

        SrtpKeyMaterial { key, auth, salt }
    }
}

impl fmt::Debug for SrtpKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SrtpKeyMaterial")
    }
}

/// The four SRTP key sets of one session.
///
/// `active` decides which extractor half is ours to send with: the side
/// that initiated the handshake (the DTLS client) sends with the client
/// keys, the passive side with the server keys.
#[derive(Debug)]
pub struct SessionKeys {
    /// Keys protecting RTP we send.
    pub rtp_tx: SrtpKeyMaterial,
    /// Keys for RTP we receive.
    pub rtp_rx: SrtpKeyMaterial,
    /// Keys protecting RTCP we send.
    pub rtcp_tx: SrtpKeyMaterial,
    /// Keys for RTCP we receive.
    pub rtcp_rx: SrtpKeyMaterial,
}

impl SessionKeys {
    /// Derive all four key sets. Exactly four AES-CM derivations, labels
    /// 0/1/2 for RTP and 3/4/5 for RTCP.
    pub fn derive(
        hash: HashAlgorithm,
        master_secret: &[u8; 32],
        randoms: &HandshakeRandoms,
        active: bool,
    ) -> SessionKeys {
        let mat = extract_srtp_keying(hash, master_secret, randoms);

        let tx = SrtpKey::new(&mat, active);
        let rx = SrtpKey::new(&mat, !active);

        SessionKeys {
            rtp_tx: SrtpKeyMaterial::from_key(&tx, LABEL_RTP_BASE),
            rtp_rx: SrtpKeyMaterial::from_key(&rx, LABEL_RTP_BASE),
            rtcp_tx: SrtpKeyMaterial::from_key(&tx, LABEL_RTCP_BASE),
            rtcp_rx: SrtpKeyMaterial::from_key(&rx, LABEL_RTCP_BASE),
        }
    }
}

/// DTLS record write keys and fixed IVs ("key expansion" output),
/// feeding [`EncryptionAlgorithm::setup_cipher`].
pub struct RecordKeys {
    client_key: Zeroizing<Vec<u8>>,
    server_key: Zeroizing<Vec<u8>>,
    client_iv: Zeroizing<Vec<u8>>,
    server_iv: Zeroizing<Vec<u8>>,
    active: bool,
}

impl RecordKeys {
    /// Derive the record key block for one session.
    pub fn derive(
        hash: HashAlgorithm,
        encryption: EncryptionAlgorithm,
        master_secret: &[u8; 32],
        randoms: &HandshakeRandoms,
        active: bool,
    ) -> RecordKeys {
        let kl = encryption.key_len();
        let il = encryption.fixed_iv_len();

        let block = Zeroizing::new(tls_prf(
            hash,
            master_secret,
            b"key expansion",
            &randoms.expansion_seed(),
            2 * kl + 2 * il,
        ));

        RecordKeys {
            client_key: Zeroizing::new(block[..kl].to_vec()),
            server_key: Zeroizing::new(block[kl..2 * kl].to_vec()),
            client_iv: Zeroizing::new(block[2 * kl..2 * kl + il].to_vec()),
            server_iv: Zeroizing::new(block[2 * kl + il..].to_vec()),
            active,
        }
    }

    /// Key protecting records we send.
    pub fn write_key(&self) -> &[u8] {
        if self.active {
            &self.client_key
        } else {
            &self.server_key
        }
    }

    /// Key for records we receive.
    pub fn read_key(&self) -> &[u8] {
        if self.active {
            &self.server_key
        } else {
            &self.client_key
        }
    }

    /// Fixed IV part for records we send.
    pub fn write_iv(&self) -> &[u8] {
        if self.active {
            &self.client_iv
        } else {
            &self.server_iv
        }
    }

    /// Fixed IV part for records we receive.
    pub fn read_iv(&self) -> &[u8] {
        if self.active {
            &self.server_iv
        } else {
            &self.client_iv
        }
    }
}

impl fmt::Debug for RecordKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKeys")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    fn fixed_randoms() -> HandshakeRandoms {
        let mut seed = [0u8; 64];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut client = [0; 32];
        let mut server = [0; 32];
        client.copy_from_slice(&seed[..32]);
        server.copy_from_slice(&seed[32..]);
        HandshakeRandoms { client, server }
    }

    #[test]
    fn prf_sha256_reference_vector() {
        // Widely used P_SHA256 test vector ("test label", 100 bytes out).
        let secret = unhex("9bbe436ba940f017b17652849a71db35");
        let seed = unhex("a0ba9f936cda311827a6f796ffd5198c");
        let expect = unhex(
            "e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a\
             6b301791e90d35c9c9a46b4e14baf9af0fa022f7077def17abfd3797c0564bab\
             4fbc91666e9def9b97fce34f796789baa48082d122ee42c5a72e5a5110fff701\
             87347b66",
        );

        let out = tls_prf(HashAlgorithm::Sha256, &secret, b"test label", &seed, 100);
        assert_eq!(out, expect);
    }

    #[test]
    fn derive_key() {
        // https://tools.ietf.org/html/rfc3711#appendix-B.3
        //
        // Key Derivation Test Vectors.

        let master = [
            0xE1, 0xF9, 0x7A, 0x0D, 0x3E, 0x01, 0x8B, 0xE0, //
            0xD6, 0x4F, 0xA3, 0x2C, 0x06, 0xDE, 0x41, 0x39,
        ];

        let salt = [
            0x0E, 0xC6, 0x75, 0xAD, 0x49, 0x8A, 0xFE, //
            0xEB, 0xB6, 0x96, 0x0B, 0x3A, 0xAB, 0xE6,
        ];

        let sk = SrtpKey { master, salt };

        // aes crypto key
        let mut out = [0_u8; 16];
        sk.derive(0, &mut out[..]);

        assert_eq!(
            out,
            [
                0xC6, 0x1E, 0x7A, 0x93, 0x74, 0x4F, 0x39, 0xEE, //
                0x10, 0x73, 0x4A, 0xFE, 0x3F, 0xF7, 0xA0, 0x87
            ]
        );

        // hmac
        let mut out = [0_u8; 20];
        sk.derive(1, &mut out[..]);

        assert_eq!(
            out,
            [
                0xCE, 0xBE, 0x32, 0x1F, 0x6F, 0xF7, 0x71, 0x6B, //
                0x6F, 0xD4, 0xAB, 0x49, 0xAF, 0x25, 0x6A, 0x15, //
                0x6D, 0x38, 0xBA, 0xA4
            ]
        );

        // salt
        let mut out = [0_u8; 14];
        sk.derive(2, &mut out[..]);

        assert_eq!(
            out,
            [
                0x30, 0xCB, 0xBC, 0x08, 0x86, 0x3D, 0x8C, //
                0x85, 0xD4, 0x9D, 0xB3, 0x4A, 0x9A, 0xE1
            ]
        );
    }

    #[test]
    fn extractor_golden_vector() {
        // Pins the PRF/label chain: all-zero master secret, randoms of
        // incrementing bytes 0..63.
        let mat = extract_srtp_keying(HashAlgorithm::Sha256, &[0; 32], &fixed_randoms());

        let expect = unhex(
            "75a37dac35334f01955351476947c90039686315e6209d5dbca32f27fbcb7366\
             02c523cbeeb4c8e1b48803a7c555c91d1e09c963d555dcd334491cbb",
        );
        assert_eq!(&*mat, &expect[..]);
    }

    #[test]
    fn session_keys_golden_vector() {
        // Same fixed inputs, full chain down to the RTP send key set of
        // the active (client) side.
        let keys = SessionKeys::derive(HashAlgorithm::Sha256, &[0; 32], &fixed_randoms(), true);

        assert_eq!(
            keys.rtp_tx.key[..],
            unhex("3ed4898dcbdbc58650658959ad8ef997")[..]
        );
        assert_eq!(
            keys.rtp_tx.auth[..],
            unhex("915845527dac54eb6f67a480802fc7e3dbc9b9d3")[..]
        );
        assert_eq!(
            keys.rtp_tx.salt[..],
            unhex("3f2763d9d14dfde748034f00e876")[..]
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        let randoms = fixed_randoms();
        let master = [7u8; 32];

        let a = SessionKeys::derive(HashAlgorithm::Sha256, &master, &randoms, true);
        let b = SessionKeys::derive(HashAlgorithm::Sha256, &master, &randoms, true);

        assert_eq!(a.rtp_tx.key, b.rtp_tx.key);
        assert_eq!(a.rtp_rx.auth, b.rtp_rx.auth);
        assert_eq!(a.rtcp_tx.salt, b.rtcp_tx.salt);
        assert_eq!(a.rtcp_rx.key, b.rtcp_rx.key);
    }

    #[test]
    fn no_two_key_sets_alike() {
        let keys = SessionKeys::derive(HashAlgorithm::Sha256, &[9; 32], &fixed_randoms(), true);

        let sets = [&keys.rtp_tx, &keys.rtp_rx, &keys.rtcp_tx, &keys.rtcp_rx];
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                assert!(
                    sets[i].key != sets[j].key || sets[i].salt != sets[j].salt,
                    "key set {} and {} share key+salt",
                    i,
                    j
                );
            }
        }
    }

    #[test]
    fn active_and_passive_are_mirrored() {
        let randoms = fixed_randoms();
        let master = [3u8; 32];

        let client = SessionKeys::derive(HashAlgorithm::Sha256, &master, &randoms, true);
        let server = SessionKeys::derive(HashAlgorithm::Sha256, &master, &randoms, false);

        assert_eq!(client.rtp_tx.key, server.rtp_rx.key);
        assert_eq!(client.rtp_rx.key, server.rtp_tx.key);
        assert_eq!(client.rtcp_tx.auth, server.rtcp_rx.auth);
    }

    #[test]
    fn record_keys_sides() {
        let randoms = fixed_randoms();
        let master = [5u8; 32];

        let client = RecordKeys::derive(
            HashAlgorithm::Sha256,
            EncryptionAlgorithm::Aes128Gcm,
            &master,
            &randoms,
            true,
        );
        let server = RecordKeys::derive(
            HashAlgorithm::Sha256,
            EncryptionAlgorithm::Aes128Gcm,
            &master,
            &randoms,
            false,
        );

        assert_eq!(client.write_key(), server.read_key());
        assert_eq!(client.read_key(), server.write_key());
        assert_eq!(client.write_iv(), server.read_iv());
        assert_ne!(client.write_key(), client.read_key());
        assert_eq!(client.write_key().len(), 16);
        assert_eq!(client.write_iv().len(), 4);
    }
}
