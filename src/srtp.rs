//! Per-packet SRTP/SRTCP protection.
//!
//! AES-128-CM encryption with HMAC-SHA1 80-bit authentication tags, plus
//! the AEAD ciphers protecting DTLS records. Authentication failures on
//! inbound packets are silent drops (`None`), never errors, so a caller
//! cannot be turned into a verification oracle.

use std::fmt;

use hmac::{Hmac, Mac};
use openssl::cipher;
use openssl::cipher_ctx::CipherCtx;
use openssl::error::ErrorStack;
use sha1::Sha1;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::keying::SrtpKeyMaterial;
use crate::suite::EncryptionAlgorithm;

/// SRTP master key length (AES-128).
pub const MASTER_KEY_LEN: usize = 16;
/// SRTP master salt length.
pub const MASTER_SALT_LEN: usize = 14;
/// HMAC-SHA1 authentication key length.
pub const HMAC_KEY_LEN: usize = 20;

/// Truncated authentication tag appended to every SRTP/SRTCP packet.
pub const TAG_LEN: usize = 10;

// header = 4 bytes
// ssrc   = 4 bytes
// srtcp_index = 4 bytes
// hmac = 10 bytes
// TOTAL overhead for SRTCP = 22 bytes over the plaintext payload.

const SRTCP_INDEX_LEN: usize = 4;

/// Bytes added to an RTP packet by protection.
pub const SRTP_OVERHEAD: usize = TAG_LEN;
/// Bytes added to an RTCP compound packet by protection.
pub const SRTCP_OVERHEAD: usize = SRTCP_INDEX_LEN + TAG_LEN;

/// AEAD tag length of all supported record ciphers.
const AEAD_TAG_LEN: usize = 16;

type HmacSha1 = Hmac<Sha1>;
type RtpSalt = [u8; MASTER_SALT_LEN];
type RtpIv = [u8; 16];

/// HMAC-SHA1 over a sequence of byte slices.
pub(crate) fn sha1_hmac(key: &[u8], payloads: &[&[u8]]) -> [u8; 20] {
    let mut hmac = HmacSha1::new_from_slice(key).expect("hmac to accept any key length");
    for payload in payloads {
        hmac.update(payload);
    }
    hmac.finalize().into_bytes().into()
}

/// The AES-CM IV of RFC 3711 §4.1.1: salt XOR ssrc XOR packet index.
fn rtp_iv(salt: &RtpSalt, ssrc: u32, srtp_index: u64) -> RtpIv {
    let mut iv = [0; 16];

    let ssrc_be = ssrc.to_be_bytes();
    let srtp_be = srtp_index.to_be_bytes();

    iv[4..8].copy_from_slice(&ssrc_be);

    for i in 0..8 {
        iv[i + 6] ^= srtp_be[i];
    }
    for i in 0..14 {
        iv[i] ^= salt[i];
    }

    iv
}

/// One direction of SRTP and SRTCP protection for a session.
///
/// Holds the derived keys for both packet kinds and the outbound SRTCP
/// index counter. A session has two of these, one per direction, and
/// they never share key material.
#[derive(Debug)]
pub struct ProtectionContext {
    /// Cipher and authentication state for RTP.
    rtp: PacketKeys,
    /// Cipher and authentication state for RTCP.
    rtcp: PacketKeys,
    /// Counter for outgoing SRTCP packets.
    srtcp_index: u32,
}

impl ProtectionContext {
    /// Bind a context to one direction's RTP and RTCP key sets.
    pub fn new(rtp: &SrtpKeyMaterial, rtcp: &SrtpKeyMaterial) -> Result<Self, CryptoError> {
        Ok(ProtectionContext {
            rtp: PacketKeys::new(rtp)?,
            rtcp: PacketKeys::new(rtcp)?,
            srtcp_index: 0,
        })
    }

    // SRTP layout
    // [header, [rtp, (padding + pad_count)], hmac]

    /// Protect one outbound RTP packet.
    ///
    /// `buf` is the full plaintext packet, `header_len` the byte length of
    /// its header (which stays in the clear), `srtp_index` the extended
    /// sequence number (ROC ‖ seq).
    pub fn protect_rtp(
        &mut self,
        buf: &[u8],
        header_len: usize,
        ssrc: u32,
        srtp_index: u64,
    ) -> Result<Vec<u8>, CryptoError> {
        let iv = rtp_iv(&self.rtp.salt, ssrc, srtp_index);

        let input = &buf[header_len..];

        let mut output = vec![0_u8; buf.len() + TAG_LEN];
        self.rtp.enc.encrypt(&iv, input, &mut output[header_len..])?;

        output[..header_len].copy_from_slice(&buf[..header_len]);

        let hmac_start = buf.len();
        self.rtp.rtp_hmac(&mut output, srtp_index, hmac_start);

        Ok(output)
    }

    /// Verify and decrypt one inbound SRTP packet. Returns the plaintext
    /// payload (header stripped), or `None` when the tag does not verify.
    pub fn unprotect_rtp(
        &mut self,
        buf: &[u8],
        header_len: usize,
        ssrc: u32,
        srtp_index: u64,
        has_padding: bool,
    ) -> Option<Vec<u8>> {
        if buf.len() < header_len + TAG_LEN {
            return None;
        }

        let hmac_start = buf.len() - TAG_LEN;

        if !self
            .rtp
            .rtp_verify(&buf[..hmac_start], srtp_index, &buf[hmac_start..])
        {
            trace!("unprotect_rtp hmac verify fail");
            return None;
        }

        let iv = rtp_iv(&self.rtp.salt, ssrc, srtp_index);

        let input = &buf[header_len..hmac_start];
        let mut output = vec![0_u8; input.len()];

        if let Err(e) = self.rtp.dec.decrypt(&iv, input, &mut output) {
            trace!("unprotect_rtp decrypt fail: {}", e);
            return None;
        }

        if truncate_off_srtp_padding(has_padding, &mut output).is_err() {
            trace!("unpadding of unprotected payload failed");
            return None;
        }

        Some(output)
    }

    /// Protect one outbound RTCP compound packet.
    ///
    /// The E-flag and 31-bit SRTCP index are appended before the tag.
    pub fn protect_rtcp(&mut self, buf: &[u8]) -> Result<Vec<u8>, CryptoError> {
        // Need at least the RTCP header and SSRC to form the IV.
        if buf.len() < 8 {
            return Err(CryptoError::Packet("rtcp packet shorter than header"));
        }

        // https://tools.ietf.org/html/rfc3711#page-15
        // The SRTCP index MUST be set to zero before the first SRTCP
        // packet is sent, and MUST be incremented by one,
        // modulo 2^31, after each SRTCP packet is sent.
        self.srtcp_index = (self.srtcp_index + 1) % 2_u32.pow(31);

        let srtcp_index = self.srtcp_index;
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if ssrc == 0 {
            warn!("SSRC 0 does not make a good SRTCP IV");
        }

        let iv = rtp_iv(&self.rtcp.salt, ssrc, srtcp_index as u64);

        let mut output = vec![0_u8; buf.len() + SRTCP_INDEX_LEN + TAG_LEN];
        output[0..8].copy_from_slice(&buf[0..8]);
        let input = &buf[8..];
        let encout = &mut output[8..(8 + input.len())];

        self.rtcp.enc.encrypt(&iv, input, encout)?;

        // e is always encrypted, rest is 31 bit index.
        let e_and_si = 0x8000_0000 | srtcp_index;
        let to = &mut output[buf.len()..];
        to[0..4].copy_from_slice(&e_and_si.to_be_bytes());

        let hmac_index = output.len() - TAG_LEN;
        self.rtcp.rtcp_hmac(&mut output, hmac_index);

        Ok(output)
    }

    // SRTCP layout
    // ["header", ssrc, payload, ["header", ssrc, payload], ...], srtcp_index, hmac]
    //
    // |----------------------------------------------------------------------|
    //                          authenticated (hmac)
    //
    //                  |--------------------------------------|
    //                              encrypted (aes)

    /// Verify and decrypt one inbound SRTCP packet. Returns the plaintext
    /// compound packet, or `None` when the tag does not verify.
    pub fn unprotect_rtcp(&mut self, buf: &[u8]) -> Option<Vec<u8>> {
        if buf.len() < 8 + TAG_LEN + SRTCP_INDEX_LEN {
            return None;
        }

        let hmac_start = buf.len() - TAG_LEN;

        if !self.rtcp.rtcp_verify(&buf[..hmac_start], &buf[hmac_start..]) {
            trace!("unprotect_rtcp hmac verify fail");
            return None;
        }

        let idx_start = hmac_start - SRTCP_INDEX_LEN;

        let srtcp_index_be = [
            buf[idx_start],
            buf[idx_start + 1],
            buf[idx_start + 2],
            buf[idx_start + 3],
        ];

        // E-flag and SRTCP index.
        let e_and_si = u32::from_be_bytes(srtcp_index_be);

        let is_encrypted = e_and_si & 0x8000_0000 > 0;

        if !is_encrypted {
            // Non-encrypted we can just return
            return Some(buf[0..idx_start].to_vec());
        }

        // The SRTCP index is a 31-bit counter for the SRTCP packet.
        let srtcp_index = e_and_si & 0x7fff_ffff;
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        let iv = rtp_iv(&self.rtcp.salt, ssrc, srtcp_index as u64);

        // The Encrypted Portion of an SRTCP packet consists of the encryption
        // of the RTCP payload of the equivalent compound RTCP packet, from the
        // first RTCP packet, i.e., from the ninth (9) octet to the end of the
        // compound packet.
        let input = &buf[8..idx_start];
        let mut output = vec![0_u8; input.len() + 8];
        output[0..8].copy_from_slice(&buf[0..8]);

        if let Err(e) = self.rtcp.dec.decrypt(&iv, input, &mut output[8..]) {
            trace!("unprotect_rtcp decrypt fail: {}", e);
            return None;
        }

        Some(output)
    }
}

fn truncate_off_srtp_padding(has_padding: bool, payload: &mut Vec<u8>) -> Result<(), ()> {
    if has_padding {
        // P bit set with nothing decrypted: there is no pad count byte.
        let Some(&pad_len) = payload.last() else {
            return Err(());
        };
        let Some(unpadded_len) = payload.len().checked_sub(pad_len as usize) else {
            return Err(());
        };
        payload.truncate(unpadded_len);
    }
    Ok(())
}

/// Cipher contexts and authentication key for one packet kind.
struct PacketKeys {
    hmac_key: [u8; HMAC_KEY_LEN],
    salt: RtpSalt,
    enc: Encrypter,
    dec: Decrypter,
}

impl Drop for PacketKeys {
    fn drop(&mut self) {
        self.hmac_key.zeroize();
        self.salt.zeroize();
    }
}

impl PacketKeys {
    fn new(mat: &SrtpKeyMaterial) -> Result<Self, CryptoError> {
        Ok(PacketKeys {
            hmac_key: mat.auth,
            salt: mat.salt,
            enc: Encrypter::new(&mat.key)?,
            dec: Decrypter::new(&mat.key)?,
        })
    }

    /// Write the truncated tag over `buf[..hmac_start]` with the ROC
    /// appended to the authenticated input.
    fn rtp_hmac(&self, buf: &mut [u8], srtp_index: u64, hmac_start: usize) {
        let roc = (srtp_index >> 16) as u32;

        let tag = sha1_hmac(&self.hmac_key, &[&buf[..hmac_start], &roc.to_be_bytes()]);

        buf[hmac_start..(hmac_start + TAG_LEN)].copy_from_slice(&tag[0..TAG_LEN]);
    }

    fn rtp_verify(&self, buf: &[u8], srtp_index: u64, cmp: &[u8]) -> bool {
        let roc = (srtp_index >> 16) as u32;

        let tag = sha1_hmac(&self.hmac_key, &[buf, &roc.to_be_bytes()]);

        &tag[0..TAG_LEN] == cmp
    }

    fn rtcp_hmac(&self, buf: &mut [u8], hmac_index: usize) {
        let tag = sha1_hmac(&self.hmac_key, &[&buf[0..hmac_index]]);

        buf[hmac_index..(hmac_index + TAG_LEN)].copy_from_slice(&tag[0..TAG_LEN]);
    }

    fn rtcp_verify(&self, buf: &[u8], cmp: &[u8]) -> bool {
        let tag = sha1_hmac(&self.hmac_key, &[buf]);

        &tag[0..TAG_LEN] == cmp
    }
}

struct Encrypter {
    ctx: CipherCtx,
}

impl Encrypter {
    /// A reusable AES-128-CTR context. Keyed once, re-IV:ed per packet.
    fn new(key: &[u8; MASTER_KEY_LEN]) -> Result<Self, CryptoError> {
        let t = cipher::Cipher::aes_128_ctr();
        let mut ctx = CipherCtx::new()?;
        ctx.encrypt_init(Some(t), Some(&key[..]), None)?;
        Ok(Encrypter { ctx })
    }

    fn encrypt(&mut self, iv: &RtpIv, input: &[u8], output: &mut [u8]) -> Result<(), ErrorStack> {
        self.ctx.encrypt_init(None, None, Some(iv))?;
        let count = self.ctx.cipher_update(input, Some(output))?;
        self.ctx.cipher_final(&mut output[count..])?;
        Ok(())
    }
}

struct Decrypter {
    ctx: CipherCtx,
}

impl Decrypter {
    fn new(key: &[u8; MASTER_KEY_LEN]) -> Result<Self, CryptoError> {
        let t = cipher::Cipher::aes_128_ctr();
        let mut ctx = CipherCtx::new()?;
        ctx.decrypt_init(Some(t), Some(&key[..]), None)?;
        Ok(Decrypter { ctx })
    }

    fn decrypt(&mut self, iv: &RtpIv, input: &[u8], output: &mut [u8]) -> Result<(), ErrorStack> {
        self.ctx.decrypt_init(None, None, Some(iv))?;
        let count = self.ctx.cipher_update(input, Some(output))?;
        self.ctx.cipher_final(&mut output[count..])?;
        Ok(())
    }
}

/// An AEAD record cipher bound to one direction's write key.
///
/// Backs the DTLS record layer for the negotiated
/// [`EncryptionAlgorithm`]. Like the SRTP contexts, the underlying
/// OpenSSL context is keyed once and re-IV:ed per record.
pub struct AeadCipher {
    ctx: CipherCtx,
    send: bool,
}

impl AeadCipher {
    /// Key a context for one direction.
    pub fn new(
        algorithm: EncryptionAlgorithm,
        key: &[u8],
        send: bool,
    ) -> Result<Self, CryptoError> {
        let t = match algorithm {
            EncryptionAlgorithm::Aes128Gcm => cipher::Cipher::aes_128_gcm(),
            EncryptionAlgorithm::Aes256Gcm => cipher::Cipher::aes_256_gcm(),
            EncryptionAlgorithm::ChaCha20Poly1305 => cipher::Cipher::chacha20_poly1305(),
        };

        let mut ctx = CipherCtx::new()?;
        if send {
            ctx.encrypt_init(Some(t), Some(key), None)?;
        } else {
            ctx.decrypt_init(Some(t), Some(key), None)?;
        }

        Ok(AeadCipher { ctx, send })
    }

    /// Seal one record. `output` must hold `input.len() + 16` bytes; the
    /// tag lands after the ciphertext. Returns the sealed length.
    pub fn encrypt(
        &mut self,
        iv: &[u8],
        aad: &[u8],
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, CryptoError> {
        assert!(self.send, "encrypt on a receive cipher");

        self.ctx.encrypt_init(None, None, Some(iv))?;
        self.ctx.cipher_update(aad, None)?;
        let count = self.ctx.cipher_update(input, Some(output))?;
        let rest = self.ctx.cipher_final(&mut output[count..])?;

        let total = count + rest;
        self.ctx.tag(&mut output[total..(total + AEAD_TAG_LEN)])?;

        Ok(total + AEAD_TAG_LEN)
    }

    /// Open one record. `input` includes the trailing tag. Returns the
    /// plaintext length, or `None` when authentication fails.
    pub fn decrypt(
        &mut self,
        iv: &[u8],
        aad: &[u8],
        input: &[u8],
        output: &mut [u8],
    ) -> Option<usize> {
        assert!(!self.send, "decrypt on a send cipher");

        if input.len() < AEAD_TAG_LEN {
            return None;
        }
        let (body, tag) = input.split_at(input.len() - AEAD_TAG_LEN);

        self.ctx.decrypt_init(None, None, Some(iv)).ok()?;
        self.ctx.set_tag(tag).ok()?;
        self.ctx.cipher_update(aad, None).ok()?;
        let count = self.ctx.cipher_update(body, Some(output)).ok()?;
        // Fails on tag mismatch.
        let rest = self.ctx.cipher_final(&mut output[count..]).ok()?;

        Some(count + rest)
    }
}

impl fmt::Debug for PacketKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketKeys")
    }
}

impl fmt::Debug for Encrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encrypter").finish()
    }
}

impl fmt::Debug for Decrypter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decrypter").finish()
    }
}

impl fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadCipher").field("send", &self.send).finish()
    }
}
