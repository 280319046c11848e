//! Per-peer connection state and the crypto call surface.
//!
//! A [`PeerSession`] owns the protection contexts of one remote peer.
//! Methods take `&mut self`: the caller's per-peer processing lane is the
//! serialization point, there is no locking in here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cert::CertificateSet;
use crate::error::CryptoError;
use crate::keying::{HandshakeRandoms, SessionKeys};
use crate::srtp::ProtectionContext;
use crate::suite::CipherSuite;

/// A session with no traffic for this long is closed by
/// [`PeerSession::handle_timeout`].
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of one peer session.
///
/// Transitions move strictly forward. Crypto operations are only legal
/// in `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// DTLS handshake in progress, no keys yet.
    Handshaking,
    /// Keys installed, waiting for the handshake driver to finish.
    KeysDerived,
    /// Media flowing.
    Active,
    /// Keys dropped. Terminal.
    Closed,
}

/// Minimal RTP header view, enough to locate the encrypted portion.
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    /// Total header length including CSRC list and extension.
    pub header_len: usize,
    /// Synchronization source.
    pub ssrc: u32,
    /// 16 bit sequence number.
    pub sequence_number: u16,
    /// P bit. Decides pad truncation after decryption.
    pub has_padding: bool,
}

impl RtpHeader {
    /// Parse the fixed header, CSRC list and extension length.
    ///
    /// `None` for anything that is not a plausible RTP v2 packet.
    pub fn parse(buf: &[u8]) -> Option<RtpHeader> {
        if buf.len() < 12 {
            return None;
        }

        let b0 = buf[0];
        if b0 >> 6 != 2 {
            return None;
        }

        let has_padding = b0 & 0x20 != 0;
        let has_extension = b0 & 0x10 != 0;
        let csrc_count = (b0 & 0x0f) as usize;

        let mut header_len = 12 + csrc_count * 4;
        if buf.len() < header_len {
            return None;
        }

        let sequence_number = u16::from_be_bytes([buf[2], buf[3]]);
        let ssrc = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        if has_extension {
            if buf.len() < header_len + 4 {
                return None;
            }
            let words = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
            header_len += 4 + words * 4;
            if buf.len() < header_len {
                return None;
            }
        }

        Some(RtpHeader {
            header_len,
            ssrc,
            sequence_number,
            has_padding,
        })
    }
}

/// "extend" a 16 bit sequence number into a 64 bit by
/// using the knowledge of the previous such sequence number.
pub fn extend_seq(prev_ext_seq: Option<u64>, seq: u16) -> u64 {
    // We define the index of the SRTP packet corresponding to a given
    // ROC and RTP sequence number to be the 48-bit quantity
    //       i = 2^16 * ROC + SEQ.
    //
    // https://tools.ietf.org/html/rfc3711#appendix-A
    let seq = seq as u64;

    let Some(prev_index) = prev_ext_seq else {
        // No wrap-around so far.
        return seq;
    };

    let roc = prev_index >> 16; // how many wrap-arounds.
    let prev_seq = prev_index & 0xffff;

    let v = if prev_seq < 32_768 {
        if seq > 32_768 + prev_seq {
            // Can't step below the first rollover.
            roc.saturating_sub(1)
        } else {
            roc
        }
    } else if prev_seq > seq + 32_768 {
        (roc + 1) & 0xffff_ffff
    } else {
        roc
    };

    v * 65_536 + seq
}

/// Rollover tracking for one SSRC.
#[derive(Debug)]
struct SsrcState {
    ssrc: u32,
    ext_seq: u64,
}

/// Rollover state for one direction. A handful of SSRCs per peer, so a
/// linear scan beats a map.
#[derive(Debug, Default)]
struct SsrcTable {
    entries: Vec<SsrcState>,
}

impl SsrcTable {
    fn extended(&self, ssrc: u32, seq: u16) -> u64 {
        let prev = self
            .entries
            .iter()
            .find(|s| s.ssrc == ssrc)
            .map(|s| s.ext_seq);
        extend_seq(prev, seq)
    }

    fn commit(&mut self, ssrc: u32, ext_seq: u64) {
        match self.entries.iter_mut().find(|s| s.ssrc == ssrc) {
            Some(s) => s.ext_seq = ext_seq,
            None => self.entries.push(SsrcState { ssrc, ext_seq }),
        }
    }
}

/// The secure transport state of one remote peer.
///
/// Created when a handshake starts, with the certificate snapshot and
/// negotiated suite fixed for its whole lifetime. The (external)
/// handshake driver feeds in the master secret via
/// [`PeerSession::install_keys`] and flips it live with
/// [`PeerSession::handshake_complete`].
#[derive(Debug)]
pub struct PeerSession {
    state: SessionState,
    suite: Arc<CipherSuite>,
    certificates: Arc<CertificateSet>,
    /// Protects what we send.
    tx: Option<ProtectionContext>,
    /// Verifies what we receive.
    rx: Option<ProtectionContext>,
    tx_ssrc: SsrcTable,
    rx_ssrc: SsrcTable,
    auth_fail_count: u64,
    last_activity: Instant,
}

impl PeerSession {
    /// Start a session in `Handshaking`.
    ///
    /// `certificates` is the authority snapshot taken at handshake start;
    /// holding it here keeps the whole handshake on one certificate set
    /// across a concurrent rotation.
    pub fn new(
        suite: Arc<CipherSuite>,
        certificates: Arc<CertificateSet>,
        now: Instant,
    ) -> PeerSession {
        PeerSession {
            state: SessionState::Handshaking,
            suite,
            certificates,
            tx: None,
            rx: None,
            tx_ssrc: SsrcTable::default(),
            rx_ssrc: SsrcTable::default(),
            auth_fail_count: 0,
            last_activity: now,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The negotiated cipher suite.
    pub fn suite(&self) -> &Arc<CipherSuite> {
        &self.suite
    }

    /// The certificate set this session's handshake is pinned to.
    pub fn certificates(&self) -> &Arc<CertificateSet> {
        &self.certificates
    }

    /// Inbound packets dropped for failing authentication.
    pub fn auth_fail_count(&self) -> u64 {
        self.auth_fail_count
    }

    /// Derive and install the session keys.
    ///
    /// `active` is true when we were the DTLS client. Exactly-once: a
    /// second call is a no-op, the first keys stay.
    pub fn install_keys(
        &mut self,
        master_secret: &[u8; 32],
        randoms: &HandshakeRandoms,
        active: bool,
    ) -> Result<(), CryptoError> {
        if self.state == SessionState::Closed {
            return Err(CryptoError::SessionNotActive);
        }

        if self.tx.is_some() {
            debug!("install_keys called twice, keeping first keys");
            return Ok(());
        }

        let keys = SessionKeys::derive(self.suite.hash, master_secret, randoms, active);

        self.tx = Some(ProtectionContext::new(&keys.rtp_tx, &keys.rtcp_tx)?);
        self.rx = Some(ProtectionContext::new(&keys.rtp_rx, &keys.rtcp_rx)?);
        // keys drops here and wipes itself.

        self.state = SessionState::KeysDerived;

        Ok(())
    }

    /// The handshake driver saw the final flight. Media may flow.
    pub fn handshake_complete(&mut self, now: Instant) -> Result<(), CryptoError> {
        match self.state {
            SessionState::KeysDerived => {
                debug!("Session active with {}", self.suite);
                self.state = SessionState::Active;
                self.last_activity = now;
                Ok(())
            }
            SessionState::Active => Ok(()),
            _ => Err(CryptoError::SessionNotActive),
        }
    }

    /// Protect one outbound RTP packet.
    pub fn protect_rtp(&mut self, buf: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        if self.state != SessionState::Active {
            return Err(CryptoError::SessionNotActive);
        }

        let header = RtpHeader::parse(buf).ok_or(CryptoError::Packet("malformed rtp header"))?;

        let ext_seq = self.tx_ssrc.extended(header.ssrc, header.sequence_number);

        let tx = self.tx.as_mut().ok_or(CryptoError::SessionNotActive)?;
        let protected = tx.protect_rtp(buf, header.header_len, header.ssrc, ext_seq)?;

        // Same discipline as the receive path: rollover state moves only
        // once the packet actually made it through the engine.
        self.tx_ssrc.commit(header.ssrc, ext_seq);

        self.last_activity = now;
        Ok(protected)
    }

    /// Verify and decrypt one inbound SRTP packet.
    ///
    /// Returns the payload, or `None` for anything that does not verify:
    /// bad tag, malformed header, wrong state. The SSRC rollover state is
    /// committed only after the tag verifies, so a spoofed sequence
    /// number cannot desync the extended index.
    pub fn unprotect_rtp(&mut self, buf: &[u8], now: Instant) -> Option<Vec<u8>> {
        if self.state != SessionState::Active {
            return None;
        }

        let Some(header) = RtpHeader::parse(buf) else {
            trace!("inbound rtp failed header parse");
            return None;
        };

        let ext_seq = self.rx_ssrc.extended(header.ssrc, header.sequence_number);

        let rx = self.rx.as_mut()?;
        let payload = rx.unprotect_rtp(
            buf,
            header.header_len,
            header.ssrc,
            ext_seq,
            header.has_padding,
        );

        let Some(payload) = payload else {
            self.auth_fail_count += 1;
            return None;
        };

        self.rx_ssrc.commit(header.ssrc, ext_seq);
        self.last_activity = now;
        Some(payload)
    }

    /// Protect one outbound RTCP compound packet.
    pub fn protect_rtcp(&mut self, buf: &[u8], now: Instant) -> Result<Vec<u8>, CryptoError> {
        if self.state != SessionState::Active {
            return Err(CryptoError::SessionNotActive);
        }
        if buf.len() < 8 {
            return Err(CryptoError::Packet("rtcp packet shorter than header"));
        }

        let tx = self.tx.as_mut().ok_or(CryptoError::SessionNotActive)?;
        let protected = tx.protect_rtcp(buf)?;

        self.last_activity = now;
        Ok(protected)
    }

    /// Verify and decrypt one inbound SRTCP packet.
    pub fn unprotect_rtcp(&mut self, buf: &[u8], now: Instant) -> Option<Vec<u8>> {
        if self.state != SessionState::Active {
            return None;
        }

        let rx = self.rx.as_mut()?;
        let Some(payload) = rx.unprotect_rtcp(buf) else {
            self.auth_fail_count += 1;
            return None;
        };

        self.last_activity = now;
        Some(payload)
    }

    /// Close the session when idle beyond [`IDLE_TIMEOUT`].
    pub fn handle_timeout(&mut self, now: Instant) {
        let live = matches!(
            self.state,
            SessionState::KeysDerived | SessionState::Active
        );
        if live && now.duration_since(self.last_activity) >= IDLE_TIMEOUT {
            debug!("Session idle, closing");
            self.close();
        }
    }

    /// Drop the key material and refuse all further crypto calls.
    pub fn close(&mut self) {
        // ProtectionContext wipes its keys on drop.
        self.tx = None;
        self.rx = None;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cert::CertificateAuthority;
    use crate::curve::CurveCatalog;
    use crate::suite::CipherCatalog;
    use std::time::SystemTime;

    fn randoms() -> HandshakeRandoms {
        HandshakeRandoms {
            client: [1; 32],
            server: [2; 32],
        }
    }

    fn session_pair() -> (PeerSession, PeerSession) {
        let authority = CertificateAuthority::new();
        let certs = authority.get_certificate_set(SystemTime::now()).unwrap();

        let p256 = CurveCatalog::by_group(23).unwrap();
        let suite = CipherCatalog::by_id(0xC02B)
            .unwrap()
            .specialize_for_curve(p256);

        let now = Instant::now();
        let mut a = PeerSession::new(Arc::clone(&suite), Arc::clone(&certs), now);
        let mut b = PeerSession::new(suite, certs, now);

        let master = [42u8; 32];
        a.install_keys(&master, &randoms(), true).unwrap();
        b.install_keys(&master, &randoms(), false).unwrap();
        a.handshake_complete(now).unwrap();
        b.handshake_complete(now).unwrap();

        (a, b)
    }

    fn rtp_packet(ssrc: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![
            0x80, 0x60, 0, 0, // V=2, PT 96
            0, 0, 0x10, 0x00, // timestamp
            0, 0, 0, 0, // ssrc
        ];
        buf[2..4].copy_from_slice(&seq.to_be_bytes());
        buf[8..12].copy_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn extend_seq_no_previous() {
        assert_eq!(extend_seq(None, 0), 0);
        assert_eq!(extend_seq(None, 100), 100);
    }

    #[test]
    fn extend_seq_rollover_up() {
        let prev = Some(65_535);
        assert_eq!(extend_seq(prev, 0), 65_536);
        assert_eq!(extend_seq(prev, 1), 65_537);
    }

    #[test]
    fn extend_seq_reorder_within_window() {
        let prev = Some(3 * 65_536 + 10);
        // Late packet from before the last rollover.
        assert_eq!(extend_seq(prev, 65_530), 2 * 65_536 + 65_530);
        // In-order packet.
        assert_eq!(extend_seq(prev, 11), 3 * 65_536 + 11);
    }

    #[test]
    fn extend_seq_no_underflow_at_roc_zero() {
        // A late-looking seq before any rollover stays in epoch 0.
        assert_eq!(extend_seq(Some(10), 65_530), 65_530);
    }

    #[test]
    fn rtp_header_parse() {
        let buf = rtp_packet(0xCAFE, 7, b"xyz");
        let h = RtpHeader::parse(&buf).unwrap();
        assert_eq!(h.header_len, 12);
        assert_eq!(h.ssrc, 0xCAFE);
        assert_eq!(h.sequence_number, 7);
        assert!(!h.has_padding);

        // Version 1 is rejected.
        let mut bad = buf.clone();
        bad[0] = 0x40;
        assert!(RtpHeader::parse(&bad).is_none());

        // Truncated CSRC list is rejected.
        let mut csrc = buf;
        csrc[0] = 0x8F; // 15 CSRCs claimed
        assert!(RtpHeader::parse(&csrc).is_none());
    }

    #[test]
    fn rtp_flows_between_peers() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        let packet = rtp_packet(0x1234, 1, b"hello media");
        let protected = a.protect_rtp(&packet, now).unwrap();
        let payload = b.unprotect_rtp(&protected, now).unwrap();
        assert_eq!(&payload[..], b"hello media");

        // And the other direction, with its own keys.
        let packet = rtp_packet(0x5678, 1, b"reverse");
        let protected = b.protect_rtp(&packet, now).unwrap();
        assert_eq!(&a.unprotect_rtp(&protected, now).unwrap()[..], b"reverse");
    }

    #[test]
    fn rtcp_flows_between_peers() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        // Minimal receiver report, SSRC 0xABCD.
        let mut rtcp = vec![0x80, 0xC9, 0x00, 0x01];
        rtcp.extend_from_slice(&0xABCD_u32.to_be_bytes());

        let protected = a.protect_rtcp(&rtcp, now).unwrap();
        let plain = b.unprotect_rtcp(&protected, now).unwrap();
        assert_eq!(plain, rtcp);
    }

    #[test]
    fn direction_isolation() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        let packet = rtp_packet(0x1234, 1, b"one way");
        let protected = a.protect_rtp(&packet, now).unwrap();

        // A's own receive side must not accept its send output.
        assert!(a.unprotect_rtp(&protected, now).is_none());
        assert_eq!(a.auth_fail_count(), 1);

        // B does.
        assert!(b.unprotect_rtp(&protected, now).is_some());
    }

    #[test]
    fn tamper_does_not_commit_rollover_state() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        let protected = a
            .protect_rtp(&rtp_packet(0x77, 100, b"payload"), now)
            .unwrap();

        // Spoof a far-future sequence number. The tag no longer matches.
        let mut spoofed = protected.clone();
        spoofed[2..4].copy_from_slice(&50_000u16.to_be_bytes());
        assert!(b.unprotect_rtp(&spoofed, now).is_none());
        assert_eq!(b.auth_fail_count(), 1);

        // The genuine packet still verifies: no state was committed.
        assert!(b.unprotect_rtp(&protected, now).is_some());
    }

    #[test]
    fn failed_protect_does_not_advance_rollover() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        // Sit right before the rollover boundary on SSRC 1.
        let protected = a.protect_rtp(&rtp_packet(1, 65_535, b"edge"), now).unwrap();
        assert!(b.unprotect_rtp(&protected, now).is_some());

        // A malformed packet errors out before anything is encrypted. The
        // send-side extended index must not move on a failed call.
        assert!(a.protect_rtp(&[0u8; 4], now).is_err());

        // Wrapping into the next epoch still lines up with the receiver.
        let protected = a.protect_rtp(&rtp_packet(1, 0, b"wrapped"), now).unwrap();
        assert_eq!(&b.unprotect_rtp(&protected, now).unwrap()[..], b"wrapped");
    }

    #[test]
    fn padding_bit_with_empty_payload_is_dropped() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        // P bit set on a header-only packet: after decryption there is no
        // pad count byte, so the receiver must refuse it rather than read
        // one. The sender happily protects it.
        let mut packet = rtp_packet(0x99, 1, b"");
        packet[0] |= 0x20;
        let protected = a.protect_rtp(&packet, now).unwrap();

        assert!(b.unprotect_rtp(&protected, now).is_none());
        assert_eq!(b.auth_fail_count(), 1);
    }

    #[test]
    fn install_keys_is_idempotent() {
        let (mut a, mut b) = session_pair();
        let now = Instant::now();

        let protected = a.protect_rtp(&rtp_packet(1, 1, b"pre"), now).unwrap();

        // A second install with a different master must not replace keys.
        b.install_keys(&[0u8; 32], &randoms(), false).unwrap();
        assert!(b.unprotect_rtp(&protected, now).is_some());
    }

    #[test]
    fn crypto_requires_active_state() {
        let authority = CertificateAuthority::new();
        let certs = authority.get_certificate_set(SystemTime::now()).unwrap();
        let p256 = CurveCatalog::by_group(23).unwrap();
        let suite = CipherCatalog::by_id(0xC02B)
            .unwrap()
            .specialize_for_curve(p256);

        let now = Instant::now();
        let mut s = PeerSession::new(suite, certs, now);

        let packet = rtp_packet(1, 1, b"early");
        assert!(matches!(
            s.protect_rtp(&packet, now),
            Err(CryptoError::SessionNotActive)
        ));

        // Completing the handshake without keys is refused.
        assert!(s.handshake_complete(now).is_err());

        s.install_keys(&[1u8; 32], &randoms(), true).unwrap();
        assert_eq!(s.state(), SessionState::KeysDerived);
        assert!(s.protect_rtp(&packet, now).is_err());

        s.handshake_complete(now).unwrap();
        assert!(s.protect_rtp(&packet, now).is_ok());
    }

    #[test]
    fn idle_timeout_closes() {
        let (mut a, _b) = session_pair();
        let now = Instant::now();

        a.handle_timeout(now + Duration::from_secs(9));
        assert_eq!(a.state(), SessionState::Active);

        a.handle_timeout(now + Duration::from_secs(11));
        assert_eq!(a.state(), SessionState::Closed);

        // Closed fails closed on both paths.
        let packet = rtp_packet(1, 1, b"late");
        assert!(a.protect_rtp(&packet, now).is_err());
        assert!(a.unprotect_rtp(&packet, now).is_none());
    }

    #[test]
    fn activity_defers_idle_timeout() {
        let (mut a, mut b) = session_pair();
        let t0 = Instant::now();

        let t1 = t0 + Duration::from_secs(8);
        let protected = a.protect_rtp(&rtp_packet(1, 1, b"keepalive"), t1).unwrap();
        b.unprotect_rtp(&protected, t1);

        a.handle_timeout(t0 + Duration::from_secs(15));
        assert_eq!(a.state(), SessionState::Active);
    }
}
