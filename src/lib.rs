//! Secure media transport core for a WebRTC-style media relay.
//!
//! This crate holds the DTLS-SRTP security layer of a media relay: the
//! cipher suite and curve catalogs, self-signed certificate generation
//! with rotation, the ephemeral key exchanges, session key derivation
//! down from a handshake master secret, and the per-packet SRTP/SRTCP
//! protection itself.
//!
//! It is a [Sans I/O][sansio] library. No sockets, no threads, no timers:
//! the caller drives everything and passes `now` into the calls that
//! need time. The DTLS handshake state machine itself (message framing,
//! flights, retransmission) lives outside this crate; a handshake driver
//! uses [`CertificateAuthority`], [`CipherCatalog`] and [`KeyExchange`]
//! to negotiate, then hands the master secret to a [`PeerSession`] which
//! takes over the media path.
//!
//! ```no_run
//! use std::time::{Instant, SystemTime};
//! use securtp::{CertificateAuthority, CipherCatalog, CurveCatalog, PeerSession};
//!
//! let authority = CertificateAuthority::new();
//! let certs = authority.get_certificate_set(SystemTime::now()).unwrap();
//!
//! // Negotiation picked suite 0xC02B over P-256.
//! let curve = CurveCatalog::by_group(23).unwrap();
//! let suite = CipherCatalog::by_id(0xC02B).unwrap().specialize_for_curve(curve);
//!
//! let mut session = PeerSession::new(suite, certs, Instant::now());
//!
//! // ... handshake driver runs, produces master secret and randoms ...
//! # let (master, randoms) = todo!();
//! session.install_keys(&master, &randoms, true).unwrap();
//! session.handshake_complete(Instant::now()).unwrap();
//!
//! // Media path.
//! # let packet: Vec<u8> = vec![];
//! let protected = session.protect_rtp(&packet, Instant::now()).unwrap();
//! ```
//!
//! [sansio]: https://sans-io.readthedocs.io/

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::manual_range_contains)]
#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod error;
pub use error::CryptoError;

mod curve;
pub use curve::{CurveCatalog, CurveInfo};

mod suite;
pub use suite::{
    CipherCatalog, CipherSuite, EncryptionAlgorithm, HashAlgorithm, KeyExchangeAlgorithm,
    SignatureAlgorithm,
};

mod cert;
pub use cert::{Certificate, CertificateAuthority, CertificateSet, Fingerprint};

mod exchange;
pub use exchange::{KeyExchange, SharedSecret};

mod keying;
pub use keying::{
    extract_srtp_keying, tls_prf, HandshakeRandoms, KeyingMaterial, RecordKeys, SessionKeys,
    SrtpKey, SrtpKeyMaterial,
};

mod srtp;
pub use srtp::{
    AeadCipher, ProtectionContext, HMAC_KEY_LEN, MASTER_KEY_LEN, MASTER_SALT_LEN, SRTCP_OVERHEAD,
    SRTP_OVERHEAD, TAG_LEN,
};

mod session;
pub use session::{extend_seq, PeerSession, RtpHeader, SessionState, IDLE_TIMEOUT};

mod send_queue;
pub use send_queue::{DatagramSend, SendQueue};
