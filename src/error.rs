use std::io;

use thiserror::Error;

/// Errors that can arise in the secure transport layer.
///
/// Per-packet authentication failures are deliberately not represented
/// here. A bad tag makes the packet silently dropped (the operation
/// returns `None` and a counter is incremented), so a peer can never use
/// error responses as a verification oracle.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No mutually acceptable cipher suite, curve or key exchange state.
    /// Fatal to the handshake, not to the process.
    #[error("negotiation failed: {0}")]
    Negotiation(&'static str),

    /// The peer sent a malformed or invalid public key. Fatal to the
    /// handshake. Never silently substituted with a fallback value.
    #[error("key agreement failed: {0}")]
    KeyAgreement(&'static str),

    /// Certificate generation failed. Rare and transient, retried on the
    /// next accessor call.
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(openssl::error::ErrorStack),

    /// A crypto call was made against a session that is not active
    /// (still handshaking, or already closed with its keys dropped).
    #[error("session is not active")]
    SessionNotActive,

    /// A packet handed to the send path is not well formed. Only the
    /// outbound side reports this; inbound parse failures are drops.
    #[error("bad packet: {0}")]
    Packet(&'static str),

    /// Some error from the OpenSSL layer.
    #[error("{0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    /// Other IO errors.
    #[error("{0}")]
    Io(#[from] io::Error),
}
