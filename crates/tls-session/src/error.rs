use tls_engine::EngineError;

use crate::verify::CertificateError;

/// Errors surfaced by the session adapter.
///
/// TLS-level failures never escape as `Err` from public operations; they are
/// recorded in the connection's error slots and delivered through callbacks.
/// The `Err` returns of public operations are reserved for host-integration
/// failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// The engine rejected or failed a record transform.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The peer's identity could not be established.
    #[error("peer not verified")]
    PeerUnverified,

    /// The peer presented an empty certificate chain.
    #[error("Peer has no certificates")]
    NoPeerCertificates,

    /// Peer verification ran without a trust store.
    #[error("No trusted CAs")]
    NoTrustedCas,

    /// The trust store rejected the peer's chain.
    #[error("certificate check failed: {0}")]
    Certificate(#[from] CertificateError),

    /// An operation ran before `init` created the engine.
    #[error("connection is not initialized")]
    NotInitialized,

    /// The runtime dropped the delegated-task resume message.
    #[error("runtime shut down during delegated tasks")]
    RuntimeShutdown,
}
