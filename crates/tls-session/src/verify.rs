//! Peer-authorization policy applied when a handshake completes.
//!
//! The engine finishes a handshake whether or not the peer should be
//! trusted; this module holds the checks the engine does not enforce. The
//! outcome is recorded as data on the connection, never raised, so the layer
//! above decides what an untrusted peer means.

use std::fmt;

use tls_engine::{Certificate, PeerCertificates, Role, SessionInfo};
use tracing::debug;

use crate::error::Error;

/// A failed certificate-chain check, reported as data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CertificateError(pub String);

/// Validates peer certificate chains against a set of trusted roots.
pub trait TrustStore: Send + Sync {
    /// Checks a chain presented by a client (run by the server role).
    fn check_client_trusted(
        &self,
        chain: &[Certificate],
        algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError>;

    /// Checks a chain presented by a server (run by the client role).
    fn check_server_trusted(
        &self,
        chain: &[Certificate],
        algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError>;
}

/// Key-exchange family of the negotiated cipher suite.
///
/// There is no simple rule for choosing the trust-check algorithm, but the
/// suite-name prefix covers the known cases. Picking the wrong family can
/// fail validation because a checker may demand certificate attributes the
/// chain does not carry.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeAlgorithm {
    EcdheEcdsa,
    EcdheRsa,
    EcdhEcdsa,
    DheDss,
    DheRsa,
    EcdhRsa,
    RsaExport,
    Rsa,
    Unknown,
}

impl KeyExchangeAlgorithm {
    /// Maps a cipher-suite name to its key-exchange family. First matching
    /// prefix wins.
    pub fn from_suite(suite: &str) -> Self {
        let table: &[(&str, Self)] = &[
            ("TLS_ECDHE_ECDSA", Self::EcdheEcdsa),
            ("TLS_ECDHE_RSA", Self::EcdheRsa),
            ("TLS_ECDH_ECDSA", Self::EcdhEcdsa),
            ("TLS_DHE_DSS", Self::DheDss),
            ("TLS_DHE_RSA", Self::DheRsa),
            ("TLS_ECDH_RSA", Self::EcdhRsa),
            ("SSL_RSA_EXPORT", Self::RsaExport),
            ("TLS_RSA", Self::Rsa),
            ("SSL_RSA", Self::Rsa),
        ];
        table
            .iter()
            .find(|(prefix, _)| suite.starts_with(prefix))
            .map_or(Self::Unknown, |&(_, algorithm)| algorithm)
    }
}

impl fmt::Display for KeyExchangeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::EcdheEcdsa => "ECDHE_ECDSA",
            Self::EcdheRsa => "ECDHE_RSA",
            Self::EcdhEcdsa => "ECDH_ECDSA",
            Self::DheDss => "DHE_DSS",
            Self::DheRsa => "DHE_RSA",
            Self::EcdhRsa => "ECDH_RSA",
            Self::RsaExport => "RSA_EXPORT",
            Self::Rsa => "RSA",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Applies the peer-authorization policy for a completed handshake.
///
/// An unverified peer or a missing chain only counts against a client, or
/// against a server that requested a certificate; an anonymous client talking
/// to a server that never asked is acceptable.
pub(crate) fn check_peer(
    role: Role,
    request_cert: bool,
    trust_store: Option<&dyn TrustStore>,
    session: &SessionInfo,
) -> Result<(), Error> {
    let identity_required = role == Role::Client || request_cert;

    let chain = match &session.peer_certificates {
        PeerCertificates::Unverified => {
            debug!("peer is unverified");
            if identity_required {
                return Err(Error::PeerUnverified);
            }
            return Ok(());
        }
        PeerCertificates::Absent => {
            debug!("peer presented no certificates");
            if identity_required {
                return Err(Error::NoPeerCertificates);
            }
            return Ok(());
        }
        PeerCertificates::Chain(chain) => chain,
    };

    let trust_store = trust_store.ok_or(Error::NoTrustedCas)?;

    let algorithm = KeyExchangeAlgorithm::from_suite(&session.cipher_suite);
    debug!(
        protocol = %session.protocol,
        suite = %session.cipher_suite,
        %algorithm,
        "checking peer trust"
    );
    let checked = match role {
        Role::Server => trust_store.check_client_trusted(chain, algorithm),
        Role::Client => trust_store.check_server_trusted(chain, algorithm),
    };
    checked.map_err(Error::from)
}
