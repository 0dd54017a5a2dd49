//! Trust anchors and the webpki-backed [`TrustStore`] implementation.

use std::time::SystemTime;

use tls_engine::Certificate;
use tracing::debug;

use crate::verify::{CertificateError, KeyExchangeAlgorithm, TrustStore};

/// A trust anchor, commonly known as a "Root Certificate."
#[derive(Debug, Clone)]
pub struct OwnedTrustAnchor {
    subject: Vec<u8>,
    spki: Vec<u8>,
    name_constraints: Option<Vec<u8>>,
}

impl OwnedTrustAnchor {
    /// Get a `webpki::TrustAnchor` by borrowing the owned elements.
    fn to_trust_anchor(&self) -> webpki::TrustAnchor {
        webpki::TrustAnchor {
            subject: &self.subject,
            spki: &self.spki,
            name_constraints: self.name_constraints.as_deref(),
        }
    }

    /// Constructs an `OwnedTrustAnchor` from its components.
    ///
    /// `subject` is the subject field of the trust anchor.
    ///
    /// `spki` is the `subjectPublicKeyInfo` field of the trust anchor.
    ///
    /// `name_constraints` is the value of a DER-encoded name constraints to
    /// apply for this trust anchor, if any.
    pub fn from_subject_spki_name_constraints(
        subject: impl Into<Vec<u8>>,
        spki: impl Into<Vec<u8>>,
        name_constraints: Option<impl Into<Vec<u8>>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            spki: spki.into(),
            name_constraints: name_constraints.map(|x| x.into()),
        }
    }
}

/// Errors that can occur during operations with [`RootCertStore`].
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum RootCertStoreError {
    #[error(transparent)]
    WebpkiError(#[from] webpki::Error),
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    #[error("Unexpected PEM certificate count. Expected 1 certificate, got {0}")]
    PemCertUnexpectedCount(usize),
}

/// A container for root certificates able to provide a root-of-trust
/// for connection authentication.
#[derive(Debug, Clone)]
pub struct RootCertStore {
    /// The list of roots.
    pub roots: Vec<OwnedTrustAnchor>,
}

impl RootCertStore {
    /// Make a new, empty `RootCertStore`.
    pub fn empty() -> Self {
        Self { roots: Vec::new() }
    }

    /// Return true if there are no certificates.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Say how many certificates are in the container.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Add a single DER-encoded certificate to the store.
    pub fn add(&mut self, der: &Certificate) -> Result<(), RootCertStoreError> {
        let ta = webpki::TrustAnchor::try_from_cert_der(&der.0)?;
        let ota = OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        );
        self.roots.push(ota);
        Ok(())
    }

    /// Adds a single PEM-encoded certificate to the store.
    pub fn add_pem(&mut self, pem: &str) -> Result<(), RootCertStoreError> {
        let mut certificates = rustls_pemfile::certs(&mut pem.as_bytes())?;

        if certificates.len() != 1 {
            return Err(RootCertStoreError::PemCertUnexpectedCount(
                certificates.len(),
            ));
        }

        self.add(&Certificate(certificates.remove(0)))?;

        Ok(())
    }

    /// Parse the given DER-encoded certificates and add all that can be
    /// parsed in a best-effort fashion.
    ///
    /// This is because large collections of root certificates often
    /// include ancient or syntactically invalid certificates.
    ///
    /// Returns the number of certificates added, and the number that were
    /// ignored.
    pub fn add_parsable_certificates(&mut self, der_certs: &[Vec<u8>]) -> (usize, usize) {
        let mut valid_count = 0;
        let mut invalid_count = 0;

        for der_cert in der_certs {
            match self.add(&Certificate(der_cert.clone())) {
                Ok(_) => valid_count += 1,
                Err(_err) => invalid_count += 1,
            }
        }

        (valid_count, invalid_count)
    }

    fn check_chain(
        &self,
        chain: &[Certificate],
        client_cert: bool,
    ) -> Result<(), CertificateError> {
        let end_entity = chain
            .first()
            .ok_or_else(|| CertificateError("empty certificate chain".into()))?;
        let cert = webpki::EndEntityCert::try_from(end_entity.0.as_slice())
            .map_err(|e| CertificateError(format!("invalid peer certificate: {:?}", e)))?;

        let intermediates: Vec<&[u8]> = chain[1..].iter().map(|c| c.0.as_slice()).collect();
        let anchors: Vec<webpki::TrustAnchor> = self
            .roots
            .iter()
            .map(OwnedTrustAnchor::to_trust_anchor)
            .collect();
        let now = webpki::Time::try_from(SystemTime::now())
            .map_err(|_| CertificateError("failed to get current time".into()))?;

        let verified = if client_cert {
            cert.verify_is_valid_tls_client_cert(
                SUPPORTED_SIG_ALGS,
                &webpki::TlsClientTrustAnchors(&anchors),
                &intermediates,
                now,
            )
        } else {
            cert.verify_is_valid_tls_server_cert(
                SUPPORTED_SIG_ALGS,
                &webpki::TlsServerTrustAnchors(&anchors),
                &intermediates,
                now,
            )
        };
        verified.map_err(|e| CertificateError(format!("certificate not trusted: {:?}", e)))
    }
}

impl TrustStore for RootCertStore {
    fn check_client_trusted(
        &self,
        chain: &[Certificate],
        algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        // webpki derives acceptable algorithms from the chain itself.
        debug!(%algorithm, chain_len = chain.len(), "validating client chain");
        self.check_chain(chain, true)
    }

    fn check_server_trusted(
        &self,
        chain: &[Certificate],
        algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        debug!(%algorithm, chain_len = chain.len(), "validating server chain");
        self.check_chain(chain, false)
    }
}

static SUPPORTED_SIG_ALGS: &[&webpki::SignatureAlgorithm] = &[
    &webpki::ECDSA_P256_SHA256,
    &webpki::ECDSA_P256_SHA384,
    &webpki::ECDSA_P384_SHA256,
    &webpki::ECDSA_P384_SHA384,
    &webpki::ED25519,
    &webpki::RSA_PKCS1_2048_8192_SHA256,
    &webpki::RSA_PKCS1_2048_8192_SHA384,
    &webpki::RSA_PKCS1_2048_8192_SHA512,
    &webpki::RSA_PKCS1_3072_8192_SHA384,
];
