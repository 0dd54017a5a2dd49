//! This library provides the [Engine] trait to encapsulate the TLS record
//! primitive driven by the session adapter.
//!
//! An engine transforms plaintext into TLS records ([`Engine::wrap`]) and TLS
//! records back into plaintext ([`Engine::unwrap`]) entirely in memory. It
//! reports its handshake demands through [`HandshakeStatus`] and may hand out
//! [`EngineTask`]s for CPU-heavy work the host should run off the event loop.
//! The adapter owns the ordering of calls; the engine owns the cryptography.

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

use std::fmt;

/// Possible engine errors.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported cipher suite: {0}")]
    UnsupportedCipherSuite(String),
    #[error("handshake failure: {0}")]
    HandshakeFailure(String),
    #[error("encryption error: {0}")]
    EncryptionError(String),
    #[error("decryption error: {0}")]
    DecryptionError(String),
    #[error("inbound closed before receiving peer shutdown")]
    InboundClosed,
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Which side of the connection an engine speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake.
    Client,
    /// Accepts the handshake.
    Server,
}

/// Client-authentication demand applied to a server-side engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// The client may present a certificate; the handshake proceeds without one.
    Request,
    /// The handshake fails unless the client presents a certificate.
    Require,
}

/// Completion status of a single wrap or unwrap call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The call completed.
    Ok,
    /// The destination buffer is too small. Nothing was consumed or produced;
    /// the caller should grow the destination and retry.
    BufferOverflow,
    /// The source does not yet hold a complete record. The caller should
    /// supply more input before retrying.
    BufferUnderflow,
    /// The closed side of the engine was exercised: either a shutdown record
    /// was produced/consumed, or the call arrived after closure.
    Closed,
}

/// The engine's current handshake demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has a record to emit; call [`Engine::wrap`].
    NeedWrap,
    /// The engine needs peer data; call [`Engine::unwrap`].
    NeedUnwrap,
    /// The engine has delegated tasks pending; drain [`Engine::delegated_task`].
    NeedTask,
    /// The handshake completed with the call that reported this status.
    /// It is reported exactly once and cannot be observed later.
    Finished,
    /// No handshake is in progress.
    NotHandshaking,
}

/// Outcome of a single [`Engine::wrap`] or [`Engine::unwrap`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    /// Completion status of the call.
    pub status: Status,
    /// Handshake demand after the call.
    pub handshake_status: HandshakeStatus,
    /// Bytes consumed from the source slice.
    pub bytes_consumed: usize,
    /// Bytes written to the destination slice.
    pub bytes_produced: usize,
}

/// This type contains a single certificate by value.
///
/// The certificate must be DER-encoded X.509.
///
/// The `rustls-pemfile` crate can be used to parse a PEM file.
#[derive(Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Certificate(pub Vec<u8>);

impl AsRef<[u8]> for Certificate {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Certificate({} bytes)", self.0.len())
    }
}

/// Peer identity as reported by the engine's session.
#[derive(Debug, Clone)]
pub enum PeerCertificates {
    /// The peer's identity could not be established (e.g. an anonymous
    /// cipher suite).
    Unverified,
    /// The peer presented no certificates.
    Absent,
    /// The peer's certificate chain, end-entity first.
    Chain(Vec<Certificate>),
}

/// Negotiated-session details exposed by the engine.
///
/// Available once the handshake has progressed far enough for the engine to
/// know them; guaranteed present by the time the handshake reports
/// [`HandshakeStatus::Finished`].
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// The peer's certificates, or why they are missing.
    pub peer_certificates: PeerCertificates,
    /// Negotiated cipher-suite name, e.g. `TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256`.
    pub cipher_suite: String,
    /// Negotiated protocol name, e.g. `TLSv1.2`.
    pub protocol: String,
}

/// A CPU-heavy job the engine asks the host to run away from the event loop.
///
/// Tasks run at most once. While a task batch runs, the engine keeps
/// reporting [`HandshakeStatus::NeedTask`]; the host must not call
/// [`Engine::wrap`] or [`Engine::unwrap`] until the batch is drained.
pub trait EngineTask: Send {
    /// Runs the task to completion.
    fn run(self: Box<Self>);
}

impl<F> EngineTask for F
where
    F: FnOnce() + Send,
{
    fn run(self: Box<Self>) {
        (*self)()
    }
}

/// Core trait which manages the TLS record transforms for a connection.
///
/// All methods except [`Engine::delegated_task`] and the tasks it hands out
/// must be called from the event-loop context that owns the connection.
pub trait Engine: Send {
    /// Encrypts plaintext from `src` into TLS records in `dst`.
    ///
    /// On [`Status::BufferOverflow`] the engine consumes and produces
    /// nothing; the caller grows `dst` and retries. May also be called with
    /// an empty `src` to let a handshake emit records.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// Decrypts TLS records from `src` into plaintext in `dst`.
    ///
    /// Reports [`Status::BufferUnderflow`] when `src` does not hold a
    /// complete record, and [`Status::Closed`] when the consumed record was
    /// the peer's shutdown or the inbound side is already closed.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError>;

    /// The engine's current handshake demand.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Returns the next delegated task, if any.
    ///
    /// Running a task may surface further tasks; callers drain until `None`.
    fn delegated_task(&mut self) -> Option<Box<dyn EngineTask>>;

    /// Closes the inbound side.
    ///
    /// Fails when the peer has not sent its shutdown record yet; after the
    /// call, [`Engine::unwrap`] reports [`Status::Closed`] either way.
    fn close_inbound(&mut self) -> Result<(), EngineError>;

    /// Closes the outbound side; the next wrap emits the shutdown record.
    fn close_outbound(&mut self);

    /// Negotiated-session details, or `None` if no session exists yet.
    fn session(&self) -> Option<SessionInfo>;

    /// The engine's record size: the largest buffer a single wrap or unwrap
    /// normally needs.
    fn packet_buffer_len(&self) -> usize;

    /// Sets which side of the handshake this engine speaks for. Must be
    /// called before any wrap or unwrap.
    fn set_role(&mut self, role: Role);

    /// Applies a client-authentication demand (server role only).
    fn set_client_auth(&mut self, auth: ClientAuth);

    /// Restricts the engine to the given cipher suites.
    ///
    /// Rejects lists containing suites the engine does not implement.
    fn set_enabled_suites(&mut self, suites: &[String]) -> Result<(), EngineError>;
}

/// Factory for engines, typically wrapping loaded keys and certificates.
pub trait EngineContext: Send + Sync {
    /// Creates a fresh engine. `sni` carries the `(server_name, port)` hint
    /// for client engines that should send SNI and reuse session state.
    fn create_engine(&self, sni: Option<(&str, u16)>) -> Box<dyn Engine>;
}
