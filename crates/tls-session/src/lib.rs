//! Memory-only bridge between a byte-stream I/O layer and a TLS record
//! engine.
//!
//! [`Connection`] accepts plaintext to encrypt and ciphertext to decrypt,
//! drives the engine's handshake to completion, verifies the peer under the
//! configured policy, and emits the resulting bytes plus lifecycle events
//! through callbacks. It performs no socket I/O of its own: the host wires
//! [`Connection::set_write_callback`] to its transport and feeds received
//! bytes back in through [`Connection::unwrap`].

#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]
#![forbid(unsafe_code)]

pub mod anchors;
mod buffer;
mod chunk;
mod conn;
mod error;
mod runtime;
mod verify;

pub use anchors::{OwnedTrustAnchor, RootCertStore, RootCertStoreError};
pub use conn::{
    ChunkCallback, Connection, ErrorCallback, HandshakeCallback, ReadCallback, WriteCallback,
};
pub use error::Error;
pub use runtime::{DomainTag, Job, Runtime};
pub use verify::{CertificateError, KeyExchangeAlgorithm, TrustStore};

pub use tls_engine::{
    Certificate, ClientAuth, Engine, EngineContext, EngineError, EngineResult, EngineTask,
    HandshakeStatus, PeerCertificates, Role, SessionInfo, Status,
};

/// Error code delivered to the read callback when the inbound side closes
/// cleanly.
pub const EOF: i32 = -4095;
