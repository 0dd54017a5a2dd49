//! The connection: queues, scratch buffers, and the encode loop.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use futures::channel::oneshot;
use tls_engine::{
    Certificate, ClientAuth, Engine, EngineContext, EngineError, EngineResult, HandshakeStatus,
    PeerCertificates, Role, Status,
};
use tracing::{debug, trace};

use crate::{
    buffer::SessionBuf,
    chunk::Chunk,
    error::Error,
    runtime::Runtime,
    verify::{self, TrustStore},
    EOF,
};

/// Completion callback attached to a queued chunk.
///
/// Invoked with `None` once the chunk has been processed, or with the error
/// that stopped it. Fires at most once.
pub type ChunkCallback = Box<dyn FnOnce(Option<Error>) + Send>;

/// Delivers ciphertext to the transport: `(records, shutdown, completion)`.
///
/// When a completion callback is handed over, the transport invokes it after
/// the bytes have been passed on.
pub type WriteCallback = Box<dyn FnMut(Option<Bytes>, bool, Option<ChunkCallback>) + Send>;

/// Delivers plaintext to the reader. A non-zero error code signals inbound
/// EOF or a lower-layer failure; the payload may be absent in that case.
pub type ReadCallback = Box<dyn FnMut(Option<Bytes>, i32) + Send>;

/// Handshake lifecycle notification.
pub type HandshakeCallback = Box<dyn FnMut() + Send>;

/// Fatal error notification.
pub type ErrorCallback = Box<dyn FnMut(Error) + Send>;

/// A memory-only TLS session: plaintext in, records out, and vice versa.
///
/// The connection owns its engine and never touches a socket. Each public
/// operation enqueues work and then drives the engine until it stalls:
/// waiting for more ciphertext, idle with empty queues, or off running
/// delegated tasks. All results flow through the configured callbacks, on
/// the event-loop context of the caller.
pub struct Connection {
    runtime: Arc<dyn Runtime>,
    role: Role,
    server_name: Option<String>,
    server_port: u16,

    request_cert: bool,
    reject_unauthorized: bool,

    engine: Option<Box<dyn Engine>>,
    trust_store: Option<Arc<dyn TrustStore>>,

    outgoing: VecDeque<Chunk>,
    incoming: VecDeque<Chunk>,
    write_buf: SessionBuf,
    read_buf: SessionBuf,

    handshaking: bool,
    init_finished: bool,
    sent_shutdown: bool,
    received_shutdown: bool,

    error: Option<Error>,
    verify_error: Option<Error>,

    on_write: Option<WriteCallback>,
    on_read: Option<ReadCallback>,
    on_handshake_start: Option<HandshakeCallback>,
    on_handshake_done: Option<HandshakeCallback>,
    on_error: Option<ErrorCallback>,
}

impl Connection {
    /// Creates a connection for the given role. `server_name` and
    /// `server_port` feed the SNI/session hint of client engines.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        role: Role,
        server_name: Option<String>,
        server_port: u16,
    ) -> Self {
        Self {
            runtime,
            role,
            server_name,
            server_port,
            request_cert: false,
            reject_unauthorized: false,
            engine: None,
            trust_store: None,
            outgoing: VecDeque::new(),
            incoming: VecDeque::new(),
            write_buf: SessionBuf::with_capacity(0),
            read_buf: SessionBuf::with_capacity(0),
            handshaking: false,
            init_finished: false,
            sent_shutdown: false,
            received_shutdown: false,
            error: None,
            verify_error: None,
            on_write: None,
            on_read: None,
            on_handshake_start: None,
            on_handshake_done: None,
            on_error: None,
        }
    }

    /// Finalizes the engine: creates it (with an SNI hint iff this is a
    /// client with a server name), sets the role, and sizes both scratch
    /// buffers to the engine's record size.
    ///
    /// Cipher restrictions are applied last so the setup above survives a
    /// rejected list: the rejection lands in the error slot and later
    /// operations observe it naturally.
    pub fn init(
        &mut self,
        ctx: &dyn EngineContext,
        ciphers: Option<&[String]>,
        trust_store: Option<Arc<dyn TrustStore>>,
    ) {
        self.trust_store = trust_store;

        let sni = if self.role == Role::Client {
            self.server_name.as_deref().map(|name| (name, self.server_port))
        } else {
            None
        };
        let mut engine = ctx.create_engine(sni);
        engine.set_role(self.role);

        let packet_len = engine.packet_buffer_len();
        debug!(packet_len, "allocating read and write buffers");
        self.read_buf = SessionBuf::with_capacity(packet_len);
        self.write_buf = SessionBuf::with_capacity(packet_len);

        if let Some(ciphers) = ciphers {
            if let Err(err) = engine.set_enabled_suites(ciphers) {
                self.handle_error(err.into());
            }
        }

        self.engine = Some(engine);
    }

    /// Applies the server-side client-authentication policy: request a
    /// certificate, and with `reject_unauthorized` make the handshake fail
    /// without one.
    pub fn set_verification_mode(&mut self, request_cert: bool, reject_unauthorized: bool) {
        self.request_cert = request_cert;
        self.reject_unauthorized = reject_unauthorized;

        if request_cert {
            let auth = if self.reject_unauthorized {
                ClientAuth::Require
            } else {
                ClientAuth::Request
            };
            if let Some(engine) = self.engine.as_mut() {
                engine.set_client_auth(auth);
            }
        }
    }

    /// Sets the ciphertext delivery callback.
    pub fn set_write_callback(&mut self, cb: WriteCallback) {
        self.on_write = Some(cb);
    }

    /// Sets the plaintext delivery callback.
    pub fn set_read_callback(&mut self, cb: ReadCallback) {
        self.on_read = Some(cb);
    }

    /// Sets the handshake-started callback.
    pub fn set_handshake_start_callback(&mut self, cb: HandshakeCallback) {
        self.on_handshake_start = Some(cb);
    }

    /// Sets the handshake-completed callback.
    pub fn set_handshake_done_callback(&mut self, cb: HandshakeCallback) {
        self.on_handshake_done = Some(cb);
    }

    /// Sets the fatal-error callback.
    pub fn set_error_callback(&mut self, cb: ErrorCallback) {
        self.on_error = Some(cb);
    }

    /// The post-handshake fatal error, if any.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// The handshake-time fatal error, if any. Read after the
    /// handshake-done callback to apply policy.
    pub fn verify_error(&self) -> Option<&Error> {
        self.verify_error.as_ref()
    }

    /// True once the handshake has completed. Never reverts.
    pub fn is_init_finished(&self) -> bool {
        self.init_finished
    }

    /// True once our shutdown record has been wrapped.
    pub fn is_sent_shutdown(&self) -> bool {
        self.sent_shutdown
    }

    /// True once the peer's shutdown record has been unwrapped.
    pub fn is_received_shutdown(&self) -> bool {
        self.received_shutdown
    }

    /// Unconsumed plaintext bytes across all queued outgoing chunks.
    pub fn write_queue_len(&self) -> usize {
        self.outgoing.iter().map(Chunk::remaining).sum()
    }

    /// The peer's end-entity certificate, once a session exists and the
    /// peer presented one.
    pub fn peer_certificate(&self) -> Option<Certificate> {
        let session = self.engine.as_ref()?.session()?;
        match session.peer_certificates {
            PeerCertificates::Chain(chain) => chain.into_iter().next(),
            _ => None,
        }
    }

    /// The negotiated cipher-suite name, once a session exists.
    pub fn cipher_suite(&self) -> Option<String> {
        self.engine
            .as_ref()?
            .session()
            .map(|session| session.cipher_suite)
    }

    /// The negotiated protocol name, once a session exists.
    pub fn protocol(&self) -> Option<String> {
        self.engine
            .as_ref()?
            .session()
            .map(|session| session.protocol)
    }

    /// Enqueues plaintext to encrypt. An absent or empty payload is a pure
    /// handshake kick.
    pub async fn wrap(
        &mut self,
        buf: Option<Bytes>,
        cb: Option<ChunkCallback>,
    ) -> Result<(), Error> {
        self.outgoing.push_back(Chunk::data(buf, cb));
        self.encode_loop().await
    }

    /// Enqueues the outbound shutdown record.
    pub async fn shutdown(&mut self, cb: Option<ChunkCallback>) -> Result<(), Error> {
        self.outgoing.push_back(Chunk::shutdown_marker(cb));
        self.encode_loop().await
    }

    /// Closes the engine's inbound side directly, surfacing EOF to the
    /// reader before any further wrapping.
    pub async fn shutdown_inbound(&mut self, cb: Option<ChunkCallback>) -> Result<(), Error> {
        let mut engine = self.engine.take().ok_or(Error::NotInitialized)?;
        if let Err(err) = engine.close_inbound() {
            debug!(%err, "error closing inbound engine side");
        }
        if let Some(cb) = cb {
            cb(None);
        }

        // Force an unwrap pass so the reader sees EOF first.
        self.do_unwrap(engine.as_mut());
        self.engine = Some(engine);

        // Wraps may still (pointlessly) be pending; run the regular loop.
        self.encode_loop().await
    }

    /// Enqueues ciphertext to decrypt.
    pub async fn unwrap(&mut self, buf: Bytes, cb: Option<ChunkCallback>) -> Result<(), Error> {
        self.incoming.push_back(Chunk::data(Some(buf), cb));
        self.encode_loop().await
    }

    /// Enqueues a lower-layer inbound error so it is surfaced to the reader
    /// in order, after all previously enqueued ciphertext.
    pub async fn inbound_error(&mut self, err: i32) -> Result<(), Error> {
        self.incoming.push_back(Chunk::error_marker(err));
        self.encode_loop().await
    }

    /// Clients only: kicks off the handshake by wrapping nothing.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.role == Role::Client {
            self.wrap(None, None).await
        } else {
            Ok(())
        }
    }

    /// Drives the engine until it stalls: waiting for ciphertext, idle with
    /// both queues empty, or suspended on delegated tasks.
    async fn encode_loop(&mut self) -> Result<(), Error> {
        loop {
            let mut engine = self.engine.take().ok_or(Error::NotInitialized)?;
            let status = engine.handshake_status();
            trace!(
                ?status,
                outgoing = self.outgoing.len(),
                incoming = self.incoming.len(),
                "engine status"
            );
            let keep_going = match status {
                HandshakeStatus::NeedWrap => {
                    // Always wrap, even with nothing queued.
                    self.process_handshaking();
                    self.do_wrap(engine.as_mut())
                }
                HandshakeStatus::NeedUnwrap => {
                    self.process_handshaking();
                    self.do_unwrap(engine.as_mut())
                }
                HandshakeStatus::NeedTask => {
                    self.engine = Some(engine);
                    self.run_delegated_tasks().await?;
                    continue;
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    if self.outgoing.is_empty() && self.incoming.is_empty() {
                        self.engine = Some(engine);
                        return Ok(());
                    }
                    let mut keep_going = true;
                    if !self.outgoing.is_empty() {
                        keep_going = self.do_wrap(engine.as_mut());
                    }
                    if keep_going && !self.incoming.is_empty() {
                        keep_going = self.do_unwrap(engine.as_mut());
                    }
                    keep_going
                }
            };
            self.engine = Some(engine);
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Wraps whatever is at the head of the outgoing queue. Returns false
    /// when the loop should stop.
    fn do_wrap(&mut self, engine: &mut dyn Engine) -> bool {
        let mut was_shutdown = false;
        let outcome: Result<EngineResult, EngineError> = loop {
            if let Some(chunk) = self.outgoing.front() {
                if chunk.is_shutdown() {
                    trace!("sending outbound close");
                    engine.close_outbound();
                    self.sent_shutdown = true;
                    was_shutdown = true;
                }
            }

            // A missing chunk, or a marker without payload, still wraps:
            // the handshake may have records to emit.
            let src = self
                .outgoing
                .front()
                .and_then(Chunk::buf)
                .map_or(&[][..], |b| b.as_ref());
            trace!(len = src.len(), "wrapping");
            match engine.wrap(src, self.write_buf.unfilled()) {
                Ok(res) => {
                    self.write_buf.advance(res.bytes_produced);
                    if let Some(chunk) = self.outgoing.front_mut() {
                        chunk.advance(res.bytes_consumed);
                    }
                    if res.status == Status::BufferOverflow {
                        self.write_buf.grow();
                        continue;
                    }
                    break Ok(res);
                }
                Err(err) => break Err(err),
            }
        };

        let result = match outcome {
            Ok(res) => res,
            Err(err) => {
                let chunk_cb = self.outgoing.front_mut().map(Chunk::take_callback);
                self.handle_encoding_error(chunk_cb, err);
                let _ = self.outgoing.pop_front();
                return false;
            }
        };

        let mut cb = None;
        let chunk_spent = self.outgoing.front().is_some_and(|c| !c.has_remaining());
        if chunk_spent && self.init_finished {
            // The chunk is done, but hold its callback until the record has
            // been offered downstream, in case the peer ended before any
            // data moved.
            if let Some(mut chunk) = self.outgoing.pop_front() {
                cb = chunk.take_callback();
            }
        }

        if result.handshake_status == HandshakeStatus::Finished {
            // Reported exactly once; cannot be re-checked later.
            self.process_not_handshaking(engine);
        }

        if result.bytes_produced > 0 {
            self.deliver_write_buffer(was_shutdown, cb);
        } else if let Some(cb) = cb {
            cb(None);
        }

        result.status == Status::Ok
    }

    /// Unwraps whatever is at the head of the incoming queue. Returns false
    /// when the loop should stop.
    fn do_unwrap(&mut self, engine: &mut dyn Engine) -> bool {
        let mut result: Option<EngineResult> = None;

        loop {
            // Inbound-error markers carry no payload and skip the engine;
            // an empty queue still unwraps so the handshake can progress.
            let feed = match self.incoming.front() {
                Some(chunk) => chunk.buf().is_some(),
                None => true,
            };
            if !feed {
                break;
            }

            let res = loop {
                let src = self
                    .incoming
                    .front()
                    .and_then(Chunk::buf)
                    .map_or(&[][..], |b| b.as_ref());
                trace!(len = src.len(), "unwrapping");
                match engine.unwrap(src, self.read_buf.unfilled()) {
                    Ok(res) => {
                        self.read_buf.advance(res.bytes_produced);
                        if let Some(chunk) = self.incoming.front_mut() {
                            chunk.advance(res.bytes_consumed);
                        }
                        if res.status == Status::BufferOverflow {
                            self.read_buf.grow();
                            continue;
                        }
                        break res;
                    }
                    Err(err) => {
                        let chunk_cb = self.incoming.front_mut().map(Chunk::take_callback);
                        self.handle_encoding_error(chunk_cb, err);
                        return false;
                    }
                }
            };
            result = Some(res);

            if res.status == Status::BufferUnderflow && !self.incoming.is_empty() {
                // Hand the producer its completion now so it supplies more
                // data; this may re-enter us through the event loop.
                if let Some(cb) = self.incoming.front_mut().and_then(Chunk::take_callback) {
                    cb(None);
                }
                if self.incoming.len() >= 2 {
                    // Fold the starved head into the next chunk and retry.
                    if let Some(head) = self.incoming.pop_front() {
                        if let Some(next) = self.incoming.front_mut() {
                            next.prepend(head.into_buf());
                        }
                    }
                    continue;
                }
            }
            break;
        }

        let mut err = self.incoming.front().map_or(0, Chunk::inbound_err);

        if err != 0 {
            if let Err(e) = engine.close_inbound() {
                trace!(%e, "ignoring inbound close failure");
            }
        }

        if result.is_some_and(|r| r.status == Status::Closed) && !self.received_shutdown {
            self.received_shutdown = true;
            err = EOF;
        }

        if self.incoming.front().is_some_and(|c| !c.has_remaining()) {
            if let Some(mut chunk) = self.incoming.pop_front() {
                // Deliver right now: we are ready to consume more data.
                if let Some(cb) = chunk.take_callback() {
                    cb(None);
                }
            }
        }

        if result.is_some_and(|r| r.handshake_status == HandshakeStatus::Finished) {
            // Reported exactly once; cannot be re-checked later.
            self.process_not_handshaking(engine);
        }

        if result.is_some_and(|r| r.bytes_produced > 0) || err != 0 {
            self.deliver_read_buffer(err);
        }

        match result {
            Some(res) => res.status == Status::Ok,
            None => true,
        }
    }

    fn deliver_write_buffer(&mut self, shutdown: bool, cb: Option<ChunkCallback>) {
        if let Some(on_write) = self.on_write.as_mut() {
            let buf = self.write_buf.take();
            if let Some(buf) = &buf {
                trace!(len = buf.len(), shutdown, "delivering ciphertext");
            }
            on_write(buf, shutdown, cb);
        } else {
            self.write_buf.clear();
            if let Some(cb) = cb {
                cb(None);
            }
        }
    }

    fn deliver_read_buffer(&mut self, err: i32) {
        if let Some(on_read) = self.on_read.as_mut() {
            let buf = self.read_buf.take();
            if let Some(buf) = &buf {
                trace!(len = buf.len(), err, "delivering plaintext");
            }
            on_read(buf, err);
        } else {
            self.read_buf.clear();
        }
    }

    fn process_handshaking(&mut self) {
        if !self.handshaking && !self.sent_shutdown && !self.received_shutdown {
            self.handshaking = true;
            if let Some(cb) = self.on_handshake_start.as_mut() {
                cb();
            }
        }
    }

    fn process_not_handshaking(&mut self, engine: &dyn Engine) {
        if self.handshaking {
            self.check_peer_authorization(engine);
            self.handshaking = false;
            self.init_finished = true;
            if let Some(cb) = self.on_handshake_done.as_mut() {
                cb();
            }
        }
    }

    /// Ships the engine to the blocking pool, drains its delegated tasks
    /// there, and resumes once the runtime posts the engine back onto the
    /// event-loop context.
    async fn run_delegated_tasks(&mut self) -> Result<(), Error> {
        let mut engine = self.engine.take().ok_or(Error::NotInitialized)?;
        let runtime = Arc::clone(&self.runtime);
        let tag = runtime.current_domain_tag();
        let (engine_tx, engine_rx) = oneshot::channel();

        self.runtime.submit_blocking(Box::new(move || {
            let mut ran = 0usize;
            while let Some(task) = engine.delegated_task() {
                task.run();
                ran += 1;
            }
            trace!(tasks = ran, "delegated tasks finished");

            // Back to the event loop to keep running with the result.
            runtime.post_to_event_loop(
                Box::new(move || {
                    let _ = engine_tx.send(engine);
                }),
                tag,
            );
        }));

        match engine_rx.await {
            Ok(engine) => {
                self.engine = Some(engine);
                Ok(())
            }
            Err(_) => Err(Error::RuntimeShutdown),
        }
    }

    /// Records a failure observed outside wrap/unwrap: during the handshake
    /// it is a verification error, afterwards a connection error.
    fn handle_error(&mut self, err: Error) {
        debug!(handshaking = self.handshaking, %err, "TLS failure");
        if self.handshaking {
            self.verify_error = Some(err);
        } else {
            self.error = Some(err);
        }
    }

    /// Records a wrap/unwrap failure and routes it to whoever can observe
    /// it. `chunk_cb` is `None` when no chunk was being processed, and the
    /// chunk's removed callback otherwise.
    fn handle_encoding_error(&mut self, chunk_cb: Option<Option<ChunkCallback>>, err: EngineError) {
        let err = Error::from(err);
        debug!(%err, init_finished = self.init_finished, "engine failure");
        self.error = Some(err.clone());
        if !self.init_finished {
            // Failures this early always make it to the error callback.
            self.verify_error = Some(err.clone());
            self.emit_error(err);
        } else {
            match chunk_cb {
                Some(Some(cb)) => cb(Some(err)),
                Some(None) => {}
                None => self.emit_error(err),
            }
        }
    }

    fn emit_error(&mut self, err: Error) {
        if let Some(on_error) = self.on_error.as_mut() {
            on_error(err);
        }
    }

    /// Runs the manual peer checks the engine does not enforce, recording
    /// the outcome in the verify-error slot.
    fn check_peer_authorization(&mut self, engine: &dyn Engine) {
        let Some(session) = engine.session() else {
            return;
        };
        match verify::check_peer(
            self.role,
            self.request_cert,
            self.trust_store.as_deref(),
            &session,
        ) {
            Ok(()) => debug!("peer is valid"),
            Err(err) => self.handle_error(err),
        }
    }
}
