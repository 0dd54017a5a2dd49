//! Shared fixtures: a scripted record engine speaking a tiny framed
//! protocol, test runtimes, and callback sinks.

#![allow(dead_code)] // compiled once per test binary

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tls_session::{
    Certificate, CertificateError, ClientAuth, Connection, DomainTag, Engine, EngineContext,
    EngineError, EngineResult, EngineTask, Error, HandshakeStatus, Job, KeyExchangeAlgorithm,
    PeerCertificates, Role, Runtime, SessionInfo, Status, TrustStore,
};

pub const FRAME_HANDSHAKE: u8 = 0x16;
pub const FRAME_APPDATA: u8 = 0x17;
pub const FRAME_CLOSE: u8 = 0x15;
pub const FRAME_HEADER: usize = 3;

/// Builds one record of the fake framed protocol: `[type][len u16 be][payload]`.
pub fn frame(typ: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER + payload.len());
    out.push(typ);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Clone)]
pub struct FakeConfig {
    pub packet_len: usize,
    pub max_record: usize,
    pub tasks: usize,
    pub peer: PeerCertificates,
    pub cipher_suite: String,
    pub protocol: String,
    pub reject_suites: bool,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            packet_len: 512,
            max_record: 16384,
            tasks: 0,
            peer: PeerCertificates::Chain(vec![Certificate(b"fake end-entity der".to_vec())]),
            cipher_suite: "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".into(),
            protocol: "TLSv1.2".into(),
            reject_suites: false,
        }
    }
}

#[derive(Default)]
pub struct FakeStats {
    pub wrap_produced: AtomicUsize,
    pub tasks_run: AtomicUsize,
    pub sni: Mutex<Option<(String, u16)>>,
    pub client_auth: Mutex<Option<ClientAuth>>,
    pub enabled_suites: Mutex<Option<Vec<String>>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum HsState {
    Idle,
    ClientStart,
    ClientAwaitServerHello,
    ClientSendFinished,
    ServerAwaitClientHello,
    ServerSendHello,
    ServerAwaitFinished,
    Done,
}

/// A scripted engine: a two-flight handshake over the fake framed protocol,
/// then app-data framing, with configurable delegated tasks, peer identity,
/// and failure injection.
pub struct FakeEngine {
    config: FakeConfig,
    stats: Arc<FakeStats>,
    state: HsState,
    tasks_outstanding: Arc<AtomicUsize>,
    pending_tasks: Vec<Box<dyn EngineTask>>,
    tasks_scheduled: bool,
    outbound_closed: bool,
    close_sent: bool,
    inbound_closed: bool,
    received_close: bool,
    session_ready: bool,
    fail_wrap: Arc<Mutex<Option<EngineError>>>,
    fail_unwrap: Arc<Mutex<Option<EngineError>>>,
}

impl FakeEngine {
    fn emit(&self, typ: u8, payload: &[u8], dst: &mut [u8]) -> Option<usize> {
        let needed = FRAME_HEADER + payload.len();
        if dst.len() < needed {
            return None;
        }
        dst[0] = typ;
        dst[1..3].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        dst[3..needed].copy_from_slice(payload);
        Some(needed)
    }

    fn schedule_tasks(&mut self) {
        if self.config.tasks == 0 || self.tasks_scheduled {
            return;
        }
        self.tasks_scheduled = true;
        self.tasks_outstanding
            .store(self.config.tasks, Ordering::SeqCst);
        for _ in 0..self.config.tasks {
            let outstanding = Arc::clone(&self.tasks_outstanding);
            let stats = Arc::clone(&self.stats);
            self.pending_tasks.push(Box::new(move || {
                stats.tasks_run.fetch_add(1, Ordering::SeqCst);
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }));
        }
    }

    fn result(
        &self,
        status: Status,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> EngineResult {
        EngineResult {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

impl Engine for FakeEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if let Some(err) = self.fail_wrap.lock().unwrap().clone() {
            return Err(err);
        }

        let res = if self.outbound_closed {
            if self.close_sent {
                self.result(Status::Closed, self.handshake_status(), 0, 0)
            } else {
                match self.emit(FRAME_CLOSE, b"", dst) {
                    Some(produced) => {
                        self.close_sent = true;
                        self.result(Status::Closed, self.handshake_status(), 0, produced)
                    }
                    None => self.result(Status::BufferOverflow, self.handshake_status(), 0, 0),
                }
            }
        } else {
            match self.state {
                HsState::ClientStart => match self.emit(FRAME_HANDSHAKE, b"CLIENT_HELLO", dst) {
                    Some(produced) => {
                        self.state = HsState::ClientAwaitServerHello;
                        self.result(Status::Ok, HandshakeStatus::NeedUnwrap, 0, produced)
                    }
                    None => self.result(Status::BufferOverflow, self.handshake_status(), 0, 0),
                },
                HsState::ClientSendFinished => match self.emit(FRAME_HANDSHAKE, b"FINISHED", dst) {
                    Some(produced) => {
                        self.state = HsState::Done;
                        self.session_ready = true;
                        self.result(Status::Ok, HandshakeStatus::Finished, 0, produced)
                    }
                    None => self.result(Status::BufferOverflow, self.handshake_status(), 0, 0),
                },
                HsState::ServerSendHello => match self.emit(FRAME_HANDSHAKE, b"SERVER_HELLO", dst) {
                    Some(produced) => {
                        self.state = HsState::ServerAwaitFinished;
                        self.result(Status::Ok, HandshakeStatus::NeedUnwrap, 0, produced)
                    }
                    None => self.result(Status::BufferOverflow, self.handshake_status(), 0, 0),
                },
                HsState::Done => {
                    if src.is_empty() {
                        self.result(Status::Ok, HandshakeStatus::NotHandshaking, 0, 0)
                    } else {
                        let n = src.len().min(self.config.max_record);
                        let hs = HandshakeStatus::NotHandshaking;
                        match self.emit(FRAME_APPDATA, &src[..n], dst) {
                            Some(produced) => self.result(Status::Ok, hs, n, produced),
                            None => self.result(Status::BufferOverflow, hs, 0, 0),
                        }
                    }
                }
                _ => self.result(Status::Ok, self.handshake_status(), 0, 0),
            }
        };

        self.stats
            .wrap_produced
            .fetch_add(res.bytes_produced, Ordering::SeqCst);
        Ok(res)
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, EngineError> {
        if let Some(err) = self.fail_unwrap.lock().unwrap().clone() {
            return Err(err);
        }
        if self.inbound_closed || self.received_close {
            return Ok(self.result(Status::Closed, self.handshake_status(), 0, 0));
        }
        if src.len() < FRAME_HEADER {
            return Ok(self.result(Status::BufferUnderflow, self.handshake_status(), 0, 0));
        }
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < FRAME_HEADER + len {
            return Ok(self.result(Status::BufferUnderflow, self.handshake_status(), 0, 0));
        }
        let typ = src[0];
        let payload = &src[FRAME_HEADER..FRAME_HEADER + len];
        let consumed = FRAME_HEADER + len;

        match typ {
            FRAME_CLOSE => {
                self.received_close = true;
                Ok(self.result(Status::Closed, self.handshake_status(), consumed, 0))
            }
            FRAME_HANDSHAKE => match (self.state, payload) {
                (HsState::ClientAwaitServerHello, b"SERVER_HELLO") => {
                    self.state = HsState::ClientSendFinished;
                    self.schedule_tasks();
                    Ok(self.result(Status::Ok, self.handshake_status(), consumed, 0))
                }
                (HsState::ServerAwaitClientHello, b"CLIENT_HELLO") => {
                    self.state = HsState::ServerSendHello;
                    self.schedule_tasks();
                    Ok(self.result(Status::Ok, self.handshake_status(), consumed, 0))
                }
                (HsState::ServerAwaitFinished, b"FINISHED") => {
                    self.state = HsState::Done;
                    self.session_ready = true;
                    Ok(self.result(Status::Ok, HandshakeStatus::Finished, consumed, 0))
                }
                _ => Err(EngineError::HandshakeFailure(format!(
                    "unexpected handshake message in {:?}",
                    self.state
                ))),
            },
            FRAME_APPDATA => {
                if self.state != HsState::Done {
                    return Err(EngineError::DecryptionError(
                        "application data during handshake".into(),
                    ));
                }
                if dst.len() < len {
                    return Ok(self.result(Status::BufferOverflow, self.handshake_status(), 0, 0));
                }
                dst[..len].copy_from_slice(payload);
                Ok(self.result(Status::Ok, HandshakeStatus::NotHandshaking, consumed, len))
            }
            _ => Err(EngineError::DecryptionError(format!(
                "unknown record type {typ}"
            ))),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.tasks_outstanding.load(Ordering::SeqCst) > 0 {
            return HandshakeStatus::NeedTask;
        }
        match self.state {
            HsState::Idle | HsState::ClientStart | HsState::Done => HandshakeStatus::NotHandshaking,
            HsState::ClientAwaitServerHello
            | HsState::ServerAwaitClientHello
            | HsState::ServerAwaitFinished => HandshakeStatus::NeedUnwrap,
            HsState::ClientSendFinished | HsState::ServerSendHello => HandshakeStatus::NeedWrap,
        }
    }

    fn delegated_task(&mut self) -> Option<Box<dyn EngineTask>> {
        self.pending_tasks.pop()
    }

    fn close_inbound(&mut self) -> Result<(), EngineError> {
        let clean = self.received_close;
        self.inbound_closed = true;
        if clean {
            Ok(())
        } else {
            Err(EngineError::InboundClosed)
        }
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn session(&self) -> Option<SessionInfo> {
        if !self.session_ready {
            return None;
        }
        Some(SessionInfo {
            peer_certificates: self.config.peer.clone(),
            cipher_suite: self.config.cipher_suite.clone(),
            protocol: self.config.protocol.clone(),
        })
    }

    fn packet_buffer_len(&self) -> usize {
        self.config.packet_len
    }

    fn set_role(&mut self, role: Role) {
        self.state = match role {
            Role::Client => HsState::ClientStart,
            Role::Server => HsState::ServerAwaitClientHello,
        };
    }

    fn set_client_auth(&mut self, auth: ClientAuth) {
        *self.stats.client_auth.lock().unwrap() = Some(auth);
    }

    fn set_enabled_suites(&mut self, suites: &[String]) -> Result<(), EngineError> {
        if self.config.reject_suites {
            return Err(EngineError::UnsupportedCipherSuite(
                suites.first().cloned().unwrap_or_default(),
            ));
        }
        *self.stats.enabled_suites.lock().unwrap() = Some(suites.to_vec());
        Ok(())
    }
}

/// Engine factory handing out [`FakeEngine`]s that share stats and failure
/// switches with the test.
pub struct FakeContext {
    config: FakeConfig,
    stats: Arc<FakeStats>,
    fail_wrap: Arc<Mutex<Option<EngineError>>>,
    fail_unwrap: Arc<Mutex<Option<EngineError>>>,
}

impl FakeContext {
    pub fn new(config: FakeConfig) -> Self {
        Self {
            config,
            stats: Arc::new(FakeStats::default()),
            fail_wrap: Arc::new(Mutex::new(None)),
            fail_unwrap: Arc::new(Mutex::new(None)),
        }
    }

    pub fn stats(&self) -> Arc<FakeStats> {
        Arc::clone(&self.stats)
    }

    pub fn fail_wrap_handle(&self) -> Arc<Mutex<Option<EngineError>>> {
        Arc::clone(&self.fail_wrap)
    }

    pub fn fail_unwrap_handle(&self) -> Arc<Mutex<Option<EngineError>>> {
        Arc::clone(&self.fail_unwrap)
    }
}

impl EngineContext for FakeContext {
    fn create_engine(&self, sni: Option<(&str, u16)>) -> Box<dyn Engine> {
        if let Some((name, port)) = sni {
            *self.stats.sni.lock().unwrap() = Some((name.to_string(), port));
        }
        Box::new(FakeEngine {
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
            state: HsState::Idle,
            tasks_outstanding: Arc::new(AtomicUsize::new(0)),
            pending_tasks: Vec::new(),
            tasks_scheduled: false,
            outbound_closed: false,
            close_sent: false,
            inbound_closed: false,
            received_close: false,
            session_ready: false,
            fail_wrap: Arc::clone(&self.fail_wrap),
            fail_unwrap: Arc::clone(&self.fail_unwrap),
        })
    }
}

/// Runs blocking jobs inline; fully deterministic.
pub struct InlineRuntime;

impl Runtime for InlineRuntime {
    fn submit_blocking(&self, job: Job) {
        job();
    }

    fn post_to_event_loop(&self, job: Job, _tag: Option<DomainTag>) {
        job();
    }
}

/// Runs blocking jobs on their own thread and records posted domain tags.
pub struct ThreadRuntime {
    tag: Option<DomainTag>,
    pub posted_tags: Mutex<Vec<Option<DomainTag>>>,
}

impl ThreadRuntime {
    pub fn new(tag: Option<DomainTag>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            posted_tags: Mutex::new(Vec::new()),
        })
    }
}

impl Runtime for ThreadRuntime {
    fn submit_blocking(&self, job: Job) {
        let _ = std::thread::spawn(move || job());
    }

    fn post_to_event_loop(&self, job: Job, tag: Option<DomainTag>) {
        self.posted_tags.lock().unwrap().push(tag);
        job();
    }

    fn current_domain_tag(&self) -> Option<DomainTag> {
        self.tag
    }
}

/// Accepts every chain.
pub struct AlwaysTrust;

impl TrustStore for AlwaysTrust {
    fn check_client_trusted(
        &self,
        _chain: &[Certificate],
        _algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        Ok(())
    }

    fn check_server_trusted(
        &self,
        _chain: &[Certificate],
        _algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        Ok(())
    }
}

/// Rejects every chain with the given message.
pub struct RejectAll(pub String);

impl TrustStore for RejectAll {
    fn check_client_trusted(
        &self,
        _chain: &[Certificate],
        _algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        Err(CertificateError(self.0.clone()))
    }

    fn check_server_trusted(
        &self,
        _chain: &[Certificate],
        _algorithm: KeyExchangeAlgorithm,
    ) -> Result<(), CertificateError> {
        Err(CertificateError(self.0.clone()))
    }
}

/// Records everything the connection's callbacks deliver.
#[derive(Default)]
pub struct Sink {
    pub writes: Mutex<Vec<(Option<Bytes>, bool)>>,
    pub reads: Mutex<Vec<(Option<Bytes>, i32)>>,
    pub errors: Mutex<Vec<Error>>,
    pub hs_start: AtomicUsize,
    pub hs_done: AtomicUsize,
    pub events: Mutex<Vec<String>>,
}

impl Sink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Drains recorded ciphertext buffers, dropping shutdown flags.
    pub fn take_write_bufs(&self) -> Vec<Bytes> {
        self.writes
            .lock()
            .unwrap()
            .drain(..)
            .filter_map(|(buf, _)| buf)
            .collect()
    }

    /// All plaintext delivered so far, concatenated.
    pub fn read_plaintext(&self) -> Vec<u8> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(buf, _)| buf.as_ref())
            .flat_map(|buf| buf.iter().copied())
            .collect()
    }

    pub fn read_entries(&self) -> Vec<(Option<Bytes>, i32)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn event_log(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn push_event(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

/// Installs recording callbacks. Completion callbacks handed to the write
/// callback are invoked right after the bytes are recorded, standing in for
/// the transport's "sent" notification.
pub fn wire(conn: &mut Connection, sink: &Arc<Sink>) {
    let s = Arc::clone(sink);
    conn.set_write_callback(Box::new(move |buf, shutdown, cb| {
        s.push_event(format!(
            "write:{}:{}",
            buf.as_ref().map_or(0, |b| b.len()),
            shutdown
        ));
        s.writes.lock().unwrap().push((buf, shutdown));
        if let Some(cb) = cb {
            cb(None);
        }
    }));
    let s = Arc::clone(sink);
    conn.set_read_callback(Box::new(move |buf, err| {
        s.push_event(format!(
            "read:{}:{}",
            buf.as_ref().map_or(0, |b| b.len()),
            err
        ));
        s.reads.lock().unwrap().push((buf, err));
    }));
    let s = Arc::clone(sink);
    conn.set_handshake_start_callback(Box::new(move || {
        s.hs_start.fetch_add(1, Ordering::SeqCst);
        s.push_event("hs_start");
    }));
    let s = Arc::clone(sink);
    conn.set_handshake_done_callback(Box::new(move || {
        s.hs_done.fetch_add(1, Ordering::SeqCst);
        s.push_event("hs_done");
    }));
    let s = Arc::clone(sink);
    conn.set_error_callback(Box::new(move |err| {
        s.push_event(format!("error:{err}"));
        s.errors.lock().unwrap().push(err);
    }));
}

/// A wired connection plus its shared fixtures.
pub struct TestConn {
    pub conn: Connection,
    pub sink: Arc<Sink>,
    pub stats: Arc<FakeStats>,
    pub fail_wrap: Arc<Mutex<Option<EngineError>>>,
    pub fail_unwrap: Arc<Mutex<Option<EngineError>>>,
}

pub fn make_conn(
    role: Role,
    config: FakeConfig,
    runtime: Arc<dyn Runtime>,
    trust: Option<Arc<dyn TrustStore>>,
) -> TestConn {
    let server_name = (role == Role::Client).then(|| "example.test".to_string());
    let mut conn = Connection::new(runtime, role, server_name, 443);
    let ctx = FakeContext::new(config);
    let stats = ctx.stats();
    let fail_wrap = ctx.fail_wrap_handle();
    let fail_unwrap = ctx.fail_unwrap_handle();
    conn.init(&ctx, None, trust);
    let sink = Sink::new();
    wire(&mut conn, &sink);
    TestConn {
        conn,
        sink,
        stats,
        fail_wrap,
        fail_unwrap,
    }
}

pub fn client_with(config: FakeConfig) -> TestConn {
    make_conn(
        Role::Client,
        config,
        Arc::new(InlineRuntime),
        Some(Arc::new(AlwaysTrust)),
    )
}

pub fn server_with(config: FakeConfig) -> TestConn {
    make_conn(
        Role::Server,
        config,
        Arc::new(InlineRuntime),
        Some(Arc::new(AlwaysTrust)),
    )
}

pub fn client() -> TestConn {
    client_with(FakeConfig::default())
}

pub fn server() -> TestConn {
    server_with(FakeConfig::default())
}

/// Shuttles recorded ciphertext between the two peers until neither side
/// produces anything new.
pub async fn pump(a: &mut TestConn, b: &mut TestConn) -> Result<(), Error> {
    loop {
        let mut moved = false;
        for buf in a.sink.take_write_bufs() {
            moved = true;
            b.conn.unwrap(buf, None).await?;
        }
        for buf in b.sink.take_write_bufs() {
            moved = true;
            a.conn.unwrap(buf, None).await?;
        }
        if !moved {
            return Ok(());
        }
    }
}

/// Drives the client/server pair through a complete handshake.
pub async fn handshake(client: &mut TestConn, server: &mut TestConn) -> Result<(), Error> {
    client.conn.start().await?;
    pump(client, server).await?;
    assert!(client.conn.is_init_finished());
    assert!(server.conn.is_init_finished());
    Ok(())
}
