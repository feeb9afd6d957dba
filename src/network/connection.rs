use crate::client_registry::ClientRegistry;
use crate::config::Config;
use crate::error::{Error, ProtocolError};
use crate::io::ReadBuf;
use crate::network::dispatch::{
    run_dispatch_worker, CommandFrame, DispatchState, Frame, McFrame, PubFrame, QUEUE_SOFT_CAP,
};
use crate::network::reply::ReplyBuilder;
use crate::protocol::command::executor;
use crate::protocol::memcache::{self, McParseResult};
use crate::protocol::resp::{self, ParseResult};
use crate::protocol::Protocol;
use crate::pubsub::handler;
use crate::pubsub::SubscriptionRecord;
use crate::shard::ShardSet;
use bytes::Bytes;
use memchr::memchr;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Cadence at which a blocked reader re-checks the closing flag.
const READ_POLL: Duration = Duration::from_millis(100);

/// HTTP probe gives up after this many bytes without a newline.
const HTTP_PROBE_LIMIT: usize = 1024;

/// Connection activity phase, published for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadSock = 0,
    Process = 1,
    Wait = 2,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ReadSock => "readsock",
            Phase::Process => "process",
            Phase::Wait => "wait",
        }
    }

    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::ReadSock,
            1 => Phase::Process,
            _ => Phase::Wait,
        }
    }
}

pub type ShutdownCb = Box<dyn FnOnce() + Send>;
pub type ShutdownHandle = u32;

struct ShutdownHooks {
    map: BTreeMap<ShutdownHandle, ShutdownCb>,
    next_handle: ShutdownHandle,
}

/// Connection state shared between the reader thread, the dispatch
/// worker, the client registry, and publishers on other threads.
pub struct ConnShared {
    pub id: u64,
    pub protocol: Protocol,
    pub peer_addr: SocketAddr,
    created_at: u64,
    last_interaction: AtomicU64,
    phase: AtomicU8,

    /// Forces the reader to enqueue rather than inline-dispatch while a
    /// subscription record exists, so deliveries can interleave.
    pub force_dispatch: AtomicBool,

    pub dispatch: Mutex<DispatchState>,
    pub wake: Condvar,
    pub builder: Mutex<ReplyBuilder>,
    pub subs: Mutex<Option<SubscriptionRecord>>,
    hooks: Mutex<Option<ShutdownHooks>>,
}

impl ConnShared {
    pub fn new(
        id: u64,
        protocol: Protocol,
        peer_addr: SocketAddr,
        builder: ReplyBuilder,
    ) -> Self {
        let now = now_secs();
        Self {
            id,
            protocol,
            peer_addr,
            created_at: now,
            last_interaction: AtomicU64::new(now),
            phase: AtomicU8::new(Phase::Process as u8),
            force_dispatch: AtomicBool::new(false),
            dispatch: Mutex::new(DispatchState::new()),
            wake: Condvar::new(),
            builder: Mutex::new(builder),
            subs: Mutex::new(None),
            hooks: Mutex::new(None),
        }
    }

    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn touch(&self) {
        self.last_interaction.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_closing(&self) -> bool {
        self.dispatch.lock().closing
    }

    pub fn set_closing_and_wake(&self) {
        self.dispatch.lock().closing = true;
        self.wake.notify_all();
    }

    /// Queue a command frame from the reader; returns the queue depth.
    pub fn enqueue_command(&self, frame: CommandFrame) -> usize {
        self.enqueue(Frame::Command(frame))
    }

    pub fn enqueue_mc(&self, frame: McFrame) -> usize {
        self.enqueue(Frame::Mc(frame))
    }

    /// Asynchronous enqueue entry point for publishers. Thread-safe;
    /// a delivery to a closing connection releases its borrow token
    /// immediately instead of queueing.
    pub fn enqueue_pub(&self, frame: PubFrame) {
        let mut st = self.dispatch.lock();
        if st.closing {
            drop(st);
            frame.borrow.dec();
            return;
        }
        st.queue.push_back(Frame::Pub(frame));
        if st.queue.len() == 1 {
            self.wake.notify_one();
        }
    }

    fn enqueue(&self, frame: Frame) -> usize {
        let mut st = self.dispatch.lock();
        st.queue.push_back(frame);
        let depth = st.queue.len();
        if depth == 1 {
            self.wake.notify_one();
        }
        depth
    }

    pub fn register_shutdown_hook(&self, cb: ShutdownCb) -> ShutdownHandle {
        let mut hooks = self.hooks.lock();
        let hooks = hooks.get_or_insert_with(|| ShutdownHooks {
            map: BTreeMap::new(),
            next_handle: 1,
        });
        let handle = hooks.next_handle;
        hooks.next_handle += 1;
        hooks.map.insert(handle, cb);
        handle
    }

    pub fn unregister_shutdown_hook(&self, handle: ShutdownHandle) {
        let mut hooks = self.hooks.lock();
        if let Some(inner) = hooks.as_mut() {
            inner.map.remove(&handle);
            if inner.map.is_empty() {
                *hooks = None;
            }
        }
    }

    /// Run registered hooks once, in registration order.
    pub fn run_shutdown_hooks(&self) {
        let taken = self.hooks.lock().take();
        if let Some(hooks) = taken {
            for (_, cb) in hooks.map {
                cb();
            }
        }
    }

    pub fn client_info(&self) -> String {
        let now = now_secs();
        format!(
            "id={} addr={} proto={} phase={} age={} idle={}",
            self.id,
            self.peer_addr,
            self.protocol.as_str(),
            self.phase().as_str(),
            now.saturating_sub(self.created_at),
            now.saturating_sub(self.last_interaction.load(Ordering::Relaxed)),
        )
    }
}

/// Everything command execution needs: the connection plus the shard
/// set it dispatches against.
#[derive(Clone)]
pub struct ConnContext {
    pub shared: Arc<ConnShared>,
    pub shards: Arc<ShardSet>,
}

enum SessionExit {
    PeerClosed,
    LocalClose,
    BuilderError,
    Io(std::io::Error),
    Parse(ProtocolError),
}

enum InputStatus {
    /// All buffered complete frames were handled.
    Flowing,
    /// The next frame is incomplete; grow/refill per the hint.
    NeedMore(Option<usize>),
    /// Unrecoverable protocol violation.
    Bad(ProtocolError),
}

/// Drive one client connection to completion. Runs on a dedicated
/// session thread; spawns the connection's dispatch worker.
pub fn run_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    protocol: Protocol,
    conn_id: u64,
    shards: Arc<ShardSet>,
    registry: Arc<ClientRegistry>,
    config: Arc<Config>,
) {
    if config.tcp_nodelay {
        let _ = stream.set_nodelay(true);
    }
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL)) {
        error!("failed to configure socket for {}: {}", peer_addr, e);
        return;
    }
    let sink = match stream.try_clone() {
        Ok(sink) => sink,
        Err(e) => {
            error!("failed to clone socket for {}: {}", peer_addr, e);
            return;
        }
    };

    let shared = Arc::new(ConnShared::new(
        conn_id,
        protocol,
        peer_addr,
        ReplyBuilder::new(sink),
    ));
    let cc = ConnContext {
        shared: Arc::clone(&shared),
        shards,
    };
    registry.register(Arc::clone(&shared));

    let mut sock = stream;
    let mut buf = ReadBuf::with_capacity(config.read_buf_min);

    // The first line decides whether this is actually an HTTP admin
    // request; any non-HTTP bytes read during the probe are retained.
    if config.http_admin_console {
        match check_for_http(&mut sock, &mut buf, &cc) {
            Ok(true) => {
                debug!("HTTP/1.1 identified on {}", shared.client_info());
                serve_http(&cc);
                registry.unregister(conn_id);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                let err = Error::Io(e);
                if !err.is_normal_close() {
                    warn!("socket error during probe on {}: {}", peer_addr, err);
                }
                registry.unregister(conn_id);
                return;
            }
        }
    }

    let worker = {
        let wcc = cc.clone();
        thread::Builder::new()
            .name(format!("conn-{}-dispatch", conn_id))
            .spawn(move || run_dispatch_worker(&wcc))
    };
    let worker = match worker {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to spawn dispatch worker for {}: {}", peer_addr, e);
            registry.unregister(conn_id);
            return;
        }
    };

    let exit = io_loop(&mut sock, &mut buf, &cc, &config);

    shared.set_closing_and_wake();
    let _ = worker.join();

    // Worker has drained its queue; subscription teardown can now wait
    // for in-flight publisher handoffs.
    handler::on_close(&cc);

    match exit {
        SessionExit::Parse(pe) => {
            // the offending request is answered only after every prior
            // queued reply went out
            let mut builder = shared.builder.lock();
            builder.set_batch_mode(false);
            builder.send_raw(&pe.to_resp());
        }
        SessionExit::Io(e) => {
            let err = Error::Io(e);
            if !err.is_normal_close() {
                warn!("socket error on {}: {}", shared.client_info(), err);
            }
        }
        SessionExit::PeerClosed | SessionExit::LocalClose | SessionExit::BuilderError => {}
    }

    debug!("closed connection {}", shared.client_info());
    registry.unregister(conn_id);
}

fn io_loop(
    sock: &mut TcpStream,
    buf: &mut ReadBuf,
    cc: &ConnContext,
    config: &Config,
) -> SessionExit {
    loop {
        let status = match cc.shared.protocol {
            Protocol::Resp => process_resp_input(buf, cc),
            Protocol::Memcache => process_mc_input(buf, cc),
        };

        match status {
            InputStatus::Flowing => {}
            InputStatus::NeedMore(hint) => {
                let capacity = buf.capacity();
                match hint {
                    Some(hint) if hint > capacity => buf.reserve(hint),
                    _ => {
                        if buf.is_full() {
                            if capacity < config.read_buf_max {
                                buf.reserve((capacity * 2).min(config.read_buf_max));
                            } else {
                                // oversized frame with no hint; keep
                                // making progress rather than stalling
                                buf.reserve(capacity * 2);
                            }
                        }
                    }
                }
            }
            InputStatus::Bad(pe) => return SessionExit::Parse(pe),
        }

        if cc.shared.is_closing() {
            return SessionExit::LocalClose;
        }
        if cc.shared.builder.lock().has_error() {
            return SessionExit::BuilderError;
        }

        cc.shared.set_phase(Phase::ReadSock);
        match sock.read(buf.append_slot()) {
            Ok(0) => return SessionExit::PeerClosed,
            Ok(n) => {
                buf.commit(n);
                cc.shared.touch();
                cc.shared.set_phase(Phase::Process);
            }
            Err(e) if is_poll_timeout(&e) => {
                if cc.shared.is_closing() {
                    return SessionExit::LocalClose;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return SessionExit::Io(e),
        }
    }
}

/// The inline fast-path predicate: allowed only when nothing is queued,
/// the worker is not mid-command, no subscription forces queueing, and
/// the parser left no pipelined follow-up in the buffer.
fn allow_inline(cc: &ConnContext, consumed_all: bool) -> bool {
    if !consumed_all || cc.shared.force_dispatch.load(Ordering::Relaxed) {
        return false;
    }
    let st = cc.shared.dispatch.lock();
    st.queue.is_empty() && !st.async_dispatch && !st.closing
}

fn process_resp_input(buf: &mut ReadBuf, cc: &ConnContext) -> InputStatus {
    loop {
        if buf.input_len() == 0 {
            return InputStatus::Flowing;
        }

        match resp::parse_command(buf.input()) {
            Ok(ParseResult::Complete { args, consumed }) => {
                if !args.is_empty() {
                    if allow_inline(cc, consumed == buf.input_len()) {
                        let slices: Vec<&[u8]> = args.iter().map(|a| &a[..]).collect();
                        executor::dispatch_command(&slices, cc);
                        cc.shared.touch();
                    } else {
                        let depth = cc.shared.enqueue_command(CommandFrame::from_args(&args));
                        if depth > QUEUE_SOFT_CAP {
                            thread::yield_now();
                        }
                    }
                }
                buf.consume(consumed);
                if cc.shared.is_closing() || cc.shared.builder.lock().has_error() {
                    return InputStatus::Flowing;
                }
            }
            Ok(ParseResult::Incomplete { hint }) => return InputStatus::NeedMore(hint),
            Err(pe) => return InputStatus::Bad(pe),
        }
    }
}

fn process_mc_input(buf: &mut ReadBuf, cc: &ConnContext) -> InputStatus {
    loop {
        if buf.input_len() == 0 {
            return InputStatus::Flowing;
        }

        match memcache::parse_command(buf.input()) {
            Ok(McParseResult::Complete { cmd, consumed }) => {
                let mut total = consumed;
                let mut value = Bytes::new();

                if cmd.verb.is_store() {
                    let need = consumed + cmd.bytes_len + 2;
                    if buf.input_len() < need {
                        return InputStatus::NeedMore(Some(need));
                    }
                    let input = buf.input();
                    if &input[consumed + cmd.bytes_len..need] != b"\r\n" {
                        if !cmd.noreply {
                            cc.shared.builder.lock().send_client_error("bad data chunk");
                        }
                        buf.consume(need);
                        continue;
                    }
                    value = Bytes::copy_from_slice(&input[consumed..consumed + cmd.bytes_len]);
                    total = need;
                }

                if allow_inline(cc, total == buf.input_len()) {
                    executor::dispatch_mc(&cmd, value, cc);
                    cc.shared.touch();
                } else {
                    let depth = cc.shared.enqueue_mc(McFrame { cmd, value });
                    if depth > QUEUE_SOFT_CAP {
                        thread::yield_now();
                    }
                }
                buf.consume(total);
                if cc.shared.is_closing() || cc.shared.builder.lock().has_error() {
                    return InputStatus::Flowing;
                }
            }
            Ok(McParseResult::Incomplete) => return InputStatus::NeedMore(None),
            Err(e) => {
                // memcache parse errors keep the connection open; skip
                // the offending line and resync
                cc.shared.builder.lock().send_raw(&e.to_wire());
                match memchr(b'\n', buf.input()) {
                    Some(pos) => buf.consume(pos + 1),
                    None => {
                        let len = buf.input_len();
                        buf.consume(len);
                    }
                }
            }
        }
    }
}

/// Read until the first newline and decide whether the peer is
/// speaking HTTP. Bytes consumed here stay buffered for the protocol
/// parser when the answer is no.
fn check_for_http(
    sock: &mut TcpStream,
    buf: &mut ReadBuf,
    cc: &ConnContext,
) -> std::io::Result<bool> {
    let mut scanned = 0usize;
    loop {
        cc.shared.set_phase(Phase::ReadSock);
        match sock.read(buf.append_slot()) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                buf.commit(n);
                cc.shared.touch();
                cc.shared.set_phase(Phase::Process);
            }
            Err(e) if is_poll_timeout(&e) => {
                if cc.shared.is_closing() {
                    return Ok(false);
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }

        let input = buf.input();
        if let Some(rel) = memchr(b'\n', &input[scanned..]) {
            let line_end = scanned + rel;
            if line_end == 0 || input[line_end - 1] != b'\r' {
                return Ok(false);
            }
            let line = &input[..line_end - 1];
            return Ok(line.starts_with(b"GET ") && line.ends_with(b" HTTP/1.1"));
        }

        scanned = buf.input_len();
        if scanned >= HTTP_PROBE_LIMIT {
            return Ok(false);
        }
        if buf.is_full() {
            buf.reserve((buf.capacity() * 2).min(HTTP_PROBE_LIMIT * 2));
        }
    }
}

/// Minimal admin console answer; the connection closes afterwards.
fn serve_http(cc: &ConnContext) {
    let body = format!(
        "spindle-server {}\nshards: {}\n",
        env!("CARGO_PKG_VERSION"),
        cc.shards.size()
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    cc.shared.builder.lock().send_raw(response.as_bytes());
}

fn is_poll_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
