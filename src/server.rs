use crate::client_registry::ClientRegistry;
use crate::config::Config;
use crate::error::Result;
use crate::network;
use crate::protocol::Protocol;
use crate::shard::ShardSet;
use once_cell::sync::OnceCell;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Accept-loop poll cadence while idle.
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// How long shutdown waits for session threads to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Sharded key-value server speaking RESP and, optionally, the
/// memcache text protocol on a second listener.
pub struct Server {
    config: Config,
    shards: Arc<ShardSet>,
    registry: Arc<ClientRegistry>,
    shutdown: AtomicBool,
    active_connections: AtomicUsize,
    next_conn_id: AtomicU64,
    resp_addr: OnceCell<SocketAddr>,
    memcache_addr: OnceCell<SocketAddr>,
}

impl Server {
    /// Create a new server with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let shards = ShardSet::new(config.threads);

        Ok(Self {
            config,
            shards,
            registry: Arc::new(ClientRegistry::new()),
            shutdown: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            next_conn_id: AtomicU64::new(1),
            resp_addr: OnceCell::new(),
            memcache_addr: OnceCell::new(),
        })
    }

    /// Run the server. Blocks until [`shutdown`](Self::shutdown) is
    /// called, then drains sessions and stops the shard threads.
    pub fn run(self: Arc<Self>) -> Result<()> {
        let resp_listener = self.bind(self.config.port)?;
        let resp_addr = resp_listener.local_addr()?;
        let _ = self.resp_addr.set(resp_addr);
        info!("RESP listener on {}", resp_addr);

        let mc_handle = match self.config.memcache_port {
            Some(port) => {
                let listener = self.bind(port)?;
                let addr = listener.local_addr()?;
                let _ = self.memcache_addr.set(addr);
                info!("memcache listener on {}", addr);

                let server = Arc::clone(&self);
                Some(
                    thread::Builder::new()
                        .name("accept-memcache".to_string())
                        .spawn(move || server.accept_loop(listener, Protocol::Memcache))
                        .map_err(std::io::Error::from)?,
                )
            }
            None => None,
        };

        self.accept_loop(resp_listener, Protocol::Resp);
        if let Some(handle) = mc_handle {
            let _ = handle.join();
        }

        // catch connections accepted while the shutdown sweep ran
        self.registry.shutdown_all();
        self.wait_for_sessions();
        self.shards.stop();

        info!("server stopped");
        Ok(())
    }

    /// Signal the server to shut down gracefully: run every
    /// connection's shutdown hooks, mark sessions closing, and stop
    /// accepting.
    pub fn shutdown(&self) {
        info!("initiating server shutdown");
        self.shutdown.store(true, Ordering::Release);
        self.registry.shutdown_all();
    }

    /// Get the number of active client connections
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Bound RESP address; set once [`run`](Self::run) has started.
    pub fn resp_addr(&self) -> Option<SocketAddr> {
        self.resp_addr.get().copied()
    }

    /// Bound memcache address, when that listener is configured.
    pub fn memcache_addr(&self) -> Option<SocketAddr> {
        self.memcache_addr.get().copied()
    }

    pub fn client_infos(&self) -> Vec<String> {
        self.registry.client_infos()
    }

    fn bind(&self, port: u16) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.config.bind_addr.as_str(), port))?;
        listener.set_nonblocking(true)?;
        Ok(listener)
    }

    fn accept_loop(self: &Arc<Self>, listener: TcpListener, protocol: Protocol) {
        while !self.shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("new {} connection from {}", protocol.as_str(), peer_addr);
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }

                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    self.active_connections.fetch_add(1, Ordering::Relaxed);

                    let server = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name(format!("conn-{}", conn_id))
                        .spawn(move || {
                            network::run_session(
                                stream,
                                peer_addr,
                                protocol,
                                conn_id,
                                Arc::clone(&server.shards),
                                Arc::clone(&server.registry),
                                Arc::new(server.config.clone()),
                            );
                            server.active_connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    if spawned.is_err() {
                        error!("failed to spawn session thread for {}", peer_addr);
                        self.active_connections.fetch_sub(1, Ordering::Relaxed);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    error!("accept error on {} listener: {}", protocol.as_str(), e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn wait_for_sessions(&self) {
        let deadline = std::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active_connections() > 0 {
            if std::time::Instant::now() >= deadline {
                error!(
                    "{} session(s) still draining at shutdown",
                    self.active_connections()
                );
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}
