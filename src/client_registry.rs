use crate::network::ConnShared;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Global registry of live connections, keyed by connection id.
///
/// Holds the shared half of each connection so server shutdown can run
/// per-connection hooks and mark every session closing before the
/// listeners go away.
pub struct ClientRegistry {
    clients: DashMap<u64, Arc<ConnShared>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Arc<ConnShared>) {
        self.clients.insert(conn.id, conn);
    }

    pub fn unregister(&self, conn_id: u64) {
        self.clients.remove(&conn_id);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Info lines for every live connection.
    pub fn client_infos(&self) -> Vec<String> {
        self.clients
            .iter()
            .map(|entry| entry.value().client_info())
            .collect()
    }

    /// Shutdown sweep: run each connection's ordered shutdown hooks
    /// once, then mark it closing and wake its dispatch worker.
    pub fn shutdown_all(&self) {
        for entry in self.clients.iter() {
            let conn = entry.value();
            debug!("shutting down connection {}", conn.client_info());
            conn.run_shutdown_hooks();
            conn.set_closing_and_wake();
        }
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ReplyBuilder;
    use crate::protocol::Protocol;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_conn(id: u64) -> Arc<ConnShared> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).unwrap();
        let (sink, _) = listener.accept().unwrap();
        Arc::new(ConnShared::new(
            id,
            Protocol::Resp,
            addr,
            ReplyBuilder::new(sink),
        ))
    }

    #[test]
    fn register_and_unregister() {
        let registry = ClientRegistry::new();
        let conn = test_conn(1);
        registry.register(Arc::clone(&conn));
        assert_eq!(registry.client_count(), 1);
        assert_eq!(registry.client_infos().len(), 1);
        registry.unregister(1);
        assert_eq!(registry.client_count(), 0);
    }

    #[test]
    fn shutdown_sweep_runs_hooks_in_order_and_closes() {
        let registry = ClientRegistry::new();
        let conn = test_conn(1);
        registry.register(Arc::clone(&conn));

        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&order);
        conn.register_shutdown_hook(Box::new(move || {
            first.compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst).ok();
        }));
        let second = Arc::clone(&order);
        conn.register_shutdown_hook(Box::new(move || {
            second.compare_exchange(1, 2, Ordering::SeqCst, Ordering::SeqCst).ok();
        }));

        registry.shutdown_all();
        assert_eq!(order.load(Ordering::SeqCst), 2);
        assert!(conn.is_closing());

        // hooks run once
        conn.run_shutdown_hooks();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unregistered_hook_does_not_run() {
        let conn = test_conn(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let handle = conn.register_shutdown_hook(Box::new(move || {
            flag.fetch_add(1, Ordering::SeqCst);
        }));
        conn.unregister_shutdown_hook(handle);
        conn.run_shutdown_hooks();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
