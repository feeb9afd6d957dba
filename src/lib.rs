//! Spindle: a sharded in-memory key-value server.
//!
//! The server speaks the RESP protocol and, on a second listener, the
//! memcache text protocol. The keyspace is partitioned across shard
//! threads; each shard exclusively owns its slice of the data and its
//! pub/sub channel registry, and all cross-shard access happens by
//! posting work onto the owning shard.
//!
//! # Architecture
//!
//! - One engine shard per worker thread, mutated only from its own task
//!   queue
//! - Per connection: a reader thread plus a dispatch worker draining a
//!   shared frame queue, so command replies and pub/sub deliveries are
//!   serialized through one writer
//! - Compact open-addressed string sets with neighbor displacement back
//!   set values and subscription records

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// I/O utilities including the connection read buffer
pub mod io;

/// Network layer: connection sessions, dispatch queue, reply builder
pub mod network;

/// Wire protocols (RESP and memcache text) and the command layer
pub mod protocol;

/// Pub/sub channel registries and subscription plumbing
pub mod pubsub;

/// Core server implementation
pub mod server;

/// Shard threads and cross-shard task posting
pub mod shard;

/// Keyspace storage: per-shard store and the string set
pub mod storage;

/// Small synchronization primitives
pub mod sync;

/// Global client registry
pub mod client_registry;

pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
