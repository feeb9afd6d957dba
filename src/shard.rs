use crate::pubsub::ChannelRegistry;
use crate::storage::Store;
use crate::sync::BlockingCounter;
use ahash::RandomState;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// One keyspace partition, owned exclusively by its worker thread. All
/// mutation happens inside tasks posted to that thread.
pub struct EngineShard {
    pub shard_id: usize,
    pub store: Store,
    pub channels: ChannelRegistry,
}

impl EngineShard {
    fn new(shard_id: usize) -> Self {
        Self {
            shard_id,
            store: Store::new(),
            channels: ChannelRegistry::new(),
        }
    }
}

enum ShardMsg {
    Run(Box<dyn FnOnce(&mut EngineShard) + Send>),
    Stop,
}

/// The set of shard threads plus the posting primitives everything else
/// routes through.
pub struct ShardSet {
    senders: Vec<Sender<ShardMsg>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    hasher: RandomState,
}

impl ShardSet {
    /// Spawn `n` shard threads.
    pub fn new(n: usize) -> Arc<Self> {
        assert!(n > 0, "shard count must be positive");

        let mut senders = Vec::with_capacity(n);
        let mut handles = Vec::with_capacity(n);

        for shard_id in 0..n {
            let (tx, rx) = unbounded::<ShardMsg>();
            senders.push(tx);

            let handle = std::thread::Builder::new()
                .name(format!("shard-{}", shard_id))
                .spawn(move || {
                    let mut shard = EngineShard::new(shard_id);
                    debug!("shard {} started", shard_id);
                    while let Ok(msg) = rx.recv() {
                        match msg {
                            ShardMsg::Run(task) => task(&mut shard),
                            ShardMsg::Stop => break,
                        }
                    }
                    debug!("shard {} stopped", shard_id);
                })
                .expect("failed to spawn shard thread");
            handles.push(handle);
        }

        Arc::new(Self {
            senders,
            handles: Mutex::new(handles),
            hasher: RandomState::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.senders.len()
    }

    /// Deterministic key → shard mapping.
    pub fn shard_of(&self, key: &[u8]) -> usize {
        (self.hasher.hash_one(key) % self.senders.len() as u64) as usize
    }

    /// Run `f` on shard `sid` and wait for its result. Returns `None`
    /// only when the shard set is already stopping.
    pub fn run_on<R, F>(&self, sid: usize, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let task = ShardMsg::Run(Box::new(move |shard: &mut EngineShard| {
            let _ = tx.send(f(shard));
        }));
        if self.senders[sid].send(task).is_err() {
            return None;
        }
        rx.recv().ok()
    }

    /// Post a brief task to every shard passing `pred` and wait until
    /// all of them have completed.
    pub fn run_brief_in_parallel<F, P>(&self, f: F, pred: P)
    where
        F: Fn(&mut EngineShard) + Send + Sync + 'static,
        P: Fn(usize) -> bool,
    {
        let f = Arc::new(f);
        let done = BlockingCounter::new(0);

        for (sid, sender) in self.senders.iter().enumerate() {
            if !pred(sid) {
                continue;
            }
            done.inc();
            let f = Arc::clone(&f);
            let done_task = done.clone();
            let task = ShardMsg::Run(Box::new(move |shard: &mut EngineShard| {
                f(shard);
                done_task.dec();
            }));
            if sender.send(task).is_err() {
                done.dec();
            }
        }

        done.wait();
    }

    /// Stop and join every shard thread. Idempotent.
    pub fn stop(&self) {
        for sender in &self.senders {
            let _ = sender.send(ShardMsg::Stop);
        }
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn run_on_returns_task_result() {
        let shards = ShardSet::new(2);
        let len = shards.run_on(0, |shard| {
            shard.store.set_str(b"k", Bytes::from_static(b"v"), 0);
            shard.store.len()
        });
        assert_eq!(len, Some(1));
        shards.stop();
    }

    #[test]
    fn shard_of_is_stable_and_in_range(){
        let shards = ShardSet::new(4);
        for key in [&b"alpha"[..], b"beta", b"gamma", b""] {
            let sid = shards.shard_of(key);
            assert!(sid < 4);
            assert_eq!(sid, shards.shard_of(key));
        }
        shards.stop();
    }

    #[test]
    fn parallel_brief_reaches_selected_shards() {
        let shards = ShardSet::new(4);
        shards.run_brief_in_parallel(
            |shard| {
                shard
                    .store
                    .set_str(b"mark", Bytes::from_static(b"x"), 0);
            },
            |sid| sid % 2 == 0,
        );
        for sid in 0..4 {
            let marked = shards.run_on(sid, |shard| shard.store.exists(b"mark"));
            assert_eq!(marked, Some(sid % 2 == 0));
        }
        shards.stop();
    }

    #[test]
    fn run_on_after_stop_reports_shutdown() {
        let shards = ShardSet::new(1);
        shards.stop();
        assert!(shards.run_on(0, |_| ()).is_none());
    }
}
