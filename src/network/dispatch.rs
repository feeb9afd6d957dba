use crate::network::connection::{ConnContext, Phase};
use crate::protocol::command::executor;
use crate::protocol::memcache::McCommand;
use crate::sync::BlockingCounter;
use bytes::Bytes;
use std::collections::VecDeque;

/// Reader yields to the worker once the queue backs up this far.
pub const QUEUE_SOFT_CAP: usize = 10;

/// One unit of work for the dispatch worker; each frame produces one
/// reply on the wire.
pub enum Frame {
    Command(CommandFrame),
    Mc(McFrame),
    Pub(PubFrame),
}

/// A parsed command whose argument bytes live in one contiguous arena
/// owned by the frame, so queued commands never borrow the read buffer.
pub struct CommandFrame {
    storage: Box<[u8]>,
    ends: Vec<u32>,
}

impl CommandFrame {
    pub fn from_args(args: &[Bytes]) -> Self {
        let total: usize = args.iter().map(|a| a.len()).sum();
        let mut storage = Vec::with_capacity(total);
        let mut ends = Vec::with_capacity(args.len());
        for arg in args {
            storage.extend_from_slice(arg);
            ends.push(storage.len() as u32);
        }
        Self {
            storage: storage.into_boxed_slice(),
            ends,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.ends.len()
    }

    pub fn args(&self) -> Vec<&[u8]> {
        let mut out = Vec::with_capacity(self.ends.len());
        let mut start = 0usize;
        for &end in &self.ends {
            out.push(&self.storage[start..end as usize]);
            start = end as usize;
        }
        out
    }
}

/// A memcache command plus its already-framed payload.
pub struct McFrame {
    pub cmd: McCommand,
    pub value: Bytes,
}

/// An asynchronous pub/sub delivery. The frame owns copies of the
/// payload bytes; `borrow` is the subscriber's borrow token, released
/// once the delivery lands in the connection's own output (or when the
/// frame is freed unprocessed on shutdown).
pub struct PubFrame {
    pub pattern: Option<Bytes>,
    pub channel: Bytes,
    pub message: Bytes,
    pub borrow: BlockingCounter,
}

/// Queue state shared by the reader and the worker. `async_dispatch`
/// lives under the same lock as the queue: the reader's inline check
/// and the worker's pop-and-mark are atomic relative to each other, so
/// an inline dispatch can never overlap a queued command mid-flight.
pub struct DispatchState {
    pub queue: VecDeque<Frame>,
    pub async_dispatch: bool,
    pub closing: bool,
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            async_dispatch: false,
            closing: false,
        }
    }
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection dispatch worker.
///
/// Drains the frame queue in FIFO order so every reply leaves the
/// socket in enqueue order, interleaving pub/sub deliveries with
/// pipelined command replies. Exits once the connection is closing or
/// the writer has failed, then frees whatever is still queued,
/// releasing borrow tokens so publishers never block on a dead peer.
pub fn run_dispatch_worker(cc: &ConnContext) {
    'outer: loop {
        let frame;
        let more;
        {
            let mut st = cc.shared.dispatch.lock();
            loop {
                if st.closing {
                    break 'outer;
                }
                if let Some(f) = st.queue.pop_front() {
                    if matches!(f, Frame::Command(_) | Frame::Mc(_)) {
                        st.async_dispatch = true;
                    }
                    more = !st.queue.is_empty();
                    frame = f;
                    break;
                }
                cc.shared.set_phase(Phase::Wait);
                cc.shared.wake.wait(&mut st);
            }
        }

        cc.shared.set_phase(Phase::Process);
        match frame {
            Frame::Command(f) => {
                cc.shared.builder.lock().set_batch_mode(more);
                executor::dispatch_command(&f.args(), cc);
                cc.shared.touch();
                cc.shared.dispatch.lock().async_dispatch = false;
            }
            Frame::Mc(McFrame { cmd, value }) => {
                cc.shared.builder.lock().set_batch_mode(more);
                executor::dispatch_mc(&cmd, value, cc);
                cc.shared.touch();
                cc.shared.dispatch.lock().async_dispatch = false;
            }
            Frame::Pub(m) => {
                {
                    let mut builder = cc.shared.builder.lock();
                    builder.set_batch_mode(more);
                    match &m.pattern {
                        Some(pattern) => builder.send_str_arr(&[
                            b"pmessage",
                            &pattern[..],
                            &m.channel[..],
                            &m.message[..],
                        ]),
                        None => {
                            builder.send_str_arr(&[b"message", &m.channel[..], &m.message[..]])
                        }
                    }
                }
                // payload is now in our own output buffer
                m.borrow.dec();
            }
        }

        if cc.shared.builder.lock().has_error() {
            break;
        }
    }

    let mut st = cc.shared.dispatch.lock();
    st.closing = true;
    while let Some(frame) = st.queue.pop_front() {
        if let Frame::Pub(m) = frame {
            m.borrow.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::connection::ConnShared;
    use crate::network::reply::ReplyBuilder;
    use crate::protocol::Protocol;
    use crate::shard::ShardSet;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::thread;

    fn test_context() -> (ConnContext, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).unwrap();
        let (sink, _) = listener.accept().unwrap();

        let shared = Arc::new(ConnShared::new(
            1,
            Protocol::Resp,
            addr,
            ReplyBuilder::new(sink),
        ));
        let cc = ConnContext {
            shared,
            shards: ShardSet::new(1),
        };
        (cc, peer)
    }

    fn pub_frame(channel: &[u8], message: &[u8], borrow: &BlockingCounter) -> PubFrame {
        borrow.inc();
        PubFrame {
            pattern: None,
            channel: Bytes::copy_from_slice(channel),
            message: Bytes::copy_from_slice(message),
            borrow: borrow.clone(),
        }
    }

    #[test]
    fn command_frame_arena_preserves_args() {
        let frame = CommandFrame::from_args(&[
            Bytes::from_static(b"SET"),
            Bytes::from_static(b"key"),
            Bytes::from_static(b"value"),
        ]);
        assert_eq!(frame.arg_count(), 3);
        assert_eq!(frame.args(), vec![&b"SET"[..], b"key", b"value"]);
    }

    #[test]
    fn worker_emits_frames_in_enqueue_order() {
        let (cc, mut peer) = test_context();
        let borrow = BlockingCounter::new(0);

        cc.shared
            .enqueue_command(CommandFrame::from_args(&[Bytes::from_static(b"PING")]));
        cc.shared.enqueue_pub(pub_frame(b"c1", b"hi", &borrow));

        let wcc = cc.clone();
        let worker = thread::spawn(move || run_dispatch_worker(&wcc));

        let mut expected = Vec::new();
        expected.extend_from_slice(b"+PONG\r\n");
        expected.extend_from_slice(b"*3\r\n$7\r\nmessage\r\n$2\r\nc1\r\n$2\r\nhi\r\n");
        let mut got = vec![0u8; expected.len()];
        peer.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
        assert_eq!(borrow.get(), 0);

        cc.shared.set_closing_and_wake();
        worker.join().unwrap();
        cc.shards.stop();
    }

    #[test]
    fn worker_releases_borrow_tokens_on_close() {
        let (cc, _peer) = test_context();
        let borrow = BlockingCounter::new(0);

        for i in 0..3 {
            cc.shared
                .enqueue_pub(pub_frame(b"c1", format!("m{}", i).as_bytes(), &borrow));
        }
        assert_eq!(borrow.get(), 3);

        // close before the worker ever runs: the drain path must still
        // release every token
        cc.shared.set_closing_and_wake();
        let wcc = cc.clone();
        let worker = thread::spawn(move || run_dispatch_worker(&wcc));
        worker.join().unwrap();

        borrow.wait();
        assert_eq!(borrow.get(), 0);
        cc.shards.stop();
    }

    #[test]
    fn enqueue_on_closing_connection_releases_token() {
        let (cc, _peer) = test_context();
        let borrow = BlockingCounter::new(0);

        cc.shared.set_closing_and_wake();
        cc.shared.enqueue_pub(pub_frame(b"c1", b"late", &borrow));
        assert_eq!(borrow.get(), 0);
        cc.shards.stop();
    }
}
