use spindle_server::{Config, Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    server: Arc<Server>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    fn start(memcache: bool) -> Self {
        let config = Config {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            memcache_port: if memcache { Some(0) } else { None },
            threads: 2,
            ..Config::default()
        };
        let server = Arc::new(Server::new(config).expect("server should build"));

        let runner = Arc::clone(&server);
        let handle = thread::spawn(move || {
            runner.run().expect("server run should succeed");
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        while server.resp_addr().is_none() {
            assert!(Instant::now() < deadline, "server did not start in time");
            thread::sleep(Duration::from_millis(5));
        }

        Self {
            server,
            handle: Some(handle),
        }
    }

    fn resp_addr(&self) -> SocketAddr {
        self.server.resp_addr().unwrap()
    }

    fn memcache_addr(&self) -> SocketAddr {
        self.server.memcache_addr().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect should succeed");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_exact_bytes(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read should succeed");
    buf
}

fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let got = read_exact_bytes(stream, expected.len());
    assert_eq!(
        got,
        expected,
        "expected {:?}, got {:?}",
        String::from_utf8_lossy(expected),
        String::from_utf8_lossy(&got)
    );
}

#[test]
fn ping_inline_and_multibulk() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"PING\r\n").unwrap();
    expect_reply(&mut conn, b"+PONG\r\n");

    conn.write_all(b"*1\r\n$4\r\nPING\r\n").unwrap();
    expect_reply(&mut conn, b"+PONG\r\n");

    conn.write_all(b"*2\r\n$4\r\nECHO\r\n$5\r\nhello\r\n").unwrap();
    expect_reply(&mut conn, b"$5\r\nhello\r\n");
}

#[test]
fn pipelined_pings_reply_in_order() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"PING\r\nPING\r\nPING\r\n").unwrap();
    expect_reply(&mut conn, b"+PONG\r\n+PONG\r\n+PONG\r\n");
}

#[test]
fn set_get_del_roundtrip() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\nhello\r\n")
        .unwrap();
    expect_reply(&mut conn, b"+OK\r\n");

    conn.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut conn, b"$5\r\nhello\r\n");

    conn.write_all(b"*2\r\n$3\r\nGET\r\n$4\r\nmiss\r\n").unwrap();
    expect_reply(&mut conn, b"$-1\r\n");

    conn.write_all(b"*2\r\n$3\r\nDEL\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut conn, b":1\r\n");

    conn.write_all(b"*2\r\n$6\r\nEXISTS\r\n$1\r\nk\r\n").unwrap();
    expect_reply(&mut conn, b":0\r\n");
}

#[test]
fn sets_and_sscan() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*5\r\n$4\r\nSADD\r\n$1\r\ns\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n")
        .unwrap();
    expect_reply(&mut conn, b":3\r\n");

    conn.write_all(b"*2\r\n$5\r\nSCARD\r\n$1\r\ns\r\n").unwrap();
    expect_reply(&mut conn, b":3\r\n");

    conn.write_all(b"*3\r\n$9\r\nSISMEMBER\r\n$1\r\ns\r\n$1\r\na\r\n")
        .unwrap();
    expect_reply(&mut conn, b":1\r\n");

    conn.write_all(b"*3\r\n$9\r\nSISMEMBER\r\n$1\r\ns\r\n$1\r\nz\r\n")
        .unwrap();
    expect_reply(&mut conn, b":0\r\n");

    // a 3-member set fits one scan batch: cursor 0, three 1-byte bulks
    // in table order
    conn.write_all(b"*3\r\n$5\r\nSSCAN\r\n$1\r\ns\r\n$1\r\n0\r\n")
        .unwrap();
    expect_reply(&mut conn, b"*2\r\n$1\r\n0\r\n*3\r\n");
    let mut members: Vec<u8> = Vec::new();
    for _ in 0..3 {
        let bulk = read_exact_bytes(&mut conn, 7);
        assert_eq!(&bulk[..4], b"$1\r\n");
        assert_eq!(&bulk[5..], b"\r\n");
        members.push(bulk[4]);
    }
    members.sort_unstable();
    assert_eq!(members, b"abc");

    conn.write_all(b"*3\r\n$4\r\nSREM\r\n$1\r\ns\r\n$1\r\nb\r\n")
        .unwrap();
    expect_reply(&mut conn, b":1\r\n");

    conn.write_all(b"*2\r\n$5\r\nSCARD\r\n$1\r\ns\r\n").unwrap();
    expect_reply(&mut conn, b":2\r\n");
}

#[test]
fn wrongtype_error_for_mixed_access() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*3\r\n$4\r\nSADD\r\n$1\r\nk\r\n$1\r\nm\r\n")
        .unwrap();
    expect_reply(&mut conn, b":1\r\n");

    conn.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    let mut reply = [0u8; 10];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"-WRONGTYPE");
}

#[test]
fn subscribe_publish_unsubscribe_flow() {
    let ts = TestServer::start(false);
    let mut subscriber = connect(ts.resp_addr());
    let mut publisher = connect(ts.resp_addr());

    subscriber
        .write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nc1\r\n")
        .unwrap();
    expect_reply(
        &mut subscriber,
        b"*3\r\n$9\r\nsubscribe\r\n$2\r\nc1\r\n:1\r\n",
    );

    publisher
        .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$2\r\nc1\r\n$2\r\nhi\r\n")
        .unwrap();
    expect_reply(&mut publisher, b":1\r\n");

    expect_reply(
        &mut subscriber,
        b"*3\r\n$7\r\nmessage\r\n$2\r\nc1\r\n$2\r\nhi\r\n",
    );

    subscriber
        .write_all(b"*2\r\n$11\r\nUNSUBSCRIBE\r\n$2\r\nc1\r\n")
        .unwrap();
    expect_reply(
        &mut subscriber,
        b"*3\r\n$11\r\nunsubscribe\r\n$2\r\nc1\r\n:0\r\n",
    );

    // no longer subscribed: publishes reach nobody
    publisher
        .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$2\r\nc1\r\n$2\r\nyo\r\n")
        .unwrap();
    expect_reply(&mut publisher, b":0\r\n");
}

#[test]
fn pattern_subscription_delivers_pmessage() {
    let ts = TestServer::start(false);
    let mut subscriber = connect(ts.resp_addr());
    let mut publisher = connect(ts.resp_addr());

    subscriber
        .write_all(b"*2\r\n$10\r\nPSUBSCRIBE\r\n$6\r\nnews.*\r\n")
        .unwrap();
    expect_reply(
        &mut subscriber,
        b"*3\r\n$10\r\npsubscribe\r\n$6\r\nnews.*\r\n:1\r\n",
    );

    publisher
        .write_all(b"*3\r\n$7\r\nPUBLISH\r\n$10\r\nnews.local\r\n$2\r\nhi\r\n")
        .unwrap();
    expect_reply(&mut publisher, b":1\r\n");

    expect_reply(
        &mut subscriber,
        b"*4\r\n$8\r\npmessage\r\n$6\r\nnews.*\r\n$10\r\nnews.local\r\n$2\r\nhi\r\n",
    );
}

#[test]
fn commands_rejected_while_subscribed() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nc1\r\n")
        .unwrap();
    expect_reply(&mut conn, b"*3\r\n$9\r\nsubscribe\r\n$2\r\nc1\r\n:1\r\n");

    conn.write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n").unwrap();
    let mut reply = [0u8; 4];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"-ERR");
}

#[test]
fn memcache_set_get_roundtrip() {
    let ts = TestServer::start(true);
    let mut conn = connect(ts.memcache_addr());

    conn.write_all(b"set k 0 0 5\r\nhello\r\n").unwrap();
    expect_reply(&mut conn, b"STORED\r\n");

    conn.write_all(b"get k\r\n").unwrap();
    expect_reply(&mut conn, b"VALUE k 0 5\r\nhello\r\nEND\r\n");

    conn.write_all(b"get missing\r\n").unwrap();
    expect_reply(&mut conn, b"END\r\n");

    conn.write_all(b"delete k\r\n").unwrap();
    expect_reply(&mut conn, b"DELETED\r\n");
}

#[test]
fn memcache_incr_decr_and_errors() {
    let ts = TestServer::start(true);
    let mut conn = connect(ts.memcache_addr());

    conn.write_all(b"set n 0 0 2\r\n10\r\n").unwrap();
    expect_reply(&mut conn, b"STORED\r\n");

    conn.write_all(b"incr n 5\r\n").unwrap();
    expect_reply(&mut conn, b"15\r\n");

    conn.write_all(b"decr n 100\r\n").unwrap();
    expect_reply(&mut conn, b"0\r\n");

    conn.write_all(b"bogus\r\n").unwrap();
    expect_reply(&mut conn, b"ERROR\r\n");

    // the connection survives the error
    conn.write_all(b"version\r\n").unwrap();
    let mut reply = [0u8; 8];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"VERSION ");
}

#[test]
fn http_probe_serves_admin_answer() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut reply = [0u8; 15];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"HTTP/1.1 200 OK");
}

#[test]
fn protocol_error_reply_then_close() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*1\r\n$-5\r\n").unwrap();
    let mut reply = Vec::new();
    conn.read_to_end(&mut reply).unwrap();
    assert_eq!(&reply[..], b"-ERR Protocol error: invalid bulk length\r\n");
}

#[test]
fn graceful_shutdown_drains_sessions() {
    let ts = TestServer::start(false);
    let mut conn = connect(ts.resp_addr());

    conn.write_all(b"*2\r\n$9\r\nSUBSCRIBE\r\n$2\r\nc1\r\n")
        .unwrap();
    expect_reply(&mut conn, b"*3\r\n$9\r\nsubscribe\r\n$2\r\nc1\r\n:1\r\n");

    // Drop triggers shutdown and joins the server thread; a hang here
    // fails the test via the harness timeout.
}
