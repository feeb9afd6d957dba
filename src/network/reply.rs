use std::io::{self, Write};
use std::net::TcpStream;

/// Buffered reply writer for one connection.
///
/// Both the reader (inline dispatch) and the dispatch worker write
/// replies through this builder, serialized by the connection's builder
/// lock. In batch mode output accumulates until batching is switched
/// off, coalescing pipelined replies into fewer writes. The first write
/// error sticks; later sends become no-ops so the worker can observe
/// the failure and wind down.
pub struct ReplyBuilder {
    sink: TcpStream,
    buf: Vec<u8>,
    batch: bool,
    err: Option<io::Error>,
}

impl ReplyBuilder {
    pub fn new(sink: TcpStream) -> Self {
        Self {
            sink,
            buf: Vec::with_capacity(1024),
            batch: false,
            err: None,
        }
    }

    pub fn set_batch_mode(&mut self, on: bool) {
        self.batch = on;
        if !on {
            self.flush();
        }
    }

    pub fn has_error(&self) -> bool {
        self.err.is_some()
    }

    pub fn error(&self) -> Option<&io::Error> {
        self.err.as_ref()
    }

    pub fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        if self.err.is_none() {
            if let Err(e) = self.sink.write_all(&self.buf) {
                self.err = Some(e);
            }
        }
        self.buf.clear();
    }

    /// Append pre-rendered bytes (protocol error lines and the like).
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.maybe_flush();
    }

    // --- RESP replies ---

    pub fn send_simple(&mut self, s: &str) {
        self.buf.push(b'+');
        self.buf.extend_from_slice(s.as_bytes());
        self.crlf();
        self.maybe_flush();
    }

    /// `msg` carries its error code prefix, e.g. `ERR unknown command`.
    pub fn send_error(&mut self, msg: &str) {
        self.buf.push(b'-');
        self.buf.extend_from_slice(msg.as_bytes());
        self.crlf();
        self.maybe_flush();
    }

    pub fn send_long(&mut self, n: i64) {
        self.buf.push(b':');
        self.int(n);
        self.crlf();
        self.maybe_flush();
    }

    pub fn send_bulk(&mut self, data: &[u8]) {
        self.bulk(data);
        self.maybe_flush();
    }

    pub fn send_null(&mut self) {
        self.buf.extend_from_slice(b"$-1\r\n");
        self.maybe_flush();
    }

    pub fn send_null_array(&mut self) {
        self.buf.extend_from_slice(b"*-1\r\n");
        self.maybe_flush();
    }

    /// Array header; the next `n` sends are its elements.
    pub fn start_array(&mut self, n: usize) {
        self.buf.push(b'*');
        self.int(n as i64);
        self.crlf();
        // header flushes together with its elements
    }

    pub fn send_str_arr(&mut self, items: &[&[u8]]) {
        self.start_array(items.len());
        for item in items {
            self.bulk(item);
        }
        self.maybe_flush();
    }

    // --- memcache replies ---

    /// Bare reply line such as `STORED` or `END`.
    pub fn send_line(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.crlf();
        self.maybe_flush();
    }

    pub fn send_value(&mut self, key: &[u8], flags: u32, data: &[u8], cas: Option<u64>) {
        self.buf.extend_from_slice(b"VALUE ");
        self.buf.extend_from_slice(key);
        self.buf.push(b' ');
        self.int(flags as i64);
        self.buf.push(b' ');
        self.int(data.len() as i64);
        if let Some(cas) = cas {
            self.buf.push(b' ');
            self.int(cas as i64);
        }
        self.crlf();
        self.buf.extend_from_slice(data);
        self.crlf();
        // values flush with the trailing END line
    }

    pub fn send_client_error(&mut self, msg: &str) {
        self.buf.extend_from_slice(b"CLIENT_ERROR ");
        self.buf.extend_from_slice(msg.as_bytes());
        self.crlf();
        self.maybe_flush();
    }

    pub fn send_server_error(&mut self, msg: &str) {
        self.buf.extend_from_slice(b"SERVER_ERROR ");
        self.buf.extend_from_slice(msg.as_bytes());
        self.crlf();
        self.maybe_flush();
    }

    fn bulk(&mut self, data: &[u8]) {
        self.buf.push(b'$');
        self.int(data.len() as i64);
        self.crlf();
        self.buf.extend_from_slice(data);
        self.crlf();
    }

    fn int(&mut self, n: i64) {
        let mut itoa_buf = itoa::Buffer::new();
        self.buf.extend_from_slice(itoa_buf.format(n).as_bytes());
    }

    fn crlf(&mut self) {
        self.buf.extend_from_slice(b"\r\n");
    }

    fn maybe_flush(&mut self) {
        if !self.batch {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn read_n(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    #[test]
    fn renders_resp_replies() {
        let (mut peer, sink) = socket_pair();
        let mut builder = ReplyBuilder::new(sink);

        builder.send_simple("PONG");
        assert_eq!(read_n(&mut peer, 7), b"+PONG\r\n");

        builder.send_long(42);
        assert_eq!(read_n(&mut peer, 5), b":42\r\n");

        builder.send_bulk(b"hello");
        assert_eq!(read_n(&mut peer, 11), b"$5\r\nhello\r\n");

        builder.send_null();
        assert_eq!(read_n(&mut peer, 5), b"$-1\r\n");

        builder.send_str_arr(&[b"message", b"c1", b"hi"]);
        assert_eq!(
            read_n(&mut peer, 33),
            b"*3\r\n$7\r\nmessage\r\n$2\r\nc1\r\n$2\r\nhi\r\n"
        );
    }

    #[test]
    fn batch_mode_coalesces_writes() {
        let (mut peer, sink) = socket_pair();
        let mut builder = ReplyBuilder::new(sink);

        builder.set_batch_mode(true);
        builder.send_simple("PONG");
        builder.send_simple("PONG");
        builder.set_batch_mode(false);

        assert_eq!(read_n(&mut peer, 14), b"+PONG\r\n+PONG\r\n");
    }

    #[test]
    fn renders_memcache_value() {
        let (mut peer, sink) = socket_pair();
        let mut builder = ReplyBuilder::new(sink);

        builder.send_value(b"k", 0, b"hello", None);
        builder.send_line("END");
        assert_eq!(read_n(&mut peer, 25), b"VALUE k 0 5\r\nhello\r\nEND\r\n");

        builder.send_client_error("bad data chunk");
        assert_eq!(read_n(&mut peer, 29), b"CLIENT_ERROR bad data chunk\r\n");
    }

    #[test]
    fn write_error_sticks() {
        let (peer, sink) = socket_pair();
        let mut builder = ReplyBuilder::new(sink);
        drop(peer);

        // a broken pipe may take more than one write to surface
        for _ in 0..64 {
            builder.send_simple("PONG");
            if builder.has_error() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(builder.has_error());
    }
}
