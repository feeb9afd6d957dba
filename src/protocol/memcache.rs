use bytes::Bytes;
use memchr::memchr;

/// Largest accepted store payload.
pub const MAX_VALUE_LEN: usize = 128 * 1024 * 1024;

/// Memcache text-protocol verbs the server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McVerb {
    Get,
    Gets,
    Gat,
    Gats,
    Set,
    Add,
    Replace,
    Delete,
    Incr,
    Decr,
    FlushAll,
    Version,
    Quit,
}

impl McVerb {
    /// Store commands carry a `bytes_len` header followed by exactly
    /// that many payload bytes and a trailing CRLF.
    pub fn is_store(self) -> bool {
        matches!(self, McVerb::Set | McVerb::Add | McVerb::Replace)
    }

    /// Commands whose reply includes the CAS stamp.
    pub fn wants_cas(self) -> bool {
        matches!(self, McVerb::Gets | McVerb::Gats)
    }
}

/// One parsed memcache command header.
#[derive(Debug, Clone)]
pub struct McCommand {
    pub verb: McVerb,
    /// Retrieval commands carry one or more keys; everything else
    /// exactly one (at index 0).
    pub keys: Vec<Bytes>,
    pub flags: u32,
    pub exptime: i64,
    /// Declared payload length for store commands.
    pub bytes_len: usize,
    /// incr/decr argument.
    pub delta: u64,
    pub noreply: bool,
}

impl McCommand {
    fn bare(verb: McVerb) -> Self {
        Self {
            verb,
            keys: Vec::new(),
            flags: 0,
            exptime: 0,
            bytes_len: 0,
            delta: 0,
            noreply: false,
        }
    }
}

/// Memcache parse failures, with their wire renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McParseError {
    /// Unknown verb: plain `ERROR`.
    Error,
    /// Malformed arguments for a known verb.
    ClientError(&'static str),
}

impl McParseError {
    pub fn to_wire(self) -> Vec<u8> {
        match self {
            McParseError::Error => b"ERROR\r\n".to_vec(),
            McParseError::ClientError(msg) => format!("CLIENT_ERROR {}\r\n", msg).into_bytes(),
        }
    }
}

const BAD_FORMAT: McParseError = McParseError::ClientError("bad command line format");
const BAD_DELTA: McParseError = McParseError::ClientError("invalid numeric delta argument");

#[derive(Debug)]
pub enum McParseResult {
    /// `consumed` covers the header line only; the caller frames the
    /// payload of store commands itself.
    Complete { cmd: McCommand, consumed: usize },
    Incomplete,
}

/// Parse one command header line from `input`.
pub fn parse_command(input: &[u8]) -> Result<McParseResult, McParseError> {
    let nl = match memchr(b'\n', input) {
        Some(pos) => pos,
        None => return Ok(McParseResult::Incomplete),
    };

    let mut line = &input[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    let consumed = nl + 1;

    let mut tokens = line.split(|b| *b == b' ').filter(|tok| !tok.is_empty());

    let verb_tok = match tokens.next() {
        Some(tok) => tok,
        None => return Err(BAD_FORMAT),
    };

    let verb = match verb_tok {
        b"get" => McVerb::Get,
        b"gets" => McVerb::Gets,
        b"gat" => McVerb::Gat,
        b"gats" => McVerb::Gats,
        b"set" => McVerb::Set,
        b"add" => McVerb::Add,
        b"replace" => McVerb::Replace,
        b"delete" => McVerb::Delete,
        b"incr" => McVerb::Incr,
        b"decr" => McVerb::Decr,
        b"flush_all" => McVerb::FlushAll,
        b"version" => McVerb::Version,
        b"quit" => McVerb::Quit,
        _ => return Err(McParseError::Error),
    };

    let mut cmd = McCommand::bare(verb);
    let mut rest: Vec<&[u8]> = tokens.collect();

    // trailing "noreply" is accepted on mutating commands
    if matches!(
        verb,
        McVerb::Set
            | McVerb::Add
            | McVerb::Replace
            | McVerb::Delete
            | McVerb::Incr
            | McVerb::Decr
            | McVerb::FlushAll
    ) && rest.last() == Some(&&b"noreply"[..])
    {
        cmd.noreply = true;
        rest.pop();
    }

    match verb {
        McVerb::Get | McVerb::Gets => {
            if rest.is_empty() {
                return Err(BAD_FORMAT);
            }
            cmd.keys = rest.iter().map(|k| Bytes::copy_from_slice(k)).collect();
        }
        McVerb::Gat | McVerb::Gats => {
            if rest.len() < 2 {
                return Err(BAD_FORMAT);
            }
            cmd.exptime = parse_num::<i64>(rest[0], BAD_FORMAT)?;
            cmd.keys = rest[1..].iter().map(|k| Bytes::copy_from_slice(k)).collect();
        }
        McVerb::Set | McVerb::Add | McVerb::Replace => {
            // <verb> <key> <flags> <exptime> <bytes>
            if rest.len() != 4 {
                return Err(BAD_FORMAT);
            }
            cmd.keys = vec![Bytes::copy_from_slice(rest[0])];
            cmd.flags = parse_num::<u32>(rest[1], BAD_FORMAT)?;
            cmd.exptime = parse_num::<i64>(rest[2], BAD_FORMAT)?;
            cmd.bytes_len = parse_num::<usize>(rest[3], BAD_FORMAT)?;
            if cmd.bytes_len > MAX_VALUE_LEN {
                return Err(McParseError::ClientError("object too large for cache"));
            }
        }
        McVerb::Delete => {
            if rest.len() != 1 {
                return Err(BAD_FORMAT);
            }
            cmd.keys = vec![Bytes::copy_from_slice(rest[0])];
        }
        McVerb::Incr | McVerb::Decr => {
            if rest.len() != 2 {
                return Err(BAD_FORMAT);
            }
            cmd.keys = vec![Bytes::copy_from_slice(rest[0])];
            cmd.delta = parse_num::<u64>(rest[1], BAD_DELTA)?;
        }
        McVerb::FlushAll => {
            if rest.len() > 1 {
                return Err(BAD_FORMAT);
            }
            if let Some(delay) = rest.first() {
                cmd.exptime = parse_num::<i64>(delay, BAD_FORMAT)?;
            }
        }
        McVerb::Version | McVerb::Quit => {
            if !rest.is_empty() {
                return Err(BAD_FORMAT);
            }
        }
    }

    Ok(McParseResult::Complete { cmd, consumed })
}

fn parse_num<T: std::str::FromStr>(tok: &[u8], err: McParseError) -> Result<T, McParseError> {
    std::str::from_utf8(tok)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .ok_or(err)
}
