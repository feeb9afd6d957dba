pub mod executor;

use bytes::Bytes;

/// Commands the executor understands. Argument bytes are copied out of
/// the frame so the command owns its data.
#[derive(Debug, Clone)]
pub enum Command {
    Ping(Option<Bytes>),
    Echo(Bytes),
    Quit,

    Set { key: Bytes, value: Bytes },
    Get(Bytes),
    Del(Vec<Bytes>),
    Exists(Vec<Bytes>),

    SAdd { key: Bytes, members: Vec<Bytes> },
    SRem { key: Bytes, members: Vec<Bytes> },
    SIsMember { key: Bytes, member: Bytes },
    SMembers(Bytes),
    SCard(Bytes),
    SScan { key: Bytes, cursor: u32, count: usize },

    Subscribe(Vec<Bytes>),
    Unsubscribe(Vec<Bytes>),
    PSubscribe(Vec<Bytes>),
    PUnsubscribe(Vec<Bytes>),
    Publish { channel: Bytes, message: Bytes },
    PubSubChannels(Option<Bytes>),
    PubSubNumSub(Vec<Bytes>),
    PubSubNumPat,
}

impl Command {
    /// Parse a command from argument slices.
    pub fn parse(args: &[&[u8]]) -> Result<Command, String> {
        if args.is_empty() {
            return Err("empty command".to_string());
        }

        let name = args[0].to_ascii_uppercase();
        let rest = &args[1..];

        match &name[..] {
            b"PING" => match rest.len() {
                0 => Ok(Command::Ping(None)),
                1 => Ok(Command::Ping(Some(owned(rest[0])))),
                _ => Err(arity("PING")),
            },
            b"ECHO" => {
                if rest.len() != 1 {
                    return Err(arity("ECHO"));
                }
                Ok(Command::Echo(owned(rest[0])))
            }
            b"QUIT" => Ok(Command::Quit),

            b"SET" => {
                if rest.len() != 2 {
                    return Err(arity("SET"));
                }
                Ok(Command::Set {
                    key: owned(rest[0]),
                    value: owned(rest[1]),
                })
            }
            b"GET" => {
                if rest.len() != 1 {
                    return Err(arity("GET"));
                }
                Ok(Command::Get(owned(rest[0])))
            }
            b"DEL" => {
                if rest.is_empty() {
                    return Err(arity("DEL"));
                }
                Ok(Command::Del(owned_all(rest)))
            }
            b"EXISTS" => {
                if rest.is_empty() {
                    return Err(arity("EXISTS"));
                }
                Ok(Command::Exists(owned_all(rest)))
            }

            b"SADD" => {
                if rest.len() < 2 {
                    return Err(arity("SADD"));
                }
                Ok(Command::SAdd {
                    key: owned(rest[0]),
                    members: owned_all(&rest[1..]),
                })
            }
            b"SREM" => {
                if rest.len() < 2 {
                    return Err(arity("SREM"));
                }
                Ok(Command::SRem {
                    key: owned(rest[0]),
                    members: owned_all(&rest[1..]),
                })
            }
            b"SISMEMBER" => {
                if rest.len() != 2 {
                    return Err(arity("SISMEMBER"));
                }
                Ok(Command::SIsMember {
                    key: owned(rest[0]),
                    member: owned(rest[1]),
                })
            }
            b"SMEMBERS" => {
                if rest.len() != 1 {
                    return Err(arity("SMEMBERS"));
                }
                Ok(Command::SMembers(owned(rest[0])))
            }
            b"SCARD" => {
                if rest.len() != 1 {
                    return Err(arity("SCARD"));
                }
                Ok(Command::SCard(owned(rest[0])))
            }
            b"SSCAN" => {
                if rest.len() < 2 {
                    return Err(arity("SSCAN"));
                }
                let cursor = parse_int::<u32>(rest[1]).ok_or("invalid cursor")?;
                let mut count = 10usize;
                let mut i = 2;
                while i < rest.len() {
                    let opt = rest[i].to_ascii_uppercase();
                    match &opt[..] {
                        b"COUNT" if i + 1 < rest.len() => {
                            count = parse_int::<usize>(rest[i + 1])
                                .filter(|&c| c > 0)
                                .ok_or("value is not an integer or out of range")?;
                            i += 2;
                        }
                        _ => return Err("syntax error".to_string()),
                    }
                }
                Ok(Command::SScan {
                    key: owned(rest[0]),
                    cursor,
                    count,
                })
            }

            b"SUBSCRIBE" => {
                if rest.is_empty() {
                    return Err(arity("SUBSCRIBE"));
                }
                Ok(Command::Subscribe(owned_all(rest)))
            }
            b"UNSUBSCRIBE" => Ok(Command::Unsubscribe(owned_all(rest))),
            b"PSUBSCRIBE" => {
                if rest.is_empty() {
                    return Err(arity("PSUBSCRIBE"));
                }
                Ok(Command::PSubscribe(owned_all(rest)))
            }
            b"PUNSUBSCRIBE" => Ok(Command::PUnsubscribe(owned_all(rest))),
            b"PUBLISH" => {
                if rest.len() != 2 {
                    return Err(arity("PUBLISH"));
                }
                Ok(Command::Publish {
                    channel: owned(rest[0]),
                    message: owned(rest[1]),
                })
            }
            b"PUBSUB" => {
                if rest.is_empty() {
                    return Err(arity("PUBSUB"));
                }
                let sub = rest[0].to_ascii_uppercase();
                match &sub[..] {
                    b"CHANNELS" => match rest.len() {
                        1 => Ok(Command::PubSubChannels(None)),
                        2 => Ok(Command::PubSubChannels(Some(owned(rest[1])))),
                        _ => Err(arity("PUBSUB CHANNELS")),
                    },
                    b"NUMSUB" => Ok(Command::PubSubNumSub(owned_all(&rest[1..]))),
                    b"NUMPAT" => {
                        if rest.len() != 1 {
                            return Err(arity("PUBSUB NUMPAT"));
                        }
                        Ok(Command::PubSubNumPat)
                    }
                    _ => Err(format!(
                        "Unknown PUBSUB subcommand or wrong number of arguments for '{}'",
                        String::from_utf8_lossy(rest[0])
                    )),
                }
            }

            _ => Err(format!(
                "unknown command '{}'",
                String::from_utf8_lossy(args[0])
            )),
        }
    }

    /// While a connection is subscribed, only the subscription family
    /// plus PING/QUIT is accepted.
    pub fn is_allowed_while_subscribed(&self) -> bool {
        matches!(
            self,
            Command::Ping(_)
                | Command::Quit
                | Command::Subscribe(_)
                | Command::Unsubscribe(_)
                | Command::PSubscribe(_)
                | Command::PUnsubscribe(_)
        )
    }
}

fn owned(arg: &[u8]) -> Bytes {
    Bytes::copy_from_slice(arg)
}

fn owned_all(args: &[&[u8]]) -> Vec<Bytes> {
    args.iter().map(|a| owned(a)).collect()
}

fn parse_int<T: std::str::FromStr>(arg: &[u8]) -> Option<T> {
    std::str::from_utf8(arg).ok().and_then(|s| s.parse().ok())
}

fn arity(name: &str) -> String {
    format!("wrong number of arguments for '{}' command", name)
}
