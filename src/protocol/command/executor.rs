use crate::network::ConnContext;
use crate::protocol::command::Command;
use crate::protocol::memcache::{McCommand, McVerb};
use crate::pubsub::handler;
use crate::storage::{Numeric, StrEntry, WrongType};
use bytes::Bytes;

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";
const SHUTTING_DOWN: &str = "ERR server shutting down";

/// Execute one RESP command against the connection's context, writing
/// the reply through its builder.
pub fn dispatch_command(args: &[&[u8]], cc: &ConnContext) {
    let cmd = match Command::parse(args) {
        Ok(cmd) => cmd,
        Err(msg) => {
            cc.shared.builder.lock().send_error(&format!("ERR {}", msg));
            return;
        }
    };

    let subscribed = cc.shared.subs.lock().is_some();
    if subscribed && !cmd.is_allowed_while_subscribed() {
        cc.shared.builder.lock().send_error(
            "ERR only (P)SUBSCRIBE / (P)UNSUBSCRIBE / PING / QUIT allowed in this context",
        );
        return;
    }

    execute(cmd, cc);
}

fn execute(cmd: Command, cc: &ConnContext) {
    match cmd {
        Command::Ping(None) => cc.shared.builder.lock().send_simple("PONG"),
        Command::Ping(Some(msg)) => cc.shared.builder.lock().send_bulk(&msg),
        Command::Echo(msg) => cc.shared.builder.lock().send_bulk(&msg),
        Command::Quit => {
            cc.shared.builder.lock().send_simple("OK");
            cc.shared.set_closing_and_wake();
        }

        Command::Set { key, value } => {
            let sid = cc.shards.shard_of(&key);
            let done = cc
                .shards
                .run_on(sid, move |shard| shard.store.set_str(&key, value, 0));
            let mut builder = cc.shared.builder.lock();
            match done {
                Some(()) => builder.send_simple("OK"),
                None => builder.send_error(SHUTTING_DOWN),
            }
        }
        Command::Get(key) => {
            let sid = cc.shards.shard_of(&key);
            let lookup = key.clone();
            let found = cc.shards.run_on(sid, move |shard| {
                shard
                    .store
                    .get_str(&lookup)
                    .map(|entry| entry.map(|e| e.data.clone()))
            });
            let mut builder = cc.shared.builder.lock();
            match found {
                Some(Ok(Some(data))) => builder.send_bulk(&data),
                Some(Ok(None)) => builder.send_null(),
                Some(Err(WrongType)) => builder.send_error(WRONGTYPE),
                None => builder.send_error(SHUTTING_DOWN),
            }
        }
        Command::Del(keys) => {
            let mut removed = 0i64;
            for key in keys {
                let sid = cc.shards.shard_of(&key);
                if cc.shards.run_on(sid, move |shard| shard.store.remove(&key)) == Some(true) {
                    removed += 1;
                }
            }
            cc.shared.builder.lock().send_long(removed);
        }
        Command::Exists(keys) => {
            let mut present = 0i64;
            for key in keys {
                let sid = cc.shards.shard_of(&key);
                if cc.shards.run_on(sid, move |shard| shard.store.exists(&key)) == Some(true) {
                    present += 1;
                }
            }
            cc.shared.builder.lock().send_long(present);
        }

        Command::SAdd { key, members } => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                let set = shard.store.set_mut(&key)?;
                let mut added = 0i64;
                for member in &members {
                    if set.add(member) {
                        added += 1;
                    }
                }
                Ok::<i64, WrongType>(added)
            });
            reply_count_or_wrongtype(cc, outcome);
        }
        Command::SRem { key, members } => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                if !shard.store.exists(&key) {
                    return Ok(0i64);
                }
                let set = shard.store.set_mut(&key)?;
                let mut removed = 0i64;
                for member in &members {
                    if set.remove(member) {
                        removed += 1;
                    }
                }
                shard.store.remove_if_empty_set(&key);
                Ok::<i64, WrongType>(removed)
            });
            reply_count_or_wrongtype(cc, outcome);
        }
        Command::SIsMember { key, member } => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                let present = shard
                    .store
                    .get_set(&key)?
                    .map(|set| set.contains(&member))
                    .unwrap_or(false);
                Ok::<i64, WrongType>(i64::from(present))
            });
            reply_count_or_wrongtype(cc, outcome);
        }
        Command::SCard(key) => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                let len = shard.store.get_set(&key)?.map(|set| set.len()).unwrap_or(0);
                Ok::<i64, WrongType>(len as i64)
            });
            reply_count_or_wrongtype(cc, outcome);
        }
        Command::SMembers(key) => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                let members = match shard.store.get_set(&key)? {
                    Some(set) => set.iter().map(|m| m.to_vec()).collect(),
                    None => Vec::new(),
                };
                Ok::<Vec<Vec<u8>>, WrongType>(members)
            });
            let mut builder = cc.shared.builder.lock();
            match outcome {
                Some(Ok(members)) => {
                    builder.start_array(members.len());
                    for member in &members {
                        builder.send_bulk(member);
                    }
                    if members.is_empty() {
                        builder.flush();
                    }
                }
                Some(Err(WrongType)) => builder.send_error(WRONGTYPE),
                None => builder.send_error(SHUTTING_DOWN),
            }
        }
        Command::SScan { key, cursor, count } => {
            let sid = cc.shards.shard_of(&key);
            let outcome = cc.shards.run_on(sid, move |shard| {
                let set = match shard.store.get_set(&key)? {
                    Some(set) => set,
                    None => return Ok((0u32, Vec::new())),
                };
                let mut members: Vec<Vec<u8>> = Vec::new();
                let mut cursor = cursor;
                loop {
                    cursor = set.scan(cursor, &mut |m| members.push(m.to_vec()));
                    if cursor == 0 || members.len() >= count {
                        break;
                    }
                }
                Ok::<(u32, Vec<Vec<u8>>), WrongType>((cursor, members))
            });
            let mut builder = cc.shared.builder.lock();
            match outcome {
                Some(Ok((next, members))) => {
                    builder.start_array(2);
                    builder.send_bulk(next.to_string().as_bytes());
                    builder.start_array(members.len());
                    for member in &members {
                        builder.send_bulk(member);
                    }
                    if members.is_empty() {
                        builder.flush();
                    }
                }
                Some(Err(WrongType)) => builder.send_error(WRONGTYPE),
                None => builder.send_error(SHUTTING_DOWN),
            }
        }

        Command::Subscribe(channels) => handler::change_subscription(cc, true, true, &channels),
        Command::Unsubscribe(channels) => {
            if channels.is_empty() {
                handler::unsubscribe_all(cc, false);
            } else {
                handler::change_subscription(cc, false, true, &channels);
            }
        }
        Command::PSubscribe(patterns) => handler::change_psub(cc, true, true, &patterns),
        Command::PUnsubscribe(patterns) => {
            if patterns.is_empty() {
                handler::unsubscribe_all(cc, true);
            } else {
                handler::change_psub(cc, false, true, &patterns);
            }
        }
        Command::Publish { channel, message } => handler::publish(cc, channel, message),
        Command::PubSubChannels(pattern) => handler::pubsub_channels(cc, pattern),
        Command::PubSubNumSub(channels) => handler::pubsub_numsub(cc, &channels),
        Command::PubSubNumPat => handler::pubsub_numpat(cc),
    }
}

fn reply_count_or_wrongtype(cc: &ConnContext, outcome: Option<Result<i64, WrongType>>) {
    let mut builder = cc.shared.builder.lock();
    match outcome {
        Some(Ok(n)) => builder.send_long(n),
        Some(Err(WrongType)) => builder.send_error(WRONGTYPE),
        None => builder.send_error(SHUTTING_DOWN),
    }
}

/// Execute one memcache command. `value` is the already-framed payload
/// of a store command. `noreply` suppresses every reply line.
pub fn dispatch_mc(cmd: &McCommand, value: Bytes, cc: &ConnContext) {
    match cmd.verb {
        McVerb::Get | McVerb::Gets | McVerb::Gat | McVerb::Gats => {
            let with_cas = cmd.verb.wants_cas();
            let mut hits: Vec<(Bytes, StrEntry)> = Vec::with_capacity(cmd.keys.len());
            for key in &cmd.keys {
                let sid = cc.shards.shard_of(key);
                let lookup = key.clone();
                let found = cc.shards.run_on(sid, move |shard| {
                    // a key bound to a set type is simply a miss here
                    shard.store.get_str(&lookup).ok().flatten().cloned()
                });
                if let Some(Some(entry)) = found {
                    hits.push((key.clone(), entry));
                }
            }
            let mut builder = cc.shared.builder.lock();
            for (key, entry) in &hits {
                builder.send_value(key, entry.flags, &entry.data, with_cas.then_some(entry.cas));
            }
            builder.send_line("END");
        }

        McVerb::Set | McVerb::Add | McVerb::Replace => {
            let key = cmd.keys[0].clone();
            let flags = cmd.flags;
            let verb = cmd.verb;
            let sid = cc.shards.shard_of(&key);
            let stored = cc.shards.run_on(sid, move |shard| match verb {
                McVerb::Set => {
                    shard.store.set_str(&key, value, flags);
                    true
                }
                McVerb::Add => shard.store.add_str(&key, value, flags),
                McVerb::Replace => shard.store.replace_str(&key, value, flags),
                _ => unreachable!(),
            });
            if !cmd.noreply {
                let mut builder = cc.shared.builder.lock();
                match stored {
                    Some(true) => builder.send_line("STORED"),
                    Some(false) => builder.send_line("NOT_STORED"),
                    None => builder.send_server_error("shutting down"),
                }
            }
        }

        McVerb::Delete => {
            let key = cmd.keys[0].clone();
            let sid = cc.shards.shard_of(&key);
            let removed = cc.shards.run_on(sid, move |shard| shard.store.remove(&key));
            if !cmd.noreply {
                let mut builder = cc.shared.builder.lock();
                match removed {
                    Some(true) => builder.send_line("DELETED"),
                    Some(false) => builder.send_line("NOT_FOUND"),
                    None => builder.send_server_error("shutting down"),
                }
            }
        }

        McVerb::Incr | McVerb::Decr => {
            let key = cmd.keys[0].clone();
            let delta = cmd.delta;
            let negative = cmd.verb == McVerb::Decr;
            let sid = cc.shards.shard_of(&key);
            let outcome = cc
                .shards
                .run_on(sid, move |shard| shard.store.apply_delta(&key, delta, negative));
            if !cmd.noreply {
                let mut builder = cc.shared.builder.lock();
                match outcome {
                    Some(Numeric::Ok(n)) => builder.send_line(&n.to_string()),
                    Some(Numeric::NotFound) => builder.send_line("NOT_FOUND"),
                    Some(Numeric::NonNumeric) => builder
                        .send_client_error("cannot increment or decrement non-numeric value"),
                    None => builder.send_server_error("shutting down"),
                }
            }
        }

        McVerb::FlushAll => {
            cc.shards
                .run_brief_in_parallel(|shard| shard.store.clear(), |_| true);
            if !cmd.noreply {
                cc.shared.builder.lock().send_line("OK");
            }
        }

        McVerb::Version => {
            cc.shared
                .builder
                .lock()
                .send_line(&format!("VERSION {}", env!("CARGO_PKG_VERSION")));
        }

        McVerb::Quit => {
            cc.shared.set_closing_and_wake();
        }
    }
}
