use super::{glob_match, SubscriptionRecord};
use crate::network::{ConnContext, PubFrame};
use crate::shard::EngineShard;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Apply a SUBSCRIBE/UNSUBSCRIBE argument list for one connection.
///
/// The connection's own record is the source of truth: duplicates in
/// one call produce one registry change but still one acknowledgement
/// per argument occurrence. Changed channels are partitioned by owning
/// shard, sorted, and applied on each shard's own context; replies go
/// out in input order carrying the post-operation channel count.
pub fn change_subscription(cc: &ConnContext, to_add: bool, to_reply: bool, args: &[Bytes]) {
    let mut counts = vec![0usize; args.len()];
    let mut changed: Vec<(usize, Bytes)> = Vec::with_capacity(args.len());
    let mut borrow = None;

    {
        let mut guard = cc.shared.subs.lock();
        if to_add && guard.is_none() {
            *guard = Some(SubscriptionRecord::new());
            // queue everything from now on so deliveries can interleave
            cc.shared.force_dispatch.store(true, Ordering::Relaxed);
        }
        if let Some(record) = guard.as_mut() {
            for (i, channel) in args.iter().enumerate() {
                let modified = if to_add {
                    record.channels.add(channel)
                } else {
                    record.channels.remove(channel)
                };
                counts[i] = record.channels.len();
                if modified {
                    changed.push((cc.shards.shard_of(channel), channel.clone()));
                }
            }
            borrow = Some(record.borrow_token.clone());
            if !to_add && record.is_empty() {
                *guard = None;
                cc.shared.force_dispatch.store(false, Ordering::Relaxed);
            }
        }
    }

    if let (Some(borrow), false) = (borrow, changed.is_empty()) {
        changed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        // beginning index into `changed` for each shard
        let nshards = cc.shards.size();
        let mut shard_idx = vec![0usize; nshards + 1];
        for (sid, _) in &changed {
            shard_idx[sid + 1] += 1;
        }
        for i in 1..=nshards {
            shard_idx[i] += shard_idx[i - 1];
        }

        let conn_id = cc.shared.id;
        let thread_id = conn_id as u32;
        let queue = Arc::downgrade(&cc.shared);
        let changed = Arc::new(changed);
        let shard_idx = Arc::new(shard_idx);
        let pred_idx = Arc::clone(&shard_idx);

        cc.shards.run_brief_in_parallel(
            move |shard: &mut EngineShard| {
                let start = shard_idx[shard.shard_id];
                let end = shard_idx[shard.shard_id + 1];
                for (_, channel) in &changed[start..end] {
                    if to_add {
                        shard.channels.add_subscription(
                            channel,
                            conn_id,
                            queue.clone(),
                            borrow.clone(),
                            thread_id,
                        );
                    } else {
                        shard.channels.remove_subscription(channel, conn_id);
                    }
                }
            },
            |sid| pred_idx[sid + 1] > pred_idx[sid],
        );
    }

    if to_reply {
        let action: &[u8] = if to_add { b"subscribe" } else { b"unsubscribe" };
        let mut builder = cc.shared.builder.lock();
        for (i, channel) in args.iter().enumerate() {
            builder.start_array(3);
            builder.send_bulk(action);
            builder.send_bulk(channel);
            builder.send_long(counts[i] as i64);
        }
    }
}

/// PSUBSCRIBE/PUNSUBSCRIBE counterpart. Patterns must be consulted on
/// publish regardless of channel hash, so every changed pattern is
/// replicated to all shards.
pub fn change_psub(cc: &ConnContext, to_add: bool, to_reply: bool, args: &[Bytes]) {
    let mut counts = vec![0usize; args.len()];
    let mut changed: Vec<Bytes> = Vec::with_capacity(args.len());
    let mut borrow = None;

    {
        let mut guard = cc.shared.subs.lock();
        if to_add && guard.is_none() {
            *guard = Some(SubscriptionRecord::new());
            cc.shared.force_dispatch.store(true, Ordering::Relaxed);
        }
        if let Some(record) = guard.as_mut() {
            for (i, pattern) in args.iter().enumerate() {
                let modified = if to_add {
                    record.patterns.add(pattern)
                } else {
                    record.patterns.remove(pattern)
                };
                counts[i] = record.patterns.len();
                if modified {
                    changed.push(pattern.clone());
                }
            }
            borrow = Some(record.borrow_token.clone());
            if !to_add && record.is_empty() {
                *guard = None;
                cc.shared.force_dispatch.store(false, Ordering::Relaxed);
            }
        }
    }

    if let (Some(borrow), false) = (borrow, changed.is_empty()) {
        let conn_id = cc.shared.id;
        let thread_id = conn_id as u32;
        let queue = Arc::downgrade(&cc.shared);
        let changed = Arc::new(changed);

        cc.shards.run_brief_in_parallel(
            move |shard: &mut EngineShard| {
                for pattern in changed.iter() {
                    if to_add {
                        shard.channels.add_glob_pattern(
                            pattern,
                            conn_id,
                            queue.clone(),
                            borrow.clone(),
                            thread_id,
                        );
                    } else {
                        shard.channels.remove_glob_pattern(pattern, conn_id);
                    }
                }
            },
            |_| true,
        );
    }

    if to_reply {
        let action: &[u8] = if to_add { b"psubscribe" } else { b"punsubscribe" };
        let mut builder = cc.shared.builder.lock();
        for (i, pattern) in args.iter().enumerate() {
            builder.start_array(3);
            builder.send_bulk(action);
            builder.send_bulk(pattern);
            builder.send_long(counts[i] as i64);
        }
    }
}

/// UNSUBSCRIBE/PUNSUBSCRIBE with no arguments: drop everything,
/// acknowledging each name, or a single nil acknowledgement when there
/// was nothing to drop.
pub fn unsubscribe_all(cc: &ConnContext, patterns: bool) {
    let names = {
        let guard = cc.shared.subs.lock();
        match guard.as_ref() {
            Some(record) => {
                let set = if patterns {
                    &record.patterns
                } else {
                    &record.channels
                };
                set.iter().map(Bytes::copy_from_slice).collect::<Vec<_>>()
            }
            None => Vec::new(),
        }
    };

    if names.is_empty() {
        let action = if patterns { "punsubscribe" } else { "unsubscribe" };
        let mut builder = cc.shared.builder.lock();
        builder.start_array(3);
        builder.send_bulk(action.as_bytes());
        builder.send_null();
        builder.send_long(0);
        return;
    }

    if patterns {
        change_psub(cc, false, true, &names);
    } else {
        change_subscription(cc, false, true, &names);
    }
}

/// PUBLISH: resolve subscribers on the channel's owning shard, then
/// hand a delivery frame to each subscriber's async-enqueue entry
/// point. Replies with the number of receivers once every handoff has
/// been posted; it does not wait for the deliveries to be written.
pub fn publish(cc: &ConnContext, channel: Bytes, message: Bytes) {
    let sid = cc.shards.shard_of(&channel);
    let lookup = channel.clone();
    let subs = cc
        .shards
        .run_on(sid, move |shard| shard.channels.fetch_subscribers(&lookup));

    let subs = match subs {
        Some(subs) => subs,
        None => {
            cc.shared
                .builder
                .lock()
                .send_error("ERR server shutting down");
            return;
        }
    };

    let receivers = subs.len() as i64;
    for sub in subs {
        match sub.queue.upgrade() {
            Some(conn) => conn.enqueue_pub(PubFrame {
                pattern: sub.pattern,
                channel: channel.clone(),
                message: message.clone(),
                borrow: sub.borrow,
            }),
            None => {
                // connection already torn down; release the reference
                debug!("dropping publish to dead subscriber {}", sub.conn_id);
                sub.borrow.dec();
            }
        }
    }

    cc.shared.builder.lock().send_long(receivers);
}

/// PUBSUB CHANNELS: union of per-shard channel lists (disjoint by
/// construction), optionally filtered by a glob pattern.
pub fn pubsub_channels(cc: &ConnContext, pattern: Option<Bytes>) {
    let acc: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&acc);
    cc.shards.run_brief_in_parallel(
        move |shard: &mut EngineShard| {
            let mut channels = shard.channels.channels();
            sink.lock().append(&mut channels);
        },
        |_| true,
    );

    let mut channels = std::mem::take(&mut *acc.lock());
    if let Some(pattern) = pattern {
        channels.retain(|ch| glob_match(&pattern, ch));
    }

    let mut builder = cc.shared.builder.lock();
    builder.start_array(channels.len());
    for channel in &channels {
        builder.send_bulk(channel);
    }
    if channels.is_empty() {
        builder.flush();
    }
}

/// PUBSUB NUMSUB: exact-subscriber counts, each from the channel's
/// owning shard.
pub fn pubsub_numsub(cc: &ConnContext, channels: &[Bytes]) {
    let mut counts = Vec::with_capacity(channels.len());
    for channel in channels {
        let sid = cc.shards.shard_of(channel);
        let lookup = channel.clone();
        let count = cc
            .shards
            .run_on(sid, move |shard| {
                shard.channels.channel_subscriber_count(&lookup)
            })
            .unwrap_or(0);
        counts.push(count);
    }

    let mut builder = cc.shared.builder.lock();
    builder.start_array(channels.len() * 2);
    for (channel, count) in channels.iter().zip(counts) {
        builder.send_bulk(channel);
        builder.send_long(count as i64);
    }
    if channels.is_empty() {
        builder.flush();
    }
}

/// PUBSUB NUMPAT: patterns are replicated, so any shard answers.
pub fn pubsub_numpat(cc: &ConnContext) {
    let count = cc
        .shards
        .run_on(0, |shard| shard.channels.pattern_count())
        .unwrap_or(0);
    cc.shared.builder.lock().send_long(count as i64);
}

/// Connection close path: synthetic unsubscribe-all for channels, then
/// patterns, waiting for the borrow token to drain after each pass so
/// no publisher still holds a reference when the connection's storage
/// goes away.
pub fn on_close(cc: &ConnContext) {
    let (channels, token) = {
        let guard = cc.shared.subs.lock();
        match guard.as_ref() {
            Some(record) if !record.channels.is_empty() => (
                record
                    .channels
                    .iter()
                    .map(Bytes::copy_from_slice)
                    .collect::<Vec<_>>(),
                Some(record.borrow_token.clone()),
            ),
            _ => (Vec::new(), None),
        }
    };
    if !channels.is_empty() {
        change_subscription(cc, false, false, &channels);
        if let Some(token) = &token {
            token.wait();
        }
    }

    let (patterns, token) = {
        let guard = cc.shared.subs.lock();
        match guard.as_ref() {
            Some(record) if !record.patterns.is_empty() => (
                record
                    .patterns
                    .iter()
                    .map(Bytes::copy_from_slice)
                    .collect::<Vec<_>>(),
                Some(record.borrow_token.clone()),
            ),
            _ => (Vec::new(), None),
        }
    };
    if !patterns.is_empty() {
        change_psub(cc, false, false, &patterns);
        if let Some(token) = &token {
            token.wait();
        }
    }
}
