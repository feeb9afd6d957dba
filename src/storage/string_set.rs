use ahash::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

const INITIAL_CAPACITY_LOG: u32 = 3;

/// Minimum number of elements a single scan call tries to emit before
/// returning an intermediate cursor.
const SCAN_BATCH_MIN: usize = 10;

/// Chain pressure that triggers a table doubling instead of a new link.
const CHAIN_FRACTION_SHIFT: u32 = 3; // chains may hold up to 1/8 of bucket count

type Key = Box<[u8]>;

/// Tail of a collision chain: either the final string or another link.
#[derive(Debug)]
enum Tail {
    Key(Key),
    Link(Box<LinkNode>),
}

#[derive(Debug)]
struct LinkNode {
    key: Key,
    next: Tail,
}

/// One table slot. A direct entry is either at its home bucket or, with
/// the displaced flag set, at a bucket one away from home. A chain head
/// only ever holds entries whose home is this bucket.
#[derive(Debug)]
enum Slot {
    Empty,
    Direct { key: Key, displaced: bool },
    Chain(Box<LinkNode>),
}

impl Slot {
    fn is_empty(&self) -> bool {
        matches!(self, Slot::Empty)
    }
}

/// A growable set of interned byte strings.
///
/// Open-addressed table indexed by the top `capacity_log` bits of a
/// 64-bit hash. A colliding entry may be displaced into one of the two
/// neighboring buckets; when the three-slot neighborhood is full and no
/// displaced occupant can be moved back toward its own home, the home
/// slot is promoted to a collision chain. Because the bucket id is a
/// hash prefix, scan cursors remain meaningful across table resizes:
/// growing refines each bucket into two adjacent ones below the same
/// prefix, shrinking merges neighbors into an already-covered prefix.
#[derive(Debug)]
pub struct StringSet {
    slots: Vec<Slot>,
    size: u32,
    num_chain_entries: u32,
    capacity_log: u32,
    obj_malloc_used: usize,
    hasher: RandomState,
}

impl StringSet {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            size: 0,
            num_chain_entries: 0,
            capacity_log: 0,
            obj_malloc_used: 0,
            hasher: RandomState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    /// Entries living in heap-allocated link nodes rather than inline
    /// in the bucket array.
    pub fn num_chain_entries(&self) -> usize {
        self.num_chain_entries as usize
    }

    /// Total bytes of stored string payloads.
    pub fn obj_malloc_used(&self) -> usize {
        self.obj_malloc_used
    }

    /// Table overhead: one word per bucket plus one per link node.
    pub fn set_malloc_used(&self) -> usize {
        (self.num_chain_entries as usize + self.slots.len()) * std::mem::size_of::<usize>()
    }

    /// Ensure capacity for at least `n` elements without growing.
    pub fn reserve(&mut self, n: usize) {
        let mut log = INITIAL_CAPACITY_LOG;
        while (1usize << log) < n {
            log += 1;
        }
        if log > self.capacity_log {
            self.rehash_to(log);
        }
    }

    /// Insert `s`; returns true iff it was not already present.
    pub fn add(&mut self, s: &[u8]) -> bool {
        if self.slots.is_empty() {
            self.rehash_to(INITIAL_CAPACITY_LOG);
        }
        if self.contains(s) {
            return false;
        }

        self.obj_malloc_used += s.len();
        self.size += 1;
        self.insert_unique(s.to_vec().into_boxed_slice(), true);
        true
    }

    pub fn contains(&self, s: &[u8]) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let bid = self.bucket_id(self.hash(s));

        for idx in self.neighborhood(bid) {
            match &self.slots[idx] {
                Slot::Direct { key, .. } if &key[..] == s => return true,
                Slot::Chain(head) if idx == bid => {
                    let mut node = head;
                    loop {
                        if &node.key[..] == s {
                            return true;
                        }
                        match &node.next {
                            Tail::Key(k) => return &k[..] == s,
                            Tail::Link(next) => node = next,
                        }
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Remove `s`; returns true iff it was present.
    pub fn remove(&mut self, s: &[u8]) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let bid = self.bucket_id(self.hash(s));

        for idx in self.neighborhood(bid) {
            match &self.slots[idx] {
                Slot::Direct { key, .. } if &key[..] == s => {
                    self.obj_malloc_used -= s.len();
                    self.size -= 1;
                    self.slots[idx] = Slot::Empty;
                    return true;
                }
                Slot::Chain(_) if idx == bid => {
                    let head = match std::mem::replace(&mut self.slots[bid], Slot::Empty) {
                        Slot::Chain(head) => head,
                        _ => unreachable!(),
                    };
                    let (tail, removed) = Self::chain_remove(head, s);
                    // a chain shrunk to one element collapses back inline
                    self.slots[bid] = match tail {
                        Tail::Key(k) => Slot::Direct {
                            key: k,
                            displaced: false,
                        },
                        Tail::Link(node) => Slot::Chain(node),
                    };
                    if removed {
                        self.obj_malloc_used -= s.len();
                        self.size -= 1;
                        self.num_chain_entries -= 1;
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Visit every stored string exactly once.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            set: self,
            bucket: 0,
            node: None,
        }
    }

    /// Scan a bounded batch of buckets, invoking `f` for every element
    /// whose home bucket falls inside the batch. Returns the next
    /// cursor, or 0 once the whole table has been covered.
    ///
    /// The cursor encodes the next home bucket in high-bit-first order,
    /// so elements present for the whole scan are emitted exactly once
    /// even if the table grows or shrinks between calls.
    pub fn scan(&self, cursor: u32, f: &mut dyn FnMut(&[u8])) -> u32 {
        if self.slots.is_empty() {
            return 0;
        }
        let shift = 32 - self.capacity_log;
        let nbuckets = self.slots.len();
        let mut bid = (cursor >> shift) as usize;
        if bid >= nbuckets {
            return 0;
        }

        let mut emitted = 0;
        loop {
            emitted += self.scan_bucket(bid, f);
            bid += 1;
            if bid >= nbuckets {
                return 0;
            }
            if emitted >= SCAN_BATCH_MIN {
                return (bid as u32) << shift;
            }
        }
    }

    /// How many entries (inline or chained) resolve to bucket `bid`'s
    /// three-slot neighborhood from `bid` itself.
    pub fn bucket_depth(&self, bid: usize) -> usize {
        self.scan_bucket(bid, &mut |_| {})
    }

    fn hash(&self, s: &[u8]) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        s.hash(&mut hasher);
        hasher.finish()
    }

    fn bucket_id(&self, hash: u64) -> usize {
        (hash >> (64 - self.capacity_log)) as usize
    }

    /// Probe order: home bucket, then left neighbor, then right.
    fn neighborhood(&self, bid: usize) -> impl Iterator<Item = usize> {
        let last = self.slots.len() - 1;
        let mut candidates = [Some(bid), None, None];
        if bid > 0 {
            candidates[1] = Some(bid - 1);
        }
        if bid < last {
            candidates[2] = Some(bid + 1);
        }
        candidates.into_iter().flatten()
    }

    fn find_empty_around(&self, bid: usize) -> Option<usize> {
        self.neighborhood(bid).find(|&idx| self.slots[idx].is_empty())
    }

    /// Place a key known to be absent. `allow_grow` is false during a
    /// rehash, where collisions resolve by chaining or eviction instead.
    fn insert_unique(&mut self, mut key: Key, allow_grow: bool) {
        loop {
            let bid = self.bucket_id(self.hash(&key));

            if let Some(idx) = self.find_empty_around(bid) {
                self.slots[idx] = Slot::Direct {
                    key,
                    displaced: idx != bid,
                };
                return;
            }

            // The neighborhood is full: try to move a displaced
            // occupant back toward its own home to make room.
            if self.try_swap_back(bid) {
                continue;
            }

            #[derive(Clone, Copy)]
            enum HomeSlot {
                Inline,
                Chained,
                Foreign,
            }
            let home_slot = match &self.slots[bid] {
                Slot::Direct { displaced: false, .. } => HomeSlot::Inline,
                Slot::Chain(_) => HomeSlot::Chained,
                Slot::Direct { displaced: true, .. } => HomeSlot::Foreign,
                Slot::Empty => unreachable!(),
            };

            match home_slot {
                HomeSlot::Inline => {
                    let pressure = self.num_chain_entries as usize + 1
                        > (self.slots.len() >> CHAIN_FRACTION_SHIFT);
                    if allow_grow && pressure {
                        self.rehash_to(self.capacity_log + 1);
                        continue;
                    }
                    self.prepend_link(bid, key);
                    return;
                }
                HomeSlot::Chained => {
                    // a second link at one bucket triggers growth
                    if allow_grow {
                        self.rehash_to(self.capacity_log + 1);
                        continue;
                    }
                    self.prepend_link(bid, key);
                    return;
                }
                HomeSlot::Foreign => {
                    if allow_grow {
                        self.rehash_to(self.capacity_log + 1);
                        continue;
                    }
                    // Rehash path: evict the foreign occupant, take its
                    // slot as home, and re-place the evictee. Each
                    // eviction settles one displaced entry at or around
                    // its home, so the cascade terminates.
                    let evicted = match std::mem::replace(
                        &mut self.slots[bid],
                        Slot::Direct {
                            key,
                            displaced: false,
                        },
                    ) {
                        Slot::Direct { key, .. } => key,
                        _ => unreachable!(),
                    };
                    key = evicted;
                }
            }
        }
    }

    /// If any slot in `bid`'s neighborhood holds a displaced entry that
    /// can legally move to a free slot around its own home bucket, move
    /// it and report success.
    fn try_swap_back(&mut self, bid: usize) -> bool {
        let candidates: Vec<usize> = self.neighborhood(bid).collect();
        for idx in candidates {
            let home = match &self.slots[idx] {
                Slot::Direct {
                    key,
                    displaced: true,
                } => self.bucket_id(self.hash(key)),
                _ => continue,
            };
            if let Some(dest) = self.find_empty_around(home) {
                let key = match std::mem::replace(&mut self.slots[idx], Slot::Empty) {
                    Slot::Direct { key, .. } => key,
                    _ => unreachable!(),
                };
                self.slots[dest] = Slot::Direct {
                    key,
                    displaced: dest != home,
                };
                return true;
            }
        }
        false
    }

    /// Promote (or extend) the chain at `bid` with a new head link.
    fn prepend_link(&mut self, bid: usize, key: Key) {
        let tail = match std::mem::replace(&mut self.slots[bid], Slot::Empty) {
            Slot::Direct { key, .. } => Tail::Key(key),
            Slot::Chain(node) => Tail::Link(node),
            Slot::Empty => unreachable!(),
        };
        self.slots[bid] = Slot::Chain(Box::new(LinkNode { key, next: tail }));
        self.num_chain_entries += 1;
    }

    /// Remove `s` from a chain, returning the rebuilt tail and whether
    /// a removal happened. Every removal frees exactly one link node.
    fn chain_remove(node: Box<LinkNode>, s: &[u8]) -> (Tail, bool) {
        let LinkNode { key, next } = *node;
        if &key[..] == s {
            return (next, true);
        }
        match next {
            Tail::Key(k) => {
                if &k[..] == s {
                    (Tail::Key(key), true)
                } else {
                    let next = Tail::Key(k);
                    (Tail::Link(Box::new(LinkNode { key, next })), false)
                }
            }
            Tail::Link(child) => {
                let (next, removed) = Self::chain_remove(child, s);
                (Tail::Link(Box::new(LinkNode { key, next })), removed)
            }
        }
    }

    /// Rebuild the table at `capacity_log = log`, re-placing every
    /// entry. Chains dissolve and reform only where still necessary.
    fn rehash_to(&mut self, log: u32) {
        let old = std::mem::take(&mut self.slots);
        self.capacity_log = log;
        self.num_chain_entries = 0;
        self.slots = (0..1usize << log).map(|_| Slot::Empty).collect();

        for slot in old {
            match slot {
                Slot::Empty => {}
                Slot::Direct { key, .. } => self.insert_unique(key, false),
                Slot::Chain(head) => {
                    let mut tail = Tail::Link(head);
                    loop {
                        match tail {
                            Tail::Key(key) => {
                                self.insert_unique(key, false);
                                break;
                            }
                            Tail::Link(node) => {
                                self.insert_unique(node.key, false);
                                tail = node.next;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Emit every element whose home bucket is `bid`: the inline home
    /// entry or chain at `bid`, plus displaced entries parked in the
    /// two neighboring slots.
    fn scan_bucket(&self, bid: usize, f: &mut dyn FnMut(&[u8])) -> usize {
        let mut emitted = 0;

        match &self.slots[bid] {
            Slot::Direct {
                key,
                displaced: false,
            } => {
                f(key);
                emitted += 1;
            }
            Slot::Chain(head) => {
                let mut node = head;
                loop {
                    f(&node.key);
                    emitted += 1;
                    match &node.next {
                        Tail::Key(k) => {
                            f(k);
                            emitted += 1;
                            break;
                        }
                        Tail::Link(next) => node = next,
                    }
                }
            }
            _ => {}
        }

        for idx in [bid.wrapping_sub(1), bid + 1] {
            if idx >= self.slots.len() {
                continue;
            }
            if let Slot::Direct {
                key,
                displaced: true,
            } = &self.slots[idx]
            {
                if self.bucket_id(self.hash(key)) == bid {
                    f(key);
                    emitted += 1;
                }
            }
        }

        emitted
    }
}

impl Default for StringSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Slot-order iterator over all stored strings.
pub struct Iter<'a> {
    set: &'a StringSet,
    bucket: usize,
    node: Option<&'a LinkNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if let Some(node) = self.node.take() {
            return Some(match &node.next {
                // final chain element; resume at the next bucket
                Tail::Key(k) => &k[..],
                Tail::Link(next) => {
                    self.node = Some(next.as_ref());
                    &next.key[..]
                }
            });
        }

        while self.bucket < self.set.slots.len() {
            let bid = self.bucket;
            self.bucket += 1;
            match &self.set.slots[bid] {
                Slot::Empty => {}
                Slot::Direct { key, .. } => return Some(&key[..]),
                Slot::Chain(head) => {
                    self.node = Some(head.as_ref());
                    return Some(&head.key[..]);
                }
            }
        }
        None
    }
}
