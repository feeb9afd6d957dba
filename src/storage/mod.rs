mod string_set;

pub use string_set::StringSet;

use ahash::RandomState;
use bytes::Bytes;
use std::collections::HashMap;

/// A string entry with the memcache metadata riding along.
#[derive(Debug, Clone)]
pub struct StrEntry {
    pub data: Bytes,
    pub flags: u32,
    pub cas: u64,
}

/// A stored value: a plain string or a set of members.
pub enum Value {
    Str(StrEntry),
    Set(StringSet),
}

/// Access to a key holding a different value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

/// Outcome of a memcache incr/decr.
pub enum Numeric {
    Ok(u64),
    NotFound,
    NonNumeric,
}

/// Per-shard keyspace. Owned and mutated exclusively by the shard's
/// thread; no interior locking.
pub struct Store {
    map: HashMap<Vec<u8>, Value, RandomState>,
    next_cas: u64,
}

impl Store {
    pub fn new() -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            next_cas: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn get_str(&self, key: &[u8]) -> Result<Option<&StrEntry>, WrongType> {
        match self.map.get(key) {
            None => Ok(None),
            Some(Value::Str(entry)) => Ok(Some(entry)),
            Some(Value::Set(_)) => Err(WrongType),
        }
    }

    /// Unconditional overwrite; type confusion is resolved in favor of
    /// the new string.
    pub fn set_str(&mut self, key: &[u8], data: Bytes, flags: u32) {
        let cas = self.bump_cas();
        self.map
            .insert(key.to_vec(), Value::Str(StrEntry { data, flags, cas }));
    }

    /// Store only when the key is vacant (memcache `add`).
    pub fn add_str(&mut self, key: &[u8], data: Bytes, flags: u32) -> bool {
        if self.map.contains_key(key) {
            return false;
        }
        self.set_str(key, data, flags);
        true
    }

    /// Store only when the key already holds a string (memcache
    /// `replace`).
    pub fn replace_str(&mut self, key: &[u8], data: Bytes, flags: u32) -> bool {
        match self.map.get(key) {
            Some(Value::Str(_)) => {
                self.set_str(key, data, flags);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    /// Apply a memcache incr/decr to a decimal string value. Decrement
    /// floors at zero; increment wraps at 2^64 as memcache does.
    pub fn apply_delta(&mut self, key: &[u8], delta: u64, negative: bool) -> Numeric {
        let cas = self.bump_cas();
        match self.map.get_mut(key) {
            None => Numeric::NotFound,
            Some(Value::Set(_)) => Numeric::NonNumeric,
            Some(Value::Str(entry)) => {
                let current = match std::str::from_utf8(&entry.data)
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    Some(v) => v,
                    None => return Numeric::NonNumeric,
                };
                let next = if negative {
                    current.saturating_sub(delta)
                } else {
                    current.wrapping_add(delta)
                };
                entry.data = Bytes::from(next.to_string());
                entry.cas = cas;
                Numeric::Ok(next)
            }
        }
    }

    pub fn get_set(&self, key: &[u8]) -> Result<Option<&StringSet>, WrongType> {
        match self.map.get(key) {
            None => Ok(None),
            Some(Value::Set(set)) => Ok(Some(set)),
            Some(Value::Str(_)) => Err(WrongType),
        }
    }

    /// Mutable access to the set at `key`, created empty when vacant.
    pub fn set_mut(&mut self, key: &[u8]) -> Result<&mut StringSet, WrongType> {
        let value = self
            .map
            .entry(key.to_vec())
            .or_insert_with(|| Value::Set(StringSet::new()));
        match value {
            Value::Set(set) => Ok(set),
            Value::Str(_) => Err(WrongType),
        }
    }

    /// Drop a set key once its last member is gone.
    pub fn remove_if_empty_set(&mut self, key: &[u8]) {
        if let Some(Value::Set(set)) = self.map.get(key) {
            if set.is_empty() {
                self.map.remove(key);
            }
        }
    }

    fn bump_cas(&mut self) -> u64 {
        let cas = self.next_cas;
        self.next_cas += 1;
        cas
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
