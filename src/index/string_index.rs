//! String interning index
//!
//! Strings are registered in two phases. [`StringIndex::intern_transient`]
//! copies the bytes into a shard's byte arena and hands back a
//! [`StringHandle`]; nothing is visible to readers yet. [`StringIndex::harden`]
//! publishes the canonical `Arc<str>` under the shard write lock, the same
//! lock readers take, so a reader either sees the published string or an
//! unknown handle, never a half-promoted one.
//!
//! ```text
//!  shard ──▶ arena:   |U|S|D|E|U|R|A|a|B|B| ...        (u32 offsets)
//!            entries: [0] off 0  len 3  published
//!                     [1] off 3  len 3  transient
//!                     [2] off 6  len 2  published
//!                     [3] vacant, gen 1             ──▶ free list
//!            by_hash: h("Aa") ──▶ [2]   (collisions compared by bytes)
//! ```
//!
//! [`StringIndex::evict_transient`] empties the slots of unhardened entries,
//! puts them on the shard's free list and compacts the arena. A reused slot
//! carries a new generation, so a handle to the discarded entry stays unknown.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Most shards a handle can address
const MAX_SHARDS: usize = 1 << 16;

/// Hash used to route and bucket strings
pub type StringHashFn = fn(&str) -> u32;

/// Polynomial string hash (31-multiplier over UTF-16 code units)
pub fn polynomial_hash(s: &str) -> u32 {
    s.encode_utf16()
        .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as u32))
}

/// Address of an interned string: shard in the top 16 bits, slot generation
/// in the next 16, entry slot in the low half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StringHandle(u64);

impl StringHandle {
    fn new(shard: usize, generation: u16, slot: u32) -> Self {
        Self(((shard as u64) << 48) | ((generation as u64) << 32) | slot as u64)
    }

    fn shard(&self) -> usize {
        (self.0 >> 48) as usize
    }

    fn generation(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    fn slot(&self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct StringEntry {
    offset: u32,
    len: u32,
    hash: u32,
    /// Bumped each time the slot is emptied
    generation: u16,
    /// Canonical instance; None until hardened
    published: Option<Arc<str>>,
    /// Slot emptied by eviction and waiting on the free list
    vacant: bool,
}

#[derive(Debug, Default)]
struct StringShard {
    arena: Vec<u8>,
    entries: Vec<StringEntry>,
    by_hash: HashMap<u32, Vec<u32>>,
    free: Vec<u32>,
}

impl StringShard {
    fn bytes(&self, entry: &StringEntry) -> &[u8] {
        &self.arena[entry.offset as usize..(entry.offset + entry.len) as usize]
    }

    fn find(&self, hash: u32, s: &str) -> Option<u32> {
        self.by_hash.get(&hash)?.iter().copied().find(|&slot| {
            let entry = &self.entries[slot as usize];
            !entry.vacant && self.bytes(entry) == s.as_bytes()
        })
    }

    /// Live entry a handle points at
    fn entry(&self, handle: StringHandle) -> Option<&StringEntry> {
        self.entries
            .get(handle.slot())
            .filter(|e| !e.vacant && e.generation == handle.generation())
    }

    fn append(&mut self, hash: u32, s: &str) -> Result<u32> {
        let (offset, len) = match (u32::try_from(self.arena.len()), u32::try_from(s.len())) {
            (Ok(offset), Ok(len)) if offset.checked_add(len).is_some() => (offset, len),
            _ => return Err(Error::Internal("string arena exhausted".into())),
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                let entry = &mut self.entries[slot as usize];
                entry.offset = offset;
                entry.len = len;
                entry.hash = hash;
                entry.vacant = false;
                slot
            }
            None => {
                let slot = u32::try_from(self.entries.len())
                    .map_err(|_| Error::Internal("string index slots exhausted".into()))?;
                self.entries.push(StringEntry {
                    offset,
                    len,
                    hash,
                    generation: 0,
                    published: None,
                    vacant: false,
                });
                slot
            }
        };
        self.arena.extend_from_slice(s.as_bytes());
        self.by_hash.entry(hash).or_default().push(slot);
        Ok(slot)
    }

    fn publish(&mut self, handle: StringHandle) -> Option<Arc<str>> {
        let entry = self.entry(handle)?;
        if let Some(published) = &entry.published {
            return Some(Arc::clone(published));
        }
        let text = std::str::from_utf8(self.bytes(entry)).ok()?;
        let canonical: Arc<str> = Arc::from(text);
        self.entries[handle.slot()].published = Some(Arc::clone(&canonical));
        Some(canonical)
    }

    /// Empty every transient slot; returns how many were emptied
    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        for slot in 0..self.entries.len() {
            let entry = &mut self.entries[slot];
            if entry.vacant || entry.published.is_some() {
                continue;
            }
            entry.vacant = true;
            entry.generation = entry.generation.wrapping_add(1);
            entry.len = 0;
            entry.offset = 0;
            let hash = entry.hash;
            if let Some(bucket) = self.by_hash.get_mut(&hash) {
                bucket.retain(|&s| s as usize != slot);
                if bucket.is_empty() {
                    self.by_hash.remove(&hash);
                }
            }
            self.free.push(slot as u32);
            evicted += 1;
        }
        if evicted > 0 {
            self.compact();
        }
        evicted
    }

    /// Rewrite the arena with only the bytes of occupied slots
    fn compact(&mut self) {
        let live: usize = self.entries.iter().map(|e| e.len as usize).sum();
        let mut arena = Vec::with_capacity(live);
        for entry in self.entries.iter_mut().filter(|e| !e.vacant) {
            let start = entry.offset as usize;
            entry.offset = arena.len() as u32;
            arena.extend_from_slice(&self.arena[start..start + entry.len as usize]);
        }
        self.arena = arena;
    }
}

/// Sharded interning table
pub struct StringIndex {
    shards: Box<[CachePadded<RwLock<StringShard>>]>,
    mask: usize,
    hash: StringHashFn,
}

impl Default for StringIndex {
    fn default() -> Self {
        Self::new(16)
    }
}

impl StringIndex {
    pub fn new(shard_count: usize) -> Self {
        Self::with_hash_fn(shard_count, polynomial_hash)
    }

    /// Use a custom hash; shard count is rounded up to a power of two and
    /// capped at 65536
    pub fn with_hash_fn(shard_count: usize, hash: StringHashFn) -> Self {
        let count = shard_count.clamp(1, MAX_SHARDS).next_power_of_two();
        Self {
            shards: (0..count)
                .map(|_| CachePadded::new(RwLock::new(StringShard::default())))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            mask: count - 1,
            hash,
        }
    }

    fn route(&self, s: &str) -> (usize, u32) {
        let hash = (self.hash)(s);
        (hash as usize & self.mask, hash)
    }

    /// Register `s` without publishing it
    pub fn intern_transient(&self, s: &str) -> Result<StringHandle> {
        self.get_if_absent_put(s, false)
    }

    /// Find or register `s`; with `hard` the entry is published in the same
    /// critical section
    pub fn get_if_absent_put(&self, s: &str, hard: bool) -> Result<StringHandle> {
        let (shard_index, hash) = self.route(s);
        let shard = &self.shards[shard_index];
        {
            let guard = shard.read();
            if let Some(slot) = guard.find(hash, s) {
                let entry = &guard.entries[slot as usize];
                if entry.published.is_some() || !hard {
                    return Ok(StringHandle::new(shard_index, entry.generation, slot));
                }
            }
        }

        let mut guard = shard.write();
        let slot = match guard.find(hash, s) {
            Some(slot) => slot,
            None => guard.append(hash, s)?,
        };
        let handle = StringHandle::new(shard_index, guard.entries[slot as usize].generation, slot);
        if hard {
            guard.publish(handle);
        }
        Ok(handle)
    }

    /// Canonical instance of `s`, registering and publishing it if needed
    pub fn intern(&self, s: &str) -> Result<Arc<str>> {
        let handle = self.get_if_absent_put(s, true)?;
        self.lookup(handle)
            .ok_or_else(|| Error::Internal(format!("interned string {:?} not published", s)))
    }

    /// Publish a transient handle
    pub fn harden(&self, handle: StringHandle) -> Result<Arc<str>> {
        let shard = self
            .shards
            .get(handle.shard())
            .ok_or_else(|| stale(handle, "shard out of range"))?;
        shard
            .write()
            .publish(handle)
            .ok_or_else(|| stale(handle, "handle unknown or discarded before hardening"))
    }

    /// Published instance for a handle; None while the handle is transient
    pub fn lookup(&self, handle: StringHandle) -> Option<Arc<str>> {
        let guard = self.shards.get(handle.shard())?.read();
        guard.entry(handle).and_then(|e| e.published.clone())
    }

    /// Published instance equal to `s`
    pub fn get(&self, s: &str) -> Option<Arc<str>> {
        let (shard_index, hash) = self.route(s);
        let guard = self.shards[shard_index].read();
        let slot = guard.find(hash, s)?;
        guard.entries[slot as usize].published.clone()
    }

    /// Discard every transient entry and reclaim its space; their handles
    /// become unknown
    pub fn evict_transient(&self) -> usize {
        self.shards.iter().map(|shard| shard.write().evict()).sum()
    }

    /// Number of published strings
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().entries.iter().filter(|e| e.published.is_some()).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held in the arenas
    pub fn arena_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.read().arena.len()).sum()
    }

    /// Entry slots allocated, occupied or free
    pub fn slot_count(&self) -> usize {
        self.shards.iter().map(|s| s.read().entries.len()).sum()
    }
}

fn stale(handle: StringHandle, reason: &str) -> Error {
    Error::StaleReference {
        cache_id: 0,
        slot: handle.slot() as i32,
        reason: reason.to_string(),
    }
}
