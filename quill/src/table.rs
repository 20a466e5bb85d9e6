/// Open-addressed hash table keyed by interned strings.
///
/// DESIGN:
///   • Linear probing, power-of-two capacity (minimum 8), max load 0.75
///   • Keys are `ObjRef` handles to interned strings, so lookup equality is
///     handle identity; each entry caches the key's hash for probing
///   • Tombstones (no key, `true` value) keep probe chains intact after
///     deletes and are recycled on insert
///   • Per-entry flag bits; the VM uses `FLAG_IMMUTABLE` to mark `val`
///     globals
///   • `find_string` is the interner's probe path: it compares hashes in the
///     table and defers byte comparison to a caller-supplied closure, since
///     only the heap can see string contents

use crate::heap::ObjRef;
use crate::value::Value;

pub const FLAG_IMMUTABLE: u8 = 0x01;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;
const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy)]
struct Entry {
    key: Option<ObjRef>,
    hash: u32,
    value: Value,
    flags: u8,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, hash: 0, value: Value::Nil, flags: 0 };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

pub struct Table {
    entries: Vec<Entry>,
    /// Live entries plus tombstones; tombstones count toward load.
    count: usize,
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`. Returns the index of the matching entry, or of the
    /// slot an insert should use (recycling the first tombstone seen).
    fn find_slot(entries: &[Entry], key: ObjRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;

        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                Some(_) => {}
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.capacity() * 2).max(MIN_CAPACITY);
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_slot(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// Insert or overwrite. Returns true when the key was newly inserted.
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        self.set_with_flags(key, hash, value, 0)
    }

    pub fn set_with_flags(&mut self, key: ObjRef, hash: u32, value: Value, flags: u8) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.capacity() * MAX_LOAD_NUM {
            self.grow();
        }

        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry { key: Some(key), hash, value, flags };
        is_new
    }

    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Overwrite the value of an existing key, preserving its flags.
    /// Returns false if the key is absent.
    pub fn replace(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.value = value;
        true
    }

    pub fn has_flag(&self, key: ObjRef, hash: u32, flag: u8) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.is_some() && entry.flags & flag != 0
    }

    /// Remove a key, leaving a tombstone so later probes keep walking.
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Self::find_slot(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry { key: None, hash: 0, value: Value::Bool(true), flags: 0 };
        true
    }

    /// Copy every live entry into `dst`. Method inheritance is this in one
    /// call: subclass tables start as a copy of the superclass's.
    pub fn add_all_into(&self, dst: &mut Table) {
        for entry in &self.entries {
            if let Some(key) = entry.key {
                dst.set_with_flags(key, entry.hash, entry.value, entry.flags);
            }
        }
    }

    /// Interner probe: find a live key with this hash whose bytes match,
    /// per the `eq` closure. Stops at the first truly empty slot.
    pub fn find_string(&self, hash: u32, mut eq: impl FnMut(ObjRef) -> bool) -> Option<ObjRef> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(k) => {
                    if entry.hash == hash && eq(k) {
                        return Some(k);
                    }
                }
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Drop entries whose key the collector left unmarked. Used by the
    /// interner's weak pass before sweeping.
    pub fn remove_unmarked(&mut self, mut is_white: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if is_white(key) {
                    *entry = Entry { key: None, hash: 0, value: Value::Bool(true), flags: 0 };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjRef;

    fn key(i: u32) -> ObjRef {
        ObjRef::test_ref(i)
    }

    // A deliberately clustering hash exercises the probe chain.
    fn hash(i: u32) -> u32 {
        i % 4
    }

    #[test]
    fn test_set_get_overwrite() {
        let mut t = Table::new();
        assert!(t.set(key(1), hash(1), Value::Int(10)));
        assert!(!t.set(key(1), hash(1), Value::Int(20)));
        assert_eq!(t.get(key(1), hash(1)), Some(Value::Int(20)));
        assert_eq!(t.get(key(2), hash(2)), None);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut t = Table::new();
        // Same hash forces 1, 2, 3 into one probe chain.
        t.set(key(1), 5, Value::Int(1));
        t.set(key(2), 5, Value::Int(2));
        t.set(key(3), 5, Value::Int(3));
        assert!(t.delete(key(2), 5));
        assert_eq!(t.get(key(3), 5), Some(Value::Int(3)));
        assert_eq!(t.get(key(2), 5), None);
        // Tombstone slot is recycled by the next insert on the chain.
        t.set(key(4), 5, Value::Int(4));
        assert_eq!(t.get(key(4), 5), Some(Value::Int(4)));
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(key(i), hash(i), Value::Int(i as i64));
        }
        for i in 0..100 {
            assert_eq!(t.get(key(i), hash(i)), Some(Value::Int(i as i64)));
        }
    }

    #[test]
    fn test_flags() {
        let mut t = Table::new();
        t.set_with_flags(key(7), hash(7), Value::Int(1), FLAG_IMMUTABLE);
        assert!(t.has_flag(key(7), hash(7), FLAG_IMMUTABLE));
        // Plain value overwrite via replace keeps the flag.
        assert!(t.replace(key(7), hash(7), Value::Int(2)));
        assert!(t.has_flag(key(7), hash(7), FLAG_IMMUTABLE));
        assert_eq!(t.get(key(7), hash(7)), Some(Value::Int(2)));
    }

    #[test]
    fn test_add_all_into() {
        let mut a = Table::new();
        a.set(key(1), hash(1), Value::Int(1));
        a.set(key(2), hash(2), Value::Int(2));
        let mut b = Table::new();
        b.set(key(2), hash(2), Value::Int(20));
        a.add_all_into(&mut b);
        assert_eq!(b.get(key(1), hash(1)), Some(Value::Int(1)));
        // Copied entries overwrite, like superclass methods being rebound.
        assert_eq!(b.get(key(2), hash(2)), Some(Value::Int(2)));
    }

    #[test]
    fn test_find_string() {
        let mut t = Table::new();
        t.set(key(1), 42, Value::Nil);
        t.set(key(2), 43, Value::Nil);
        let found = t.find_string(42, |k| k == key(1));
        assert_eq!(found, Some(key(1)));
        // Hash matches but the byte comparison rejects it.
        assert_eq!(t.find_string(42, |_| false), None);
        assert_eq!(t.find_string(99, |_| true), None);
    }

    #[test]
    fn test_remove_unmarked() {
        let mut t = Table::new();
        t.set(key(1), 1, Value::Nil);
        t.set(key(2), 2, Value::Nil);
        t.remove_unmarked(|k| k == key(1));
        assert_eq!(t.get(key(1), 1), None);
        assert_eq!(t.get(key(2), 2), Some(Value::Nil));
    }
}
