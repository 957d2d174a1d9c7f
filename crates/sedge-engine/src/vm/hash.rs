//! Open-addressed hash table with a split record.
//!
//! A hash record holds a header (size, log2 capacity, next free entry), an
//! entry array of `2^lgsz` key/value pairs, and an index table of
//! `2^(lgsz+1)` slots. Index slots are -1 (empty), -2 (tombstone), or an
//! entry index. Probing is open addressing with a key-dependent odd step so
//! every probe sequence cycles the whole table.
//!
//! The same structure backs the language's first-class hash values and the
//! activation record of every function call; the interned-symbol fast path
//! exists because local-variable lookup is by far the hottest operation.

use super::heap::Heap;
use super::value::{Kind, Ref};

const ENT_EMPTY: i32 = -1;
const ENT_DELETED: i32 = -2;

#[derive(Clone, Copy)]
pub(crate) struct HashEnt {
    pub(crate) key: Ref,
    pub(crate) val: Ref,
}

/// The allocated record behind a hash object.
pub(crate) struct HashRec {
    /// Number of active entries.
    pub(crate) size: i32,
    /// Base-2 logarithm of the entry capacity.
    pub(crate) lgsz: u32,
    /// Next entry slot to hand out.
    pub(crate) next: i32,
    pub(crate) ents: Box<[HashEnt]>,
    pub(crate) tab: Box<[i32]>,
}

fn mix32(mut h: u32) -> u32 {
    h ^= 0x2e63_823a;
    h = h.wrapping_add(h.rotate_left(15));
    h = h.wrapping_sub(h.rotate_left(9));
    h = h.wrapping_add(h.rotate_left(4));
    h = h.wrapping_sub(h.rotate_left(1));
    h ^= h.rotate_left(2);
    h
}

/// 4-byte-block mixing hash with the length seeded into the accumulator.
pub(crate) fn hash32(input: &[u8]) -> u32 {
    let mut h = input.len() as u32;
    let mut val = 0u32;
    let mut count = 0;
    for &b in input {
        val = (val << 8) ^ b as u32;
        count += 1;
        if count == 4 {
            h = mix32(h ^ val);
            val = 0;
            count = 0;
        }
    }
    mix32(h ^ val)
}

/// Hash code for a key reference. String hashes are cached in the string
/// object; numbers mix the two 32-bit halves of the bit pattern, with
/// negative zero normalized so it lands with positive zero.
pub(crate) fn refhash(heap: &mut Heap, key: Ref) -> u32 {
    if key.is_kind(Kind::Str) {
        let s = heap.string(key);
        if s.hashcode != 0 {
            return s.hashcode;
        }
        let code = hash32(s.bytes());
        heap.string_mut(key).hashcode = code;
        code
    } else if let Some(n) = key.as_num() {
        let n = if n == 0.0 { 0.0 } else { n };
        let bits = n.to_bits();
        mix32(mix32(bits as u32) ^ (bits >> 32) as u32)
    } else {
        let bits = key.bits();
        mix32(mix32(bits as u32) ^ (bits >> 32) as u32)
    }
}

/// Key equality: numbers by value, other references by identity, strings
/// additionally by bytes so non-interned lookups work.
pub(crate) fn keys_equal(heap: &Heap, a: Ref, b: Ref) -> bool {
    if let (Some(x), Some(y)) = (a.as_num(), b.as_num()) {
        return x == y;
    }
    if a.bits() == b.bits() {
        return true;
    }
    if a.is_kind(Kind::Str) && b.is_kind(Kind::Str) {
        let sa = heap.string(a);
        let sb = heap.string(b);
        return sa.len() == sb.len() && sa.bytes() == sb.bytes();
    }
    false
}

fn hbits(lgsz: u32, code: u32) -> usize {
    if lgsz > 0 {
        (code >> (32 - lgsz)) as usize
    } else {
        0
    }
}

impl HashRec {
    pub(crate) fn with_lgsz(lgsz: u32) -> HashRec {
        let ncells = 1usize << lgsz;
        HashRec {
            size: 0,
            lgsz,
            next: 0,
            ents: vec![
                HashEnt {
                    key: Ref::nil(),
                    val: Ref::nil()
                };
                ncells
            ]
            .into_boxed_slice(),
            tab: vec![ENT_EMPTY; ncells * 2].into_boxed_slice(),
        }
    }

    /// Index of the cell containing a matching key, or of the empty slot
    /// that would receive an insertion of that key.
    fn findcell(&self, heap: &Heap, key: Ref, code: u32) -> usize {
        let mask = (1usize << (self.lgsz + 1)) - 1;
        let step = (2 * code as usize + 1) & mask;
        let mut i = hbits(self.lgsz, code);
        while self.tab[i] != ENT_EMPTY {
            let e = self.tab[i];
            if e != ENT_DELETED && keys_equal(heap, key, self.ents[e as usize].key) {
                break;
            }
            i = (i + step) & mask;
        }
        i
    }

    fn set(&mut self, heap: &Heap, key: Ref, val: Ref, code: u32) {
        let cell = self.findcell(heap, key, code);
        let mut ent = self.tab[cell];
        if ent == ENT_EMPTY {
            ent = self.next;
            self.next += 1;
            if ent as usize >= self.ents.len() {
                return; // race protection, don't overrun
            }
            self.tab[cell] = ent;
            self.size += 1;
            self.ents[ent as usize].key = key;
        }
        self.ents[ent as usize].val = val;
    }
}

impl Heap {
    /// Number of live entries.
    pub(crate) fn hash_size(&self, h: Ref) -> usize {
        match &self.hashes.get(h.index()).rec {
            Some(rec) => rec.size as usize,
            None => 0,
        }
    }

    pub(crate) fn hash_get(&mut self, h: Ref, key: Ref) -> Option<Ref> {
        let code = refhash(self, key);
        let rec = self.hashes.get(h.index()).rec.as_ref()?;
        let cell = rec.findcell(self, key, code);
        let ent = rec.tab[cell];
        if ent < 0 {
            None
        } else {
            Some(rec.ents[ent as usize].val)
        }
    }

    pub(crate) fn hash_set(&mut self, h: Ref, key: Ref, val: Ref) {
        let grow = match &self.hashes.get(h.index()).rec {
            None => true,
            Some(rec) => rec.next >= (1 << rec.lgsz),
        };
        if grow {
            self.hash_resize(h);
        }
        let code = refhash(self, key);
        let mut rec = self
            .hashes
            .get_mut(h.index())
            .rec
            .take()
            .expect("hash record missing after resize");
        rec.set(self, key, val, code);
        self.hashes.get_mut(h.index()).rec = Some(rec);
    }

    /// Set only when the key is already present. Returns whether it was.
    pub(crate) fn hash_try_set(&mut self, h: Ref, key: Ref, val: Ref) -> bool {
        let code = refhash(self, key);
        let mut rec = match self.hashes.get_mut(h.index()).rec.take() {
            Some(rec) => rec,
            None => return false,
        };
        let cell = rec.findcell(self, key, code);
        let ent = rec.tab[cell];
        let hit = ent >= 0;
        if hit {
            rec.ents[ent as usize].val = val;
        }
        self.hashes.get_mut(h.index()).rec = Some(rec);
        hit
    }

    pub(crate) fn hash_delete(&mut self, h: Ref, key: Ref) {
        let code = refhash(self, key);
        let mut rec = match self.hashes.get_mut(h.index()).rec.take() {
            Some(rec) => rec,
            None => return,
        };
        let cell = rec.findcell(self, key, code);
        let mut shrink = false;
        if rec.tab[cell] >= 0 {
            rec.tab[cell] = ENT_DELETED;
            rec.size -= 1;
            shrink = rec.lgsz > 0 && rec.size < (1 << (rec.lgsz - 1));
        }
        self.hashes.get_mut(h.index()).rec = Some(rec);
        if shrink {
            self.hash_resize(h);
        }
    }

    /// The live keys, in entry order.
    pub(crate) fn hash_keys(&self, h: Ref) -> Vec<Ref> {
        let mut out = Vec::new();
        if let Some(rec) = &self.hashes.get(h.index()).rec {
            for i in 0..rec.tab.len() {
                let e = rec.tab[i];
                if e >= 0 {
                    out.push(rec.ents[e as usize].key);
                }
            }
        }
        out
    }

    /// Local-variable fast path: the key is an interned symbol, so pointer
    /// identity suffices and the hash code comes from the symbol's cache.
    pub(crate) fn hash_sym_get(&mut self, h: Ref, sym: Ref) -> Option<Ref> {
        let code = refhash(self, sym);
        let rec = self.hashes.get(h.index()).rec.as_ref()?;
        let mask = (1usize << (rec.lgsz + 1)) - 1;
        let step = (2 * code as usize + 1) & mask;
        let mut cell = hbits(rec.lgsz, code);
        while rec.tab[cell] != ENT_EMPTY {
            let e = rec.tab[cell];
            if e != ENT_DELETED && rec.ents[e as usize].key.bits() == sym.bits() {
                return Some(rec.ents[e as usize].val);
            }
            cell = (cell + step) & mask;
        }
        None
    }

    /// Local-variable fast insert: the key is interned and known absent, so
    /// the probe only has to find an empty cell.
    pub(crate) fn hash_new_sym(&mut self, h: Ref, sym: Ref, val: Ref) {
        let grow = match &self.hashes.get(h.index()).rec {
            None => true,
            Some(rec) => rec.next >= (1 << rec.lgsz),
        };
        if grow {
            self.hash_resize(h);
        }
        let code = refhash(self, sym);
        let mut rec = self
            .hashes
            .get_mut(h.index())
            .rec
            .take()
            .expect("hash record missing after resize");
        let mask = (1usize << (rec.lgsz + 1)) - 1;
        let step = (2 * code as usize + 1) & mask;
        let mut cell = hbits(rec.lgsz, code);
        while rec.tab[cell] != ENT_EMPTY {
            cell = (cell + step) & mask;
        }
        let ent = rec.next;
        rec.next += 1;
        if (ent as usize) < rec.ents.len() {
            rec.tab[cell] = ent;
            rec.size += 1;
            rec.ents[ent as usize] = HashEnt { key: sym, val };
        }
        self.hashes.get_mut(h.index()).rec = Some(rec);
    }

    /// Rebuild the record sized for the current entry count. The old record
    /// is dropped on replacement; with every access serialized by the
    /// runtime lock there are no concurrent probers to protect.
    fn hash_resize(&mut self, h: Ref) {
        let old = self.hashes.get_mut(h.index()).rec.take();
        let mut lgsz = 0;
        if let Some(rec) = &old {
            let mut sz = rec.size;
            while sz != 0 {
                sz >>= 1;
                lgsz += 1;
            }
        }
        let mut fresh = HashRec::with_lgsz(lgsz);
        if let Some(rec) = &old {
            for i in 0..rec.tab.len() {
                let e = rec.tab[i];
                if e >= 0 {
                    let ent = rec.ents[e as usize];
                    let code = refhash(self, ent.key);
                    fresh.set(self, ent.key, ent.val, code);
                }
            }
        }
        self.hashes.get_mut(h.index()).rec = Some(Box::new(fresh));
    }
}
