//! Robin-Hood open-addressing integer-keyed hash map used for struct field
//! and method tables. Ported in behavior from
//! `examples/original_source/intmap.go` (see
//! <https://programming.guide/robin-hood-hashing.html>).

use crate::value::Value;

const INT_MAP_MIN: usize = 16;

#[derive(Clone)]
struct Pair {
    distance: i32,
    key: i64,
    value: Value,
}

impl Default for Pair {
    fn default() -> Self {
        Pair {
            distance: 0,
            key: 0,
            value: Value::default(),
        }
    }
}

#[derive(Clone)]
pub struct IntMap {
    pairs: Vec<Pair>,
    total: usize,
    size: usize,
    mask: usize,
    min: usize,
    max: usize,
}

fn hash(key: i64) -> usize {
    key as usize
}

impl IntMap {
    pub fn new() -> Self {
        let mut m = IntMap {
            pairs: Vec::new(),
            total: 0,
            size: 0,
            mask: 0,
            min: 0,
            max: 0,
        };
        m.init(INT_MAP_MIN, 0);
        m
    }

    /// Preallocates a map large enough to hold `alloc` entries without a
    /// resize.
    pub fn with_capacity(alloc: usize) -> Self {
        let mut size = INT_MAP_MIN;
        while size < alloc << 1 {
            size <<= 1;
        }
        let mut m = IntMap {
            pairs: Vec::new(),
            total: 0,
            size: 0,
            mask: 0,
            min: 0,
            max: 0,
        };
        m.init(size, 0);
        m
    }

    fn init(&mut self, size: usize, total: usize) {
        self.pairs = vec![Pair::default(); size];
        self.total = total;
        self.size = size;
        self.mask = size - 1;
        self.max = size * 3 / 4;
        self.min = size / 4;
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn set(&mut self, key: i64, value: Value) {
        let h = hash(key);
        let mut i = h;
        loop {
            i &= self.mask;
            if self.pairs[i].distance == 0 {
                self.insert(h, key, value);
                self.total += 1;
                if self.total > self.max {
                    let new_size = self.size << 1;
                    self.resize(new_size);
                }
                return;
            }
            if self.pairs[i].key == key {
                self.pairs[i].value = value;
                return;
            }
            i += 1;
        }
    }

    pub fn assign(&mut self, key: i64, value: Value) {
        let h = hash(key);
        let mut i = h;
        loop {
            i &= self.mask;
            if self.pairs[i].distance == 0 {
                return;
            }
            if self.pairs[i].key == key {
                let target = self.pairs[i].value.tag;
                self.pairs[i].value = value.assign(target);
                return;
            }
            i += 1;
        }
    }

    fn insert(&mut self, i: usize, key: i64, value: Value) {
        let mut pair = Pair {
            distance: 1,
            key,
            value,
        };
        let mut i = i;
        loop {
            i &= self.mask;
            if self.pairs[i].distance < pair.distance {
                std::mem::swap(&mut pair, &mut self.pairs[i]);
                if pair.distance == 0 {
                    return;
                }
            }
            pair.distance += 1;
            i += 1;
        }
    }

    pub fn get(&self, key: i64) -> Option<Value> {
        let mut i = hash(key);
        loop {
            i &= self.mask;
            if self.pairs[i].distance == 0 {
                return None;
            }
            if self.pairs[i].key == key {
                return Some(self.pairs[i].value.clone());
            }
            i += 1;
        }
    }

    pub fn delete(&mut self, key: i64) {
        let mut i = hash(key);
        loop {
            i &= self.mask;
            if self.pairs[i].distance == 0 {
                return;
            }
            if self.pairs[i].key == key {
                let mut prev = i;
                let mut j = i + 1;
                loop {
                    j &= self.mask;
                    if self.pairs[j].distance <= 1 {
                        self.pairs[prev].distance = 0;
                        self.total -= 1;
                        if self.total < self.min {
                            let new_size = self.size >> 1;
                            self.resize(new_size);
                        }
                        return;
                    }
                    self.pairs[prev] = self.pairs[j].clone();
                    self.pairs[prev].distance -= 1;
                    prev = j;
                    j += 1;
                }
            }
            i += 1;
        }
    }

    fn resize(&mut self, size: usize) {
        let size = size.max(INT_MAP_MIN);
        if size == self.size {
            return;
        }
        let (old_pairs, total) = (std::mem::take(&mut self.pairs), self.total);
        self.init(size, total);
        for pair in old_pairs {
            if pair.distance == 0 {
                continue;
            }
            let h = hash(pair.key);
            self.insert(h, pair.key, pair.value);
        }
    }
}

impl Default for IntMap {
    fn default() -> Self {
        IntMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_roundtrip() {
        let mut m = IntMap::new();
        for i in 0..100 {
            m.set(i, Value::from_int(i as i32 * 2));
        }
        for i in 0..100 {
            assert_eq!(m.get(i).unwrap().as_int(), i as i32 * 2);
        }
        assert_eq!(m.len(), 100);
    }

    #[test]
    fn delete_removes_key() {
        let mut m = IntMap::new();
        m.set(1, Value::from_int(1));
        m.set(2, Value::from_int(2));
        m.delete(1);
        assert!(m.get(1).is_none());
        assert_eq!(m.get(2).unwrap().as_int(), 2);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn grows_and_shrinks() {
        let mut m = IntMap::new();
        for i in 0..1000 {
            m.set(i, Value::from_int(i as i32));
        }
        assert_eq!(m.len(), 1000);
        for i in 0..990 {
            m.delete(i);
        }
        assert_eq!(m.len(), 10);
        for i in 990..1000 {
            assert_eq!(m.get(i).unwrap().as_int(), i as i32);
        }
    }
}
