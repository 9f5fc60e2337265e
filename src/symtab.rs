//! Append-only symbol table used for both the global environment and each
//! function's local frame. Grounded on `examples/original_source/lookup.go`.

use indexmap::IndexMap;

use crate::value::Value;

/// Maps names to stable integer slots and stores the current value at each
/// slot. Slots are never reused or removed; `shadow`/`drop` rename a key out
/// of the way (and back) so a re-entered scope can see its own bindings
/// again without disturbing the slot indices already baked into compiled
/// code.
#[derive(Debug, Default)]
pub struct Lookup {
    key_to_index: IndexMap<String, usize>,
    index_to_key: Vec<String>,
    data: Vec<Value>,
    cap: usize,
}

impl Lookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// High-water mark of slots ever allocated, used to size a function's
    /// local register file.
    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn read(&self, index: usize) -> Value {
        self.data[index].clone()
    }

    pub fn write(&mut self, index: usize, v: Value) {
        self.data[index] = v;
    }

    /// Implicit coercion at a typed storage boundary (spec §3.6 `assign`).
    pub fn assign(&mut self, index: usize, v: Value) {
        let target_tag = self.data[index].tag;
        self.data[index] = v.assign(target_tag);
    }

    pub fn set(&mut self, key: &str, v: Value) {
        let n = self.index(key);
        self.data[n] = v;
    }

    pub fn get(&mut self, key: &str) -> Value {
        let n = self.index(key);
        self.data[n].clone()
    }

    /// Returns the slot for `key`, creating it (with a zero `Value`) if it
    /// does not already exist.
    pub fn index(&mut self, key: &str) -> usize {
        if let Some(&n) = self.key_to_index.get(key) {
            return n;
        }
        let n = self.data.len();
        self.data.push(Value::default());
        self.index_to_key.push(key.to_string());
        if self.data.len() > self.cap {
            self.cap = self.data.len();
        }
        self.key_to_index.insert(key.to_string(), n);
        n
    }

    fn shadow_rec(&mut self, key: &str) {
        if let Some(n) = self.key_to_index.shift_remove(key) {
            let hidden = format!("~{key}");
            self.shadow_rec(&hidden);
            self.key_to_index.insert(hidden, n);
        }
    }

    fn unshadow_rec(&mut self, key: &str) {
        let hidden = format!("~{key}");
        if let Some(n) = self.key_to_index.shift_remove(&hidden) {
            self.key_to_index.insert(key.to_string(), n);
            self.unshadow_rec(&hidden);
        }
    }

    /// Hides the current binding for `key` (if any) behind a `~`-prefixed
    /// name and allocates (or reuses, after a matching `drop`) a fresh slot.
    pub fn shadow(&mut self, key: &str) -> usize {
        self.shadow_rec(key);
        self.index(key)
    }

    /// Releases the last `count` slots: clears their name binding and
    /// restores whatever binding they had shadowed.
    pub fn drop(&mut self, count: usize) {
        for i in 1..=count {
            let n = self.data.len() - i;
            let key = std::mem::take(&mut self.index_to_key[n]);
            if key.is_empty() {
                continue;
            }
            self.key_to_index.shift_remove(&key);
            self.unshadow_rec(&key);
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.key_to_index.contains_key(key)
    }

    pub fn key(&self, index: usize) -> &str {
        &self.index_to_key[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_is_stable_and_reused() {
        let mut l = Lookup::new();
        let a = l.index("a");
        let a2 = l.index("a");
        assert_eq!(a, a2);
        let b = l.index("b");
        assert_ne!(a, b);
    }

    #[test]
    fn shadow_and_drop_restores_outer_binding() {
        let mut l = Lookup::new();
        let outer = l.index("x");
        l.write(outer, Value::from_int(1));

        let inner = l.shadow("x");
        assert_ne!(outer, inner);
        l.write(inner, Value::from_int(2));
        assert_eq!(l.read(l.index("x")).as_int(), 2);

        l.drop(1);
        assert_eq!(l.index("x"), outer);
        assert_eq!(l.read(outer).as_int(), 1);
    }

    #[test]
    fn cap_tracks_high_water_mark() {
        let mut l = Lookup::new();
        l.index("a");
        l.index("b");
        assert_eq!(l.cap(), 2);
        l.drop(1);
        assert_eq!(l.cap(), 2);
    }
}
