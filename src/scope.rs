//! Dense per-symbol maps with scoped update.
//!
//! Passes thread per-buffer state (crops, inferred bounds, fold factors)
//! through recursive traversal. `set` returns the previous slot so the
//! caller can restore it after recursing into a binder:
//!
//! ```ignore
//! let old = map.set(sym, Some(value));
//! let body = self.fold_stmt(body);
//! let current = map.set(sym, old);
//! ```

use crate::ir::SymbolId;

/// Map from symbol id to `T`, backed by a dense vector. A slot is either
/// defined or not; `None` distinguishes "no entry" from any value of `T`.
#[derive(Debug, Clone)]
pub struct SymbolMap<T> {
    slots: Vec<Option<T>>,
}

impl<T> Default for SymbolMap<T> {
    fn default() -> Self {
        SymbolMap { slots: Vec::new() }
    }
}

impl<T> SymbolMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sym: SymbolId) -> Option<&T> {
        self.slots.get(sym.index()).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, sym: SymbolId) -> Option<&mut T> {
        self.slots.get_mut(sym.index()).and_then(|slot| slot.as_mut())
    }

    pub fn contains(&self, sym: SymbolId) -> bool {
        self.get(sym).is_some()
    }

    /// Replace the slot for `sym`, returning its previous contents. Grows
    /// the map as needed.
    pub fn set(&mut self, sym: SymbolId, value: Option<T>) -> Option<T> {
        let i = sym.index();
        if i >= self.slots.len() {
            self.slots.resize_with(i + 1, || None);
        }
        std::mem::replace(&mut self.slots[i], value)
    }

    pub fn insert(&mut self, sym: SymbolId, value: T) -> Option<T> {
        self.set(sym, Some(value))
    }

    pub fn remove(&mut self, sym: SymbolId) -> Option<T> {
        self.set(sym, None)
    }

    /// Iterate over the defined entries.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (SymbolId(i as u32), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (SymbolId, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (SymbolId(i as u32), v)))
    }

    /// Symbols with defined entries, collected. Handy when the entries
    /// themselves must be mutated while iterating.
    pub fn keys(&self) -> Vec<SymbolId> {
        self.iter().map(|(sym, _)| sym).collect()
    }
}
