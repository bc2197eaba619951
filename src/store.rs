//! Slot store with generation-stamped handles.
//!
//! Entries live in a slab of reusable slots. A [`SlotId`] captures both
//! the slot index and the generation it was issued for, so a handle held
//! across a remove can never observe an unrelated entry that later
//! recycled the same slot. Lookups by [`Uuid`] go through a side index.

use std::collections::HashMap;

use uuid::Uuid;

/// Stable handle to a stored entry.
///
/// Becomes inert once the entry is removed; it never aliases a newer
/// occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u64,
    entry: Option<(Uuid, T)>,
}

#[derive(Debug)]
pub struct Store<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    index: HashMap<Uuid, SlotId>,
}

impl<T> Store<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Stores `value` under `id` and returns its handle.
    ///
    /// Inserting an id that is already present replaces the value in
    /// place and keeps the existing handle valid.
    pub fn insert(&mut self, id: Uuid, value: T) -> SlotId {
        if let Some(&handle) = self.index.get(&id) {
            self.slots[handle.index].entry = Some((id, value));
            return handle;
        }
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.generation += 1;
                slot.entry = Some((id, value));
                SlotId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some((id, value)),
                });
                SlotId {
                    index: self.slots.len() - 1,
                    generation: 0,
                }
            }
        };
        self.index.insert(id, handle);
        handle
    }

    pub fn get(&self, handle: SlotId) -> Option<&T> {
        let slot = self.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|(_, value)| value)
    }

    pub fn get_mut(&mut self, handle: SlotId) -> Option<&mut T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut().map(|(_, value)| value)
    }

    /// Removes the entry behind `handle`, freeing its slot for reuse.
    pub fn remove(&mut self, handle: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        let (id, value) = slot.entry.take()?;
        self.index.remove(&id);
        self.free.push(handle.index);
        Some(value)
    }

    pub fn handle(&self, id: &Uuid) -> Option<SlotId> {
        self.index.get(id).copied()
    }

    pub fn get_by_id(&self, id: &Uuid) -> Option<&T> {
        self.get(self.handle(id)?)
    }

    pub fn get_by_id_mut(&mut self, id: &Uuid) -> Option<&mut T> {
        self.get_mut(self.handle(id)?)
    }

    pub fn remove_by_id(&mut self, id: &Uuid) -> Option<T> {
        self.remove(self.handle(id)?)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Uuid, &T)> + '_ {
        self.slots
            .iter()
            .filter_map(|slot| slot.entry.as_ref().map(|(id, value)| (*id, value)))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> + '_ {
        self.iter().map(|(_, value)| value)
    }
}

impl<T> Default for Store<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut store = Store::new();
        let id = Uuid::new_v4();
        let handle = store.insert(id, "alpha");

        assert_eq!(store.get(handle), Some(&"alpha"));
        assert_eq!(store.get_by_id(&id), Some(&"alpha"));
        assert_eq!(store.handle(&id), Some(handle));
        assert_eq!(store.len(), 1);
        assert!(store.contains(&id));
    }

    #[test]
    fn remove_frees_the_entry() {
        let mut store = Store::new();
        let id = Uuid::new_v4();
        let handle = store.insert(id, 7);

        assert_eq!(store.remove(handle), Some(7));
        assert_eq!(store.get(handle), None);
        assert!(!store.contains(&id));
        assert!(store.is_empty());
        assert_eq!(store.remove(handle), None);
    }

    #[test]
    fn stale_handle_misses_recycled_slot() {
        let mut store = Store::new();
        let first = Uuid::new_v4();
        let stale = store.insert(first, "first");
        store.remove(stale);

        let second = Uuid::new_v4();
        let fresh = store.insert(second, "second");

        // Same slot, newer generation.
        assert_eq!(store.get(fresh), Some(&"second"));
        assert_eq!(store.get(stale), None);
        assert_eq!(store.remove(stale), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn insert_same_id_replaces_in_place() {
        let mut store = Store::new();
        let id = Uuid::new_v4();
        let first = store.insert(id, 1);
        let second = store.insert(id, 2);

        assert_eq!(first, second);
        assert_eq!(store.get(first), Some(&2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut store = Store::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        store.insert(keep, "keep");
        store.insert(drop, "drop");
        store.remove_by_id(&drop);

        let seen: Vec<_> = store.iter().collect();
        assert_eq!(seen, vec![(keep, &"keep")]);
    }
}
