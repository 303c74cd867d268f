//! Slot arena addressed by integer ids. Freed slots are reused, so an id is
//! only meaningful while its record is alive.

use std::marker::PhantomData;

pub trait ArenaId: Copy {
    fn from_index(index: usize) -> Self;
    fn index(self) -> usize;
}

#[derive(Debug, Clone)]
pub struct Arena<I, T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    live: usize,
    _id: PhantomData<I>,
}

impl<I: ArenaId, T> Default for Arena<I, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ArenaId, T> Arena<I, T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            _id: PhantomData,
        }
    }

    /// Builds an arena from records that already carry their ids.
    pub fn from_records(records: impl IntoIterator<Item = (I, T)>) -> Self {
        let mut slots: Vec<Option<T>> = Vec::new();
        let mut live = 0;
        for (id, record) in records {
            let idx = id.index();
            if idx >= slots.len() {
                slots.resize_with(idx + 1, || None);
            }
            if slots[idx].replace(record).is_none() {
                live += 1;
            }
        }
        let free = free_slots(&slots);
        Self {
            slots,
            free,
            live,
            _id: PhantomData,
        }
    }

    /// Stores the record built by `make` and returns its id.
    pub fn alloc(&mut self, make: impl FnOnce(I) -> T) -> I {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = I::from_index(idx);
        self.slots[idx] = Some(make(id));
        self.live += 1;
        id
    }

    pub fn get(&self, id: I) -> Option<&T> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }

    pub fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: I) -> Option<T> {
        let idx = id.index();
        let removed = self.slots.get_mut(idx).and_then(Option::take);
        if removed.is_some() {
            self.live -= 1;
            // Lowest ids are handed out first.
            let pos = self.free.partition_point(|&f| f > idx);
            self.free.insert(pos, idx);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.live = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (I, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|r| (I::from_index(idx), r)))
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}

/// Free slot indexes sorted descending so `pop` yields the lowest.
fn free_slots<T>(slots: &[Option<T>]) -> Vec<usize> {
    let mut free: Vec<usize> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_none())
        .map(|(i, _)| i)
        .collect();
    free.reverse();
    free
}
