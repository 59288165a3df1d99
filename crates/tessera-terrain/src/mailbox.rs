//! Double-buffered handoff list between producer threads and the main thread.

use parking_lot::Mutex;

struct Buffers<T> {
    lists: [Vec<T>; 2],
    active: usize,
}

/// A list written by many threads and periodically swapped out by one consumer.
///
/// Producers call [`add`](Self::add) from any thread. The consumer calls
/// [`switch_and_get`](Self::switch_and_get), which freezes the list that was
/// being written, makes the other (cleared) list active and hands the frozen
/// one back. An item added before a switch is part of that snapshot or the
/// next one, never both.
pub struct DoubleBufferedList<T> {
    buffers: Mutex<Buffers<T>>,
}

impl<T: PartialEq> DoubleBufferedList<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Buffers {
                lists: [Vec::new(), Vec::new()],
                active: 0,
            }),
        }
    }

    /// Appends an item unless an equal one is already pending.
    ///
    /// Returns `true` if the item was stored.
    pub fn add(&self, item: T) -> bool {
        let mut buffers = self.buffers.lock();
        let active = buffers.active;
        let list = &mut buffers.lists[active];
        if list.contains(&item) {
            return false;
        }
        list.push(item);
        true
    }

    /// Swaps the write list and returns everything added since the last switch.
    pub fn switch_and_get(&self) -> Vec<T> {
        let mut buffers = self.buffers.lock();
        let frozen = buffers.active;
        buffers.active = 1 - frozen;
        let next = buffers.active;
        buffers.lists[next].clear();
        let capacity = buffers.lists[frozen].capacity();
        std::mem::replace(&mut buffers.lists[frozen], Vec::with_capacity(capacity))
    }

    /// Number of pending items.
    #[must_use]
    pub fn len(&self) -> usize {
        let buffers = self.buffers.lock();
        buffers.lists[buffers.active].len()
    }

    /// Returns `true` when nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: PartialEq> Default for DoubleBufferedList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for DoubleBufferedList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let buffers = self.buffers.lock();
        f.debug_struct("DoubleBufferedList")
            .field("pending", &buffers.lists[buffers.active].len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tessera_common::Region;

    #[test]
    fn test_duplicates_are_dropped() {
        let list = DoubleBufferedList::new();
        assert!(list.add(Region::new(1, 0, 0, 4, 4)));
        assert!(!list.add(Region::new(1, 0, 0, 4, 4)));
        assert!(list.add(Region::new(2, 0, 0, 4, 4)));
        assert_eq!(list.len(), 2);

        let snapshot = list.switch_and_get();
        assert_eq!(snapshot.len(), 2);
        assert!(list.is_empty());
        assert!(list.switch_and_get().is_empty());
    }

    #[test]
    fn test_same_item_after_switch_is_delivered_again() {
        let list = DoubleBufferedList::new();
        list.add(7);
        assert_eq!(list.switch_and_get(), vec![7]);
        assert!(list.add(7));
        assert_eq!(list.switch_and_get(), vec![7]);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing() {
        let list = Arc::new(DoubleBufferedList::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        list.add(t * 1000 + i);
                    }
                })
            })
            .collect();

        let mut received = Vec::new();
        while producers.iter().any(|p| !p.is_finished()) {
            received.extend(list.switch_and_get());
        }
        for producer in producers {
            producer.join().expect("producer panicked");
        }
        received.extend(list.switch_and_get());

        received.sort_unstable();
        let expected: Vec<i32> = (0..4)
            .flat_map(|t| (0..500).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(received, expected);
    }

    proptest! {
        #[test]
        fn prop_every_add_lands_in_one_snapshot(
            ops in proptest::collection::vec(prop_oneof![
                (0u32..4).prop_map(Some),
                Just(None),
            ], 0..200)
        ) {
            let list = DoubleBufferedList::new();
            let mut snapshots: Vec<Vec<u32>> = Vec::new();
            let mut pending: Vec<u32> = Vec::new();
            for op in ops {
                match op {
                    Some(item) => {
                        let stored = list.add(item);
                        prop_assert_eq!(stored, !pending.contains(&item));
                        if stored {
                            pending.push(item);
                        }
                    }
                    None => {
                        let snapshot = list.switch_and_get();
                        prop_assert_eq!(&snapshot, &pending);
                        snapshots.push(snapshot);
                        pending.clear();
                    }
                }
            }
            prop_assert_eq!(list.switch_and_get(), pending);
        }
    }
}
