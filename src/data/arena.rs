//! A generational arena providing the stable handles exposed by the public
//! API.
//!
//! Adapted from the generational-arena crate, with deterministic slot reuse:
//! freed slots are recycled in LIFO order and generations only ever grow, so
//! two runs performing the same sequence of insertions and removals hand out
//! identical indices.

use std::iter;
use std::mem;
use std::ops;

/// The `Arena` allows inserting and removing elements that are referred to by
/// `Index`.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Arena<T> {
    items: Vec<Entry<T>>,
    generation: u32,
    free_list_head: Option<u32>,
    len: usize,
}

#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
enum Entry<T> {
    Free { next_free: Option<u32> },
    Occupied { generation: u32, value: T },
}

/// An index (and generation) into an `Arena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde-serialize", derive(Serialize, Deserialize))]
pub struct Index {
    index: u32,
    generation: u32,
}

impl Index {
    /// Creates a new `Index` from its raw parts.
    ///
    /// The parts must have been returned from an earlier call to
    /// `into_raw_parts`.
    pub fn from_raw_parts(index: u32, generation: u32) -> Index {
        Index { index, generation }
    }

    /// Converts this `Index` into its raw parts.
    pub fn into_raw_parts(self) -> (u32, u32) {
        (self.index, self.generation)
    }

    /// The slot this index refers to, ignoring the generation.
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }

    /// An index that will never point to a live entry.
    pub fn invalid() -> Index {
        Index {
            index: crate::INVALID_U32,
            generation: crate::INVALID_U32,
        }
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates a new, empty arena.
    pub fn new() -> Self {
        Self::with_capacity(4)
    }

    /// Creates a new, empty arena able to hold `n` elements without
    /// reallocating.
    pub fn with_capacity(n: usize) -> Self {
        let mut arena = Arena {
            items: Vec::new(),
            generation: 0,
            free_list_head: None,
            len: 0,
        };
        arena.reserve(n);
        arena
    }

    /// The number of elements in the arena.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena contains no element.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Allocates capacity for `additional_capacity` more elements.
    pub fn reserve(&mut self, additional_capacity: usize) {
        let start = self.items.len();
        let end = start + additional_capacity;
        let old_head = self.free_list_head;
        self.items.reserve_exact(additional_capacity);
        self.items.extend((start..end).map(|i| {
            if i == end - 1 {
                Entry::Free {
                    next_free: old_head,
                }
            } else {
                Entry::Free {
                    next_free: Some(i as u32 + 1),
                }
            }
        }));
        if additional_capacity > 0 {
            self.free_list_head = Some(start as u32);
        }
    }

    /// Inserts `value` into the arena, returning the index assigned to it.
    pub fn insert(&mut self, value: T) -> Index {
        match self.try_insert(value) {
            Ok(i) => i,
            Err(value) => self.insert_slow_path(value),
        }
    }

    fn try_insert(&mut self, value: T) -> Result<Index, T> {
        match self.free_list_head {
            None => Err(value),
            Some(i) => match self.items[i as usize] {
                Entry::Occupied { .. } => panic!("corrupt free list"),
                Entry::Free { next_free } => {
                    self.free_list_head = next_free;
                    self.len += 1;
                    self.items[i as usize] = Entry::Occupied {
                        generation: self.generation,
                        value,
                    };
                    Ok(Index {
                        index: i,
                        generation: self.generation,
                    })
                }
            },
        }
    }

    #[inline(never)]
    fn insert_slow_path(&mut self, value: T) -> Index {
        let len = self.items.len();
        self.reserve(len.max(4));
        self.try_insert(value)
            .map_err(|_| ())
            .expect("inserting will always succeed after reserving additional space")
    }

    /// Removes the element at `i` from the arena, if it exists.
    pub fn remove(&mut self, i: Index) -> Option<T> {
        if i.index as usize >= self.items.len() {
            return None;
        }

        match self.items[i.index as usize] {
            Entry::Occupied { generation, .. } if i.generation == generation => {
                let entry = mem::replace(
                    &mut self.items[i.index as usize],
                    Entry::Free {
                        next_free: self.free_list_head,
                    },
                );
                self.generation += 1;
                self.free_list_head = Some(i.index);
                self.len -= 1;

                match entry {
                    Entry::Occupied {
                        generation: _,
                        value,
                    } => Some(value),
                    _ => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Whether `i` refers to a live element of the arena.
    pub fn contains(&self, i: Index) -> bool {
        self.get(i).is_some()
    }

    /// Gets a reference to the element at `i`, if it exists.
    pub fn get(&self, i: Index) -> Option<&T> {
        match self.items.get(i.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == i.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Gets the live element stored in slot `slot` together with its full
    /// index, regardless of generation.
    pub fn get_unknown_gen(&self, slot: u32) -> Option<(Index, &T)> {
        match self.items.get(slot as usize) {
            Some(Entry::Occupied { generation, value }) => Some((
                Index {
                    index: slot,
                    generation: *generation,
                },
                value,
            )),
            _ => None,
        }
    }

    /// Gets a mutable reference to the element at `i`, if it exists.
    pub fn get_mut(&mut self, i: Index) -> Option<&mut T> {
        match self.items.get_mut(i.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == i.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    /// Iterates over the live elements of the arena with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (Index, &T)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    Index {
                        index: i as u32,
                        generation: *generation,
                    },
                    value,
                )),
                _ => None,
            })
    }

    /// Removes every element from the arena.
    pub fn clear(&mut self) {
        self.len = 0;
        let end = self.items.len();
        self.items
            .iter_mut()
            .zip((1..end + 1).map(|i| i as u32))
            .for_each(|(entry, next)| {
                *entry = Entry::Free {
                    next_free: if next as usize == end {
                        None
                    } else {
                        Some(next)
                    },
                };
            });
        self.free_list_head = if end == 0 { None } else { Some(0) };
    }
}

impl<T> ops::Index<Index> for Arena<T> {
    type Output = T;

    fn index(&self, index: Index) -> &Self::Output {
        self.get(index).expect("no element at index")
    }
}

impl<T> ops::IndexMut<Index> for Arena<T> {
    fn index_mut(&mut self, index: Index) -> &mut Self::Output {
        self.get_mut(index).expect("no element at index")
    }
}

impl<T> iter::FromIterator<T> for Arena<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let (lower, upper) = iter.size_hint();
        let cap = upper.unwrap_or(lower).max(lower).max(4);
        let mut arena = Arena::with_capacity(cap);
        for value in iter {
            arena.insert(value);
        }
        arena
    }
}

#[cfg(test)]
mod test {
    use super::Arena;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena[a], "a");
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena[b], "b");
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_index_does_not_alias_reused_slot() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        arena.remove(a);
        let b = arena.insert(2);
        // The slot is reused but the generation differs.
        assert_eq!(a.index(), b.index());
        assert_eq!(arena.get(a), None);
        assert_eq!(arena[b], 2);
    }

    #[test]
    fn deterministic_reuse() {
        let build = || {
            let mut arena = Arena::new();
            let h: Vec<_> = (0..8).map(|i| arena.insert(i)).collect();
            arena.remove(h[3]);
            arena.remove(h[5]);
            let i = arena.insert(100);
            let j = arena.insert(101);
            (i, j)
        };
        assert_eq!(build(), build());
    }
}
