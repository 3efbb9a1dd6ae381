/// Number of items the shared table holds.
pub const TABLE_CAPACITY: usize = 2;

/// Fixed-capacity ring of item ids living inside the shared region.
///
/// The table does no locking of its own. `push` and `pop` trust the caller's
/// semaphore discipline: a producer only pushes after taking an `empty` slot,
/// a consumer only pops after taking a `full` one, and both hold the mutex.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SharedTable<const N: usize> {
    pub items: [i32; N],
    // next write position
    pub head: i32,
    // next read position
    pub tail: i32,
    pub count: i32,
    pub next_id: i32,
}

/// Bookkeeping fields copied out while the mutex was held.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub head: i32,
    pub tail: i32,
    pub count: i32,
    pub next_id: i32,
}

impl<const N: usize> Default for SharedTable<N> {
    fn default() -> Self {
        SharedTable::new()
    }
}

impl<const N: usize> SharedTable<N> {
    pub const fn new() -> SharedTable<N> {
        SharedTable {
            items: [0; N],
            head: 0,
            tail: 0,
            count: 0,
            next_id: 0,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.count as usize == N
    }

    /// Hands out the next producer id.
    #[inline]
    pub fn allocate_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    #[inline]
    pub fn push(&mut self, item: i32) {
        debug_assert!(!self.is_full(), "push into a full table: {:?}", self.snapshot());
        self.items[self.head as usize] = item;
        self.head = Self::advance(self.head);
        self.count += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> i32 {
        debug_assert!(!self.is_empty(), "pop from an empty table: {:?}", self.snapshot());
        let item = self.items[self.tail as usize];
        self.tail = Self::advance(self.tail);
        self.count -= 1;
        item
    }

    pub fn snapshot(&self) -> TableSnapshot {
        TableSnapshot {
            head: self.head,
            tail: self.tail,
            count: self.count,
            next_id: self.next_id,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.snapshot().is_consistent(N)
    }

    #[inline]
    fn advance(position: i32) -> i32 {
        (position + 1) % N as i32
    }
}

impl TableSnapshot {
    /// `0 <= count <= capacity` and `head == (tail + count) mod capacity`.
    pub fn is_consistent(&self, capacity: usize) -> bool {
        let n = capacity as i32;
        (0..=n).contains(&self.count)
            && (0..n).contains(&self.head)
            && (0..n).contains(&self.tail)
            && self.head == (self.tail + self.count) % n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn layout_matches_region_format() {
        assert_eq!(mem::size_of::<SharedTable<2>>(), 24);
        assert_eq!(mem::size_of::<SharedTable<8>>(), 4 * 8 + 16);
        assert_eq!(mem::align_of::<SharedTable<2>>(), 4);
    }

    #[test]
    fn fresh_table_is_empty_and_consistent() {
        let table = SharedTable::<TABLE_CAPACITY>::new();
        assert!(table.is_empty());
        assert!(!table.is_full());
        assert!(table.is_consistent());
        assert_eq!(table.capacity(), TABLE_CAPACITY);
    }

    #[test]
    fn ids_fill_then_drain_in_order() {
        let mut table = SharedTable::<2>::new();
        for _ in 0..2 {
            let id = table.allocate_id();
            table.push(id);
            assert!(table.is_consistent());
        }
        assert!(table.is_full());
        assert_eq!(table.snapshot(), TableSnapshot { head: 0, tail: 0, count: 2, next_id: 2 });
        assert_eq!(table.pop(), 0);
        assert_eq!(table.pop(), 1);
        assert!(table.is_empty());
        assert!(table.is_consistent());
    }

    #[test]
    fn positions_wrap_around() {
        let mut table = SharedTable::<3>::new();
        let mut expected = 0;
        for round in 0..10 {
            let id = table.allocate_id();
            table.push(id);
            if round % 2 == 1 {
                let id = table.allocate_id();
                table.push(id);
            }
            while !table.is_empty() {
                assert_eq!(table.pop(), expected);
                expected += 1;
                assert!(table.is_consistent());
            }
        }
        assert_eq!(table.next_id, expected);
        assert_eq!(table.head, table.tail);
    }

    #[test]
    fn inconsistent_snapshots_are_detected() {
        let over = TableSnapshot { head: 0, tail: 0, count: 3, next_id: 3 };
        assert!(!over.is_consistent(2));
        let skewed = TableSnapshot { head: 0, tail: 0, count: 1, next_id: 1 };
        assert!(!skewed.is_consistent(2));
        let negative = TableSnapshot { head: 1, tail: 0, count: -1, next_id: 0 };
        assert!(!negative.is_consistent(2));
    }
}
