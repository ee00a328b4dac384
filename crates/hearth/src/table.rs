//! Slab-backed LRU list of live connections.
//!
//! Slot index doubles as the connection's readiness-queue token, so event
//! lookup is O(1), and the slots are threaded into a doubly-linked list
//! ordered by last activity. Expiration stamps are written under the same
//! lock that moves a slot to the head, so list order equals expiry order
//! and the timeout sweep only ever inspects the tail.

use std::time::Instant;

const NIL: usize = usize::MAX;

struct Entry<T> {
    prev: usize,
    next: usize,
    expires: Instant,
    item: T,
}

pub struct Lru<T> {
    slots: Vec<Option<Entry<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T: Clone> Lru<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), head: NIL, tail: NIL, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts at the head (most recently active), building the item from
    /// its slot index.
    pub fn insert_with(&mut self, expires: Instant, make: impl FnOnce(usize) -> T) -> (usize, T) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let item = make(slot);
        self.slots[slot] =
            Some(Entry { prev: NIL, next: NIL, expires, item: item.clone() });
        self.link_front(slot);
        self.len += 1;
        (slot, item)
    }

    pub fn get(&self, slot: usize) -> Option<T> {
        self.slots.get(slot)?.as_ref().map(|e| e.item.clone())
    }

    /// Moves `slot` to the head and restamps its expiry. False if the slot
    /// was already removed.
    pub fn touch(&mut self, slot: usize, expires: Instant) -> bool {
        if self.slots.get(slot).is_none_or(|s| s.is_none()) {
            return false;
        }
        self.unlink(slot);
        self.slots[slot].as_mut().expect("slot checked above").expires = expires;
        self.link_front(slot);
        true
    }

    pub fn remove(&mut self, slot: usize) -> Option<T> {
        self.slots.get(slot)?.as_ref()?;
        self.unlink(slot);
        let entry = self.slots[slot].take().expect("slot checked above");
        self.free.push(slot);
        self.len -= 1;
        Some(entry.item)
    }

    /// Pops the least recently active item if its expiry has passed.
    /// Activity stamps are monotone along the list, so the sweep stops at
    /// the first live tail.
    pub fn pop_expired(&mut self, now: Instant) -> Option<T> {
        let tail = self.tail;
        if tail == NIL {
            return None;
        }
        let expires = self.slots[tail].as_ref().expect("tail is linked").expires;
        if expires >= now {
            return None;
        }
        self.remove(tail)
    }

    /// Empties the table, yielding every remaining item.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while self.head != NIL {
            out.push(self.remove(self.head).expect("head is linked"));
        }
        out
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let e = self.slots[slot].as_mut().expect("linking a present slot");
            e.prev = NIL;
            e.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().expect("head is present").prev = slot;
        } else {
            self.tail = slot;
        }
        self.head = slot;
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let e = self.slots[slot].as_ref().expect("unlinking a present slot");
            (e.prev, e.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().expect("prev is present").next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().expect("next is present").prev = prev;
        } else {
            self.tail = prev;
        }
    }
}

impl<T: Clone> Default for Lru<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn insert_get_remove() {
        let mut lru: Lru<u32> = Lru::new();
        let now = Instant::now();
        let (a, _) = lru.insert_with(now, |_| 10);
        let (b, _) = lru.insert_with(now, |_| 20);
        assert_eq!(lru.len(), 2);
        assert_eq!(lru.get(a), Some(10));
        assert_eq!(lru.get(b), Some(20));
        assert_eq!(lru.remove(a), Some(10));
        assert_eq!(lru.remove(a), None);
        assert_eq!(lru.get(a), None);
        assert_eq!(lru.len(), 1);
    }

    #[test]
    fn slots_are_recycled() {
        let mut lru: Lru<u32> = Lru::new();
        let now = Instant::now();
        let (a, _) = lru.insert_with(now, |_| 1);
        lru.remove(a);
        let (b, _) = lru.insert_with(now, |_| 2);
        assert_eq!(a, b);
        assert_eq!(lru.get(b), Some(2));
    }

    #[test]
    fn expiry_follows_activity_order() {
        let mut lru: Lru<u32> = Lru::new();
        let base = Instant::now();
        let t = |secs| base + Duration::from_secs(secs);

        let (a, _) = lru.insert_with(t(1), |_| 1);
        let (_b, _) = lru.insert_with(t(2), |_| 2);
        let (_c, _) = lru.insert_with(t(3), |_| 3);

        // nothing has expired yet
        assert_eq!(lru.pop_expired(t(1)), None);

        // a expires first; exactly-at-expiry does not count
        assert_eq!(lru.pop_expired(t(2)), Some(1));
        assert_eq!(lru.pop_expired(t(2)), None);

        // touching refreshes position and stamp
        assert!(lru.touch(_b, t(9)));
        assert_eq!(lru.pop_expired(t(5)), Some(3));
        assert_eq!(lru.pop_expired(t(5)), None);
        assert_eq!(lru.pop_expired(t(10)), Some(2));
        assert!(lru.is_empty());
        assert!(!lru.touch(a, t(10)));
    }

    #[test]
    fn drain_returns_everything_once() {
        let mut lru: Lru<u32> = Lru::new();
        let now = Instant::now();
        for i in 0..5 {
            lru.insert_with(now, |_| i);
        }
        let mut all = lru.drain_all();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4]);
        assert!(lru.is_empty());
        assert_eq!(lru.drain_all(), Vec::<u32>::new());
    }
}
