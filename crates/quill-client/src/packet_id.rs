//! Packet identifier allocation and tracking.
//!
//! Packet identifiers are 16-bit non-zero values used for QoS 1/2 PUBLISH,
//! SUBSCRIBE, and UNSUBSCRIBE. An identifier must not be reused while its
//! exchange is still in flight, and a re-sent packet must keep its original
//! identifier.

use std::collections::HashSet;

#[derive(Debug)]
pub struct PacketIdAllocator {
    /// Next ID to try allocating
    next_id: u16,
    /// Set of currently in-use IDs
    in_use: HashSet<u16>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            in_use: HashSet::new(),
        }
    }

    /// Allocate a new unused packet identifier.
    ///
    /// Returns `None` if all 65535 possible IDs are in use.
    pub fn allocate(&mut self) -> Option<u16> {
        // Fast path: next_id is available
        if !self.in_use.contains(&self.next_id) {
            let id = self.next_id;
            self.in_use.insert(id);
            self.advance_next();
            return Some(id);
        }

        // Slow path: search for an available ID
        let start = self.next_id;
        loop {
            self.advance_next();
            if self.next_id == start {
                // Wrapped around completely, all IDs in use
                return None;
            }
            if !self.in_use.contains(&self.next_id) {
                let id = self.next_id;
                self.in_use.insert(id);
                self.advance_next();
                return Some(id);
            }
        }
    }

    /// Release a packet identifier after its exchange completes
    /// (PUBACK, PUBCOMP, SUBACK, or UNSUBACK received).
    pub fn release(&mut self, id: u16) {
        self.in_use.remove(&id);
    }

    pub fn is_in_use(&self, id: u16) -> bool {
        self.in_use.contains(&id)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Clear all allocations (used when session state is discarded).
    pub fn clear(&mut self) {
        self.in_use.clear();
        self.next_id = 1;
    }

    /// Re-register an identifier carried over from a resumed session.
    pub fn reserve(&mut self, id: u16) {
        self.in_use.insert(id);
    }

    /// Advance next_id, skipping 0.
    fn advance_next(&mut self) {
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocation() {
        let mut alloc = PacketIdAllocator::new();
        assert_eq!(alloc.allocate(), Some(1));
        assert_eq!(alloc.allocate(), Some(2));
        assert_eq!(alloc.allocate(), Some(3));
    }

    #[test]
    fn release_and_reuse() {
        let mut alloc = PacketIdAllocator::new();
        let id1 = alloc.allocate().unwrap();
        let id2 = alloc.allocate().unwrap();

        assert!(alloc.is_in_use(id1));
        assert!(alloc.is_in_use(id2));

        alloc.release(id1);
        assert!(!alloc.is_in_use(id1));
        assert!(alloc.is_in_use(id2));
    }

    #[test]
    fn skips_zero_on_wrap() {
        let mut alloc = PacketIdAllocator::new();
        alloc.next_id = 65535;
        assert_eq!(alloc.allocate(), Some(65535));
        assert_eq!(alloc.allocate(), Some(1));
    }

    #[test]
    fn exhaustion() {
        let mut alloc = PacketIdAllocator::new();
        for id in 1..=u16::MAX {
            alloc.reserve(id);
        }
        assert_eq!(alloc.allocate(), None);
        alloc.release(777);
        assert_eq!(alloc.allocate(), Some(777));
    }

    #[test]
    fn clear_resets() {
        let mut alloc = PacketIdAllocator::new();
        alloc.allocate();
        alloc.allocate();
        assert_eq!(alloc.in_use_count(), 2);

        alloc.clear();
        assert_eq!(alloc.in_use_count(), 0);
        assert_eq!(alloc.allocate(), Some(1));
    }
}
