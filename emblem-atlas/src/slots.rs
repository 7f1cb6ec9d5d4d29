const NULL_INDEX: u32 = u32::MAX;

#[derive(Copy, Clone)]
struct SlotNode {
    next: u32,
    prev: u32,
}

/// Recency ordering over a fixed set of slot indices. Doubly linked list using
/// indices instead of pointers, `u32::MAX` for "null". Every slot is always on the
/// list: the head is the most recently used slot and the tail is always the next
/// allocation candidate, so freed slots get pushed to the back and unused slots
/// start there.
pub struct SlotLru {
    head: u32,
    tail: u32,
    nodes: Vec<SlotNode>,
}

impl SlotLru {
    pub fn new(slot_count: u32) -> SlotLru {
        assert!(slot_count > 0);
        let mut nodes = vec![
            SlotNode {
                next: NULL_INDEX,
                prev: NULL_INDEX,
            };
            slot_count as usize
        ];
        for i in 0..slot_count {
            nodes[i as usize].prev = if i == 0 { NULL_INDEX } else { i - 1 };
            nodes[i as usize].next = if i + 1 == slot_count { NULL_INDEX } else { i + 1 };
        }

        SlotLru {
            head: 0,
            tail: slot_count - 1,
            nodes,
        }
    }

    /// The least recently used slot, which is where allocation starts.
    pub fn back(&self) -> u32 {
        self.tail
    }

    pub fn move_to_front(
        &mut self,
        slot_index: u32,
    ) {
        let node = self.nodes[slot_index as usize];

        if slot_index == self.head {
            assert_eq!(node.prev, NULL_INDEX);
            return;
        }

        if slot_index == self.tail {
            // The node before us becomes the new tail
            assert_eq!(node.next, NULL_INDEX);
            assert_ne!(node.prev, NULL_INDEX);
            self.tail = node.prev;
        }

        // Splice this node out of the list
        assert_ne!(node.prev, NULL_INDEX);
        self.nodes[node.prev as usize].next = node.next;
        if node.next != NULL_INDEX {
            self.nodes[node.next as usize].prev = node.prev;
        }

        // Make this node the new head
        assert_eq!(self.nodes[self.head as usize].prev, NULL_INDEX);
        self.nodes[self.head as usize].prev = slot_index;
        self.nodes[slot_index as usize].prev = NULL_INDEX;
        self.nodes[slot_index as usize].next = self.head;
        self.head = slot_index;
    }

    pub fn move_to_back(
        &mut self,
        slot_index: u32,
    ) {
        let node = self.nodes[slot_index as usize];

        if slot_index == self.tail {
            assert_eq!(node.next, NULL_INDEX);
            return;
        }

        if slot_index == self.head {
            // The node after us becomes the new head
            assert_eq!(node.prev, NULL_INDEX);
            assert_ne!(node.next, NULL_INDEX);
            self.head = node.next;
        }

        // Splice this node out of the list
        if node.prev != NULL_INDEX {
            self.nodes[node.prev as usize].next = node.next;
        }
        assert_ne!(node.next, NULL_INDEX);
        self.nodes[node.next as usize].prev = node.prev;

        // Make this node the new tail
        assert_eq!(self.nodes[self.tail as usize].next, NULL_INDEX);
        self.nodes[self.tail as usize].next = slot_index;
        self.nodes[slot_index as usize].prev = self.tail;
        self.nodes[slot_index as usize].next = NULL_INDEX;
        self.tail = slot_index;
    }

    /// Walks head to tail, checking link consistency on the way.
    #[cfg(test)]
    fn order(&self) -> Vec<u32> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut iter = self.head;
        let mut prev = NULL_INDEX;
        while iter != NULL_INDEX {
            assert_eq!(self.nodes[iter as usize].prev, prev);
            order.push(iter);
            prev = iter;
            iter = self.nodes[iter as usize].next;
        }
        assert_eq!(prev, self.tail);
        assert_eq!(order.len(), self.nodes.len());
        order
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_list_runs_in_index_order() {
        let lru = SlotLru::new(4);
        assert_eq!(lru.order(), vec![0, 1, 2, 3]);
        assert_eq!(lru.back(), 3);
    }

    #[test]
    fn move_to_front_promotes_the_tail() {
        let mut lru = SlotLru::new(4);
        lru.move_to_front(3);
        assert_eq!(lru.order(), vec![3, 0, 1, 2]);
        assert_eq!(lru.back(), 2);
    }

    #[test]
    fn move_to_front_splices_from_the_middle() {
        let mut lru = SlotLru::new(4);
        lru.move_to_front(2);
        lru.move_to_front(1);
        assert_eq!(lru.order(), vec![1, 2, 0, 3]);

        // Touching the head again is a no-op
        lru.move_to_front(1);
        assert_eq!(lru.order(), vec![1, 2, 0, 3]);
    }

    #[test]
    fn move_to_back_demotes_the_head() {
        let mut lru = SlotLru::new(3);
        lru.move_to_back(0);
        assert_eq!(lru.order(), vec![1, 2, 0]);
        assert_eq!(lru.back(), 0);

        lru.move_to_back(2);
        assert_eq!(lru.order(), vec![1, 0, 2]);
    }

    #[test]
    fn single_slot_list_is_stable() {
        let mut lru = SlotLru::new(1);
        lru.move_to_front(0);
        lru.move_to_back(0);
        assert_eq!(lru.order(), vec![0]);
        assert_eq!(lru.back(), 0);
    }

    #[test]
    fn allocation_order_cycles_through_every_slot() {
        let mut lru = SlotLru::new(3);
        let mut taken = Vec::new();
        for _ in 0..6 {
            let slot_index = lru.back();
            lru.move_to_front(slot_index);
            taken.push(slot_index);
        }
        assert_eq!(taken, vec![2, 1, 0, 2, 1, 0]);
    }
}
