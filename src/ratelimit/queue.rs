//! Bounded FIFO admission queue.

use std::collections::VecDeque;

/// A FIFO queue that refuses new items once `max_size` is reached.
///
/// Shrinking the bound below the current length evicts nothing; it only
/// blocks further enqueues until the queue drains back under the new bound.
#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    items: VecDeque<T>,
    max_size: usize,
}

impl<T> BoundedQueue<T> {
    /// Create an empty queue holding at most `max_size` items.
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    /// Append `item` unless the queue is full.
    ///
    /// Returns `false` without modifying the queue when full.
    pub fn enqueue(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.items.push_back(item);
        true
    }

    /// Remove and return the oldest item.
    pub fn dequeue(&mut self) -> Option<T> {
        self.items.pop_front()
    }

    /// The oldest item, if any.
    pub fn peek(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Change the bound; existing items are kept.
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    /// Drop all queued items.
    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_until_full() {
        let mut queue = BoundedQueue::new(2);
        assert!(queue.enqueue("a"));
        assert!(queue.enqueue("b"));
        assert!(!queue.enqueue("c"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_dequeue_is_fifo() {
        let mut queue = BoundedQueue::new(10);
        for i in 0..5 {
            queue.enqueue(i);
        }

        assert_eq!(queue.peek(), Some(&0));
        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_shrinking_keeps_items_and_blocks_enqueue() {
        let mut queue = BoundedQueue::new(4);
        for i in 0..4 {
            queue.enqueue(i);
        }

        queue.set_max_size(2);
        assert_eq!(queue.len(), 4);
        assert!(!queue.enqueue(9));

        queue.dequeue();
        queue.dequeue();
        assert!(!queue.enqueue(9));

        queue.dequeue();
        assert!(queue.enqueue(9));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_bound_refuses_everything() {
        let mut queue = BoundedQueue::new(0);
        assert!(queue.is_full());
        assert!(!queue.enqueue(1));
    }

    #[test]
    fn test_clear() {
        let mut queue = BoundedQueue::new(3);
        queue.enqueue(1);
        queue.clear();
        assert!(queue.is_empty());
    }
}
