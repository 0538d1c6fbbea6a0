//! Ready queue
//!
//! One FIFO per priority level plus an occupancy bitmap, so picking the
//! next task is a trailing-zeros away. Insertion order within a level is
//! the round-robin tie-break.

extern crate alloc;

use alloc::collections::VecDeque;

use super::task::{Pid, PRIORITY_LEVELS};

/// Priority-ordered collection of Ready tasks. The Running task is never
/// in the queue.
pub struct ReadyQueue {
    queues: [VecDeque<Pid>; PRIORITY_LEVELS],
    /// Bit N set when level N is non-empty.
    bitmap: u32,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            bitmap: 0,
        }
    }

    /// Append a task at its priority level.
    pub fn enqueue(&mut self, pid: Pid, priority: u8) {
        let level = (priority as usize).min(PRIORITY_LEVELS - 1);
        self.queues[level].push_back(pid);
        self.bitmap |= 1 << level;
    }

    /// Pop the longest-waiting task of the highest occupied priority.
    pub fn pop_highest(&mut self) -> Option<Pid> {
        if self.bitmap == 0 {
            return None;
        }
        let level = self.bitmap.trailing_zeros() as usize;
        let pid = self.queues[level].pop_front();
        if self.queues[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
        pid
    }

    /// Highest occupied priority level, if any.
    pub fn highest_priority(&self) -> Option<u8> {
        if self.bitmap == 0 {
            None
        } else {
            Some(self.bitmap.trailing_zeros() as u8)
        }
    }

    /// Drop a specific task from whatever level it sits in.
    pub fn remove(&mut self, pid: Pid) -> bool {
        for level in 0..PRIORITY_LEVELS {
            if let Some(pos) = self.queues[level].iter().position(|&p| p == pid) {
                self.queues[level].remove(pos);
                if self.queues[level].is_empty() {
                    self.bitmap &= !(1 << level);
                }
                return true;
            }
        }
        false
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order_wins() {
        let mut q = ReadyQueue::new();
        q.enqueue(1, 16);
        q.enqueue(2, 4);
        q.enqueue(3, 31);

        assert_eq!(q.highest_priority(), Some(4));
        assert_eq!(q.pop_highest(), Some(2));
        assert_eq!(q.pop_highest(), Some(1));
        assert_eq!(q.pop_highest(), Some(3));
        assert_eq!(q.pop_highest(), None);
    }

    #[test]
    fn fifo_within_level() {
        let mut q = ReadyQueue::new();
        q.enqueue(5, 8);
        q.enqueue(6, 8);
        q.enqueue(7, 8);

        assert_eq!(q.pop_highest(), Some(5));
        q.enqueue(5, 8); // requeued after its slice
        assert_eq!(q.pop_highest(), Some(6));
        assert_eq!(q.pop_highest(), Some(7));
        assert_eq!(q.pop_highest(), Some(5));
    }

    #[test]
    fn remove_clears_bitmap() {
        let mut q = ReadyQueue::new();
        q.enqueue(9, 2);
        assert!(q.remove(9));
        assert!(!q.remove(9));
        assert!(q.is_empty());
        assert_eq!(q.pop_highest(), None);
    }
}
