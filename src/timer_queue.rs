use std::cmp::Reverse;
use std::collections::BinaryHeap;

struct Entry<T> {
    time_ms: u64,
    seq: u64,
    target: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        (self.time_ms, self.seq) == (other.time_ms, other.seq)
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.time_ms, self.seq).cmp(&(other.time_ms, other.seq))
    }
}

/// Timers ordered by expiration time. Timers which expire at the same time fire in the order they
/// were added.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<Entry<T>>>,
    next_seq: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn add_timer(&mut self, time_ms: u64, target: T) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(Reverse(Entry {
            time_ms,
            seq,
            target,
        }));
    }

    pub fn next_expiration_time_ms(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse(entry)| entry.time_ms)
    }

    /// Moves every timer expiring at or before `now_ms` into `expired`, earliest first.
    pub fn pop_expired(&mut self, now_ms: u64, expired: &mut Vec<T>) {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if entry.time_ms > now_ms {
                break;
            }

            if let Some(Reverse(entry)) = self.heap.pop() {
                expired.push(entry.target);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
