// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use msg::Message;

// Timestamp-ordered message queue. Ties dispatch in insertion order, so
// the heap entry carries an insertion sequence number. Timestamps are
// finite by construction (the wire layer never produces NaN here).

struct Entry {
    time: f64,
    seq: u64,
    msg: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Entry) -> Ordering {
        // reversed: BinaryHeap is a max-heap, we pop the earliest
        other.time.partial_cmp(&self.time)
            .unwrap_or(Ordering::Equal)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct Sched {
    heap: BinaryHeap<Entry>,
    seq: u64,
}

impl Sched {
    pub fn new() -> Sched {
        Sched {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn insert(&mut self, time: f64, msg: Message) {
        let seq = self.seq;

        self.seq += 1;
        self.heap.push(Entry {
            time: time,
            seq: seq,
            msg: msg,
        });
    }

    /// The next message whose timestamp is due at `now`, if any.
    pub fn pop_due(&mut self, now: f64) -> Option<Message> {
        let due = match self.heap.peek() {
            Some(entry) => entry.time <= now,
            None => false,
        };

        if due {
            self.heap.pop().map(|entry| entry.msg)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

impl Default for Sched {
    fn default() -> Sched {
        Sched::new()
    }
}

#[cfg(test)]
mod tests {
    use msg::MsgWriter;
    use super::Sched;

    fn msg(addr: &str) -> ::msg::Message {
        MsgWriter::new().finish(addr, 0.0, true).unwrap()
    }

    #[test]
    fn pops_in_timestamp_order() {
        let mut sched = Sched::new();
        sched.insert(3.0, msg("/c"));
        sched.insert(1.0, msg("/a"));
        sched.insert(2.0, msg("/b"));

        assert_eq!("/a", sched.pop_due(10.0).unwrap().address());
        assert_eq!("/b", sched.pop_due(10.0).unwrap().address());
        assert_eq!("/c", sched.pop_due(10.0).unwrap().address());
        assert!(sched.pop_due(10.0).is_none());
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut sched = Sched::new();
        sched.insert(1.0, msg("/first"));
        sched.insert(1.0, msg("/second"));
        sched.insert(1.0, msg("/third"));

        assert_eq!("/first", sched.pop_due(1.0).unwrap().address());
        assert_eq!("/second", sched.pop_due(1.0).unwrap().address());
        assert_eq!("/third", sched.pop_due(1.0).unwrap().address());
    }

    #[test]
    fn nothing_due_before_its_time() {
        let mut sched = Sched::new();
        sched.insert(5.0, msg("/later"));

        assert!(sched.pop_due(4.999).is_none());
        assert_eq!(1, sched.len());
        assert!(sched.pop_due(5.0).is_some());
    }
}
