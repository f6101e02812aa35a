// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

// Size-classed recycling for message buffers. Linear classes run from 8 to
// 512 bytes in 16-byte steps, exponential classes cover powers of two up
// to 16 MiB, anything larger goes straight to the system allocator and is
// not recycled. Freed buffers stay on their class free list for the life
// of the pool.

const MAX_LINEAR: usize = 512;
const LINEAR_STEP: usize = 16;
const LOG2_MAX_EXPONENTIAL: usize = 24;
const LOG2_MAX_LINEAR: usize = 9;

/// How buffer requests are served. Fixed at session build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemPolicy {
    /// Recycle buffers through size-classed free lists.
    Pooled,
    /// Every request goes to the system allocator, nothing is retained.
    System,
}

/// Allocation tallies, readable at any time and checked on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemReport {
    pub allocated: u64,
    pub freed: u64,
    pub recycled: u64,
}

impl MemReport {
    /// Outstanding buffers; zero after a clean shutdown. Buffers built
    /// outside the pool and retired into it can push `freed` past
    /// `allocated`, hence the saturation.
    pub fn in_use(&self) -> u64 {
        self.allocated.saturating_sub(self.freed)
    }
}

pub struct Pool {
    policy: MemPolicy,
    linear: Vec<Vec<Vec<u8>>>,
    exponential: Vec<Vec<Vec<u8>>>,
    report: MemReport,
}

fn exp_class(size: usize) -> Option<usize> {
    let mut k = LOG2_MAX_LINEAR + 1;
    while k <= LOG2_MAX_EXPONENTIAL {
        if size <= (1 << k) {
            return Some(k - LOG2_MAX_LINEAR - 1);
        }
        k += 1;
    }
    None
}

impl Pool {
    pub fn new(policy: MemPolicy) -> Pool {
        let linear_classes = MAX_LINEAR / LINEAR_STEP;
        let exp_classes = LOG2_MAX_EXPONENTIAL - LOG2_MAX_LINEAR;

        Pool {
            policy: policy,
            linear: (0..linear_classes).map(|_| Vec::new()).collect(),
            exponential: (0..exp_classes).map(|_| Vec::new()).collect(),
            report: MemReport::default(),
        }
    }

    /// Class capacity for a request, so equal requests recycle each other.
    fn class_size(size: usize) -> usize {
        if size <= MAX_LINEAR {
            let steps = (size + LINEAR_STEP - 1) / LINEAR_STEP;
            ::std::cmp::max(steps * LINEAR_STEP, 8)
        } else {
            match exp_class(size) {
                Some(c) => 1 << (c + LOG2_MAX_LINEAR + 1),
                None    => size,
            }
        }
    }

    fn free_list(&mut self, size: usize) -> Option<&mut Vec<Vec<u8>>> {
        if size <= MAX_LINEAR {
            let class = ::std::cmp::max((size + LINEAR_STEP - 1) / LINEAR_STEP, 1) - 1;
            Some(&mut self.linear[class])
        } else {
            match exp_class(size) {
                Some(c) => Some(&mut self.exponential[c]),
                None    => None,
            }
        }
    }

    /// Take a zeroed-length buffer with at least `size` bytes of capacity.
    pub fn alloc(&mut self, size: usize) -> Vec<u8> {
        self.report.allocated += 1;

        if self.policy == MemPolicy::System {
            return Vec::with_capacity(size);
        }

        let recycled = self.free_list(size).and_then(|list| list.pop());
        match recycled {
            Some(mut buf) => {
                self.report.recycled += 1;
                buf.clear();
                buf
            }
            None => Vec::with_capacity(Pool::class_size(size)),
        }
    }

    /// Return a buffer to its class free list.
    pub fn free(&mut self, buf: Vec<u8>) {
        self.report.freed += 1;

        if self.policy == MemPolicy::System {
            return;
        }
        let capacity = buf.capacity();
        if let Some(list) = self.free_list(capacity) {
            list.push(buf);
        }
        // oversized buffers fall out of scope here and go back to the system
    }

    /// A pooled buffer was consumed somewhere the pool cannot see;
    /// keep the tallies balanced.
    pub fn discard(&mut self) {
        self.report.freed += 1;
    }

    pub fn report(&self) -> MemReport {
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_sizes_are_linear_then_exponential() {
        assert_eq!(8, Pool::class_size(1));
        assert_eq!(16, Pool::class_size(16));
        assert_eq!(32, Pool::class_size(17));
        assert_eq!(512, Pool::class_size(512));
        assert_eq!(1024, Pool::class_size(513));
        assert_eq!(1 << 16, Pool::class_size(40_000));
    }

    #[test]
    fn buffers_are_recycled_within_a_class() {
        let mut pool = Pool::new(MemPolicy::Pooled);
        let mut buf = pool.alloc(100);
        buf.extend_from_slice(&[1, 2, 3]);
        let capacity = buf.capacity();
        pool.free(buf);

        let again = pool.alloc(100);
        assert_eq!(capacity, again.capacity());
        assert!(again.is_empty());
        assert_eq!(1, pool.report().recycled);
    }

    #[test]
    fn report_balances_after_shutdown() {
        let mut pool = Pool::new(MemPolicy::Pooled);
        let a = pool.alloc(24);
        let b = pool.alloc(2000);
        pool.free(a);
        pool.free(b);

        assert_eq!(0, pool.report().in_use());
    }

    #[test]
    fn system_policy_retains_nothing() {
        let mut pool = Pool::new(MemPolicy::System);
        let buf = pool.alloc(64);
        pool.free(buf);

        assert_eq!(0, pool.report().recycled);
        let _ = pool.alloc(64);
        assert_eq!(0, pool.report().recycled);
    }
}
