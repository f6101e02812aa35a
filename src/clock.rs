// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;

use time;

/// Samples kept in the rolling round-trip window.
pub const SAMPLES: usize = 5;

/// Ping period bounds: fast while acquiring, decaying once synchronized.
const PERIOD_MIN: f64 = 0.1;
const PERIOD_MAX: f64 = 10.0;
const PERIOD_DECAY: f64 = 1.2;

/// Largest single slew step once the offset is being tracked.
const SLEW_STEP: f64 = 0.002;

/// The local and global clocks of one process. The local clock is a
/// monotonically increasing seconds value; the global clock is
/// `local + offset` once synchronized, or exactly the local clock on the
/// reference process.
pub struct Clock {
    start_ns: u64,
    is_ref: bool,
    synced: bool,
    offset: f64,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            start_ns: time::precise_time_ns(),
            is_ref: false,
            synced: false,
            offset: 0.0,
        }
    }

    pub fn local(&self) -> f64 {
        (time::precise_time_ns() - self.start_ns) as f64 * 1e-9
    }

    /// Global time, or None while not yet synchronized.
    pub fn global(&self) -> Option<f64> {
        if self.synced {
            Some(self.local() + self.offset)
        } else {
            None
        }
    }

    /// Become the clock reference: our local clock is the global clock.
    pub fn set_reference(&mut self) {
        self.is_ref = true;
        self.synced = true;
        self.offset = 0.0;
    }

    pub fn is_reference(&self) -> bool {
        self.is_ref
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    fn set_offset(&mut self, offset: f64) {
        self.offset = offset;
        self.synced = true;
    }

    /// Fold a new best estimate into the running offset: a large error is
    /// clipped into `estimate ± min_rtt` so gross drift corrects at once,
    /// a small error slews in 2 ms steps so steady operation never sees a
    /// discontinuous jump.
    fn adjust(&mut self, estimate: f64, min_rtt: f64) {
        let diff = estimate - self.offset;

        if diff.abs() > min_rtt {
            let low = estimate - min_rtt;
            let high = estimate + min_rtt;
            self.offset = self.offset.max(low).min(high);
        } else if diff > SLEW_STEP {
            self.offset += SLEW_STEP;
        } else if diff < -SLEW_STEP {
            self.offset -= SLEW_STEP;
        } else {
            self.offset = estimate;
        }
    }
}

/// Outcome of folding in one clock reply.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncStep {
    /// Still collecting the first full sample window.
    Sampling,
    /// This reply completed the window; we just became synchronized.
    Synced,
    /// Already synchronized; the offset was refined.
    Adjusted,
    /// The reply did not match the outstanding request.
    Ignored,
}

/// Round-trip sampling state toward the clock reference.
pub struct Sync {
    serial: i32,
    outstanding: Option<(i32, f64)>,
    samples: VecDeque<(f64, f64)>, // (offset estimate, rtt)
    next_ping: f64,
    period: f64,
}

impl Sync {
    pub fn new() -> Sync {
        Sync {
            serial: 0,
            outstanding: None,
            samples: VecDeque::with_capacity(SAMPLES),
            next_ping: 0.0,
            period: PERIOD_MIN,
        }
    }

    /// Is it time to send the next request?
    pub fn ping_due(&self, now: f64) -> bool {
        now >= self.next_ping
    }

    /// Record an outgoing request; returns its serial number.
    pub fn ping_sent(&mut self, now: f64) -> i32 {
        self.serial += 1;
        self.outstanding = Some((self.serial, now));
        self.next_ping = now + self.period;
        self.serial
    }

    /// Fold in a reply carrying the reference's time.
    pub fn reply(&mut self, clock: &mut Clock, serial: i32, ref_time: f64, now: f64)
                 -> SyncStep {
        let sent = match self.outstanding.take() {
            Some((expected, sent)) if expected == serial => sent,
            other => {
                self.outstanding = other;
                return SyncStep::Ignored;
            }
        };

        let rtt = now - sent;
        let estimate = ref_time - (now - rtt / 2.0);
        if self.samples.len() == SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back((estimate, rtt));

        let (best, min_rtt) = self.best();
        if clock.is_synced() {
            clock.adjust(best, min_rtt);
            self.period = (self.period * PERIOD_DECAY).min(PERIOD_MAX);
            SyncStep::Adjusted
        } else if self.samples.len() >= SAMPLES {
            clock.set_offset(best);
            self.period = (self.period * PERIOD_DECAY).min(PERIOD_MAX);
            SyncStep::Synced
        } else {
            SyncStep::Sampling
        }
    }

    /// The sample with the minimum round trip carries the best estimate.
    fn best(&self) -> (f64, f64) {
        let mut best = (0.0, ::std::f64::INFINITY);
        for &(estimate, rtt) in &self.samples {
            if rtt < best.1 {
                best = (estimate, rtt);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_clock_is_global_immediately() {
        let mut clock = Clock::new();
        assert_eq!(None, clock.global());

        clock.set_reference();
        assert!(clock.is_synced());
        let local = clock.local();
        let global = clock.global().unwrap();
        assert!((global - local).abs() < 0.001);
    }

    #[test]
    fn five_samples_trigger_the_sync_transition() {
        let mut clock = Clock::new();
        let mut sync = Sync::new();

        // reference runs 100 s ahead; rtt is 10 ms per exchange
        for round in 0..SAMPLES {
            let now = round as f64;
            let serial = sync.ping_sent(now);
            let reply_now = now + 0.010;
            let ref_time = reply_now - 0.005 + 100.0;
            let step = sync.reply(&mut clock, serial, ref_time, reply_now);

            if round < SAMPLES - 1 {
                assert_eq!(SyncStep::Sampling, step);
                assert!(!clock.is_synced());
            } else {
                assert_eq!(SyncStep::Synced, step);
            }
        }
        assert!((clock.offset() - 100.0).abs() < 0.001);
    }

    #[test]
    fn stale_serial_is_ignored() {
        let mut clock = Clock::new();
        let mut sync = Sync::new();
        let serial = sync.ping_sent(0.0);

        assert_eq!(SyncStep::Ignored, sync.reply(&mut clock, serial + 7, 1.0, 0.01));
        // the outstanding request is still answerable
        assert_eq!(SyncStep::Sampling, sync.reply(&mut clock, serial, 1.0, 0.01));
    }

    #[test]
    fn small_errors_slew_instead_of_jumping() {
        let mut clock = Clock::new();
        clock.set_reference();
        clock.is_ref = false; // plain synced process with offset 0

        clock.adjust(0.0015, 0.01);
        assert_eq!(0.0015, clock.offset()); // within one step: lands on it

        clock.adjust(0.0115, 0.01);
        assert!((clock.offset() - 0.0035).abs() < 1e-9); // one 2 ms step

        clock.adjust(0.5, 0.01);
        assert!((clock.offset() - 0.49).abs() < 1e-9); // clipped to est - rtt
    }
}
