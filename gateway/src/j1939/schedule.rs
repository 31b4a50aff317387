//! Per-PGN request interval table. A negative interval means "never
//! request" — receive-only, the PGN is
//! still decoded and published if it shows up unsolicited.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// fast = 0.2s: wheel speed, pitch/altitude, EEC1.
const FAST: &[u32] = &[65265, 65256, 61444];
/// default = 1.0s.
const DEFAULT: &[u32] = &[65215, 65266, 65217, 65248];
/// slow = 60s.
const SLOW: &[u32] = &[65199, 65257, 65276, 65201, 65202];
/// slower = 300s.
const SLOWER: &[u32] = &[65253, 65255, 65263, 65244];
/// listen-only, never requested.
const LISTEN_ONLY: &[u32] = &[65262, 65194, 61443, 61450, 65153, 65132];

/// Interval, in seconds, for a PGN not named in any of the reference
/// buckets above: entries without an explicit interval default to 1 s.
const UNLISTED_DEFAULT_SECS: f64 = 1.0;

fn reference_interval_secs(pgn: u32) -> f64 {
    if FAST.contains(&pgn) {
        0.2
    } else if DEFAULT.contains(&pgn) {
        1.0
    } else if SLOW.contains(&pgn) {
        60.0
    } else if SLOWER.contains(&pgn) {
        300.0
    } else if LISTEN_ONLY.contains(&pgn) {
        -1.0
    } else {
        UNLISTED_DEFAULT_SECS
    }
}

struct ScheduleEntry {
    interval: Duration,
    listen_only: bool,
    last_requested: Option<Instant>,
}

/// Tracks, per discovered PGN, when it was last requested and whether it's
/// due for another request this tick.
pub struct RequestSchedule {
    entries: HashMap<u32, ScheduleEntry>,
}

impl RequestSchedule {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a PGN discovered during the scan passes, picking up its
    /// interval from the reference table.
    pub fn discover(&mut self, pgn: u32) {
        self.entries.entry(pgn).or_insert_with(|| {
            let secs = reference_interval_secs(pgn);
            ScheduleEntry {
                interval: Duration::from_secs_f64(secs.abs()),
                listen_only: secs < 0.0,
                last_requested: None,
            }
        });
    }

    pub fn is_discovered(&self, pgn: u32) -> bool {
        self.entries.contains_key(&pgn)
    }

    /// PGNs due for a fresh Request PGN at `now`: discovered, not
    /// listen-only, and either never requested or past their interval.
    pub fn due(&self, now: Instant) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.listen_only)
            .filter(|(_, e)| match e.last_requested {
                None => true,
                Some(last) => now.duration_since(last) >= e.interval,
            })
            .map(|(pgn, _)| *pgn)
            .collect()
    }

    pub fn mark_requested(&mut self, pgn: u32, now: Instant) {
        if let Some(e) = self.entries.get_mut(&pgn) {
            e.last_requested = Some(now);
        }
    }
}

impl Default for RequestSchedule {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_only_pgn_never_due() {
        let mut sched = RequestSchedule::new();
        sched.discover(65262);
        assert!(sched.due(Instant::now()).is_empty());
    }

    #[test]
    fn freshly_discovered_pgn_is_immediately_due() {
        let mut sched = RequestSchedule::new();
        sched.discover(61444);
        assert_eq!(sched.due(Instant::now()), vec![61444]);
    }

    #[test]
    fn requested_pgn_not_due_again_before_its_interval() {
        let mut sched = RequestSchedule::new();
        sched.discover(65199); // slow = 60s
        let now = Instant::now();
        sched.mark_requested(65199, now);
        assert!(sched.due(now).is_empty());
    }

    #[test]
    fn unlisted_pgn_defaults_to_one_second() {
        let mut sched = RequestSchedule::new();
        sched.discover(123456);
        let now = Instant::now();
        sched.mark_requested(123456, now);
        assert!(sched.due(now + Duration::from_millis(500)).is_empty());
        assert_eq!(
            sched.due(now + Duration::from_millis(1100)),
            vec![123456]
        );
    }
}
