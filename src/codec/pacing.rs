//! Timestamp-paced message release.
//!
//! Recorded lines may start with a millisecond timestamp, e.g.
//! `1700000000123,NEW,42`. When replaying at timestamps, the first timestamp of
//! a step anchors the step's clock and every later line is released at its
//! offset from that anchor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for a line to become due.
const PACE_SLICE: Duration = Duration::from_millis(20);

/// Extract a leading millisecond timestamp terminated by `,`, `|` or whitespace.
pub fn leading_timestamp(line: &str) -> Option<u64> {
    let end = line.find(|c: char| c == ',' || c == '|' || c.is_whitespace())?;
    line[..end].parse().ok()
}

#[derive(Debug, Default)]
pub struct TimestampPacer {
    origin: Option<(u64, Instant)>,
    running: Option<Arc<AtomicBool>>,
}

impl TimestampPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long `line` should wait before release, anchoring the clock on the
    /// first timestamped line.
    pub fn delay_for(&mut self, line: &str, now: Instant) -> Duration {
        let Some(ts) = leading_timestamp(line) else {
            return Duration::ZERO;
        };
        match self.origin {
            None => {
                self.origin = Some((ts, now));
                Duration::ZERO
            }
            Some((first, anchor)) => {
                let due = anchor + Duration::from_millis(ts.saturating_sub(first));
                due.saturating_duration_since(now)
            }
        }
    }

    /// Stop waiting as soon as `running` is cleared.
    pub fn watch(&mut self, running: Arc<AtomicBool>) {
        self.running = Some(running);
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(true, |r| r.load(Ordering::SeqCst))
    }

    /// Block until `line` is due, or until the watched run flag clears.
    pub fn pace(&mut self, line: &str) {
        let now = Instant::now();
        let due = now + self.delay_for(line, now);
        loop {
            let now = Instant::now();
            if now >= due {
                return;
            }
            if !self.is_running() {
                tracing::debug!("Pacing interrupted {:?} early", due - now);
                return;
            }
            thread::sleep((due - now).min(PACE_SLICE));
        }
    }

    /// Drop the anchor; the next step starts a new clock.
    pub fn reset(&mut self) {
        self.origin = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leading_timestamp() {
        assert_eq!(leading_timestamp("1000,NEW,1"), Some(1000));
        assert_eq!(leading_timestamp("25|payload"), Some(25));
        assert_eq!(leading_timestamp("7 text"), Some(7));
        assert_eq!(leading_timestamp("abc,1"), None);
        assert_eq!(leading_timestamp("1234"), None);
    }

    #[test]
    fn test_delay_relative_to_first_line() {
        let mut pacer = TimestampPacer::new();
        let start = Instant::now();
        assert_eq!(pacer.delay_for("1000,a", start), Duration::ZERO);
        assert_eq!(
            pacer.delay_for("1250,b", start),
            Duration::from_millis(250)
        );
        // Late lines are released immediately
        assert_eq!(
            pacer.delay_for("1100,c", start + Duration::from_secs(1)),
            Duration::ZERO
        );
        assert_eq!(pacer.delay_for("no timestamp", start), Duration::ZERO);
    }

    #[test]
    fn test_pace_waits_for_due_time() {
        let mut pacer = TimestampPacer::new();
        pacer.pace("1000,a");
        let started = Instant::now();
        pacer.pace("1060,b");
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_pace_stops_when_run_is_stopped() {
        let running = Arc::new(AtomicBool::new(true));
        let mut pacer = TimestampPacer::new();
        pacer.watch(running.clone());
        pacer.pace("1000,a");

        let stopper = {
            let running = running.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                running.store(false, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        // Due an hour after the first line
        pacer.pace("3601000,b");
        assert!(started.elapsed() < Duration::from_secs(5));
        stopper.join().unwrap();
    }

    #[test]
    fn test_reset_reanchors() {
        let mut pacer = TimestampPacer::new();
        let start = Instant::now();
        pacer.delay_for("1000,a", start);
        pacer.reset();
        assert_eq!(pacer.delay_for("5000,a", start), Duration::ZERO);
    }
}
