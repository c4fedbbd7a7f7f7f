//! Small helpers shared by the state machine and the recovery loop:
//! deadline bookkeeping for the poll loop and bounded operational logs.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::time::SystemTime;

/// Tracks a single pending timeout against a monotonic tick counter.
///
/// The state machine and the slew rate limiter both need "how many
/// milliseconds until my next deadline" answers suitable for a poll call.
/// Timestamps are readings of the local clock; the counter frequency is
/// supplied at construction so deadlines stay correct for non-nanosecond
/// clocks.
#[derive(Debug, Clone)]
pub struct Deadline {
    end_at: Option<i64>,
    ticks_per_sec: u64,
}

impl Deadline {
    pub fn new(ticks_per_sec: u64) -> Self {
        assert!(ticks_per_sec > 0);
        Self {
            end_at: None,
            ticks_per_sec,
        }
    }

    /// Arm the deadline `ms` milliseconds after `now`.
    pub fn set(&mut self, now: i64, ms: u32) {
        let ticks = (ms as i64).saturating_mul(self.ticks_per_sec as i64) / 1000;
        self.end_at = Some(now.saturating_add(ticks));
    }

    /// Cancel any pending deadline.
    pub fn clear(&mut self) {
        self.end_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.end_at.is_some()
    }

    /// Milliseconds until the deadline, rounded up.  `None` when no
    /// deadline is armed, `Some(0)` when it is due.
    pub fn ms_until(&self, now: i64) -> Option<u64> {
        let end = self.end_at?;
        if end <= now {
            return Some(0);
        }

        let delta = (end - now) as u128;
        let ms = (delta * 1000 + (self.ticks_per_sec as u128 - 1)) / self.ticks_per_sec as u128;
        Some(ms.min(u64::MAX as u128) as u64)
    }
}

struct LogEntry {
    stamp: SystemTime,
    repeat: u32,
    line: String,
}

/// Bounded ring of operational log lines used for status dumps.
///
/// State changes, election traffic and bad packets each get their own
/// ring so that a status dump can show recent history without unbounded
/// memory use.  Consecutive identical lines are collapsed into a repeat
/// count.
pub struct LogRing {
    title: &'static str,
    cap: usize,
    entries: VecDeque<LogEntry>,
}

impl LogRing {
    pub fn new(title: &'static str, cap: usize) -> Self {
        assert!(cap > 0);
        Self {
            title,
            cap,
            entries: VecDeque::with_capacity(cap),
        }
    }

    /// Record a line in the ring only.
    pub fn push(&mut self, line: String) {
        if let Some(last) = self.entries.back_mut() {
            if last.line == line {
                last.repeat += 1;
                last.stamp = SystemTime::now();
                return;
            }
        }

        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            stamp: SystemTime::now(),
            repeat: 1,
            line,
        });
    }

    /// Record a line in the ring and mirror it to the logger.
    pub fn push_logged(&mut self, level: log::Level, line: String) {
        log::log!(level, "{line}");
        self.push(line);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the ring contents to `out`, oldest entry first.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "\n{} ({} entries)", self.title, self.entries.len())?;
        for entry in &self.entries {
            let age = entry
                .stamp
                .elapsed()
                .map(|d| d.as_secs())
                .unwrap_or_default();
            if entry.repeat > 1 {
                writeln!(out, "  [{age:>6}s ago] (x{}) {}", entry.repeat, entry.line)?;
            } else {
                writeln!(out, "  [{age:>6}s ago] {}", entry.line)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_starts_disarmed() {
        let d = Deadline::new(1_000_000_000);
        assert!(!d.is_armed());
        assert_eq!(d.ms_until(0), None);
    }

    #[test]
    fn deadline_counts_down_and_expires() {
        let mut d = Deadline::new(1_000_000_000);
        d.set(0, 100);
        assert_eq!(d.ms_until(0), Some(100));
        assert_eq!(d.ms_until(50_000_000), Some(50));
        assert_eq!(d.ms_until(100_000_000), Some(0));
        assert_eq!(d.ms_until(150_000_000), Some(0));
    }

    #[test]
    fn deadline_rounds_partial_milliseconds_up() {
        let mut d = Deadline::new(1_000_000_000);
        d.set(0, 10);
        // 0.5ms remaining must report 1ms so poll does not spin early.
        assert_eq!(d.ms_until(9_500_000), Some(1));
    }

    #[test]
    fn deadline_respects_clock_frequency() {
        // A 1MHz counter: 1 tick per microsecond.
        let mut d = Deadline::new(1_000_000);
        d.set(0, 100);
        assert_eq!(d.ms_until(0), Some(100));
        assert_eq!(d.ms_until(100_000), Some(0));
    }

    #[test]
    fn deadline_clear_cancels(){
        let mut d = Deadline::new(1_000_000_000);
        d.set(0, 100);
        d.clear();
        assert_eq!(d.ms_until(0), None);
    }

    #[test]
    fn log_ring_evicts_oldest() {
        let mut ring = LogRing::new("Test Ring", 3);
        for i in 0..5 {
            ring.push(format!("line {i}"));
        }
        assert_eq!(ring.len(), 3);

        let mut out = Vec::new();
        ring.dump(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("line 1"));
        assert!(text.contains("line 2"));
        assert!(text.contains("line 4"));
    }

    #[test]
    fn log_ring_collapses_repeats() {
        let mut ring = LogRing::new("Test Ring", 4);
        ring.push("same".to_string());
        ring.push("same".to_string());
        ring.push("same".to_string());
        assert_eq!(ring.len(), 1);

        let mut out = Vec::new();
        ring.dump(&mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("(x3)"));
    }
}
