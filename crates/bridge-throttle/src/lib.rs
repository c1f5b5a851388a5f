#![deny(unsafe_code)]

//! Rate-limits UCI `info` lines forwarded from an engine to a client.
//! Every non-`info` line and every depth change passes through immediately;
//! otherwise lines are collapsed to at most one forward per configured
//! window.

use std::time::Duration;

/// What a caller should do with the line just examined.
#[derive(Debug, Eq, PartialEq)]
pub enum Decision {
    /// Write the line to the client now.
    Forward,
    /// Drop the line; it has been recorded in the pending slot.
    Defer,
}

/// Stateful per-bridge throttler.
///
/// `now_ms` is supplied by the caller on every call rather than read from
/// the system clock internally, which keeps the rule table in this module
/// deterministic and unit-testable without real sleeps.
#[derive(Debug)]
pub struct Throttler {
    interval: Duration,
    last_forward_ms: u64,
    last_depth: Option<i64>,
    pending: Option<String>,
}

impl Throttler {
    /// Builds a throttler with the given window. An interval of zero
    /// disables throttling entirely (every line forwards).
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_forward_ms: 0,
            last_depth: None,
            pending: None,
        }
    }

    /// The line currently held in the single-slot pending field, if any.
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Applies the throttle rules, in order, to one already-decoded line of
    /// engine output.
    pub fn should_forward(&mut self, line: &str, now_ms: u64) -> Decision {
        if self.interval.is_zero() {
            return Decision::Forward;
        }

        if !line.starts_with("info ") {
            self.pending = None;
            return Decision::Forward;
        }

        if let Some(depth) = extract_depth(line) {
            if Some(depth) != self.last_depth {
                self.last_depth = Some(depth);
                self.last_forward_ms = now_ms;
                self.pending = None;
                return Decision::Forward;
            }
        }

        if now_ms.saturating_sub(self.last_forward_ms) >= self.interval.as_millis() as u64 {
            self.last_forward_ms = now_ms;
            self.pending = None;
            return Decision::Forward;
        }

        self.pending = Some(line.to_string());
        Decision::Defer
    }
}

/// Extracts the integer token immediately following the literal `depth`
/// keyword. Only the first `depth` occurrence is honored; `seldepth` is not
/// inspected.
fn extract_depth(line: &str) -> Option<i64> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "depth" {
            return tokens.next()?.parse().ok();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_forwards_everything() {
        let mut t = Throttler::new(Duration::ZERO);
        assert_eq!(t.should_forward("info depth 1 score cp 10", 0), Decision::Forward);
        assert_eq!(t.should_forward("info depth 1 score cp 10", 1), Decision::Forward);
    }

    #[test]
    fn non_info_lines_always_forward_and_clear_pending() {
        let mut t = Throttler::new(Duration::from_millis(100));
        assert_eq!(t.should_forward("info depth 1", 0), Decision::Forward);
        assert_eq!(t.should_forward("info depth 1 more", 10), Decision::Defer);
        assert!(t.pending().is_some());
        assert_eq!(t.should_forward("bestmove e2e4", 20), Decision::Forward);
        assert!(t.pending().is_none());
    }

    #[test]
    fn strictly_increasing_depth_always_forwards() {
        let mut t = Throttler::new(Duration::from_millis(1000));
        for depth in 1..=5 {
            let line = format!("info depth {depth} score cp 1");
            assert_eq!(t.should_forward(&line, depth as u64), Decision::Forward);
        }
    }

    #[test]
    fn constant_depth_is_throttled_by_window() {
        let mut t = Throttler::new(Duration::from_millis(100));
        assert_eq!(t.should_forward("info depth 5 score cp 1", 0), Decision::Forward);
        assert_eq!(t.should_forward("info depth 5 score cp 2", 50), Decision::Defer);
        assert_eq!(t.should_forward("info depth 5 score cp 3", 99), Decision::Defer);
        assert_eq!(t.should_forward("info depth 5 score cp 4", 100), Decision::Forward);
    }

    #[test]
    fn pending_slot_holds_only_the_latest_line() {
        let mut t = Throttler::new(Duration::from_millis(1000));
        t.should_forward("info depth 5 score cp 1", 0);
        t.should_forward("info depth 5 score cp 2", 1);
        t.should_forward("info depth 5 score cp 3", 2);
        assert_eq!(t.pending(), Some("info depth 5 score cp 3"));
    }

    #[test]
    fn missing_depth_token_falls_back_to_time_window() {
        let mut t = Throttler::new(Duration::from_millis(50));
        assert_eq!(t.should_forward("info string hello", 0), Decision::Forward);
        assert_eq!(t.should_forward("info string hello2", 10), Decision::Defer);
        assert_eq!(t.should_forward("info string hello3", 60), Decision::Forward);
    }
}
