//! Database time.
//!
//! All timestamps are i64 nanoseconds since the Unix epoch; 0 means
//! "unset". The database clock normally follows the wall clock but can be
//! overridden through the segment's simulation-time cell (playback mode),
//! which is why every blocking primitive in this crate takes an absolute
//! [`Timestamp`] deadline rather than a duration.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The smallest representable time step. Commit timestamps that collide on
/// the same tick are forged forward by exactly one of these.
pub const TICK: i64 = 1;

/// Nanoseconds since the Unix epoch. 0 = unset/invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Largest representable deadline; effectively "block forever".
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    pub fn from_nanos(ns: i64) -> Timestamp {
        Timestamp(ns)
    }

    pub fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn from_secs_f64(secs: f64) -> Timestamp {
        Timestamp((secs * 1e9) as i64)
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1e9
    }

    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Saturating add of a duration, for building deadlines.
    pub fn add(self, d: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(d.as_nanos().min(i64::MAX as u128) as i64))
    }

    pub fn saturating_sub(self, other: Timestamp) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(other.0).max(0) as u64)
    }

    /// Next representable instant, used for same-tick collision forging.
    pub fn next_tick(self) -> Timestamp {
        Timestamp(self.0.saturating_add(TICK))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}s", self.as_secs_f64())
    }
}

/// Current wall-clock time. Callers inside the store should prefer
/// `SegmentView::db_now`, which folds in the simulation cell.
pub fn wall_now() -> Timestamp {
    let d = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp(d.as_nanos().min(i64::MAX as u128) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_round_trip() {
        let ts = Timestamp::from_secs_f64(1.5);
        assert_eq!(ts.as_nanos(), 1_500_000_000);
        assert!((ts.as_secs_f64() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn deadline_arithmetic() {
        let t = Timestamp(100);
        assert_eq!(t.add(Duration::from_nanos(50)).as_nanos(), 150);
        assert_eq!(t.next_tick().as_nanos(), 100 + TICK);
        assert_eq!(Timestamp::MAX.next_tick(), Timestamp::MAX);
    }

    #[test]
    fn wall_clock_is_sane() {
        let a = wall_now();
        let b = wall_now();
        assert!(a.is_set());
        assert!(b >= a);
    }
}
