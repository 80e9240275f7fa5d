//! Timestamp arithmetic on `(seconds, nanoseconds)` pairs.
//!
//! Every latency figure in this crate is the difference of two kernel
//! software timestamps delivered through `SCM_TIMESTAMPING` control
//! messages. [`Stamp`] keeps the kernel's split representation instead of
//! collapsing to a single integer, so the writer can reproduce second and
//! sub-second fields exactly as they were measured.

/// Nanoseconds per second.
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

const NANOS_PER_MILLI: i64 = 1_000_000;
const MILLIS_PER_SEC: i64 = 1_000;

/// A kernel timestamp, split into whole seconds and nanoseconds.
///
/// Ordering is lexicographic on `(sec, nsec)`, which for normalized values
/// is chronological order. The all-zero stamp doubles as the error marker
/// for measurements that never produced a usable latency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    /// Whole seconds.
    pub sec: i64,
    /// Nanoseconds within the second, `0..1_000_000_000` when normalized.
    pub nsec: i64,
}

impl Stamp {
    /// The zero stamp, also used as the failed-measurement marker.
    pub const ZERO: Self = Self { sec: 0, nsec: 0 };

    #[inline]
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Converts a millisecond count, normalizing into seconds plus
    /// nanoseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        let millis = millis as i64;
        Self {
            sec: millis / MILLIS_PER_SEC,
            nsec: (millis % MILLIS_PER_SEC) * NANOS_PER_MILLI,
        }
    }

    /// Elapsed time from `earlier` to `self`, borrowing from the seconds
    /// field when the nanosecond subtraction underflows.
    ///
    /// The subtraction is mechanical: when the two stamps are misordered
    /// the seconds field goes negative and callers observe the sign
    /// through [`Stamp::as_nanos`].
    #[must_use]
    pub const fn since(self, earlier: Self) -> Self {
        let mut sec = self.sec - earlier.sec;
        let mut nsec = self.nsec - earlier.nsec;
        if nsec < 0 {
            sec -= 1;
            nsec += NANOS_PER_SEC;
        }
        Self { sec, nsec }
    }

    /// Total nanoseconds, collapsing both fields.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> i64 {
        self.sec * NANOS_PER_SEC + self.nsec
    }

    /// True for the all-zero stamp.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.sec == 0 && self.nsec == 0
    }
}
