//! Debug assertion macros for ring invariants.
//!
//! Active only in debug builds; release builds carry zero overhead.

/// Assert that the producer count never decreases.
macro_rules! debug_assert_monotonic_count {
    ($old:expr, $new:expr) => {
        debug_assert!(
            $new >= $old,
            "producer count decreased from {} to {}",
            $old,
            $new
        )
    };
}

/// Assert that a cursor never runs ahead of the producer.
macro_rules! debug_assert_cursor_bound {
    ($cursor:expr, $published:expr) => {
        debug_assert!(
            $cursor <= $published,
            "cursor {} ahead of producer count {}",
            $cursor,
            $published
        )
    };
}

/// Assert that a successfully read message was within the live window.
macro_rules! debug_assert_read_in_window {
    ($seq:expr, $published:expr, $capacity:expr) => {
        debug_assert!(
            $published - $seq <= $capacity as u64,
            "read seq {} outside live window (published {}, capacity {})",
            $seq,
            $published,
            $capacity
        )
    };
}

pub(crate) use debug_assert_cursor_bound;
pub(crate) use debug_assert_monotonic_count;
pub(crate) use debug_assert_read_in_window;
