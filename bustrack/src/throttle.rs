//! Minimum-interval throttle for location emissions.
//!
//! Devices deliver position fixes far more often than the backend needs them.
//! The [`EmissionThrottle`] lets at most one emission through per
//! `min_interval` window; everything in between is rejected and dropped by the
//! caller. Rejected samples are never queued or batched.
//!
//! ```text
//! min_interval = 5s
//!
//!   t=0     t=1     t=4     t=6     t=9     t=11
//!   emit    drop    drop    emit    drop    emit
//!   |<------ 5s ------>|    |<------ 5s ------>|
//! ```
//!
//! The throttle is a plain value owned by exactly one tracking session; it is
//! not shared and needs no locking.

use std::time::Duration;

use crate::clock::Timestamp;

/// Default minimum interval between two accepted emissions.
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(5);

/// Accepts at most one emission per `min_interval`.
#[derive(Debug, Clone)]
pub struct EmissionThrottle {
    min_interval: Duration,
    last_emitted_at: Option<Timestamp>,
}

impl EmissionThrottle {
    /// Creates a throttle that has never emitted.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emitted_at: None,
        }
    }

    /// Decides whether an emission is allowed at `now`.
    ///
    /// Returns `true` on the first call, or once `min_interval` has elapsed
    /// since the last accepted emission; `now` then becomes the new reference
    /// point. Returns `false` otherwise and leaves the state untouched.
    ///
    /// If the clock went backwards past the last emission the elapsed time is
    /// negative and the emission is rejected until the clock catches up.
    pub fn can_emit(&mut self, now: Timestamp) -> bool {
        let allowed = match self.last_emitted_at {
            None => true,
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed >= self.min_interval,
                Err(_) => false,
            },
        };

        if allowed {
            self.last_emitted_at = Some(now);
        }
        allowed
    }

    /// Forgets the last emission so the next call is accepted.
    pub fn reset(&mut self) {
        self.last_emitted_at = None;
    }

    /// Time of the last accepted emission, if any.
    pub fn last_emitted_at(&self) -> Option<Timestamp> {
        self.last_emitted_at
    }

    /// The configured window.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for EmissionThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::timestamp_from_millis;
    use proptest::prelude::*;

    fn at(ms: i64) -> Timestamp {
        timestamp_from_millis(ms)
    }

    #[test]
    fn test_first_emission_is_allowed() {
        let mut throttle = EmissionThrottle::default();
        assert!(throttle.last_emitted_at().is_none());
        assert!(throttle.can_emit(at(123)));
        assert_eq!(throttle.last_emitted_at(), Some(at(123)));
    }

    #[test]
    fn test_rejection_has_no_side_effect() {
        let mut throttle = EmissionThrottle::default();
        assert!(throttle.can_emit(at(0)));
        assert!(!throttle.can_emit(at(4_999)));
        assert_eq!(throttle.last_emitted_at(), Some(at(0)));
    }

    #[test]
    fn test_exact_interval_is_allowed() {
        let mut throttle = EmissionThrottle::default();
        assert!(throttle.can_emit(at(0)));
        assert!(throttle.can_emit(at(5_000)));
    }

    #[test]
    fn test_scenario_six_samples_three_accepted() {
        let mut throttle = EmissionThrottle::new(Duration::from_millis(5_000));
        let accepted: Vec<i64> = [0, 1_000, 4_000, 6_000, 9_000, 11_000]
            .into_iter()
            .filter(|&t| throttle.can_emit(at(t)))
            .collect();

        assert_eq!(accepted, vec![0, 6_000, 11_000]);
    }

    #[test]
    fn test_clock_going_backwards_is_rejected() {
        let mut throttle = EmissionThrottle::default();
        assert!(throttle.can_emit(at(60_000)));
        assert!(!throttle.can_emit(at(10_000)));
        assert_eq!(throttle.last_emitted_at(), Some(at(60_000)));
    }

    #[test]
    fn test_reset_allows_next_emission() {
        let mut throttle = EmissionThrottle::default();
        assert!(throttle.can_emit(at(0)));
        throttle.reset();
        assert!(throttle.can_emit(at(1)));
    }

    #[test]
    fn test_zero_interval_accepts_everything() {
        let mut throttle = EmissionThrottle::new(Duration::ZERO);
        assert!(throttle.can_emit(at(0)));
        assert!(throttle.can_emit(at(0)));
        assert!(throttle.can_emit(at(1)));
    }

    proptest! {
        #[test]
        fn prop_within_window_is_rejected(
            start in 0i64..1_000_000_000,
            interval_ms in 1u64..600_000,
            fraction in 0.0f64..1.0,
        ) {
            let mut throttle = EmissionThrottle::new(Duration::from_millis(interval_ms));
            let gap = ((interval_ms as f64) * fraction) as i64;
            prop_assume!(gap < interval_ms as i64);

            prop_assert!(throttle.can_emit(at(start)));
            prop_assert!(!throttle.can_emit(at(start + gap)));
        }

        #[test]
        fn prop_after_window_is_accepted(
            start in 0i64..1_000_000_000,
            interval_ms in 0u64..600_000,
            extra in 0i64..600_000,
        ) {
            let mut throttle = EmissionThrottle::new(Duration::from_millis(interval_ms));
            prop_assert!(throttle.can_emit(at(start)));
            prop_assert!(throttle.can_emit(at(start + interval_ms as i64 + extra)));
        }

        #[test]
        fn prop_accepted_emissions_are_spaced(
            mut offsets in proptest::collection::vec(0i64..60_000, 1..50),
        ) {
            offsets.sort_unstable();
            let mut throttle = EmissionThrottle::default();
            let accepted: Vec<i64> = offsets
                .into_iter()
                .filter(|&t| throttle.can_emit(at(t)))
                .collect();

            for pair in accepted.windows(2) {
                prop_assert!(pair[1] - pair[0] >= 5_000);
            }
        }
    }
}
