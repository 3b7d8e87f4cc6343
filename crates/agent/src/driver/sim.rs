//! Value generators for simulated sensors (development hosts without the
//! probes attached).

use time::OffsetDateTime;

/// Uniform sample in `[lo, hi)`, rounded to one decimal like the real probes.
pub(super) fn uniform(lo: f64, hi: f64) -> f64 {
    round1(lo + fastrand::f64() * (hi - lo))
}

pub(super) fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Daytime is 06:00-18:59 UTC; simulated light follows it.
pub(super) fn is_daytime(at: OffsetDateTime) -> bool {
    (6..=18).contains(&at.hour())
}

/// Simulated ambient light: bright during the day, dim at night.
pub(super) fn light_lux(at: OffsetDateTime) -> f64 {
    if is_daytime(at) {
        uniform(100.0, 1000.0)
    } else {
        uniform(0.1, 50.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn uniform_stays_in_range() {
        for _ in 0..1000 {
            let v = uniform(18.0, 28.0);
            assert!((18.0..=28.0).contains(&v), "out of range: {v}");
        }
    }

    #[test]
    fn round1_keeps_one_decimal() {
        assert_eq!(round1(21.349), 21.3);
        assert_eq!(round1(21.36), 21.4);
    }

    #[test]
    fn light_follows_day_night() {
        let noon = datetime!(2025-06-01 12:00 UTC);
        let midnight = datetime!(2025-06-01 00:30 UTC);
        for _ in 0..100 {
            assert!(light_lux(noon) >= 100.0);
            assert!(light_lux(midnight) <= 50.0);
        }
    }
}
