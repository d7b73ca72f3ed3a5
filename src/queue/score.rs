//! Score encoding for queue entries.
//!
//! A single numeric score gives the queue a total ordering that satisfies
//! both rules at once:
//!
//! - strictly higher priority first;
//! - within a priority, older `enqueued_at` first (FIFO).
//!
//! The encoding is `priority * PRIORITY_BAND + (TIMESTAMP_CEILING - ts)`,
//! where `ts` is the enqueue time in unix seconds. The band factor exceeds
//! any unix timestamp below the ceiling, so the priority term always
//! dominates; within a band, older timestamps leave a larger remainder and
//! therefore win. Higher score = dispatched earlier.
//!
//! All arithmetic is integral; scores are converted to `f64` only at the
//! sorted-set boundary, where every value in range is exactly representable.

use chrono::{DateTime, TimeZone, Utc};

use crate::item::Priority;

/// Width of one priority band. Larger than any unix timestamp the encoding
/// accepts, so the priority term dominates the ordering.
pub const PRIORITY_BAND: i64 = 10_000_000_000;

/// Upper bound on enqueue timestamps (unix seconds). Reached in the year
/// 2286; until then the age term is strictly positive and decreasing in
/// enqueue time.
pub const TIMESTAMP_CEILING: i64 = 9_999_999_999;

/// Encodes a priority and enqueue time into an ordering score.
pub fn encode(priority: Priority, enqueued_at: DateTime<Utc>) -> f64 {
    let ts = enqueued_at.timestamp().clamp(0, TIMESTAMP_CEILING);
    (priority.level() as i64 * PRIORITY_BAND + (TIMESTAMP_CEILING - ts)) as f64
}

/// Decodes a score back into its priority and enqueue time.
///
/// Scores outside the valid bands (produced by a corrupted entry) decode to
/// a clamped priority so the caller still gets a usable ordering.
pub fn decode(score: f64) -> (Priority, DateTime<Utc>) {
    let score = score as i64;
    let level = (score / PRIORITY_BAND).clamp(Priority::MIN as i64, Priority::MAX as i64);
    // Level was clamped into range above.
    let priority = Priority::new(level).unwrap_or(Priority::LOW);
    let time_component = score - level * PRIORITY_BAND;
    let ts = (TIMESTAMP_CEILING - time_component).clamp(0, TIMESTAMP_CEILING);
    let enqueued_at = Utc
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(Utc::now);
    (priority, enqueued_at)
}

/// Extracts the age component of a score (the part below the band factor).
pub fn time_component(score: f64) -> i64 {
    let score = score as i64;
    score % PRIORITY_BAND
}

/// Rewrites the priority band of a score, preserving its age component.
/// A priority change must not reset FIFO age within the new band.
pub fn with_priority(score: f64, new_priority: Priority) -> f64 {
    (new_priority.level() as i64 * PRIORITY_BAND + time_component(score)) as f64
}

/// Inclusive score range covered by one priority band.
pub fn band_range(priority: Priority) -> (f64, f64) {
    let min = priority.level() as i64 * PRIORITY_BAND;
    let max = min + PRIORITY_BAND - 1;
    (min as f64, max as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_priority_dominates() {
        let now = Utc::now();
        let much_older = now - Duration::days(365);
        let low_old = encode(Priority::LOW, much_older);
        let high_new = encode(Priority::HIGH, now);
        assert!(high_new > low_old);
    }

    #[test]
    fn test_older_wins_within_band() {
        let now = Utc::now();
        let older = encode(Priority::NORMAL, now - Duration::seconds(10));
        let newer = encode(Priority::NORMAL, now);
        assert!(older > newer);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for priority in Priority::all() {
            let score = encode(priority, at);
            let (p, ts) = decode(score);
            assert_eq!(p, priority);
            assert_eq!(ts, at);
        }
    }

    #[test]
    fn test_with_priority_preserves_age() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let score = encode(Priority::LOW, at);
        let boosted = with_priority(score, Priority::HIGH);
        let (p, ts) = decode(boosted);
        assert_eq!(p, Priority::HIGH);
        assert_eq!(ts, at);
    }

    #[test]
    fn test_band_range_bounds() {
        let (min, max) = band_range(Priority::NORMAL);
        assert_eq!(min as i64, 3 * PRIORITY_BAND);
        assert_eq!(max as i64, 4 * PRIORITY_BAND - 1);

        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let score = encode(Priority::NORMAL, at);
        assert!(score >= min && score <= max);
    }

    #[test]
    fn test_bands_do_not_overlap() {
        let mut previous_max = f64::MIN;
        for priority in Priority::all() {
            let (min, max) = band_range(priority);
            assert!(min > previous_max);
            previous_max = max;
        }
    }

    #[test]
    fn test_scores_exact_in_f64() {
        // Largest encodable score must survive the f64 roundtrip exactly.
        let top = Priority::MAX as i64 * PRIORITY_BAND + TIMESTAMP_CEILING;
        assert_eq!(top as f64 as i64, top);
    }
}
