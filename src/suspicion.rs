//! Burst heuristic: rapid-fire requests push the score up fast, normally
//! spaced ones let it drain slowly.

use chrono::{DateTime, Utc};

use crate::config::SuspicionPolicy;
use crate::rate_limit::IdentifierRecord;

pub const MAX_SCORE: u8 = 100;

/// Folds one request arriving at `now` into the record's suspicion score.
pub fn score_request(record: &mut IdentifierRecord, now: DateTime<Utc>, policy: &SuspicionPolicy) {
    if let Some(last) = record.last_request_time {
        let gap = now - last;
        record.suspicion_score = if gap < policy.min_request_interval {
            record
                .suspicion_score
                .saturating_add(policy.rapid_increment)
                .min(MAX_SCORE)
        } else {
            record.suspicion_score.saturating_sub(policy.steady_decrement)
        };
    }
    record.last_request_time = Some(now);
}

pub fn is_suspicious(record: &IdentifierRecord, policy: &SuspicionPolicy) -> bool {
    record.suspicion_score >= policy.threshold
}
