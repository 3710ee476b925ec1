//! Pipeline metrics.

use metrics::{counter, gauge};
use vpipe_models::TranscodeStatus;

/// Metric name constants for consistency.
pub mod names {
    pub const UPLOADS_ISSUED_TOTAL: &str = "vpipe_uploads_issued_total";
    pub const JOBS_PUBLISHED_TOTAL: &str = "vpipe_jobs_published_total";
    pub const JOBS_REJECTED_TOTAL: &str = "vpipe_jobs_rejected_total";
    pub const STATUS_MESSAGES_TOTAL: &str = "vpipe_status_messages_total";
    pub const MALFORMED_MESSAGES_TOTAL: &str = "vpipe_status_messages_malformed_total";
    pub const SUBSCRIBERS_EVICTED_TOTAL: &str = "vpipe_subscribers_evicted_total";
    pub const FAST_PATH_TOTAL: &str = "vpipe_fast_path_total";
    pub const LIVE_SUBSCRIPTIONS: &str = "vpipe_live_subscriptions";
}

pub fn record_upload_issued() {
    counter!(names::UPLOADS_ISSUED_TOTAL).increment(1);
}

pub fn record_job_published() {
    counter!(names::JOBS_PUBLISHED_TOTAL).increment(1);
}

pub fn record_job_rejected(reason: &'static str) {
    counter!(names::JOBS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_status_message(status: TranscodeStatus) {
    counter!(names::STATUS_MESSAGES_TOTAL, "status" => status.as_str()).increment(1);
}

pub fn record_malformed_message() {
    counter!(names::MALFORMED_MESSAGES_TOTAL).increment(1);
}

pub fn record_evicted(count: usize) {
    counter!(names::SUBSCRIBERS_EVICTED_TOTAL).increment(count as u64);
}

pub fn record_fast_path(status: TranscodeStatus) {
    counter!(names::FAST_PATH_TOTAL, "status" => status.as_str()).increment(1);
}

pub fn subscriptions_opened(count: usize) {
    gauge!(names::LIVE_SUBSCRIPTIONS).increment(count as f64);
}

pub fn subscriptions_closed(count: usize) {
    if count > 0 {
        gauge!(names::LIVE_SUBSCRIPTIONS).decrement(count as f64);
    }
}
