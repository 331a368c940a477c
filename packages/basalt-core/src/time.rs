/// Wall-clock helpers.
///
/// Entry timestamps are advisory ordering hints, not security-critical;
/// millisecond precision is what the wire format carries.

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
