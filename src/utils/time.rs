use chrono::{SecondsFormat, Utc};

/// Current UTC wall-clock time in nanoseconds since the epoch.
///
/// Saturates at `i64::MAX` (year 2262) rather than panicking.
#[inline]
pub fn utc_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// ISO-8601 UTC timestamp for log lines.
#[inline]
pub fn iso_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_ns_is_monotonic_enough() {
        let a = utc_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = utc_ns();
        assert!(b > a);
    }

    #[test]
    fn iso_utc_ends_in_z() {
        assert!(iso_utc().ends_with('Z'));
    }
}
