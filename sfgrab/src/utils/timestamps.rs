//! Timestamp helpers.

use chrono::{Local, Utc};

/// Format used in artifact names: day plus time, second granularity.
pub const WARC_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Returns the local time formatted for artifact names (`YYYYMMDD-HHMMSS`).
#[must_use]
pub fn warc_timestamp() -> String {
    Local::now().format(WARC_TIMESTAMP_FORMAT).to_string()
}

/// Returns the current UTC time as an RFC 3339 string.
#[must_use]
pub fn iso_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    #[test]
    fn test_warc_timestamp_shape() {
        let ts = warc_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(&ts[8..9], "-");
        assert!(NaiveDateTime::parse_from_str(&ts, WARC_TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_iso_timestamp_parses() {
        let ts = iso_timestamp();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
