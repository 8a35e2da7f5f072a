//! Formatting helpers shared by status displays.

use chrono::{DateTime, Utc};

/// Format a timestamp relative to now (e.g., "in 25s", "3m ago").
pub fn format_relative_time(ts: DateTime<Utc>) -> String {
    format_relative_to(ts, Utc::now())
}

fn format_relative_to(ts: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = ts.signed_duration_since(now).num_seconds();
    let magnitude = seconds.unsigned_abs();

    if magnitude == 0 {
        return "now".to_string();
    }

    let amount = if magnitude < 60 {
        format!("{}s", magnitude)
    } else if magnitude < 3600 {
        format!("{}m", magnitude / 60)
    } else if magnitude < 86_400 {
        format!("{}h", magnitude / 3600)
    } else {
        format!("{}d", magnitude / 86_400)
    };

    if seconds > 0 {
        format!("in {}", amount)
    } else {
        format!("{} ago", amount)
    }
}

/// Format an optional timestamp, or "-" if missing.
pub fn format_relative_time_opt(ts: Option<DateTime<Utc>>) -> String {
    match ts {
        Some(ts) => format_relative_time(ts),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_future_and_past() {
        let now = Utc::now();
        assert_eq!(format_relative_to(now + Duration::seconds(25), now), "in 25s");
        assert_eq!(format_relative_to(now - Duration::seconds(125), now), "2m ago");
        assert_eq!(format_relative_to(now + Duration::hours(3), now), "in 3h");
        assert_eq!(format_relative_to(now, now), "now");
    }

    #[test]
    fn test_missing_timestamp() {
        assert_eq!(format_relative_time_opt(None), "-");
    }
}
