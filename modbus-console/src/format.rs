//! Pure display formatting for the liveness telemetry the gateway reports.

use modbus_link::KeepAlive;

/// Collapses an uptime in seconds into the "1d 2h 3m 4s" cascade. Units are
/// shown from the largest non-zero one down, so "2d 0h 0m 5s" keeps its
/// zeroed middle units while plain "42s" stays short.
pub fn uptime(total_seconds: f64) -> String {
    if !(total_seconds >= 1.0) {
        return "0s".to_owned();
    }
    let total = total_seconds as u64;
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d "));
    }
    if hours > 0 || days > 0 {
        out.push_str(&format!("{hours}h "));
    }
    if minutes > 0 || hours > 0 || days > 0 {
        out.push_str(&format!("{minutes}m "));
    }
    out.push_str(&format!("{seconds}s"));
    out
}

/// Renders the keep-alive outcome against the supplied current time (epoch
/// seconds). A failed probe is always called out; no probe yet renders as
/// nothing at all.
pub fn keep_alive(last: KeepAlive, now_epoch: f64) -> String {
    match last {
        KeepAlive::Failed => "Keep-alive: FAILED".to_owned(),
        KeepAlive::Unknown => String::new(),
        KeepAlive::OkAt(ts) => format!("Keep-alive OK ({}s ago)", (now_epoch - ts).round() as i64),
    }
}

/// Wall-clock label for an epoch timestamp, local time.
pub fn clock_time(epoch_seconds: f64) -> String {
    use chrono::{Local, TimeZone};
    Local
        .timestamp_opt(epoch_seconds as i64, 0)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_owned())
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn uptime_under_one_second_is_zero() {
    assert_eq!(uptime(0.0), "0s");
    assert_eq!(uptime(0.9), "0s");
    assert_eq!(uptime(f64::NAN), "0s");
}

#[test]
fn uptime_cascade() {
    assert_eq!(uptime(42.0), "42s");
    assert_eq!(uptime(61.0), "1m 1s");
    assert_eq!(uptime(3_661.0), "1h 1m 1s");
    assert_eq!(uptime(90_061.0), "1d 1h 1m 1s");
    // Larger units force the zeroed middle ones to show.
    assert_eq!(uptime(86_400.0 * 2.0 + 5.0), "2d 0h 0m 5s");
    assert_eq!(uptime(3_600.0 + 2.0), "1h 0m 2s");
}

#[test]
fn keep_alive_failed_and_unknown() {
    assert_eq!(keep_alive(KeepAlive::Failed, 100.0), "Keep-alive: FAILED");
    assert_eq!(keep_alive(KeepAlive::Unknown, 100.0), "");
}

#[test]
fn keep_alive_age_is_relative_to_now() {
    assert_eq!(
        keep_alive(KeepAlive::OkAt(1_000.0), 1_002.4),
        "Keep-alive OK (2s ago)"
    );
    assert_eq!(
        keep_alive(KeepAlive::OkAt(1_000.0), 1_000.0),
        "Keep-alive OK (0s ago)"
    );
}
