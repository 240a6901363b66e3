//! Access log line
//!
//! Combined-log-format variant with TLS version and origin timing:
//!
//! ```text
//! 203.0.113.7 shop.example.com - [01/Mar/2024:12:34:56 +0000] "GET /cart?id=3 HTTP/1.1" 200 5120 "-" "Mozilla/5.0" | - | 0.042 0.042 0.042
//! ```

use crate::clock::Timestamp;
use std::fmt;
use std::time::Duration;

const MISSING: &str = "-";

/// Collapse each run of `\r`, `\n`, `\t` into one space, escape `"`, trim
pub fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_control_run = false;

    for c in value.chars() {
        match c {
            '\r' | '\n' | '\t' => {
                if !in_control_run {
                    out.push(' ');
                    in_control_run = true;
                }
            }
            '"' => {
                out.push_str("\\\"");
                in_control_run = false;
            }
            _ => {
                out.push(c);
                in_control_run = false;
            }
        }
    }

    out.trim().to_string()
}

/// `[DD/Mon/YYYY:HH:MM:SS +0000]`, always UTC
pub fn clf_timestamp(at: Timestamp) -> String {
    format!("[{} +0000]", at.to_datetime().format("%d/%b/%Y:%H:%M:%S"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogLine {
    pub ip: Option<String>,
    /// Full request hostname, `www.` included
    pub domain: String,
    pub at: Timestamp,
    pub method: String,
    /// Path plus query string
    pub path: String,
    pub protocol: Option<String>,
    pub status: u16,
    /// `None` when the response body could not be measured
    pub size: Option<u64>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub tls_version: Option<String>,
    /// Origin fetch duration
    pub duration: Duration,
}

fn or_missing(value: &Option<String>) -> &str {
    value.as_deref().filter(|v| !v.is_empty()).unwrap_or(MISSING)
}

impl fmt::Display for AccessLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.size {
            Some(n) => n.to_string(),
            None => MISSING.to_string(),
        };
        let t = format!("{:.3}", self.duration.as_secs_f64());

        writeln!(
            f,
            "{} {} - {} \"{} {} {}\" {} {} \"{}\" \"{}\" | {} | {} {} {}",
            or_missing(&self.ip),
            self.domain,
            clf_timestamp(self.at),
            self.method,
            self.path,
            or_missing(&self.protocol),
            self.status,
            size,
            sanitize(or_missing(&self.referer)),
            sanitize(or_missing(&self.user_agent)),
            or_missing(&self.tls_version),
            t,
            t,
            t
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-01T12:34:56.789Z
    const AT: u64 = 1_709_296_496_789;

    fn line() -> AccessLogLine {
        AccessLogLine {
            ip: Some("203.0.113.7".into()),
            domain: "www.example.com".into(),
            at: Timestamp::from_millis(AT),
            method: "GET".into(),
            path: "/cart?id=3".into(),
            protocol: Some("HTTP/1.1".into()),
            status: 200,
            size: Some(5120),
            referer: None,
            user_agent: Some("Mozilla/5.0".into()),
            tls_version: None,
            duration: Duration::from_millis(42),
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("line1\r\nline2\t\"quoted\""), "line1 line2 \\\"quoted\\\"");
        assert_eq!(sanitize("  padded\n"), "padded");
        assert_eq!(sanitize("a\t\t\tb"), "a b");
        assert_eq!(sanitize("plain"), "plain");
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_clf_timestamp() {
        assert_eq!(clf_timestamp(Timestamp::from_millis(AT)), "[01/Mar/2024:12:34:56 +0000]");
        assert_eq!(clf_timestamp(Timestamp::from_millis(0)), "[01/Jan/1970:00:00:00 +0000]");
    }

    #[test]
    fn test_format() {
        assert_eq!(
            line().to_string(),
            "203.0.113.7 www.example.com - [01/Mar/2024:12:34:56 +0000] \"GET /cart?id=3 HTTP/1.1\" 200 5120 \"-\" \"Mozilla/5.0\" | - | 0.042 0.042 0.042\n"
        );
    }

    #[test]
    fn test_missing_fields_are_dashes() {
        let l = AccessLogLine {
            ip: None,
            protocol: None,
            size: None,
            user_agent: Some(String::new()),
            duration: Duration::from_micros(1_234_567),
            ..line()
        };
        let s = l.to_string();
        assert!(s.starts_with("- www.example.com - "));
        assert!(s.contains("\"GET /cart?id=3 -\" 200 - \"-\" \"-\""));
        assert!(s.ends_with("| 1.235 1.235 1.235\n"));
    }

    #[test]
    fn test_injected_newlines_stay_on_one_line() {
        let l = AccessLogLine {
            user_agent: Some("evil\r\n127.0.0.1 forged - \"GET /\"".into()),
            ..line()
        };
        let s = l.to_string();
        assert_eq!(s.matches('\n').count(), 1);
        assert!(s.contains("\"evil 127.0.0.1 forged - \\\"GET /\\\"\""));
    }
}
