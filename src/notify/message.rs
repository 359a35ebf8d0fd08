//! Notification message rendering

use crate::store::entities::TraceDetail;
use chrono::{DateTime, Utc};

/// Lines of traceback kept in the notification body
const TRACEBACK_TAIL_LINES: usize = 10;

/// Render the chat message for one captured error trace.
///
/// Layout: request identity and admin link first, then the failing URL and
/// exception, the tail of the traceback in a code fence, and finally the
/// logs captured during the request.
pub fn render_message(admin_base_url: &str, detail: &TraceDetail) -> String {
    let trace = &detail.trace;
    let request = &detail.request;
    let admin_link = format!(
        "{}/traces/{}",
        admin_base_url.trim_end_matches('/'),
        trace.request_id
    );

    let mut message = format!(
        "Oops! An error occurred.\n\
         Request ID: `{}`\n\
         Check it out on admin: {}\n\
         URL: `{} {}`\n\
         Error: `{}: {}`\n\
         ```{}```\n\
         Logs associated with this request:",
        trace.request_id,
        admin_link,
        request.method,
        request.path,
        trace.exception_class,
        trace.exception_args,
        traceback_tail(&trace.traceback),
    );

    for log in &detail.logs {
        message.push('\n');
        message.push_str(&format!(
            "`[{} {}] {}`",
            format_timestamp(log.timestamp),
            log.level,
            log.message
        ));
    }

    message
}

/// Last `TRACEBACK_TAIL_LINES` lines of the traceback. Full tracebacks are
/// kept in storage; the notification only needs the frames closest to the
/// failure.
fn traceback_tail(traceback: &str) -> String {
    let lines: Vec<&str> = traceback.lines().collect();
    let start = lines.len().saturating_sub(TRACEBACK_TAIL_LINES);
    lines[start..].join("\n")
}

fn format_timestamp(millis: u64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis as i64) {
        Some(datetime) => datetime.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{ApiRequest, ErrorTrace, RequestLogRecord};

    fn sample_detail(traceback: &str, logs: Vec<RequestLogRecord>) -> TraceDetail {
        TraceDetail {
            trace: ErrorTrace {
                request_id: "req-1".to_string(),
                payload: None,
                exception_class: "ValueError".to_string(),
                exception_args: "boom".to_string(),
                traceback: traceback.to_string(),
                created_at: 1_700_000_000_000,
                dismissed_at: None,
                dismissed_by: None,
            },
            request: ApiRequest {
                id: "req-1".to_string(),
                headers: None,
                query_parameters: None,
                query_string: None,
                handler: "polls.api.poll_detail".to_string(),
                method: "GET".to_string(),
                path: "/polls/7/".to_string(),
                user_id: None,
                requested_at: 1_700_000_000_000,
            },
            logs,
        }
    }

    fn log_record(timestamp: u64, level: &str, message: &str) -> RequestLogRecord {
        RequestLogRecord {
            trace_id: "req-1".to_string(),
            level: level.to_string(),
            file_path: "api.rs:10".to_string(),
            func_name: "poll_detail".to_string(),
            timestamp,
            message: message.to_string(),
        }
    }

    #[test]
    fn test_message_carries_request_identity_and_admin_link() {
        let detail = sample_detail("Traceback", vec![]);
        let message = render_message("http://localhost:8080/apm", &detail);

        assert!(message.starts_with("Oops! An error occurred."));
        assert!(message.contains("Request ID: `req-1`"));
        assert!(message.contains("Check it out on admin: http://localhost:8080/apm/traces/req-1"));
        assert!(message.contains("URL: `GET /polls/7/`"));
        assert!(message.contains("Error: `ValueError: boom`"));
        assert!(message.contains("```Traceback```"));
    }

    #[test]
    fn test_trailing_slash_on_admin_base_is_normalized() {
        let detail = sample_detail("tb", vec![]);
        let message = render_message("http://apm.internal/", &detail);
        assert!(message.contains("Check it out on admin: http://apm.internal/traces/req-1"));
    }

    #[test]
    fn test_traceback_keeps_only_the_last_ten_lines() {
        let traceback: Vec<String> = (1..=15).map(|n| format!("frame-{n}")).collect();
        let detail = sample_detail(&traceback.join("\n"), vec![]);
        let message = render_message("http://a", &detail);

        assert!(!message.contains("frame-5\n"));
        assert!(message.contains("frame-6"));
        assert!(message.contains("frame-15"));
    }

    #[test]
    fn test_short_traceback_is_kept_whole() {
        let detail = sample_detail("one\ntwo", vec![]);
        let message = render_message("http://a", &detail);
        assert!(message.contains("```one\ntwo```"));
    }

    #[test]
    fn test_log_lines_render_with_timestamp_and_level() {
        // 1_700_000_000_000 ms == 2023-11-14 22:13:20 UTC
        let logs = vec![
            log_record(1_700_000_000_000, "INFO", "fetching poll"),
            log_record(1_700_000_001_000, "ERROR", "poll missing"),
        ];
        let detail = sample_detail("tb", logs);
        let message = render_message("http://a", &detail);

        assert!(message.contains("Logs associated with this request:"));
        assert!(message.contains("`[2023-11-14 22:13:20 INFO] fetching poll`"));
        assert!(message.contains("`[2023-11-14 22:13:21 ERROR] poll missing`"));

        // Captured order is preserved
        let info_at = message.find("fetching poll").unwrap();
        let error_at = message.find("poll missing").unwrap();
        assert!(info_at < error_at);
    }
}
