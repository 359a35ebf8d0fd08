//! Handler outcomes
//!
//! Instrumented handlers report success or failure explicitly instead of
//! relying on exception hooks. A failure carries everything the error
//! capture step persists: the error's type name, its message, and a textual
//! backtrace taken at capture time.

use axum::response::Response;
use std::backtrace::Backtrace;
use std::fmt;

/// What an instrumented handler produced
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Normal completion, including application-level error statuses (4xx/5xx)
    Completed(Response),
    /// The handler failed; the pipeline records a trace and answers 500
    Failed(CapturedFailure),
}

impl HandlerOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

impl From<Response> for HandlerOutcome {
    fn from(response: Response) -> Self {
        Self::Completed(response)
    }
}

/// A failure captured at the handler boundary
#[derive(Debug, Clone)]
pub struct CapturedFailure {
    /// Error type name, last path segment only
    pub exception_class: String,
    /// The error's own message
    pub exception_args: String,
    /// Error chain followed by a stack backtrace
    pub traceback: String,
}

impl CapturedFailure {
    /// Capture a typed error. Prefer the `?` conversion in handler code; this
    /// exists for call sites that only hold a reference.
    pub fn of<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        Self {
            exception_class: short_type_name(std::any::type_name::<E>()),
            exception_args: error.to_string(),
            traceback: render_traceback(&error.to_string(), error.source()),
        }
    }

    /// Capture an `anyhow::Error`. The concrete type is erased, so the class
    /// falls back to the root cause's message-level name.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        let mut chain = error.chain();
        let top = chain
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| error.to_string());

        let mut traceback = top.clone();
        for cause in chain {
            traceback.push_str(&format!("\nCaused by: {}", cause));
        }
        traceback.push_str(&format!(
            "\n\nStack backtrace:\n{}",
            Backtrace::force_capture()
        ));

        Self {
            exception_class: "Error".to_string(),
            exception_args: top,
            traceback,
        }
    }

    /// Build a failure from already-known parts (tests, replayed traces)
    pub fn from_parts(
        exception_class: impl Into<String>,
        exception_args: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        Self {
            exception_class: exception_class.into(),
            exception_args: exception_args.into(),
            traceback: traceback.into(),
        }
    }
}

impl fmt::Display for CapturedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_class, self.exception_args)
    }
}

// Same trick as anyhow: a blanket conversion so handler code can use `?`.
// CapturedFailure itself must not implement std::error::Error for this to
// stay coherent.
impl<E> From<E> for CapturedFailure
where
    E: std::error::Error,
{
    fn from(error: E) -> Self {
        Self {
            exception_class: short_type_name(std::any::type_name::<E>()),
            exception_args: error.to_string(),
            traceback: render_traceback(&error.to_string(), error.source()),
        }
    }
}

fn short_type_name(full: &str) -> String {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .to_string()
}

fn render_traceback(message: &str, mut source: Option<&(dyn std::error::Error + 'static)>) -> String {
    let mut out = message.to_string();
    while let Some(cause) = source {
        out.push_str(&format!("\nCaused by: {}", cause));
        source = cause.source();
    }
    out.push_str(&format!(
        "\n\nStack backtrace:\n{}",
        Backtrace::force_capture()
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct BrokenBallot {
        detail: String,
    }

    impl fmt::Display for BrokenBallot {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "ballot rejected: {}", self.detail)
        }
    }

    impl std::error::Error for BrokenBallot {}

    #[test]
    fn test_capture_typed_error() {
        let err = BrokenBallot {
            detail: "stale".to_string(),
        };

        let failure = CapturedFailure::of(&err);
        assert_eq!(failure.exception_class, "BrokenBallot");
        assert_eq!(failure.exception_args, "ballot rejected: stale");
        assert!(failure.traceback.contains("ballot rejected: stale"));
        assert!(failure.traceback.contains("Stack backtrace:"));
    }

    #[test]
    fn test_question_mark_conversion() {
        fn failing() -> Result<(), CapturedFailure> {
            Err(BrokenBallot {
                detail: "torn".to_string(),
            })?;
            Ok(())
        }

        let failure = failing().unwrap_err();
        assert_eq!(failure.exception_class, "BrokenBallot");
    }

    #[test]
    fn test_from_anyhow_keeps_cause_chain() {
        let root = BrokenBallot {
            detail: "smudged".to_string(),
        };
        let err = anyhow::Error::new(root).context("counting failed");

        let failure = CapturedFailure::from_anyhow(&err);
        assert_eq!(failure.exception_args, "counting failed");
        assert!(failure.traceback.contains("Caused by: ballot rejected: smudged"));
    }

    #[test]
    fn test_short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name("demo::polls::BrokenBallot"), "BrokenBallot");
        assert_eq!(
            short_type_name("demo::Wrapper<alloc::string::String>"),
            "Wrapper"
        );
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_display_matches_notification_error_line() {
        let failure = CapturedFailure::from_parts("ValueError", "bad input", "trace");
        assert_eq!(failure.to_string(), "ValueError: bad input");
    }
}
