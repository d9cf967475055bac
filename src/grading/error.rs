//! Error taxonomy for one batch grading call.

use crate::gateway::error::{excerpt, ProviderError};

/// How much of a reply is quoted back in parse failures.
pub const REPLY_EXCERPT_CHARS: usize = 800;

/// Every variant is terminal for the batch that raised it.
#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    /// Empty batch or a structurally invalid task; raised before any call.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Transport, auth or non-success response from the completion service.
    #[error("completion call failed: {source}{}", format_diagnostics(.source))]
    ApiCallFailed {
        #[source]
        source: ProviderError,
    },

    /// The response envelope lacked the expected text payload.
    #[error("unexpected reply shape: {message}{}", format_excerpt(.body_excerpt.as_deref()))]
    UnexpectedReplyShape {
        message: String,
        body_excerpt: Option<String>,
    },

    /// The reply contained no well-formed record at all.
    #[error("no well-formed records in reply ({rejected} malformed); reply was: {excerpt}")]
    NoRecordsParsed { rejected: usize, excerpt: String },

    /// Some but not all tasks came back.
    #[error("expected {expected} records, parsed {parsed}; reply was: {excerpt}")]
    ResultCountMismatch {
        expected: usize,
        parsed: usize,
        excerpt: String,
    },

    /// Right number of records, but their task numbers are not 1..=expected.
    #[error("record task numbers {found:?} do not cover tasks 1..={expected}; reply was: {excerpt}")]
    TaskNumberingInconsistent {
        expected: usize,
        found: Vec<u32>,
        excerpt: String,
    },
}

impl GradingError {
    pub(crate) fn no_records(rejected: usize, reply: &str) -> Self {
        Self::NoRecordsParsed {
            rejected,
            excerpt: excerpt(reply, REPLY_EXCERPT_CHARS),
        }
    }

    pub(crate) fn count_mismatch(expected: usize, parsed: usize, reply: &str) -> Self {
        Self::ResultCountMismatch {
            expected,
            parsed,
            excerpt: excerpt(reply, REPLY_EXCERPT_CHARS),
        }
    }

    pub(crate) fn numbering(expected: usize, found: Vec<u32>, reply: &str) -> Self {
        Self::TaskNumberingInconsistent {
            expected,
            found,
            excerpt: excerpt(reply, REPLY_EXCERPT_CHARS),
        }
    }

    /// Short error code for logs and traces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTask(_) => "invalid_task",
            Self::ApiCallFailed { .. } => "api_call_failed",
            Self::UnexpectedReplyShape { .. } => "unexpected_reply_shape",
            Self::NoRecordsParsed { .. } => "no_records_parsed",
            Self::ResultCountMismatch { .. } => "result_count_mismatch",
            Self::TaskNumberingInconsistent { .. } => "task_numbering_inconsistent",
        }
    }
}

impl From<ProviderError> for GradingError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::MalformedEnvelope {
                provider,
                message,
                context,
            } => Self::UnexpectedReplyShape {
                message: format!("{provider}: {message}"),
                body_excerpt: context.and_then(|c| c.body_excerpt),
            },
            other => Self::ApiCallFailed { source: other },
        }
    }
}

fn format_diagnostics(err: &ProviderError) -> String {
    let Some(ctx) = err.context() else {
        return String::new();
    };
    let mut parts = Vec::new();
    if let Some(status) = ctx.http_status {
        parts.push(format!("status={status}"));
    }
    if let Some(code) = &ctx.provider_code {
        parts.push(format!("code={code}"));
    }
    if let Some(id) = &ctx.request_id {
        parts.push(format!("request_id={id}"));
    }
    if let Some(body) = &ctx.body_excerpt {
        parts.push(format!("body={body}"));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_excerpt(body: Option<&str>) -> String {
    body.map(|b| format!("; body was: {b}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ErrorContext;

    #[test]
    fn malformed_envelope_maps_to_unexpected_shape() {
        let err: GradingError = ProviderError::malformed(
            "openai",
            "No choices in response",
            ErrorContext::new().with_body("{\"choices\":[]}"),
        )
        .into();
        assert_eq!(err.code(), "unexpected_reply_shape");
        assert!(err.to_string().contains("{\"choices\":[]}"));
    }

    #[test]
    fn api_failure_message_carries_status_and_body() {
        let ctx = ErrorContext::new()
            .with_status(401)
            .with_request_id("req-1")
            .with_body("invalid api key");
        let err: GradingError =
            ProviderError::provider_with_context("openai", "HTTP 401: invalid api key", false, ctx)
                .into();
        assert_eq!(err.code(), "api_call_failed");
        let msg = err.to_string();
        assert!(msg.contains("HTTP 401"));
        assert!(msg.contains("status=401"));
        assert!(msg.contains("request_id=req-1"));
    }

    #[test]
    fn parse_failures_quote_a_bounded_excerpt() {
        let reply = "x".repeat(REPLY_EXCERPT_CHARS * 2);
        match GradingError::no_records(0, &reply) {
            GradingError::NoRecordsParsed { excerpt, .. } => {
                assert_eq!(excerpt.len(), REPLY_EXCERPT_CHARS + 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
