//! Uniform failure values for the invocation pipeline.
//!
//! Every terminal outcome of an invocation is a value: success carries the
//! parsed response, failure carries an [`Anomaly`]. Anomalies are never
//! panicked or silently swallowed; they travel through the pipeline like any
//! other value and are classified into a closed set of categories.

use std::sync::Arc;

use thiserror::Error;

/// Maximum characters of response body carried in anomaly diagnostics.
pub(crate) const MAX_BODY_CHARS: usize = 200;

/// Terminal outcome of an invocation: a parsed value or an anomaly.
pub type Outcome = Result<serde_json::Value, Anomaly>;

/// Closed set of failure categories.
///
/// The category determines retry behaviour: `Busy`, `Interrupted` and
/// `Unavailable` are retriable by the default predicate, everything else is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// The service is throttling or otherwise overloaded.
    Busy,
    /// The exchange was cut short (timeout, reset mid-flight).
    Interrupted,
    /// The service could not be reached or answered 5xx transiently.
    Unavailable,
    /// Caller error: validation failure, missing member, malformed input.
    Incorrect,
    /// Authentication or authorization failure.
    Forbidden,
    /// The addressed resource does not exist.
    NotFound,
    /// The request conflicts with current resource state.
    Conflict,
    /// The operation is not supported by the service.
    Unsupported,
    /// Internal or unclassified server fault.
    Fault,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Busy => "busy",
            Category::Interrupted => "interrupted",
            Category::Unavailable => "unavailable",
            Category::Incorrect => "incorrect",
            Category::Forbidden => "forbidden",
            Category::NotFound => "not-found",
            Category::Conflict => "conflict",
            Category::Unsupported => "unsupported",
            Category::Fault => "fault",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A uniform failure value.
///
/// Carries the category plus whatever diagnostics were available at the point
/// of failure: the AWS error code, the HTTP status, validation problems, and
/// the source error when an internal error was converted at the pipeline
/// boundary.
#[derive(Debug, Clone, Error)]
#[error("{category}: {}", message.as_deref().unwrap_or("(no message)"))]
pub struct Anomaly {
    pub category: Category,
    pub message: Option<String>,
    /// Service-declared error code (`Error.Code` / `__type`).
    pub code: Option<String>,
    /// HTTP status of the response this anomaly was derived from.
    pub status: Option<u16>,
    /// Validation diagnostics, one entry per problem.
    pub problems: Vec<String>,
    /// Source error converted at the pipeline boundary.
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Anomaly {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            message: None,
            code: None,
            status: None,
            problems: Vec::new(),
            source: None,
        }
    }

    pub fn of(category: Category, message: impl Into<String>) -> Self {
        Self::new(category).with_message(message)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_problems(mut self, problems: Vec<String>) -> Self {
        self.problems = problems;
        self
    }

    /// Converts an internal error into a `fault` anomaly, keeping the source
    /// attached for observability.
    pub fn fault_from<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let mut a = Self::of(Category::Fault, err.to_string());
        a.source = Some(Arc::new(err));
        a
    }

    pub fn incorrect(message: impl Into<String>) -> Self {
        Self::of(Category::Incorrect, message)
    }

    pub fn unsupported_operation() -> Self {
        Self::of(Category::Unsupported, "Operation not supported")
    }

    /// True for the categories the default retry predicate retries.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.category,
            Category::Busy | Category::Interrupted | Category::Unavailable
        )
    }
}

/// Default category for an HTTP status, before error-code overrides.
pub(crate) fn category_for_status(status: u16) -> Category {
    match status {
        429 => Category::Busy,
        401 | 403 => Category::Forbidden,
        404 | 410 => Category::NotFound,
        405 | 501 => Category::Unsupported,
        409 => Category::Conflict,
        400..=499 => Category::Incorrect,
        503 => Category::Busy,
        502 | 504 => Category::Unavailable,
        _ => Category::Fault,
    }
}

/// Maps an HTTP status plus service-declared error code to a category.
///
/// The code overrides the status table: throttling codes are `busy` whatever
/// the status, auth codes are `forbidden`, unknown-operation codes are
/// `unsupported`.
pub(crate) fn categorize(status: u16, code: Option<&str>) -> Category {
    if let Some(code) = code {
        if code.contains("Throttl") || code.contains("TooManyRequests") {
            return Category::Busy;
        }
        if code.contains("ServiceUnavailable") {
            return Category::Unavailable;
        }
        if code.contains("AccessDenied")
            || code.contains("UnauthorizedOperation")
            || code.contains("ExpiredToken")
            || code.contains("InvalidSignature")
            || code.contains("SignatureDoesNotMatch")
            || code.contains("MissingAuthenticationToken")
        {
            return Category::Forbidden;
        }
        if code.contains("UnknownOperation")
            || code.contains("InvalidAction")
            || code.contains("UnrecognizedClient")
        {
            return Category::Unsupported;
        }
    }
    category_for_status(status)
}

/// Truncates a string to at most `max_chars` characters on a valid UTF-8
/// boundary.
pub(crate) fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
