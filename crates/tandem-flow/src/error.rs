// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Flow error types.
//!
//! A task failure is carried as a `TaskError`; everything the engine itself
//! rejects is a `FlowError` variant. Both collect context segments as the
//! error crosses wait points and flow boundaries.

use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub type Result<T, E = FlowError> = std::result::Result<T, E>;

/// One frame of causal context attached to an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextSegment {
    /// The wait call that observed the failure.
    WaitSite {
        location: &'static Location<'static>,
    },
    /// A flow the error passed through, innermost first.
    FlowOrigin {
        flow: u64,
        location: &'static Location<'static>,
        label: Option<String>,
    },
}

impl fmt::Display for ContextSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextSegment::WaitSite { location } => write!(f, "observed at {}", location),
            ContextSegment::FlowOrigin {
                flow,
                location,
                label: Some(label),
            } => write!(f, "in flow #{} `{}` started at {}", flow, label, location),
            ContextSegment::FlowOrigin {
                flow,
                location,
                label: None,
            } => write!(f, "in flow #{} started at {}", flow, location),
        }
    }
}

/// Where a flow was created.
#[derive(Debug, Clone)]
pub struct Origin {
    pub location: &'static Location<'static>,
    pub label: Option<String>,
}

/// Whether an error has reached an error handler. Clones of one error
/// share the flag, so a failure re-raised further up is not reported again.
#[derive(Debug, Clone, Default)]
pub struct Delivery(Arc<AtomicBool>);

impl Delivery {
    /// True for the first caller only.
    pub(crate) fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_delivered(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A failed task.
#[derive(Debug, Clone)]
pub struct TaskError {
    key: String,
    message: String,
    original: Option<Value>,
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
    timed_out: bool,
    elapsed: Option<Duration>,
    context: Vec<ContextSegment>,
    context_attached: bool,
    delivery: Delivery,
}

impl TaskError {
    fn new(key: &str, message: String) -> Self {
        Self {
            key: key.to_string(),
            message,
            original: None,
            source: None,
            timed_out: false,
            elapsed: None,
            context: Vec::new(),
            context_attached: false,
            delivery: Delivery::default(),
        }
    }

    /// Normalize an error value handed to a completion.
    ///
    /// Strings become the message verbatim. Anything else is kept as the
    /// original value and rendered as JSON for the message.
    pub fn from_value(key: &str, value: Value) -> Self {
        let message = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut err = Self::new(key, message);
        err.original = Some(value);
        err
    }

    pub fn from_error<E>(key: &str, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let mut err = Self::new(key, source.to_string());
        err.source = Some(Arc::new(source));
        err
    }

    pub fn timeout(key: &str, elapsed: Duration) -> Self {
        let message = format!(
            "timeout exceeded for task `{}` after {}ms",
            key,
            elapsed.as_millis()
        );
        let mut err = Self::new(key, message);
        err.timed_out = true;
        err.elapsed = Some(elapsed);
        err
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The non-string error value the task failed with, if any.
    pub fn original(&self) -> Option<&Value> {
        self.original.as_ref()
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// How long the task ran before its timeout fired.
    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    pub fn context(&self) -> &[ContextSegment] {
        &self.context
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub(crate) fn push_wait_site(&mut self, location: &'static Location<'static>) {
        self.context.push(ContextSegment::WaitSite { location });
    }

    pub(crate) fn attach_lineage(&mut self, lineage: &[ContextSegment]) {
        if !self.context_attached {
            self.context.extend_from_slice(lineage);
            self.context_attached = true;
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for segment in &self.context {
            write!(f, "\n    {}", segment)?;
        }
        Ok(())
    }
}

impl StdError for TaskError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Errors produced by flows.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("completion for task `{key}` invoked more than once")]
    CallbackInvokedTwice { key: String },
    #[error("done_adding called without force_wait_until_done_adding")]
    NotForceWaiting,
    #[error("no task registered under key `{key}`")]
    UnknownKey { key: String },
    #[error("key is missing")]
    MissingKey,
    #[error("yield_value may only be called from a generator")]
    NotGenerator,
    #[error("generator is exhausted")]
    Exhausted,
    #[error("flow is closed")]
    Closed,
    #[error("{}", render(message, context))]
    Body {
        message: String,
        context: Vec<ContextSegment>,
        attached: bool,
        delivery: Delivery,
    },
    #[error("flow body panicked: {0}")]
    Panicked(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("failed to start flow: {0}")]
    Spawn(String),
}

impl FlowError {
    /// Wrap an error raised by the body of a flow.
    pub fn body<E: StdError>(err: E) -> Self {
        FlowError::Body {
            message: err.to_string(),
            context: Vec::new(),
            attached: false,
            delivery: Delivery::default(),
        }
    }

    /// Causal context collected so far. Empty for protocol errors.
    pub fn context(&self) -> &[ContextSegment] {
        match self {
            FlowError::Task(err) => err.context(),
            FlowError::Body { context, .. } => context,
            _ => &[],
        }
    }

    /// The underlying task failure, if this is one.
    pub fn task(&self) -> Option<&TaskError> {
        match self {
            FlowError::Task(err) => Some(err),
            _ => None,
        }
    }

    /// The delivery flag of a task or body failure. Protocol errors and
    /// panics have none; each flow reports them when its body ends.
    pub fn delivery(&self) -> Option<&Delivery> {
        match self {
            FlowError::Task(err) => Some(err.delivery()),
            FlowError::Body { delivery, .. } => Some(delivery),
            _ => None,
        }
    }

    pub(crate) fn attach_lineage(&mut self, lineage: &[ContextSegment]) {
        match self {
            FlowError::Task(err) => err.attach_lineage(lineage),
            FlowError::Body {
                context, attached, ..
            } if !*attached => {
                context.extend_from_slice(lineage);
                *attached = true;
            }
            _ => {}
        }
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

fn render(message: &str, context: &[ContextSegment]) -> String {
    let mut out = message.to_string();
    for segment in context {
        out.push_str("\n    ");
        out.push_str(&segment.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_values_become_the_message() {
        let err = TaskError::from_value("a", json!("disk full"));
        assert_eq!(err.message(), "disk full");
        assert_eq!(err.original(), Some(&json!("disk full")));
    }

    #[test]
    fn structured_values_are_rendered_as_json() {
        let err = TaskError::from_value("a", json!({ "code": 7 }));
        assert_eq!(err.message(), r#"{"code":7}"#);
        assert_eq!(err.original(), Some(&json!({ "code": 7 })));
    }

    #[test]
    fn rust_errors_keep_their_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "pipe broke");
        let err = TaskError::from_error("a", io);
        assert_eq!(err.message(), "pipe broke");
        assert!(err.source().is_some());
    }

    #[test]
    fn timeout_errors_are_flagged() {
        let err = TaskError::timeout("slow", Duration::from_millis(51));
        assert!(err.timed_out());
        assert_eq!(err.elapsed(), Some(Duration::from_millis(51)));
        assert!(err.message().contains("slow"));
        assert!(err.message().contains("51ms"));
    }

    #[test]
    fn lineage_is_attached_once() {
        let loc = Location::caller();
        let lineage = vec![ContextSegment::FlowOrigin {
            flow: 1,
            location: loc,
            label: Some("outer".into()),
        }];
        let mut err = FlowError::from(TaskError::from_value("a", json!("x")));
        err.attach_lineage(&lineage);
        err.attach_lineage(&lineage);
        assert_eq!(err.context().len(), 1);
        assert!(err.to_string().contains("`outer`"));
    }

    #[test]
    fn clones_share_the_delivery_flag() {
        let err = FlowError::from(TaskError::from_value("a", json!("x")));
        let copy = err.clone();
        assert!(err.delivery().map_or(false, Delivery::claim));
        assert!(copy.delivery().map_or(false, Delivery::is_delivered));
        assert!(!copy.delivery().map_or(true, Delivery::claim));

        let other = FlowError::from(TaskError::from_value("a", json!("x")));
        assert!(!other.delivery().map_or(true, Delivery::is_delivered));
        assert!(FlowError::Closed.delivery().is_none());
    }

    #[test]
    fn body_errors_render_context() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "bad input");
        let mut err = FlowError::body(io);
        err.attach_lineage(&[ContextSegment::FlowOrigin {
            flow: 9,
            location: Location::caller(),
            label: None,
        }]);
        let text = err.to_string();
        assert!(text.starts_with("bad input"));
        assert!(text.contains("flow #9"));
    }
}
