//! Error type shared by every coroutine, funnel and join handle.
//!
//! An [`Error`] is an [`ErrorKind`] plus the logical call chain the runners
//! recorded while the error travelled up through suspended frames. The chain
//! is appended by the runner, never by user code, and is immutable once a
//! segment has been recorded. See [`crate::stack`] for how it is rendered.

use std::{backtrace::Backtrace, fmt, sync::Arc};

use crate::stack::{CausalStack, Segment};

/// A specialized `Result` whose error defaults to [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The condition an [`Error`] reports.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    /// A coroutine body suspended on something the runner cannot resume.
    ///
    /// This happens when a body awaits a future that is not one of the
    /// [`Co`](crate::Co) suspension points, or leaves more than one suspension
    /// request outstanding at the same time.
    #[error("invalid value was yielded: {0}")]
    InvalidYield(String),

    /// A callback-style wrapper produced by [`unstar`](crate::unstar) was
    /// invoked from inside a coroutine.
    #[error("cannot invoke unstarred function `{0}`: call its coroutine form instead")]
    Unstarred(&'static str),

    /// A frame produced a value of a different type than its caller expected.
    #[error("result type mismatch: expected `{expected}`")]
    TypeMismatch { expected: &'static str },

    /// The task behind a join handle was dropped before it completed.
    #[error("task was dropped before it completed")]
    Abandoned,

    #[error(transparent)]
    Io(Arc<std::io::Error>),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync>),
}

#[derive(Clone)]
struct Inner {
    kind: ErrorKind,
    segments: Vec<Segment>,
    backtrace: Arc<Backtrace>,
}

/// An error raised by an operation or by the scheduler itself.
///
/// Errors are cheap to clone so that a [`Spin`](crate::Spin) handle can
/// hand the identical error to every waiter.
#[derive(Clone)]
pub struct Error {
    inner: Box<Inner>,
}

impl Error {
    /// Creates an error of the given kind, capturing the native backtrace if
    /// backtraces are enabled for the process.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            inner: Box::new(Inner {
                kind,
                segments: Vec::new(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    /// Creates an error carrying only a message.
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Message(message.to_string()))
    }

    /// Wraps an arbitrary error.
    pub fn other(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Custom(Arc::new(error)))
    }

    pub(crate) fn invalid_yield(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidYield(reason.into()))
    }

    pub(crate) fn type_mismatch<T>() -> Self {
        Self::new(ErrorKind::TypeMismatch {
            expected: std::any::type_name::<T>(),
        })
    }

    /// Returns the condition this error reports.
    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.inner.kind
    }

    /// Returns the logical call chain recorded for this error, innermost
    /// frame first.
    #[must_use]
    pub fn causal_stack(&self) -> CausalStack<'_> {
        CausalStack::new(&self.inner.segments)
    }

    /// Renders the message, the logical call chain and the native backtrace.
    #[must_use]
    pub fn stack(&self) -> String {
        crate::stack::render(self, &self.inner.backtrace)
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.inner.segments
    }

    // Called by a runner when this error pops out of one of its frames.
    pub(crate) fn record(mut self, segment: Segment) -> Self {
        self.inner.segments.push(segment);
        self
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(error)))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            return f.write_str(&self.stack());
        }
        fmt::Display::fmt(&self.inner.kind, f)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.inner.kind)
            .field("causal_stack", &self.causal_stack())
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner.kind {
            ErrorKind::Io(error) => Some(error.as_ref()),
            ErrorKind::Custom(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}
