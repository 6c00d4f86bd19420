//! Logical call chains for errors that travel through suspended frames.
//!
//! By the time an error reaches the top-level callback, the native stack only
//! shows the completion callback that resumed the runner. The logical chain
//! recorded here instead lists the coroutine frames the error unwound through,
//! each with the place where that frame last suspended (or where it was
//! created, if it never suspended).

use std::{
    backtrace::{Backtrace, BacktraceStatus},
    fmt,
    panic::Location,
    sync::Arc,
};

use crate::Error;

/// Identity of one logical frame: its name and a source location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    name: &'static str,
    location: &'static Location<'static>,
}

impl FrameInfo {
    pub(crate) fn new(name: &'static str, location: &'static Location<'static>) -> Self {
        Self { name, location }
    }

    /// Best-effort function name of the frame.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn file(&self) -> &'static str {
        self.location.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.location.line()
    }

    #[must_use]
    pub fn column(&self) -> u32 {
        self.location.column()
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}:{})",
            self.name,
            self.file(),
            self.line(),
            self.column()
        )
    }
}

// The frames one runner had on its stack when an error first left one of
// them, innermost first.
#[derive(Clone, Debug)]
pub(crate) struct Segment {
    runner: u64,
    frames: Arc<[FrameInfo]>,
}

impl Segment {
    pub(crate) fn new(runner: u64, frames: Vec<FrameInfo>) -> Self {
        Self {
            runner,
            frames: frames.into(),
        }
    }

    pub(crate) fn runner(&self) -> u64 {
        self.runner
    }
}

/// Iterator over the logical frames recorded on an [`Error`], innermost
/// first.
///
/// When an error crosses from one runner to another (through
/// [`spin`](crate::spin()), a [`Funnel`](crate::Funnel) or a fan-out join),
/// the frames of the inner runner come before those of the outer one.
#[derive(Clone)]
pub struct CausalStack<'a> {
    segments: &'a [Segment],
    segment: usize,
    frame: usize,
}

impl<'a> CausalStack<'a> {
    pub(crate) fn new(segments: &'a [Segment]) -> Self {
        Self {
            segments,
            segment: 0,
            frame: 0,
        }
    }
}

impl<'a> Iterator for CausalStack<'a> {
    type Item = &'a FrameInfo;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(segment) = self.segments.get(self.segment) {
            if let Some(frame) = segment.frames.get(self.frame) {
                self.frame += 1;
                return Some(frame);
            }
            self.segment += 1;
            self.frame = 0;
        }
        None
    }
}

impl fmt::Debug for CausalStack<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.clone().map(ToString::to_string))
            .finish()
    }
}

pub(crate) fn render(error: &Error, backtrace: &Backtrace) -> String {
    let mut out = format!("Error: {}\n", error.kind());
    out.push_str("  <<< logical stack >>>\n");
    for frame in CausalStack::new(error.segments()) {
        out.push_str(&format!("  at {frame}\n"));
    }
    out.push_str("  <<< raw stack >>>\n");
    match backtrace.status() {
        BacktraceStatus::Captured => out.push_str(&backtrace.to_string()),
        BacktraceStatus::Disabled => {
            out.push_str("  UNAVAILABLE: backtrace capture disabled (set RUST_BACKTRACE=1)\n")
        }
        _ => out.push_str("  UNAVAILABLE: backtraces are not supported on this platform\n"),
    }
    out
}
