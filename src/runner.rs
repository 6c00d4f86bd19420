//! Drives a stack of nested coroutines to completion.
//!
//! A runner owns an explicit stack of frames and a drive loop that polls the
//! top frame once per iteration. The [`Step`] the frame reports decides what
//! happens next:
//!
//! - `Suspend`: an operation is in flight. The loop stops and control returns
//!   to whoever called into the runner. The operation's callback re-enters the
//!   loop later.
//! - `Ready`: the operation called back synchronously. The outcome is fed
//!   into the same frame on the next iteration, so synchronous completions
//!   loop instead of recursing.
//! - `Continue`: a nested call. The callee is pushed and started.
//! - `Join`: a fan-out. An internal frame that waits for every branch is pushed.
//! - `Done` / `Failed`: the frame is popped and its outcome is fed into the
//!   caller, or delivered to the runner's completion callback when the stack
//!   is empty. Errors get the current logical stack recorded on the way out.
//! - `Invalid`: the frame broke the suspension protocol and fails with
//!   [`ErrorKind::InvalidYield`](crate::ErrorKind::InvalidYield).
//!
//! Nested calls never grow the native stack, no matter how deep they go.

use std::{
    cell::{Cell, RefCell},
    panic::Location,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    task::{Context, Poll},
};

use futures::task::noop_waker_ref;

use crate::{
    Callback, Coroutine, Error, Result,
    adapter::Invoke,
    context::{self, ContextCell, Enter, Shared},
    coroutine::{Frame, Outcome, Step, Value, downcast},
    stack::Segment,
};

static NEXT_RUNNER: AtomicU64 = AtomicU64::new(1);

type Interrupt = Rc<dyn Fn() -> bool>;
type Done = Box<dyn FnOnce(Outcome)>;

// Where a new runner's context comes from.
#[derive(Clone, Default)]
enum Seed {
    #[default]
    Current,
    Value(Option<Shared>),
}

/// Options for [`run_with`] and [`spin_with`](crate::spin_with).
#[derive(Clone, Default)]
pub struct RunOptions {
    interrupt: Option<Interrupt>,
    seed: Seed,
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a predicate checked before every frame the drive loop steps.
    ///
    /// Once it returns `true`, the runner drops its stack and never calls
    /// back. Operations already in flight still complete, but their results
    /// are discarded. A coroutine whose outermost frame has already returned
    /// still delivers its result.
    #[must_use]
    pub fn interrupt(mut self, interrupt: impl Fn() -> bool + 'static) -> Self {
        self.interrupt = Some(Rc::new(interrupt));
        self
    }

    /// Starts the runner with `value` as its context instead of inheriting
    /// the context of the coroutine that is currently running.
    #[must_use]
    pub fn context<T: 'static>(mut self, value: T) -> Self {
        self.seed = Seed::Value(Some(Rc::new(value)));
        self
    }

    pub(crate) fn inherit(mut self, value: Option<Shared>) -> Self {
        self.seed = Seed::Value(value);
        self
    }
}

/// Runs a coroutine and reports its result to `callback`.
///
/// The coroutine starts immediately. If it never suspends on an asynchronous
/// operation, `callback` is called before `run` returns.
pub fn run<T: 'static>(coroutine: Coroutine<T>, callback: impl FnOnce(Result<T>) + 'static) {
    run_with(coroutine, RunOptions::default(), callback);
}

/// Same as [`run`], with options.
pub fn run_with<T: 'static>(
    coroutine: Coroutine<T>,
    options: RunOptions,
    callback: impl FnOnce(Result<T>) + 'static,
) {
    let done: Done = Box::new(move |outcome: Outcome| callback(outcome.and_then(downcast::<T>)));
    Runner::start(coroutine.into_frame(), options, done);
}

/// Continuation of one suspended frame.
///
/// Calling it feeds an outcome back into the runner that owns the frame.
#[derive(Clone)]
pub(crate) struct Resume {
    runner: Rc<Runner>,
    frame: u64,
}

impl Resume {
    pub(crate) fn resume(self, outcome: Outcome) {
        self.runner.resume(self.frame, outcome);
    }

    pub(crate) fn context(&self) -> ContextCell {
        Rc::clone(&self.runner.context)
    }
}

struct State {
    stack: Vec<Frame>,
    driving: bool,
    // A resumption that arrived while the loop was running.
    queued: Option<(u64, Outcome)>,
}

pub(crate) struct Runner {
    id: u64,
    state: RefCell<State>,
    done: Cell<Option<Done>>,
    interrupt: Option<Interrupt>,
    context: ContextCell,
}

// Marks the runner as driving until dropped.
struct Driving<'a> {
    runner: &'a Runner,
}

impl<'a> Driving<'a> {
    fn enter(runner: &'a Runner) -> Self {
        runner.state.borrow_mut().driving = true;
        Self { runner }
    }
}

impl Drop for Driving<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.runner.state.try_borrow_mut() {
            state.driving = false;
        }
    }
}

impl Runner {
    pub(crate) fn start(frame: Frame, options: RunOptions, done: Done) {
        let context = match options.seed {
            Seed::Current => context::current(),
            Seed::Value(value) => value,
        };
        let runner = Rc::new(Runner {
            id: NEXT_RUNNER.fetch_add(1, Ordering::Relaxed),
            state: RefCell::new(State {
                stack: Vec::with_capacity(8),
                driving: false,
                queued: None,
            }),
            done: Cell::new(Some(done)),
            interrupt: options.interrupt,
            context: Rc::new(RefCell::new(context)),
        });
        tracing::trace!(runner = runner.id, frame = %frame.info(), "enter");
        runner.state.borrow_mut().stack.push(frame);
        runner.drive(None);
    }

    fn resume(self: &Rc<Self>, frame: u64, outcome: Outcome) {
        {
            let mut state = self.state.borrow_mut();
            if state.driving {
                if state.queued.is_some() {
                    tracing::warn!(runner = self.id, "dropping resumption: another one is already queued");
                } else {
                    state.queued = Some((frame, outcome));
                }
                return;
            }
            if state.stack.last().map(Frame::id) != Some(frame) {
                tracing::warn!(
                    runner = self.id,
                    frame,
                    "dropping resumption of a frame that is not suspended"
                );
                return;
            }
        }
        self.drive(Some(outcome));
    }

    fn drive(self: &Rc<Self>, mut input: Option<Outcome>) {
        let _driving = Driving::enter(self);
        loop {
            let top = self.state.borrow_mut().stack.pop();
            let Some(mut frame) = top else {
                // The stack is exhausted: `input` holds the outcome of the
                // outermost frame.
                if let Some(outcome) = input {
                    self.finish(outcome);
                }
                return;
            };
            if self.interrupted() {
                drop(frame);
                self.abandon();
                return;
            }

            match self.step(&mut frame, input.take()) {
                Step::Suspend => {
                    let id = frame.id();
                    tracing::trace!(runner = self.id, frame = %frame.info(), "yield");
                    let queued = {
                        let mut state = self.state.borrow_mut();
                        state.stack.push(frame);
                        state.queued.take()
                    };
                    match queued {
                        Some((target, outcome)) if target == id => input = Some(outcome),
                        Some((target, _)) => {
                            tracing::warn!(
                                runner = self.id,
                                frame = target,
                                "dropping resumption of a frame that is not suspended"
                            );
                            return;
                        }
                        None => return,
                    }
                }
                Step::Ready(outcome) => {
                    self.state.borrow_mut().stack.push(frame);
                    input = Some(outcome);
                }
                Step::Continue(callee) => {
                    tracing::trace!(runner = self.id, frame = %callee.info(), "enter");
                    let mut state = self.state.borrow_mut();
                    state.stack.push(frame);
                    state.stack.push(callee);
                }
                Step::Join(branches) => {
                    let mut state = self.state.borrow_mut();
                    state.stack.push(frame);
                    state.stack.push(fan_out(branches));
                }
                Step::Done(value) => {
                    tracing::trace!(runner = self.id, frame = %frame.info(), "exit");
                    input = Some(Ok(value));
                }
                Step::Failed(error) => {
                    tracing::trace!(runner = self.id, frame = %frame.info(), error = %error, "exit");
                    input = Some(Err(self.record(error, &frame)));
                }
                Step::Invalid(reason) => {
                    tracing::warn!(runner = self.id, frame = %frame.info(), reason = %reason, "invalid yield");
                    input = Some(Err(self.record(Error::invalid_yield(reason), &frame)));
                }
            }
        }
    }

    // Polls `frame` once with this runner installed as its continuation.
    fn step(self: &Rc<Self>, frame: &mut Frame, input: Option<Outcome>) -> Step {
        if input.is_some() {
            tracing::trace!(runner = self.id, frame = %frame.info(), "resume");
        }
        frame.slot.feed(input);
        let poll = {
            let _resume = frame.slot.install(Resume {
                runner: Rc::clone(self),
                frame: frame.id(),
            });
            let _context = Enter::new(&self.context);
            let mut cx = Context::from_waker(noop_waker_ref());
            frame.body.as_mut().poll(&mut cx)
        };
        match poll {
            Poll::Ready(Ok(value)) => Step::Done(value),
            Poll::Ready(Err(error)) => Step::Failed(error),
            Poll::Pending => {
                let mut steps = frame.slot.take_steps();
                match steps.pop() {
                    Some(step) if steps.is_empty() => step,
                    Some(_) => Step::Invalid(format!(
                        "{} suspension points were awaited at once",
                        steps.len() + 1
                    )),
                    None => Step::Invalid(
                        "coroutine awaited a future that is not a suspension point".to_string(),
                    ),
                }
            }
        }
    }

    // Attaches the logical stack to an error leaving `failed`, unless this
    // runner already recorded one for it.
    fn record(&self, error: Error, failed: &Frame) -> Error {
        if error
            .segments()
            .last()
            .is_some_and(|segment| segment.runner() == self.id)
        {
            return error;
        }
        let state = self.state.borrow();
        let frames = std::iter::once(failed)
            .chain(state.stack.iter().rev())
            .filter(|frame| !frame.is_internal())
            .map(Frame::info)
            .collect();
        error.record(Segment::new(self.id, frames))
    }

    fn interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(|interrupt| interrupt())
    }

    fn abandon(&self) {
        let frames = std::mem::take(&mut self.state.borrow_mut().stack);
        tracing::debug!(runner = self.id, frames = frames.len(), "interrupted");
        self.done.take();
        drop(frames);
    }

    fn finish(&self, outcome: Outcome) {
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

// Positional results of a fan-out. The first position holding an error
// decides the outcome; later positions are never looked at once it fails.
struct FanOut {
    outcomes: Vec<Option<Outcome>>,
    next: usize,
    callback: Option<Callback<Vec<Value>>>,
}

impl FanOut {
    fn start(branches: Vec<Frame>, callback: Callback<Vec<Value>>) {
        if branches.is_empty() {
            return callback.ok(Vec::new());
        }
        let fan = Rc::new(RefCell::new(FanOut {
            outcomes: branches.iter().map(|_| None).collect(),
            next: 0,
            callback: Some(callback),
        }));
        for (index, branch) in branches.into_iter().enumerate() {
            let fan = Rc::clone(&fan);
            let done: Done = Box::new(move |outcome| {
                let settled = fan.borrow_mut().settle(index, outcome);
                if let Some((callback, result)) = settled {
                    callback.call(result);
                }
            });
            Runner::start(branch, RunOptions::default(), done);
        }
    }

    fn settle(
        &mut self,
        index: usize,
        outcome: Outcome,
    ) -> Option<(Callback<Vec<Value>>, Result<Vec<Value>>)> {
        self.callback.as_ref()?;
        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = Some(outcome);
        }
        while let Some(Some(outcome)) = self.outcomes.get(self.next) {
            if let Err(error) = outcome {
                let error = error.clone();
                self.outcomes.clear();
                return self.callback.take().map(|callback| (callback, Err(error)));
            }
            self.next += 1;
        }
        if self.next < self.outcomes.len() {
            return None;
        }
        let values = self
            .outcomes
            .drain(..)
            .filter_map(|outcome| outcome.and_then(Result::ok))
            .collect();
        self.callback.take().map(|callback| (callback, Ok(values)))
    }
}

// Internal frame that waits for every branch of a fan-out.
fn fan_out(branches: Vec<Frame>) -> Frame {
    let location = Location::caller();
    Coroutine::<Vec<Value>>::build("join", location, true, move |co| async move {
        Invoke::new(
            &co,
            move |callback: Callback<Vec<Value>>| FanOut::start(branches, callback),
            location,
        )
        .await
    })
    .into_frame()
}
