//! Coroutines and the suspension points available to their bodies.
//!
//! A [`Coroutine`] is a not-yet-started body written as an `async` block. The
//! body receives a [`Co`] handle and may only suspend through it:
//!
//! - [`Co::call`] runs a nested coroutine and resumes with its result,
//! - [`Co::join`] runs several coroutines in parallel and resumes with all
//!   of their results,
//! - [`Co::invoke`] starts a callback-style operation and resumes when it
//!   calls back,
//! - [`Co::wait`] joins a task started with [`spin`](crate::spin()).
//!
//! Every suspension point deposits a [`Step`] into the frame's slot and
//! returns `Pending`; the runner picks the step up and decides what to drive
//! next. Nothing here is ever woken through a `Waker`.

use std::{
    any::{Any, type_name},
    cell::{Cell, RefCell},
    marker::PhantomData,
    mem,
    panic::Location,
    pin::Pin,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    task::Poll,
};

use futures::FutureExt;

use crate::{Error, Result, runner::Resume, stack::FrameInfo};

pub(crate) type Value = Box<dyn Any>;
pub(crate) type Outcome = Result<Value>;

static NEXT_FRAME: AtomicU64 = AtomicU64::new(1);

/// What the top frame did during one step of the drive loop.
pub(crate) enum Step {
    /// An operation is in flight; the frame resumes from its callback.
    /// This is the pending token: it never carries a result.
    Suspend,
    /// The operation called back before it returned.
    Ready(Outcome),
    /// The frame called a nested coroutine.
    Continue(Frame),
    /// The frame fanned out into parallel coroutines.
    Join(Vec<Frame>),
    Done(Value),
    Failed(Error),
    /// The frame broke the suspension protocol.
    Invalid(String),
}

// The explicit context shared by a frame's body and the runner driving it.
pub(crate) struct Slot {
    id: u64,
    location: Cell<&'static Location<'static>>,
    steps: RefCell<Vec<Step>>,
    input: RefCell<Option<Outcome>>,
    resume: RefCell<Option<Resume>>,
}

impl Slot {
    fn new(location: &'static Location<'static>) -> Self {
        Self {
            id: NEXT_FRAME.fetch_add(1, Ordering::Relaxed),
            location: Cell::new(location),
            steps: RefCell::new(Vec::new()),
            input: RefCell::new(None),
            resume: RefCell::new(None),
        }
    }

    pub(crate) fn suspend(&self, location: &'static Location<'static>, step: Step) {
        self.location.set(location);
        self.steps.borrow_mut().push(step);
    }

    pub(crate) fn take_steps(&self) -> Vec<Step> {
        mem::take(&mut *self.steps.borrow_mut())
    }

    pub(crate) fn feed(&self, input: Option<Outcome>) {
        *self.input.borrow_mut() = input;
    }

    pub(crate) fn take_input(&self) -> Option<Outcome> {
        self.input.borrow_mut().take()
    }

    pub(crate) fn resume(&self) -> Option<Resume> {
        self.resume.borrow().clone()
    }

    /// Installs `resume` as the continuation of this frame until the guard
    /// drops, then restores whatever was there before.
    pub(crate) fn install(&self, resume: Resume) -> ResumeGuard<'_> {
        let previous = self.resume.replace(Some(resume));
        ResumeGuard {
            slot: self,
            previous,
        }
    }
}

pub(crate) struct ResumeGuard<'a> {
    slot: &'a Slot,
    previous: Option<Resume>,
}

impl Drop for ResumeGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut resume) = self.slot.resume.try_borrow_mut() {
            *resume = self.previous.take();
        }
    }
}

/// One coroutine as the runner sees it: a type-erased body plus its
/// diagnostic identity.
pub(crate) struct Frame {
    pub(crate) body: Pin<Box<dyn Future<Output = Outcome>>>,
    pub(crate) slot: Rc<Slot>,
    name: &'static str,
    internal: bool,
}

impl Frame {
    pub(crate) fn id(&self) -> u64 {
        self.slot.id
    }

    /// Frames created by the scheduler itself are left out of causal stacks.
    pub(crate) fn is_internal(&self) -> bool {
        self.internal
    }

    pub(crate) fn info(&self) -> FrameInfo {
        FrameInfo::new(self.name, self.slot.location.get())
    }
}

/// A suspendable computation producing a `T`.
///
/// Creating a coroutine does not run anything. It runs when a running
/// coroutine [`call`](Co::call)s it, when it is handed to
/// [`run`](crate::run) or [`spin`](crate::spin()), or when it enters a
/// [`Funnel`](crate::Funnel).
///
/// # Example
/// ```
/// use spindle::{Coroutine, Result, run};
///
/// fn greet(name: &'static str) -> Coroutine<String> {
///     Coroutine::new(move |_co| async move { Ok(format!("hello {name}")) })
/// }
///
/// fn main_flow() -> Coroutine<String> {
///     Coroutine::new(|co| async move {
///         let a = co.call(greet("a")).await?;
///         let b = co.call(greet("b")).await?;
///         Ok(a + ", " + &b)
///     })
/// }
///
/// run(main_flow(), |result: Result<String>| {
///     assert_eq!(result.unwrap(), "hello a, hello b");
/// });
/// ```
#[must_use = "coroutines do nothing unless they are called, joined, spun or run"]
pub struct Coroutine<T> {
    frame: Frame,
    _output: PhantomData<fn() -> T>,
}

impl<T: 'static> Coroutine<T> {
    /// Creates a coroutine from a body.
    ///
    /// The frame is named after the function that contains the body closure
    /// and located where `new` is called.
    #[track_caller]
    pub fn new<F, Fut>(body: F) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::build(short_name(type_name::<F>()), Location::caller(), false, body)
    }

    /// Creates a coroutine with an explicit frame name.
    #[track_caller]
    pub fn named<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        Self::build(name, Location::caller(), false, body)
    }

    pub(crate) fn build<F, Fut>(
        name: &'static str,
        location: &'static Location<'static>,
        internal: bool,
        body: F,
    ) -> Self
    where
        F: FnOnce(Co) -> Fut,
        Fut: Future<Output = Result<T>> + 'static,
    {
        let slot = Rc::new(Slot::new(location));
        let co = Co {
            slot: Rc::clone(&slot),
        };
        let body = body(co).map(|result| result.map(|value| Box::new(value) as Value));
        Self {
            frame: Frame {
                body: Box::pin(body),
                slot,
                name,
                internal,
            },
            _output: PhantomData,
        }
    }

    /// Name reported for this coroutine's frame in causal stacks.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.frame.name
    }

    pub(crate) fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Handle a coroutine body uses to suspend.
///
/// Each body gets its own `Co`; it is only meaningful inside that body.
#[derive(Clone)]
pub struct Co {
    pub(crate) slot: Rc<Slot>,
}

impl Co {
    /// Calls a nested coroutine and resumes with its result.
    ///
    /// An error from the callee is returned here, so it can be handled with
    /// ordinary `match` or propagated with `?`.
    #[track_caller]
    pub fn call<T: 'static>(&self, coroutine: Coroutine<T>) -> Suspend<T> {
        Suspend::new(self, Step::Continue(coroutine.into_frame()), downcast::<T>)
    }

    /// Runs every coroutine in parallel and resumes with their results in
    /// the order they were given.
    ///
    /// Results are collected position by position: if any coroutine fails,
    /// the error of the first position that fails is returned and no result
    /// is delivered.
    #[track_caller]
    pub fn join<T: 'static>(
        &self,
        coroutines: impl IntoIterator<Item = Coroutine<T>>,
    ) -> Suspend<Vec<T>> {
        let frames = coroutines.into_iter().map(Coroutine::into_frame).collect();
        Suspend::new(self, Step::Join(frames), downcast_all::<T>)
    }
}

/// Future returned by [`Co::call`] and [`Co::join`].
#[must_use = "futures do nothing unless polled or .awaited"]
pub struct Suspend<T> {
    slot: Rc<Slot>,
    request: Option<Step>,
    location: &'static Location<'static>,
    convert: fn(Value) -> Result<T>,
}

impl<T> Suspend<T> {
    #[track_caller]
    fn new(co: &Co, request: Step, convert: fn(Value) -> Result<T>) -> Self {
        Self {
            slot: Rc::clone(&co.slot),
            request: Some(request),
            location: Location::caller(),
            convert,
        }
    }
}

impl<T> Future for Suspend<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(request) = this.request.take() {
            this.slot.suspend(this.location, request);
            return Poll::Pending;
        }
        match this.slot.take_input() {
            Some(outcome) => Poll::Ready(outcome.and_then(this.convert)),
            None => Poll::Pending,
        }
    }
}

pub(crate) fn downcast<T: 'static>(value: Value) -> Result<T> {
    value
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| Error::type_mismatch::<T>())
}

fn downcast_all<T: 'static>(value: Value) -> Result<Vec<T>> {
    downcast::<Vec<Value>>(value)?
        .into_iter()
        .map(downcast::<T>)
        .collect()
}

// `type_name` of a body closure looks like `my_crate::module::function::{{closure}}`.
pub(crate) fn short_name(mut path: &'static str) -> &'static str {
    while let Some(outer) = path.strip_suffix("::{{closure}}") {
        path = outer;
    }
    path.rsplit("::").next().unwrap_or(path)
}
