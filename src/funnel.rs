//! Bounded concurrency gate.
//!
//! A [`Funnel`] limits how many operations submitted through it are running
//! at the same time. Submissions beyond the limit wait in a FIFO queue and
//! start, in order, as running operations complete. A funnel of size 1 is a
//! critical section.
//!
//! Closing a funnel discards everything still queued. Operations already
//! started keep running, but their results are dropped instead of delivered.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    panic::Location,
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    Callback, Coroutine, Result,
    adapter::Invoke,
    context,
    runner::{RunOptions, run_with},
};

static DEFAULT_SIZE: AtomicUsize = AtomicUsize::new(4);

/// Returns the limit used by funnels created with a `max` of `0`.
#[must_use]
pub fn default_size() -> usize {
    DEFAULT_SIZE.load(Ordering::Relaxed)
}

/// Sets the limit used by funnels created with a `max` of `0` from now on.
///
/// Funnels that already exist keep their limit. A size of `0` is treated
/// as `1`.
pub fn set_default_size(size: usize) {
    DEFAULT_SIZE.store(size.max(1), Ordering::Relaxed);
}

/// How many operations a [`Funnel`] lets through at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unbounded,
    Max(usize),
}

type Entry = Box<dyn FnOnce()>;

struct FunnelState {
    limit: Limit,
    queue: VecDeque<Entry>,
    active: usize,
    closed: bool,
    // Set while `drain` runs; nested drains leave the work to the outer loop.
    draining: bool,
}

/// A gate limiting the number of concurrently running operations.
///
/// Clones share the same queue and limit.
///
/// # Example
/// ```
/// use spindle::{Coroutine, Funnel, Result, run};
///
/// let gate = Funnel::new(1);
/// let work = Coroutine::new(|_co| async move { Ok("inside") });
/// let outer = Coroutine::new(move |co| async move { co.call(gate.run(work)).await });
/// run(outer, |result: Result<&str>| assert_eq!(result.unwrap(), "inside"));
/// ```
#[derive(Clone)]
pub struct Funnel {
    state: Rc<RefCell<FunnelState>>,
}

impl Funnel {
    /// Creates a funnel letting at most `max` operations through at once.
    ///
    /// A negative `max` does not limit anything; `0` uses
    /// [`default_size`].
    pub fn new(max: isize) -> Self {
        let limit = match usize::try_from(max) {
            Err(_) => Limit::Unbounded,
            Ok(0) => Limit::Max(default_size()),
            Ok(max) => Limit::Max(max),
        };
        Self::with_limit(limit)
    }

    /// Creates a funnel that never queues.
    pub fn unlimited() -> Self {
        Self::with_limit(Limit::Unbounded)
    }

    fn with_limit(limit: Limit) -> Self {
        Self {
            state: Rc::new(RefCell::new(FunnelState {
                limit,
                queue: VecDeque::new(),
                active: 0,
                closed: false,
                draining: false,
            })),
        }
    }

    #[must_use]
    pub fn limit(&self) -> Limit {
        self.state.borrow().limit
    }

    /// Number of operations started through this funnel and not yet
    /// completed.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.borrow().active
    }

    /// Number of operations waiting for their turn.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.state.borrow().queue.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    /// Returns a coroutine that passes `work` through the funnel and resumes
    /// with its result.
    #[track_caller]
    pub fn run<T: 'static>(&self, work: Coroutine<T>) -> Coroutine<T> {
        let funnel = self.clone();
        let location = Location::caller();
        Coroutine::build("funnel", location, true, move |co| async move {
            Invoke::new(
                &co,
                move |callback: Callback<T>| {
                    funnel.run_with(work, move |result| callback.call(result));
                },
                location,
            )
            .await
        })
    }

    /// Passes `work` through the funnel and reports its result to
    /// `callback`.
    ///
    /// `callback` is never called if the funnel is closed before `work`
    /// completes. `work` starts with the context that is current now, even
    /// if it has to wait for its turn.
    pub fn run_with<T: 'static>(
        &self,
        work: Coroutine<T>,
        callback: impl FnOnce(Result<T>) + 'static,
    ) {
        if self.is_closed() {
            tracing::debug!(frame = work.name(), "funnel is closed, dropping operation");
            return;
        }
        let funnel = self.clone();
        let options = RunOptions::new().inherit(context::current());
        let entry: Entry = Box::new(move || {
            run_with(work, options, move |result| funnel.complete(result, callback));
        });

        let mut state = self.state.borrow_mut();
        let limit = state.limit;
        match limit {
            Limit::Unbounded => {
                state.active += 1;
                drop(state);
                entry();
            }
            Limit::Max(_) => {
                state.queue.push_back(entry);
                drop(state);
                self.drain();
            }
        }
    }

    /// Closes the funnel.
    ///
    /// Queued operations are dropped without ever starting. Operations
    /// already running finish, but their callbacks are not called.
    pub fn close(&self) {
        let discarded = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            std::mem::take(&mut state.queue)
        };
        tracing::debug!(
            discarded = discarded.len(),
            active = self.active(),
            "funnel closed"
        );
        drop(discarded);
    }

    fn complete<T>(&self, result: Result<T>, callback: impl FnOnce(Result<T>)) {
        let closed = {
            let mut state = self.state.borrow_mut();
            state.active = state.active.saturating_sub(1);
            state.closed
        };
        if closed {
            tracing::trace!("funnel is closed, dropping result");
            return;
        }
        callback(result);
        self.drain();
    }

    // Starts queued operations while there is room for them.
    fn drain(&self) {
        {
            let mut state = self.state.borrow_mut();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        while let Some(entry) = self.admit() {
            entry();
        }
        self.state.borrow_mut().draining = false;
    }

    fn admit(&self) -> Option<Entry> {
        let mut state = self.state.borrow_mut();
        let room = match state.limit {
            Limit::Unbounded => true,
            Limit::Max(max) => state.active < max,
        };
        if state.closed || !room {
            return None;
        }
        let entry = state.queue.pop_front()?;
        state.active += 1;
        tracing::debug!(
            active = state.active,
            queued = state.queue.len(),
            "funnel admitted operation"
        );
        Some(entry)
    }
}

impl fmt::Debug for Funnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Funnel")
            .field("limit", &state.limit)
            .field("active", &state.active)
            .field("queued", &state.queue.len())
            .field("closed", &state.closed)
            .finish()
    }
}
