//! Detached tasks and their join handles.
//!
//! [`spin`] starts driving a coroutine right away and hands back a [`Spin`]
//! handle. The caller keeps going and joins the handle later, which is how
//! independent operations overlap: start several, then wait on each.
//!
//! A handle remembers the task's result, so joining it any number of times,
//! before or after the task finished, yields the same result. Waiters are
//! resumed in the order they joined, including waiters that join from inside
//! another waiter while the result is being handed out.

use std::{cell::RefCell, collections::VecDeque, rc::Rc};

use futures::channel::oneshot;
use pin_project_lite::pin_project;

use crate::{
    Callback, Co, Coroutine, ErrorKind, Result,
    adapter::Invoke,
    runner::{RunOptions, run_with},
};

struct SpinState<T> {
    outcome: Option<Result<T>>,
    waiters: VecDeque<Callback<T>>,
    // Set while the waiters queued at completion are being resumed.
    completing: bool,
}

/// Join handle of a task started with [`spin`].
///
/// Join it from a coroutine with [`Co::wait`], from callback-style code with
/// [`Spin::subscribe`], or from any async executor by awaiting it.
pub struct Spin<T> {
    state: Rc<RefCell<SpinState<T>>>,
}

impl<T> Clone for Spin<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

/// Starts running a coroutine independently of the caller.
///
/// The coroutine runs until its first asynchronous suspension before `spin`
/// returns. Its result is kept in the returned handle.
///
/// # Example
/// ```
/// use spindle::{Coroutine, Result, run, spin};
///
/// fn add(a: u32, b: u32) -> Coroutine<u32> {
///     Coroutine::new(move |_co| async move { Ok(a + b) })
/// }
///
/// let both = Coroutine::new(|co| async move {
///     let first = spin(add(1, 2));
///     let second = spin(add(3, 4));
///     Ok(co.wait(&first).await? + co.wait(&second).await?)
/// });
/// run(both, |result: Result<u32>| assert_eq!(result.unwrap(), 10));
/// ```
pub fn spin<T: Clone + 'static>(coroutine: Coroutine<T>) -> Spin<T> {
    spin_with(coroutine, RunOptions::default())
}

/// Same as [`spin`], with options.
pub fn spin_with<T: Clone + 'static>(coroutine: Coroutine<T>, options: RunOptions) -> Spin<T> {
    let handle = Spin {
        state: Rc::new(RefCell::new(SpinState {
            outcome: None,
            waiters: VecDeque::new(),
            completing: false,
        })),
    };
    let task = handle.clone();
    run_with(coroutine, options, move |result| task.complete(result));
    handle
}

impl<T: Clone + 'static> Spin<T> {
    /// Returns `true` once the task has produced its result.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.borrow().outcome.is_some()
    }

    /// Calls `callback` with the task's result.
    ///
    /// If the task already finished, `callback` runs before this returns.
    pub fn subscribe(&self, callback: impl FnOnce(Result<T>) + 'static) {
        self.push(Callback::new(callback));
    }

    /// Returns a future resolving to the task's result.
    ///
    /// If the task is dropped without ever completing (its operation never
    /// called back, or it was interrupted), the future resolves to
    /// [`ErrorKind::Abandoned`].
    pub fn join(&self) -> Joined<T> {
        let (sender, receiver) = oneshot::channel();
        self.subscribe(move |result| {
            let _ = sender.send(result);
        });
        Joined { receiver }
    }

    fn push(&self, callback: Callback<T>) {
        let cached = {
            let state = self.state.borrow();
            if state.completing {
                None
            } else {
                state.outcome.clone()
            }
        };
        match cached {
            Some(result) => callback.call(result),
            None => self.state.borrow_mut().waiters.push_back(callback),
        }
    }

    fn complete(&self, result: Result<T>) {
        {
            let mut state = self.state.borrow_mut();
            state.outcome = Some(result.clone());
            state.completing = true;
        }
        loop {
            // Release the borrow before calling out: a waiter may join again.
            let waiter = self.state.borrow_mut().waiters.pop_front();
            let Some(waiter) = waiter else {
                break;
            };
            waiter.call(result.clone());
        }
        self.state.borrow_mut().completing = false;
    }
}

impl<T: Clone + 'static> IntoFuture for Spin<T> {
    type Output = Result<T>;
    type IntoFuture = Joined<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.join()
    }
}

impl Co {
    /// Suspends until the task behind `task` finishes and resumes with its
    /// result.
    #[track_caller]
    pub fn wait<T: Clone + 'static>(
        &self,
        task: &Spin<T>,
    ) -> Invoke<T, impl FnOnce(Callback<T>) + use<T>> {
        let task = task.clone();
        self.invoke(move |callback: Callback<T>| task.push(callback))
    }
}

pin_project! {
    /// Future returned by [`Spin::join`].
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Joined<T> {
        #[pin]
        receiver: oneshot::Receiver<Result<T>>,
    }
}

impl<T> Future for Joined<T> {
    type Output = Result<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        self.project()
            .receiver
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(ErrorKind::Abandoned.into())))
    }
}
