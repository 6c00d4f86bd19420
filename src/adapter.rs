//! Bridges between callback-style operations and coroutines.
//!
//! A callback-style operation is anything that performs work and eventually
//! reports an error-or-result through a [`Callback`]. [`Co::invoke`] turns
//! one call of such an operation into a suspension point; [`star`] turns a
//! whole callback-style function into a coroutine factory, and [`unstar`]
//! goes the other way, exposing coroutine logic as a callback-style function.
//!
//! Operations must call their callback at most once, which `Callback` enforces
//! by being consumed on use. An operation that never calls back leaves its
//! coroutine suspended forever; cancellation is the operation's business.

use std::{any::type_name, cell::RefCell, marker::PhantomData, panic::Location, rc::Rc};

use pin_project_lite::pin_project;

use crate::{
    Co, Coroutine, Error, ErrorKind, Result, Spin,
    coroutine::{Outcome, Slot, Step, Value, downcast, short_name},
    runner::run,
    spin::spin,
};

/// Completion callback handed to a callback-style operation.
#[must_use = "an operation that never calls back leaves its coroutine suspended"]
pub struct Callback<T> {
    inner: Box<dyn FnOnce(Result<T>)>,
}

impl<T> Callback<T> {
    pub fn new(callback: impl FnOnce(Result<T>) + 'static) -> Self {
        Self {
            inner: Box::new(callback),
        }
    }

    /// Reports the outcome of the operation.
    pub fn call(self, result: Result<T>) {
        (self.inner)(result)
    }

    pub fn ok(self, value: T) {
        self.call(Ok(value))
    }

    pub fn err(self, error: impl Into<Error>) {
        self.call(Err(error.into()))
    }
}

// Outcome of an operation that called back before it returned.
struct Completion {
    sync: bool,
    outcome: Option<Outcome>,
}

pin_project! {
    /// Future returned by [`Co::invoke`] and [`Co::wait`].
    ///
    /// The first poll starts the operation. If the operation calls back before
    /// it returns, the runner resumes the coroutine in the same drive loop;
    /// otherwise the coroutine stays suspended until the callback fires.
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Invoke<T, F> {
        slot: Rc<Slot>,
        operation: Option<F>,
        location: &'static Location<'static>,
        _output: PhantomData<fn() -> T>,
    }
}

impl<T, F> Invoke<T, F> {
    pub(crate) fn new(co: &Co, operation: F, location: &'static Location<'static>) -> Self {
        Self {
            slot: Rc::clone(&co.slot),
            operation: Some(operation),
            location,
            _output: PhantomData,
        }
    }
}

impl<T, F> Future for Invoke<T, F>
where
    T: 'static,
    F: FnOnce(Callback<T>),
{
    type Output = Result<T>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        let Some(operation) = this.operation.take() else {
            return match this.slot.take_input() {
                Some(outcome) => std::task::Poll::Ready(outcome.and_then(downcast::<T>)),
                None => std::task::Poll::Pending,
            };
        };
        let Some(resume) = this.slot.resume() else {
            return std::task::Poll::Ready(Err(Error::invalid_yield(
                "operation invoked outside of a running coroutine",
            )));
        };

        let completion = Rc::new(RefCell::new(Completion {
            sync: true,
            outcome: None,
        }));
        let callback = {
            let completion = Rc::clone(&completion);
            Callback::new(move |result: Result<T>| {
                let outcome = result.map(|value| Box::new(value) as Value);
                let mut state = completion.borrow_mut();
                if state.sync {
                    state.outcome = Some(outcome);
                } else {
                    drop(state);
                    resume.resume(outcome);
                }
            })
        };
        operation(callback);

        let ready = {
            let mut state = completion.borrow_mut();
            state.sync = false;
            state.outcome.take()
        };
        let step = match ready {
            Some(outcome) => Step::Ready(outcome),
            None => Step::Suspend,
        };
        this.slot.suspend(*this.location, step);
        std::task::Poll::Pending
    }
}

impl Co {
    /// Starts a callback-style operation and suspends until it calls back.
    ///
    /// # Example
    /// ```
    /// use spindle::{Callback, Coroutine, Result, run};
    ///
    /// fn answer(callback: Callback<u32>) {
    ///     callback.ok(42);
    /// }
    ///
    /// let coroutine = Coroutine::new(|co| async move { co.invoke(answer).await });
    /// run(coroutine, |result: Result<u32>| assert_eq!(result.unwrap(), 42));
    /// ```
    #[track_caller]
    pub fn invoke<T, F>(&self, operation: F) -> Invoke<T, F>
    where
        T: 'static,
        F: FnOnce(Callback<T>),
    {
        Invoke::new(self, operation, Location::caller())
    }
}

/// A callback-style function adapted into a coroutine factory.
///
/// Created with [`star`].
pub struct Starred<A, T> {
    operation: Rc<dyn Fn(A, Callback<T>)>,
    name: &'static str,
}

impl<A, T> Clone for Starred<A, T> {
    fn clone(&self) -> Self {
        Self {
            operation: Rc::clone(&self.operation),
            name: self.name,
        }
    }
}

/// Turns a callback-style function into a function returning coroutines.
///
/// Each [`Starred::call`] produces a coroutine that runs the operation once
/// with the given arguments.
///
/// # Example
/// ```
/// use spindle::{Callback, Coroutine, Result, run, star};
///
/// let double = star(|n: u32, callback: Callback<u32>| callback.ok(n * 2));
/// let coroutine = Coroutine::new(move |co| async move { co.call(double.call(21)).await });
/// run(coroutine, |result: Result<u32>| assert_eq!(result.unwrap(), 42));
/// ```
pub fn star<A, T, F>(operation: F) -> Starred<A, T>
where
    F: Fn(A, Callback<T>) + 'static,
{
    Starred {
        operation: Rc::new(operation),
        name: short_name(type_name::<F>()),
    }
}

impl<A: 'static, T: 'static> Starred<A, T> {
    /// Returns a coroutine that runs the operation with `args`.
    #[track_caller]
    pub fn call(&self, args: A) -> Coroutine<T> {
        let operation = Rc::clone(&self.operation);
        let location = Location::caller();
        Coroutine::build(self.name, location, false, move |co| async move {
            Invoke::new(
                &co,
                move |callback: Callback<T>| operation(args, callback),
                location,
            )
            .await
        })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Coroutine logic exposed as a callback-style function.
///
/// Created with [`unstar`].
pub struct Unstarred<A, T> {
    factory: Rc<dyn Fn(A) -> Coroutine<T>>,
    name: &'static str,
}

impl<A, T> Clone for Unstarred<A, T> {
    fn clone(&self) -> Self {
        Self {
            factory: Rc::clone(&self.factory),
            name: self.name,
        }
    }
}

/// Turns a coroutine factory into a callback-style function.
///
/// # Example
/// ```
/// use spindle::{Coroutine, Result, unstar};
///
/// fn square(n: u64) -> Coroutine<u64> {
///     Coroutine::new(move |_co| async move { Ok(n * n) })
/// }
///
/// let square = unstar(square);
/// square.call(7, |result: Result<u64>| assert_eq!(result.unwrap(), 49));
/// ```
pub fn unstar<A, T, F>(factory: F) -> Unstarred<A, T>
where
    F: Fn(A) -> Coroutine<T> + 'static,
{
    Unstarred {
        factory: Rc::new(factory),
        name: short_name(type_name::<F>()),
    }
}

impl<A: 'static, T: 'static> Unstarred<A, T> {
    /// Runs the coroutine for `args` and reports its result to `callback`.
    pub fn call(&self, args: A, callback: impl FnOnce(Result<T>) + 'static) {
        run((self.factory)(args), callback);
    }

    /// Starts the coroutine for `args` and returns a handle to join it later.
    pub fn future(&self, args: A) -> Spin<T>
    where
        T: Clone,
    {
        spin((self.factory)(args))
    }

    /// Returns the coroutine form of this function.
    pub fn coroutine(&self, args: A) -> Coroutine<T> {
        (self.factory)(args)
    }

    /// Returns this function's callback form as an operation for
    /// [`Co::invoke`].
    ///
    /// Coroutines must call the coroutine form instead, so the returned
    /// operation never runs the function: it fails at once with
    /// [`ErrorKind::Unstarred`], leaving the coroutine's runner untouched.
    ///
    /// The types already keep a [`Starred`] function out of `Co::invoke`.
    /// `bind` is the one way to hand the callback form of adapted logic
    /// back to a coroutine, and it exists so that this mistake surfaces as
    /// an ordinary error the coroutine can handle.
    pub fn bind(&self, args: A) -> impl FnOnce(Callback<T>) + use<A, T> {
        let name = self.name;
        drop(args);
        move |callback: Callback<T>| {
            tracing::warn!(function = name, "unstarred function invoked from a coroutine");
            callback.err(ErrorKind::Unstarred(name));
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}
