//! A value that follows one logical thread of execution.
//!
//! Every runner owns a context cell. A body reads and replaces its runner's
//! value with [`Co::context`] and [`Co::set_context`], and the value stays put
//! across every suspension, however long the operation takes to call back.
//!
//! Runners started while another runner is polling a body (through
//! [`spin`](crate::spin()), a fan-out [`Co::join`] or a nested
//! [`run`](crate::run)) start with the current value. A [`Funnel`](crate::Funnel)
//! hands queued work the value that was current when the work was submitted.
//! Each runner has its own cell, so replacing the value in one task never
//! changes what another task sees.

use std::{any::Any, cell::RefCell, rc::Rc};

use crate::Co;

/// Shared, type-erased context value.
pub(crate) type Shared = Rc<dyn Any>;

/// Context cell owned by one runner.
pub(crate) type ContextCell = Rc<RefCell<Option<Shared>>>;

thread_local! {
    // Cell of the runner whose body is being polled on this thread.
    static POLLING: RefCell<Option<ContextCell>> = const { RefCell::new(None) };
}

/// Marks `cell` as the current context until dropped, then restores the
/// previous one.
pub(crate) struct Enter {
    previous: Option<ContextCell>,
}

impl Enter {
    pub(crate) fn new(cell: &ContextCell) -> Self {
        let previous = POLLING.with(|polling| polling.replace(Some(Rc::clone(cell))));
        Self { previous }
    }
}

impl Drop for Enter {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = POLLING.try_with(|polling| {
            if let Ok(mut polling) = polling.try_borrow_mut() {
                *polling = previous;
            }
        });
    }
}

/// The value new runners start with when nothing seeds them explicitly.
pub(crate) fn current() -> Option<Shared> {
    POLLING
        .try_with(|polling| {
            polling
                .borrow()
                .as_ref()
                .and_then(|cell| cell.borrow().clone())
        })
        .ok()
        .flatten()
}

impl Co {
    /// Returns this logical thread's context, if one is set and it is a `T`.
    ///
    /// # Example
    /// ```
    /// use spindle::{Coroutine, Result, run};
    ///
    /// let body = Coroutine::new(|co| async move {
    ///     co.set_context(String::from("request-17"));
    ///     let id = co.context::<String>().map(|id| id.to_string());
    ///     Ok(id)
    /// });
    /// run(body, |result: Result<Option<String>>| {
    ///     assert_eq!(result.unwrap().as_deref(), Some("request-17"));
    /// });
    /// ```
    #[must_use]
    pub fn context<T: 'static>(&self) -> Option<Rc<T>> {
        let cell = self.slot.resume()?.context();
        let value = cell.borrow().clone()?;
        value.downcast::<T>().ok()
    }

    /// Replaces this logical thread's context.
    ///
    /// Only the runner driving this body is affected. Tasks started from
    /// here afterwards inherit the new value.
    pub fn set_context<T: 'static>(&self, value: T) {
        self.store(Some(Rc::new(value)));
    }

    /// Removes this logical thread's context.
    pub fn clear_context(&self) {
        self.store(None);
    }

    fn store(&self, value: Option<Shared>) {
        match self.slot.resume() {
            Some(resume) => *resume.context().borrow_mut() = value,
            None => tracing::warn!("context changed outside of a running coroutine, ignoring"),
        }
    }
}
