//! Coroutine-style sequential code on top of callback-style asynchronous
//! operations.
//!
//! `spindle` lets asynchronous logic be written as straight-line `async`
//! bodies while every actual operation is a callback-style function that
//! reports its outcome once. Bodies suspend only through their [`Co`]
//! handle; a runner drives them on an explicit stack, so deep nesting never
//! grows the native stack and errors propagate through ordinary `?`.
//!
//! Features include:
//! - [`Coroutine`] and [`run`] for driving nested coroutines to completion
//! - [`star`] / [`unstar`] for moving functions between the callback and
//!   coroutine worlds
//! - [`spin()`] for starting work early and joining it later, any number of
//!   times, from coroutines, callbacks or any async executor
//! - [`Funnel`] for limiting how many operations run at once
//! - Causal stacks: an [`Error`] remembers the logical chain of coroutine
//!   frames it travelled through, across every asynchronous boundary
//! - A per-task context value ([`Co::context`]) that survives suspensions and
//!   is inherited by the tasks a coroutine starts
//!
//! Everything runs on the thread that drives it: the types here are neither
//! `Send` nor `Sync`.

pub mod adapter;
mod context;
pub mod coroutine;
pub mod error;
pub mod funnel;
pub mod runner;
pub mod spin;
pub mod stack;

pub use adapter::{Callback, Invoke, Starred, Unstarred, star, unstar};
pub use coroutine::{Co, Coroutine, Suspend};
pub use error::{Error, ErrorKind, Result};
pub use funnel::{Funnel, Limit};
pub use runner::{RunOptions, run, run_with};
pub use spin::{Joined, Spin, spin, spin_with};
pub use stack::{CausalStack, FrameInfo};
