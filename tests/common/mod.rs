#![allow(dead_code)]

use std::{sync::Once, time::Duration};

use spindle::{Callback, Coroutine, Error, Result, spin};
use tracing_subscriber::EnvFilter;

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. Filter with `RUST_LOG`.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Runs `future` inside a `LocalSet`, so that `spawn_local` works.
pub async fn local<F: Future>(future: F) -> F::Output {
    init_test_logging();
    tokio::task::LocalSet::new().run_until(future).await
}

/// Calls back with `value` on a later turn of the event loop.
pub fn later<T: 'static>(value: T, callback: Callback<T>) {
    tokio::task::spawn_local(async move {
        tokio::task::yield_now().await;
        callback.ok(value);
    });
}

/// Calls back with `value` after `millis` milliseconds.
pub fn after<T: 'static>(millis: u64, value: T, callback: Callback<T>) {
    tokio::task::spawn_local(async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        callback.ok(value);
    });
}

/// Fails with `message` after `millis` milliseconds.
pub fn fail_after<T: 'static>(millis: u64, message: &'static str, callback: Callback<T>) {
    tokio::task::spawn_local(async move {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        callback.err(Error::msg(message));
    });
}

/// A coroutine resolving to `value` after `millis` milliseconds.
pub fn sleepy<T: 'static>(millis: u64, value: T) -> Coroutine<T> {
    Coroutine::new(move |co| async move { co.invoke(move |callback| after(millis, value, callback)).await })
}

/// Drives `coroutine` to completion from the test's async context.
pub async fn complete<T: Clone + 'static>(coroutine: Coroutine<T>) -> Result<T> {
    spin(coroutine).await
}
