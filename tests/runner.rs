mod common;

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    time::Duration,
};

use common::{complete, later, local};
use spindle::{Callback, Coroutine, Error, ErrorKind, RunOptions, run, run_with};

type Log = Rc<RefCell<String>>;

// Appends `letter` through an operation that completes either before it
// returns or on a later turn.
fn append(log: Log, letter: char, deferred: bool) -> Coroutine<()> {
    Coroutine::new(move |co| async move {
        let letter = if deferred {
            co.invoke(move |callback| later(letter, callback)).await?
        } else {
            co.invoke(move |callback: Callback<char>| callback.ok(letter)).await?
        };
        log.borrow_mut().push(letter);
        Ok(())
    })
}

fn abc(log: Log, deferred: bool) -> Coroutine<String> {
    Coroutine::new(move |co| async move {
        co.call(append(Rc::clone(&log), 'a', deferred)).await?;
        co.call(append(Rc::clone(&log), 'b', deferred)).await?;
        co.call(append(Rc::clone(&log), 'c', deferred)).await?;
        let result = log.borrow().clone();
        Ok(result)
    })
}

#[tokio::test]
async fn immediate_and_deferred_completions_agree() {
    local(async {
        let immediate = complete(abc(Log::default(), false)).await;
        let deferred = complete(abc(Log::default(), true)).await;
        assert_eq!(immediate.unwrap(), "abc", "Immediate completions should produce 'abc'");
        assert_eq!(deferred.unwrap(), "abc", "Deferred completions should produce 'abc'");
    })
    .await;
}

#[tokio::test]
async fn synchronous_run_calls_back_before_returning() {
    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    run(abc(Log::default(), false), move |outcome| {
        *slot.borrow_mut() = Some(outcome.unwrap());
    });
    assert_eq!(
        result.borrow().as_deref(),
        Some("abc"),
        "Callback should have fired before run returned"
    );
}

#[tokio::test]
async fn sequential_steps_in_a_loop() {
    local(async {
        let log = Log::default();
        let body_log = Rc::clone(&log);
        let looping = Coroutine::new(move |co| async move {
            for i in 0..3 {
                co.call(append(Rc::clone(&body_log), 'a', true)).await?;
                co.call(append(Rc::clone(&body_log), 'b', false)).await?;
                co.call(append(Rc::clone(&body_log), 'c', true)).await?;
                body_log.borrow_mut().push_str(&i.to_string());
            }
            Ok(())
        });
        complete(looping).await.unwrap();
        assert_eq!(*log.borrow(), "abc0abc1abc2", "Loop should interleave steps and indices");
    })
    .await;
}

fn depth(n: u32) -> Coroutine<u32> {
    Coroutine::new(move |co| async move {
        if n == 0 {
            return Ok(0);
        }
        Ok(co.call(depth(n - 1)).await? + 1)
    })
}

#[tokio::test]
async fn deep_nesting_does_not_grow_the_native_stack() {
    let result = Rc::new(Cell::new(0));
    let slot = Rc::clone(&result);
    run(depth(100_000), move |outcome| slot.set(outcome.unwrap()));
    assert_eq!(result.get(), 100_000, "Every level should have added one");
}

#[tokio::test]
async fn many_synchronous_completions_loop_instead_of_recursing() {
    let counted = Coroutine::new(|co| async move {
        let mut total = 0u64;
        for i in 0..100_000u64 {
            total += co.invoke(move |callback: Callback<u64>| callback.ok(i)).await?;
        }
        Ok(total)
    });
    let result = Rc::new(Cell::new(0));
    let slot = Rc::clone(&result);
    run(counted, move |outcome| slot.set(outcome.unwrap()));
    assert_eq!(result.get(), 4_999_950_000, "Sum of 0..100000");
}

fn failing(message: &'static str) -> Coroutine<u32> {
    Coroutine::new(move |co| async move {
        co.invoke(|callback: Callback<()>| later((), callback)).await?;
        Err(Error::msg(message))
    })
}

#[tokio::test]
async fn errors_propagate_and_can_be_caught() {
    local(async {
        let caught = Coroutine::new(|co| async move {
            match co.call(failing("boom")).await {
                Ok(_) => Ok("no error".to_string()),
                Err(error) => Ok(format!("caught {error}")),
            }
        });
        assert_eq!(complete(caught).await.unwrap(), "caught boom", "Caller should catch the error");

        let uncaught = Coroutine::new(|co| async move {
            let value = co.call(failing("bang")).await?;
            Ok(value + 1)
        });
        let error = complete(uncaught).await.unwrap_err();
        assert_eq!(error.to_string(), "bang", "Error should reach the top-level callback");
    })
    .await;
}

#[tokio::test]
async fn awaiting_a_foreign_future_is_an_invalid_yield() {
    let foreign = Coroutine::new(|_co| async move {
        futures::future::pending::<()>().await;
        Ok(())
    });
    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    run(foreign, move |outcome| *slot.borrow_mut() = Some(outcome));

    let outcome = result.borrow_mut().take().expect("Run should have completed");
    let error = outcome.unwrap_err();
    assert!(
        matches!(error.kind(), ErrorKind::InvalidYield(_)),
        "Expected InvalidYield, got {error:?}"
    );
}

#[tokio::test]
async fn two_suspensions_at_once_are_an_invalid_yield() {
    let both = Coroutine::new(|co| async move {
        let (a, b) = futures::join!(co.call(depth(1)), co.call(depth(2)));
        Ok(a? + b?)
    });
    let caller = Coroutine::new(move |co| async move {
        match co.call(both).await {
            Err(error) if matches!(error.kind(), ErrorKind::InvalidYield(_)) => Ok(true),
            _ => Ok(false),
        }
    });
    let result = Rc::new(Cell::new(false));
    let slot = Rc::clone(&result);
    run(caller, move |outcome| slot.set(outcome.unwrap()));
    assert!(result.get(), "Caller should catch the InvalidYield like any error");
}

#[tokio::test]
async fn interrupted_runner_never_calls_back() {
    local(async {
        let stop = Rc::new(Cell::new(false));
        let steps = Rc::new(Cell::new(0));
        let called = Rc::new(Cell::new(false));

        let (body_stop, body_steps) = (Rc::clone(&stop), Rc::clone(&steps));
        let body = Coroutine::new(move |co| async move {
            for _ in 0..3 {
                body_steps.set(body_steps.get() + 1);
                body_stop.set(true);
                co.invoke(|callback: Callback<()>| later((), callback)).await?;
            }
            Ok(())
        });
        let interrupt = Rc::clone(&stop);
        let flag = Rc::clone(&called);
        run_with(
            body,
            RunOptions::new().interrupt(move || interrupt.get()),
            move |_| flag.set(true),
        );

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(steps.get(), 1, "Runner should stop after the first resumption");
        assert!(!called.get(), "Interrupted runner should never call back");
    })
    .await;
}

#[tokio::test]
async fn fan_out_preserves_positional_order() {
    local(async {
        let fan = Coroutine::new(|co| async move {
            co.join([
                common::sleepy(15, 'x'),
                common::sleepy(1, 'y'),
                common::sleepy(5, 'z'),
            ])
            .await
        });
        let values = complete(fan).await.unwrap();
        assert_eq!(values, vec!['x', 'y', 'z'], "Results should follow input order");
    })
    .await;
}

#[tokio::test]
async fn fan_out_fails_with_the_failing_position() {
    local(async {
        let delivered = Rc::new(Cell::new(false));
        let flag = Rc::clone(&delivered);
        let fan = Coroutine::new(move |co| async move {
            let values = co
                .join([
                    common::sleepy(5, 1u32),
                    Coroutine::new(|co| async move {
                        co.invoke(|callback| common::fail_after(2, "second", callback)).await
                    }),
                    common::sleepy(1, 3u32),
                ])
                .await?;
            flag.set(true);
            Ok(values)
        });
        let error = complete(fan).await.unwrap_err();
        assert_eq!(error.to_string(), "second", "Second position's error should win");
        assert!(!delivered.get(), "No results should be delivered after a failure");
    })
    .await;
}

#[tokio::test]
async fn fan_out_reports_first_position_on_multiple_failures() {
    local(async {
        let fan = Coroutine::new(|co| async move {
            co.join([
                Coroutine::new(|co| async move {
                    co.invoke(|callback: Callback<u32>| common::fail_after(10, "first", callback))
                        .await
                }),
                Coroutine::new(|co| async move {
                    co.invoke(|callback: Callback<u32>| common::fail_after(1, "second", callback))
                        .await
                }),
            ])
            .await
        });
        let error = complete(fan).await.unwrap_err();
        assert_eq!(error.to_string(), "first", "Earliest position should win even if it fails later");
    })
    .await;
}

#[tokio::test]
async fn empty_fan_out_resolves_immediately() {
    let fan = Coroutine::new(|co| async move { co.join(Vec::<Coroutine<u8>>::new()).await });
    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    run(fan, move |outcome| *slot.borrow_mut() = Some(outcome.unwrap()));
    assert_eq!(*result.borrow(), Some(Vec::new()), "Empty join should yield no values");
}

#[tokio::test]
async fn finished_runner_delivers_even_if_interrupted_on_its_last_step() {
    let stop = Rc::new(Cell::new(false));
    let body_stop = Rc::clone(&stop);
    let body = Coroutine::new(move |_co| async move {
        body_stop.set(true);
        Ok(1u32)
    });

    let result = Rc::new(Cell::new(None));
    let slot = Rc::clone(&result);
    let interrupt = Rc::clone(&stop);
    run_with(
        body,
        RunOptions::new().interrupt(move || interrupt.get()),
        move |outcome| slot.set(Some(outcome.unwrap())),
    );
    assert_eq!(result.get(), Some(1), "A completed coroutine keeps its result");
}

#[tokio::test]
async fn resumption_while_driving_is_queued() {
    let stash: Rc<RefCell<Option<Callback<u32>>>> = Rc::default();
    let body_stash = Rc::clone(&stash);
    let body = Coroutine::new(move |co| async move {
        let stored = Rc::clone(&body_stash);
        let (value, ()) = futures::join!(
            co.invoke(move |callback: Callback<u32>| *stored.borrow_mut() = Some(callback)),
            async {
                let stashed = body_stash.borrow_mut().take();
                if let Some(callback) = stashed {
                    callback.ok(5);
                }
            },
        );
        value
    });

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    run(body, move |outcome| *slot.borrow_mut() = Some(outcome));
    let outcome = result.borrow_mut().take().expect("Run should have completed");
    assert_eq!(outcome.unwrap(), 5, "Queued resumption should reach the frame");
    assert!(stash.borrow().is_none(), "Callback should have been used");
}

type Stash = Rc<RefCell<Vec<Callback<u32>>>>;

// Leaves three operations in flight at once, which fails the frame.
fn overlapping_invokes(stash: Stash) -> Coroutine<u32> {
    Coroutine::new(move |co| async move {
        let keep = |stash: &Stash| {
            let stash = Rc::clone(stash);
            move |callback: Callback<u32>| stash.borrow_mut().push(callback)
        };
        let (a, b, c) = futures::join!(
            co.invoke(keep(&stash)),
            co.invoke(keep(&stash)),
            co.invoke(keep(&stash)),
        );
        Ok(a? + b? + c?)
    })
}

#[tokio::test]
async fn stale_callbacks_do_not_disturb_the_caller() {
    local(async {
        let stash = Stash::default();
        let body_stash = Rc::clone(&stash);
        let parent = Coroutine::new(move |co| async move {
            let failed = co.call(overlapping_invokes(Rc::clone(&body_stash))).await;
            let invalid = matches!(&failed, Err(error) if matches!(error.kind(), ErrorKind::InvalidYield(_)));

            let value = co
                .invoke(move |callback: Callback<u32>| {
                    let mut stale = body_stash.take();
                    let last = stale.pop();
                    // Fired while this runner is still driving.
                    for old in stale {
                        old.ok(99);
                    }
                    tokio::task::spawn_local(async move {
                        // Fired while the caller is suspended on its own operation.
                        if let Some(old) = last {
                            old.ok(99);
                        }
                        tokio::task::yield_now().await;
                        callback.ok(7);
                    });
                })
                .await?;
            Ok((invalid, value))
        });

        let (invalid, value) = complete(parent).await.unwrap();
        assert!(invalid, "Overlapping invokes should fail with InvalidYield");
        assert_eq!(value, 7, "Caller should resume only with its own result");
        assert!(stash.borrow().is_empty(), "Every stale callback should have fired");
    })
    .await;
}
