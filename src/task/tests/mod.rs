//! Task state machine unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::task::{break_if, cancel_if, wait_until, SharedTask, Status, UniqueTask};

/// Body-local object whose drop is counted, to observe when a computation
/// is actually destroyed.
struct Guard {
    drops: Arc<AtomicUsize>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

mod status_tests {
    use super::*;

    #[test]
    fn test_status_atomic_roundtrip() {
        for status in [
            Status::Suspended,
            Status::Resuming,
            Status::Canceled,
            Status::Done,
            Status::Faulted,
            Status::Disconnected,
        ] {
            assert_eq!(Status::from_u8(status.as_u8()), status);
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!Status::Suspended.is_terminal());
        assert!(!Status::Resuming.is_terminal());
        assert!(Status::Canceled.is_terminal());
        assert!(Status::Done.is_terminal());
        assert!(Status::Faulted.is_terminal());
        assert!(Status::Disconnected.is_terminal());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(format!("{}", Status::Suspended), "Suspended");
        assert_eq!(format!("{}", Status::Disconnected), "Disconnected");
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_fresh_task_is_suspended() {
        let task: UniqueTask<i32> = UniqueTask::new(|_co| async move { 1 });
        assert_eq!(task.status(), Status::Suspended);
        assert_eq!(task.consume(), None);
    }

    #[test]
    fn test_resume_to_completion() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            32
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);
        task.resume();
        assert_eq!(task.status(), Status::Done);
    }

    #[test]
    fn test_resume_after_done_is_noop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let task: UniqueTask<()> = UniqueTask::new({
            let runs = runs.clone();
            move |_co| async move {
                runs.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.resume();
        assert_eq!(task.status(), Status::Done);
        task.resume();
        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consume_once() {
        let task: UniqueTask<i32> = UniqueTask::new(|_co| async move { 32 });
        task.resume();
        assert_eq!(task.consume(), Some(32));
        assert_eq!(task.consume(), None);
    }

    #[test]
    fn test_reset_disconnects_handle() {
        let mut task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            1
        });
        task.resume();
        task.reset();
        assert_eq!(task.status(), Status::Disconnected);
        // Everything on a detached handle is a safe no-op.
        task.resume();
        task.cancel();
        assert_eq!(task.consume(), None);
        assert_eq!(task.consume_yield(), None);
    }

    #[test]
    fn test_reset_destroys_computation_mid_suspension() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut task: UniqueTask<()> = UniqueTask::new({
            let drops = drops.clone();
            move |co| async move {
                let _guard = Guard { drops };
                co.suspend().await;
                co.suspend().await;
            }
        });

        task.resume();
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        task.reset();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handle_moves_between_threads() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            5
        });
        task.resume();

        let task = thread::spawn(move || {
            task.resume();
            task
        })
        .join()
        .unwrap();

        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(5));
    }
}

mod predicate_tests {
    use super::*;

    #[test]
    fn test_predicate_gates_resume() {
        let flag = Arc::new(AtomicBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        let task: UniqueTask<()> = UniqueTask::new({
            let flag = flag.clone();
            let hits = hits.clone();
            move |co| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                co.until(move || flag.load(Ordering::SeqCst)).await;
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // False predicate: no side effects, the body is not entered.
        task.resume();
        task.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        flag.store(true, Ordering::SeqCst);
        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_true_predicate_does_not_suspend() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.until(|| true).await;
            9
        });
        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(9));
    }

    #[test]
    fn test_wait_until_task() {
        let flag = Arc::new(AtomicBool::new(false));
        let task = wait_until({
            let flag = flag.clone();
            move || flag.load(Ordering::SeqCst)
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);
        flag.store(true, Ordering::SeqCst);
        task.resume();
        assert_eq!(task.status(), Status::Done);
    }
}

mod generator_tests {
    use super::*;

    fn fibonacci(n: usize) -> UniqueTask<usize, u64> {
        UniqueTask::new(move |co| async move {
            let (mut a, mut b) = (0u64, 1u64);
            for _ in 0..n {
                co.yield_value(a).await;
                (a, b) = (b, a + b);
            }
            n
        })
    }

    #[test]
    fn test_fibonacci_yield_sequence() {
        let expected = [0u64, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89];
        let task = fibonacci(12);

        for &value in &expected {
            task.resume();
            assert_eq!(task.status(), Status::Suspended);
            assert_eq!(task.consume_yield(), Some(value));
            // The return slot stays empty until the final resume.
            assert_eq!(task.consume(), None);
        }

        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume_yield(), None);
        assert_eq!(task.consume(), Some(12));
    }

    #[test]
    fn test_consume_yield_clears_slot() {
        let task = fibonacci(3);
        task.resume();
        assert_eq!(task.consume_yield(), Some(0));
        assert_eq!(task.consume_yield(), None);
    }

    #[test]
    fn test_unconsumed_yield_is_replaced() {
        let task = fibonacci(3);
        task.resume();
        task.resume();
        // The driver skipped a value; the slot holds the latest one.
        assert_eq!(task.consume_yield(), Some(1));
    }
}

mod cancel_tests {
    use super::*;

    #[test]
    fn test_cancel_is_terminal() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            1
        });
        task.resume();
        task.cancel();
        assert_eq!(task.status(), Status::Canceled);
        task.resume();
        assert_eq!(task.status(), Status::Canceled);
        assert_eq!(task.consume(), None);
    }

    #[test]
    fn test_cancel_after_done_is_noop() {
        let task: UniqueTask<i32> = UniqueTask::new(|_co| async move { 1 });
        task.resume();
        task.cancel();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(1));
    }

    #[test]
    fn test_cancel_propagates_to_nested_task() {
        let inner: SharedTask<i32> = SharedTask::new(|co| async move {
            co.suspend().await;
            co.suspend().await;
            1
        });
        let inner_watch = inner.clone();

        let outer: UniqueTask<()> = UniqueTask::new(move |co| async move {
            let _ = co.join_shared(inner).await;
        });

        outer.resume();
        assert_eq!(outer.status(), Status::Suspended);
        assert_eq!(inner_watch.status(), Status::Suspended);

        outer.cancel();
        assert_eq!(outer.status(), Status::Canceled);
        assert_eq!(inner_watch.status(), Status::Canceled);
    }

    #[test]
    fn test_cancel_self_from_body() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            co.cancel_self().await;
            unreachable!("a canceled body is never polled again")
        });
        task.resume();
        task.resume();
        assert_eq!(task.status(), Status::Canceled);
        task.resume();
        assert_eq!(task.status(), Status::Canceled);
    }
}

mod join_tests {
    use super::*;

    fn helper() -> UniqueTask<i32> {
        UniqueTask::new(|co| async move {
            co.suspend().await;
            co.suspend().await;
            32
        })
    }

    #[test]
    fn test_join_forwards_return_value() {
        let outer: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.join(helper()).await.unwrap_or(-1)
        });

        outer.resume();
        assert_eq!(outer.status(), Status::Suspended);
        outer.resume();
        assert_eq!(outer.status(), Status::Suspended);
        outer.resume();
        assert_eq!(outer.status(), Status::Done);
        assert_eq!(outer.consume(), Some(32));
    }

    #[test]
    fn test_join_completed_inner_is_immediate() {
        let inner = helper();
        inner.resume();
        inner.resume();
        inner.resume();
        assert_eq!(inner.status(), Status::Done);

        let outer: UniqueTask<i32> = UniqueTask::new(move |co| async move {
            co.join(inner).await.unwrap_or(-1)
        });
        outer.resume();
        assert_eq!(outer.status(), Status::Done);
        assert_eq!(outer.consume(), Some(32));
    }

    #[test]
    fn test_join_detached_handle_yields_none() {
        let mut inner = helper();
        inner.reset();
        let outer: UniqueTask<i32> = UniqueTask::new(move |co| async move {
            co.join(inner).await.unwrap_or(-1)
        });
        outer.resume();
        assert_eq!(outer.status(), Status::Done);
        assert_eq!(outer.consume(), Some(-1));
    }
}

mod external_tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;

    /// A future that stays pending until the shared flag opens.
    struct Gate {
        open: Arc<AtomicBool>,
    }

    impl Future for Gate {
        type Output = u8;

        fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<u8> {
            if self.open.load(Ordering::SeqCst) {
                Poll::Ready(9)
            } else {
                Poll::Pending
            }
        }
    }

    #[test]
    fn test_external_ready_future_completes_immediately() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.external(std::future::ready(5)).await
        });
        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(5));
    }

    #[test]
    fn test_external_future_polled_each_resume() {
        let open = Arc::new(AtomicBool::new(false));
        let task: UniqueTask<u8> = UniqueTask::new({
            let open = open.clone();
            move |co| async move { co.external(Gate { open }).await }
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);
        task.resume();
        assert_eq!(task.status(), Status::Suspended);

        open.store(true, Ordering::SeqCst);
        task.resume();
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(9));
    }
}

mod fault_tests {
    use super::*;

    #[test]
    fn test_panicking_body_faults_task() {
        let task: UniqueTask<i32> = UniqueTask::new(|co| async move {
            co.suspend().await;
            panic!("boom");
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);
        task.resume();
        assert_eq!(task.status(), Status::Faulted);
        assert_eq!(task.consume(), None);

        // Terminal: no further effect.
        task.resume();
        assert_eq!(task.status(), Status::Faulted);
        task.cancel();
        assert_eq!(task.status(), Status::Faulted);
    }
}

mod shared_tests {
    use super::*;

    #[test]
    fn test_clones_alias_one_computation() {
        let first: SharedTask<i32> = SharedTask::new(|co| async move {
            co.suspend().await;
            3
        });
        let second = first.clone();

        second.resume();
        assert_eq!(first.status(), Status::Suspended);
        first.resume();
        assert_eq!(second.status(), Status::Done);
        assert_eq!(second.consume(), Some(3));
        assert_eq!(first.consume(), None);
    }

    #[test]
    fn test_computation_destroyed_with_last_handle() {
        let drops = Arc::new(AtomicUsize::new(0));
        let first: SharedTask<()> = SharedTask::new({
            let drops = drops.clone();
            move |co| async move {
                let _guard = Guard { drops };
                co.suspend().await;
                co.suspend().await;
            }
        });

        first.resume(); // enters the body, constructing the guard
        let second = first.clone();

        drop(first);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}

mod combinator_tests {
    use super::*;

    fn counting(n: usize) -> UniqueTask<usize, usize> {
        UniqueTask::new(move |co| async move {
            for i in 0..n {
                co.yield_value(i).await;
            }
            n
        })
    }

    #[test]
    fn test_break_if_passthrough() {
        let task = break_if(counting(3), || false);

        let mut yields = Vec::new();
        loop {
            task.resume();
            if let Some(value) = task.consume_yield() {
                yields.push(value);
            }
            if task.status() != Status::Suspended {
                break;
            }
        }

        assert_eq!(yields, vec![0, 1, 2]);
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(Some(3)));
    }

    #[test]
    fn test_break_if_releases_inner_and_completes() {
        let stop = Arc::new(AtomicBool::new(false));
        let task = break_if(counting(10), {
            let stop = stop.clone();
            move || stop.load(Ordering::SeqCst)
        });

        task.resume();
        assert_eq!(task.consume_yield(), Some(0));
        assert_eq!(task.status(), Status::Suspended);

        stop.store(true, Ordering::SeqCst);
        task.resume();
        assert_eq!(task.status(), Status::Done);
        // Broken, not completed: no inner return value.
        assert_eq!(task.consume(), Some(None));
    }

    #[test]
    fn test_cancel_if_cancels_wrapper() {
        let stop = Arc::new(AtomicBool::new(false));
        let task = cancel_if(counting(10), {
            let stop = stop.clone();
            move || stop.load(Ordering::SeqCst)
        });

        task.resume();
        assert_eq!(task.status(), Status::Suspended);

        stop.store(true, Ordering::SeqCst);
        task.resume();
        assert_eq!(task.status(), Status::Canceled);
        assert_eq!(task.consume(), None);
    }

    #[test]
    fn test_cancel_if_forwards_result_when_never_triggered() {
        let task = cancel_if(counting(2), || false);
        loop {
            task.resume();
            task.consume_yield();
            if task.status() != Status::Suspended {
                break;
            }
        }
        assert_eq!(task.status(), Status::Done);
        assert_eq!(task.consume(), Some(Some(2)));
    }
}
