//! Integration tests composing nested futures with the task executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether_core::{
    EventBus, ExecutorConfig, Flow, ObservableFuture, Outcome, TaskExecutor, TetherError,
};

#[tokio::test(start_paused = true)]
async fn outer_future_bound_to_request_sees_timeout() {
    let executor = TaskExecutor::new(ExecutorConfig::default()).unwrap();
    let outer = ObservableFuture::<String>::new();
    let request = executor.enqueue(
        || async { Ok(ObservableFuture::new()) },
        Some(Duration::from_secs(30)),
    );
    outer.bind_nested(&request).unwrap();

    assert_eq!(
        outer.wait().await,
        Outcome::Failure(TetherError::Timeout(Duration::from_secs(30)))
    );
}

#[tokio::test(start_paused = true)]
async fn work_completed_by_event_beats_deadline() {
    let executor = TaskExecutor::new(ExecutorConfig::default()).unwrap();
    let bus = Arc::new(EventBus::<String>::new());

    let work_bus = Arc::clone(&bus);
    let request = executor.enqueue(
        move || async move {
            let result = ObservableFuture::new();
            let target = result.clone();
            work_bus.subscribe_once(move |value: &String| {
                target.set_success(value.clone());
            });
            Ok(result)
        },
        Some(Duration::from_secs(10)),
    );

    while bus.is_empty() {
        tokio::task::yield_now().await;
    }
    bus.publish(&"confirmed".to_string());

    assert_eq!(request.wait().await, Outcome::Success("confirmed".to_string()));
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(request.is_success());
    assert_eq!(executor.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_completion_resolves_once() {
    for _ in 0..50 {
        let parent = ObservableFuture::<usize>::new();
        let child = ObservableFuture::<usize>::new();
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notified);
        parent.add_observer(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let binder = {
            let parent = parent.clone();
            let child = child.clone();
            tokio::spawn(async move { parent.bind_nested(&child) })
        };
        let racers: Vec<_> = (0..4)
            .map(|i| {
                let target = if i % 2 == 0 { parent.clone() } else { child.clone() };
                tokio::spawn(async move { target.set_success(7) })
            })
            .collect();

        binder.await.unwrap().unwrap();
        for racer in racers {
            racer.await.unwrap();
        }

        assert_eq!(parent.outcome(), child.outcome());
        assert!(parent.is_success());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn detaching_listener_sees_single_event_under_contention() {
    let bus = Arc::new(EventBus::<u32>::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    bus.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        Flow::Detach
    });

    std::thread::scope(|scope| {
        for i in 0..8 {
            let bus = Arc::clone(&bus);
            scope.spawn(move || bus.publish(&i));
        }
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(bus.is_empty());
}

#[test]
fn once_listener_fires_once_under_contention() {
    let bus = Arc::new(EventBus::<u32>::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    bus.subscribe_once(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::scope(|scope| {
        for i in 0..8 {
            let bus = Arc::clone(&bus);
            scope.spawn(move || bus.publish(&i));
        }
    });
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(bus.is_empty());
}
