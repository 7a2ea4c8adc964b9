//! CPU worker pool behavior

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use taskr::error::Error;
use taskr::pool::ThreadPool;

const SMALL_POOL_SIZE: usize = 5;

#[test]
fn zero_threads_is_invalid() {
    assert!(matches!(ThreadPool::new(0), Err(Error::InvalidThreadCount)));
}

#[test]
fn single_thread_single_task() {
    let pool = ThreadPool::new(1).unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let task_flag = Arc::clone(&flag);

    pool.submit(move || task_flag.store(true, Ordering::SeqCst))
        .wait()
        .unwrap();
    assert!(flag.load(Ordering::SeqCst));
}

#[test]
fn multiple_threads_single_task() {
    let pool = ThreadPool::new(SMALL_POOL_SIZE).unwrap();
    let result = pool.submit(|| 12 + 4).wait().unwrap();
    assert_eq!(result, 16);
}

#[test]
fn n_threads_run_n_tasks_concurrently() {
    // All workers must rendezvous at one barrier, which only happens if
    // the pool truly runs SMALL_POOL_SIZE tasks at once.
    let pool = ThreadPool::new(SMALL_POOL_SIZE).unwrap();
    let barrier = Arc::new(Barrier::new(SMALL_POOL_SIZE));

    let completions: Vec<_> = (0..SMALL_POOL_SIZE)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            pool.submit(move || {
                barrier.wait();
            })
        })
        .collect();

    for completion in completions {
        completion.wait().unwrap();
    }
}

#[test]
fn results_arrive_for_many_tasks() {
    let pool = ThreadPool::new(SMALL_POOL_SIZE).unwrap();
    let completions: Vec<_> = (0..SMALL_POOL_SIZE * 3)
        .map(|i| pool.submit(move || i * i))
        .collect();
    for (i, completion) in completions.into_iter().enumerate() {
        assert_eq!(completion.wait().unwrap(), i * i);
    }
}

#[test]
fn panic_surfaces_through_completion() {
    let pool = ThreadPool::new(SMALL_POOL_SIZE).unwrap();
    let boom = pool.submit(|| panic!("test panic!"));
    match boom.wait() {
        Err(Error::TaskPanicked { message, .. }) => assert!(message.contains("test panic!")),
        other => panic!("expected TaskPanicked, got {other:?}"),
    }
}

#[test]
fn workers_survive_panicking_tasks() {
    let pool = ThreadPool::new(SMALL_POOL_SIZE).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let mut completions = Vec::new();
    for i in 0..(SMALL_POOL_SIZE * 2) + 1 {
        if i % 2 != 0 {
            completions.push(None);
            let _ = pool.submit(|| -> usize { panic!("interleaved failure") });
        } else {
            let counter = Arc::clone(&counter);
            completions.push(Some(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
            })));
        }
    }

    for completion in completions.into_iter().flatten() {
        completion.wait().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), SMALL_POOL_SIZE + 1);
}

#[test]
fn drop_joins_in_flight_workers() {
    let counter = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));
    {
        let pool = ThreadPool::new(3).unwrap();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            let _ = pool.submit(move || {
                barrier.wait();
                std::thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // All three tasks are in flight once the barrier opens.
        barrier.wait();
    }
    // Drop returned, so the in-flight tasks ran to completion.
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}
