//! Runtime Integration Tests
//!
//! End-to-end scenarios run through the public API only:
//! 1. Bounded concurrency with a semaphore around real sleeps
//! 2. Racing, structured supervision and fairness between fibers
//! 3. Fiber-local state, scoped resources and keyed daemons working together

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sable_runtime::{
    Effect, Exit, FiberRef, Managed, Never, ProcessMap, Promise, Queue, Runtime, RuntimeConfig,
    Semaphore, IO, UIO,
};

fn runtime(workers: usize) -> Runtime {
    Runtime::new(RuntimeConfig::builder().num_workers(workers).build_unchecked()).unwrap()
}

#[test]
fn semaphore_bounds_sleeping_tasks() {
    let rt = runtime(4);
    let sem = Semaphore::new(2);
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (inside_task, peak_task) = (inside.clone(), peak.clone());
    let effect: UIO<()> = Effect::foreach_par_(0..10u32, move |_| {
        let (enter, leave) = (inside_task.clone(), inside_task.clone());
        let peak = peak_task.clone();
        let critical = UIO::succeed_with(move || {
            let now = enter.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
        })
        .zip_right(UIO::<()>::sleep(Duration::from_millis(1000)))
        .zip_right(UIO::succeed_with(move || {
            leave.fetch_sub(1, Ordering::SeqCst);
        }));
        sem.with_permit(critical)
    });

    let started = Instant::now();
    rt.run_sync(effect).unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
    // Five rounds of two.
    assert!(started.elapsed() >= Duration::from_millis(5000));
}

#[test]
fn race_interrupts_the_loser() {
    let rt = runtime(2);
    let loser_interrupted = Arc::new(AtomicBool::new(false));
    let flag = loser_interrupted.clone();
    let left = UIO::<i32>::never().on_interrupt(UIO::succeed_with(move || {
        flag.store(true, Ordering::SeqCst);
    }));
    let effect = left.race_with(
        UIO::succeed(1),
        |_, _| Effect::succeed(-1),
        |winner, loser: Exit<Never, i32>| {
            assert!(loser.is_interrupted());
            Effect::done(winner)
        },
    );
    assert_eq!(rt.run_sync(effect).unwrap(), 1);
    // The loser's cleanup ran before the race completed.
    assert!(loser_interrupted.load(Ordering::SeqCst));
}

#[test]
fn timeout_releases_resources_of_the_slow_side() {
    let rt = runtime(2);
    let released = Arc::new(AtomicBool::new(false));
    let flag = released.clone();
    let slow = UIO::succeed(()).bracket(
        move |_| {
            let flag = flag.clone();
            UIO::succeed_with(move || flag.store(true, Ordering::SeqCst))
        },
        |_| UIO::<u8>::succeed(1).delay(Duration::from_secs(10)),
    );
    assert_eq!(rt.run_sync(slow.timeout(Duration::from_millis(20))).unwrap(), None);
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn parent_exit_interrupts_children() {
    let rt = runtime(2);
    let started = Promise::<Never, ()>::new();
    let child_interrupted = Arc::new(AtomicBool::new(false));
    let flag = child_interrupted.clone();
    let child = started
        .succeed(())
        .zip_right(UIO::<()>::never())
        .on_interrupt(UIO::succeed_with(move || flag.store(true, Ordering::SeqCst)));
    let parent = child.fork().zip_left(started.await_()).as_(7);
    assert_eq!(rt.run_sync(parent).unwrap(), 7);
    assert!(child_interrupted.load(Ordering::SeqCst));
}

#[test]
fn busy_fiber_does_not_starve_others() {
    fn spin(counter: Arc<AtomicUsize>) -> UIO<()> {
        let next = counter.clone();
        UIO::succeed_with(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .flat_map(move |_| spin(next.clone()))
    }

    let rt = runtime(1);
    let spins = Arc::new(AtomicUsize::new(0));
    let effect = spin(spins.clone()).fork().flat_map(|busy| {
        UIO::<()>::yield_now()
            .zip_right(UIO::succeed(42))
            .zip_left(busy.interrupt())
    });
    assert_eq!(rt.run_sync(effect).unwrap(), 42);
    assert!(spins.load(Ordering::Relaxed) > 0);
}

#[test]
fn deep_recursion_is_stack_safe() {
    fn count_down(n: u64, acc: u64) -> UIO<u64> {
        if n == 0 {
            UIO::succeed(acc)
        } else {
            UIO::succeed(n).flat_map(move |n| count_down(n - 1, acc + 1))
        }
    }

    let rt = runtime(1);
    assert_eq!(rt.run_sync(count_down(1_000_000, 0)).unwrap(), 1_000_000);
}

#[test]
fn fiber_refs_merge_on_join() {
    let rt = runtime(2);
    let effect = FiberRef::make_with(0u32, |n| *n, |parent, child| *parent.max(child))
        .flat_map(|counter| {
            let (reader, writer) = (counter.clone(), counter.clone());
            counter
                .set(3)
                .zip_right(writer.set(10).fork())
                .flat_map(|child| child.join())
                .zip_right(reader.get())
        });
    assert_eq!(rt.run_sync(effect).unwrap(), 10);
}

#[test]
fn managed_pool_feeds_a_queue() {
    let rt = runtime(4);
    let log = Arc::new(Mutex::new(Vec::new()));
    let (open_log, close_log) = (log.clone(), log.clone());
    let resource = Managed::make(
        Queue::<u32>::bounded(2).zip_left(UIO::succeed_with(move || {
            open_log.lock().push("open")
        })),
        move |queue: Queue<u32>| {
            let close_log = close_log.clone();
            queue
                .shutdown()
                .zip_right(UIO::succeed_with(move || close_log.lock().push("close")))
        },
    );
    let effect = resource.use_(|queue| {
        let (producer, consumer) = (queue.clone(), queue.clone());
        let produce = UIO::<()>::foreach_(1..=10u32, move |n| producer.offer(n));
        let consume = UIO::<Vec<u32>>::foreach(1..=10u32, move |_| consumer.take());
        produce.zip_par(consume).map(|(_, taken)| taken.iter().sum::<u32>())
    });
    assert_eq!(rt.run_sync(effect).unwrap(), 55);
    assert_eq!(*log.lock(), vec!["open", "close"]);
}

#[test]
fn process_map_keeps_one_fiber_per_key() {
    let rt = runtime(2);
    let processes = ProcessMap::<String>::new();
    let release = Promise::<Never, ()>::new();
    let first = rt
        .run_sync(processes.fork("sync".to_string(), release.await_().widen_err::<String>()))
        .unwrap();

    let duplicate = rt.run_sync_exit(processes.fork("sync".to_string(), IO::<String, ()>::unit()));
    assert!(duplicate.cause().is_some_and(|cause| cause.died()));

    release.try_complete(Exit::succeed(()));
    rt.run_sync(first.join()).unwrap();
    let second = rt
        .run_sync(processes.fork("sync".to_string(), IO::<String, ()>::unit()))
        .unwrap();
    rt.run_sync(second.join()).unwrap();
}

#[test]
fn run_promise_bridges_to_futures() {
    let rt = runtime(2);
    let future = rt.run_promise(IO::<String, u32>::succeed(5).delay(Duration::from_millis(5)));
    assert_eq!(futures::executor::block_on(future).unwrap(), 5);
}
