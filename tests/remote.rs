use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use mikomi::{AtomicCounter, Cluster, Config, Future, TaskAttributes, WorldError, callback};

fn cluster(size: usize) -> Cluster {
    Cluster::new(size, Config::new().workers(2)).unwrap()
}

#[test]
fn test_loopback_matches_local_add() {
    let cluster = cluster(2);
    let world = cluster.world(0);
    let add = cluster.register_task("add", |(a, b): (i32, i32)| a + b).unwrap();

    let input = Future::new();
    let local = world.taskq().add((input.clone(), Future::ready(1)), |(a, b)| a + b);
    let looped = world.taskq().add_on(0, &add, (input.clone(), Future::ready(1)));
    assert!(!looped.probe());

    input.set(41);
    assert_eq!(*local.get(), 42);
    assert_eq!(*looped.get(), 42);
}

#[test]
fn test_task_runs_on_destination() {
    let cluster = cluster(3);
    let whoami = cluster.register_task("whoami", |tag: String| {
        let name = std::thread::current().name().unwrap_or_default().to_string();
        format!("{tag}@{name}")
    })
    .unwrap();

    let taskq = cluster.world(0).taskq();
    let answers: Vec<_> = (0..3)
        .map(|dest| taskq.add_on(dest, &whoami, Future::ready(format!("t{dest}"))))
        .collect();

    for (dest, answer) in answers.iter().enumerate() {
        let answer = answer.get();
        assert!(answer.starts_with(&format!("t{dest}@mikomi-{dest}-")), "{answer}");
    }
}

#[test]
fn test_remote_results_feed_local_tasks() {
    let cluster = cluster(2);
    let square = cluster.register_task("square", |x: u64| x * x).unwrap();
    let taskq = cluster.world(0).taskq();

    let parts: Vec<_> = (1..=4u64)
        .map(|x| taskq.add_on_with(1, TaskAttributes::hipri(), &square, Future::ready(x)))
        .collect();
    let total = taskq.add(parts, |parts| parts.into_iter().sum::<u64>());

    assert_eq!(*total.get(), 1 + 4 + 9 + 16);
}

#[test]
fn test_remote_task_waits_on_remote_task() {
    let cluster = cluster(2);
    let hits = Arc::new(AtomicCounter::new(0));

    let counted = hits.clone();
    let leaf = cluster
        .register_task("leaf", move |x: i32| {
            counted.inc();
            x + 1
        })
        .unwrap();

    let middle = cluster.world(1).clone();
    let relay = cluster
        .register_task("relay", move |x: i32| {
            let back = middle.taskq().add_on(0, &leaf, Future::ready(x));
            *back.get() * 10
        })
        .unwrap();

    let result = cluster.world(0).taskq().add_on(1, &relay, Future::ready(5));
    assert_eq!(*result.get(), 60);
    assert_eq!(hits.load(), 1);
}

#[test]
fn test_fence_does_not_wait_for_remote_work() {
    let cluster = cluster(2);
    let slow = cluster
        .register_task("slow", |ms: u64| {
            std::thread::sleep(Duration::from_millis(ms));
            ms
        })
        .unwrap();

    let taskq = cluster.world(0).taskq();
    let result = taskq.add_on(1, &slow, Future::ready(30));
    taskq.fence();
    assert_eq!(taskq.size(), 0);
    assert_eq!(*result.get(), 30);

    cluster.fence();
}

#[test]
#[should_panic(expected = "contract violation")]
fn test_unready_argument_cannot_travel() {
    let cluster = cluster(2);
    let echo = cluster.register_task("echo", |x: u8| x).unwrap();
    let pending = Future::<u8>::new();
    cluster.world(0).taskq().add_on(1, &echo, pending);
}

#[test]
fn test_remote_task_panic_reaches_caller() {
    let cluster = cluster(2);
    let checked = cluster
        .register_task("checked", |x: i32| {
            assert!(x >= 0, "negative input {x}");
            x
        })
        .unwrap();

    let result = cluster.world(0).taskq().add_on(1, &checked, Future::ready(-4));
    let err = catch_unwind(AssertUnwindSafe(|| *result.get())).unwrap_err();
    let message = err.downcast_ref::<String>().cloned().unwrap_or_default();
    assert!(message.contains("negative input -4"), "{message}");
    assert!(result.is_failed());

    assert!(catch_unwind(AssertUnwindSafe(|| cluster.world(1).taskq().fence())).is_err());
}

#[test]
fn test_second_remote_set_is_reported() {
    let cluster = cluster(2);
    let (report, reports) = crossbeam_channel::unbounded();
    cluster.on_dispatch_error(move |rank, err| {
        let unknown = matches!(err, WorldError::UnknownSlot(_));
        report.send((rank, unknown)).unwrap();
    });

    let local = Future::<u8>::new();
    let proxy = Future::<u8>::from_remote(cluster.world(1), local.remote_ref(cluster.world(0)));
    local.set(1);
    proxy.set(2);

    let (rank, unknown) = reports.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rank, 0);
    assert!(unknown);
    assert_eq!(*local.get(), 1);
}

#[test]
fn test_handler_panic_is_reported() {
    let cluster = cluster(2);
    let (report, reports) = crossbeam_channel::unbounded();
    cluster.on_dispatch_error(move |rank, err| {
        report.send((rank, err.to_string())).unwrap();
    });

    let local = Future::<u8>::new();
    local.register_callback(callback(|| panic!("callback exploded")));
    let proxy = Future::<u8>::from_remote(cluster.world(1), local.remote_ref(cluster.world(0)));
    proxy.set(7);

    let (rank, err) = reports.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rank, 0);
    assert!(err.contains("callback exploded"), "{err}");
}
