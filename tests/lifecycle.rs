use hyphae::{Error, SyncPolicy, TaskId, TaskQueue};
use std::{sync::Arc, thread, time::Duration};

mod util;
use util::{init, spawn_local, wait_all};

#[test]
fn exit_status_is_observed() {
    let cx = init(4);
    let task = cx
        .spawn(|cx| {
            fn bail(cx: &hyphae::Cx) -> ! {
                cx.exit(42)
            }
            bail(cx)
        })
        .unwrap();
    assert_eq!(cx.wait(task).unwrap(), 42);
}

#[test]
fn returned_and_panicked_status() {
    let cx = init(4);
    let ok = cx.spawn(|_| 3).unwrap();
    let panicked = cx
        .build_task()
        .name("panicky")
        .spawn(|_| panic!("task body panicked on purpose"))
        .unwrap();
    assert_eq!(wait_all(&cx, [ok, panicked]), [3, 101]);
}

#[test]
fn wait_errors() {
    let cx = init(4);
    assert!(matches!(cx.wait(TaskId::ROOT), Err(Error::InvalidArgument)));
    assert!(matches!(cx.try_wait(TaskId::from(3)), Err(Error::InvalidArgument)));

    let task = cx
        .spawn(|cx| match cx.wait(cx.id()) {
            Err(Error::InvalidArgument) => 0,
            _ => 1,
        })
        .unwrap();
    assert_eq!(cx.wait(task).unwrap(), 0);
    // the slot has been released
    assert!(matches!(cx.wait(task), Err(Error::InvalidArgument)));
}

#[test]
fn try_wait_does_not_block() {
    let cx = init(4);
    let queue = Arc::new(TaskQueue::new());
    let task = cx.build_task().inactive(queue.clone()).spawn(|_| 5).unwrap();

    assert_eq!(cx.try_wait(task).unwrap(), None);
    let info = cx.info(task).unwrap();
    assert!(!info.running);
    assert!(!info.exited);
    assert_eq!(info.refcount, 1, "suspended in its own domain");

    cx.dequeue_and_resume(&queue, None).unwrap();
    let status = loop {
        if let Some(status) = cx.try_wait(task).unwrap() {
            break status;
        }
        thread::yield_now();
    };
    assert_eq!(status, 5);
}

#[test]
fn arena_overflow() {
    let cx = init(3);
    let queue = Arc::new(TaskQueue::new());
    let a = cx.build_task().inactive(queue.clone()).spawn(|_| 0).unwrap();
    let b = cx.build_task().inactive(queue.clone()).spawn(|_| 0).unwrap();
    assert!(matches!(cx.spawn(|_| 0), Err(Error::Overflow)));

    assert_eq!(cx.dequeue_and_resume_n(&queue, None, None).unwrap(), 2);
    assert_eq!(wait_all(&cx, [a, b]), [0, 0]);
    let c = cx.spawn(|_| 1).unwrap();
    assert_eq!(cx.wait(c).unwrap(), 1);
}

#[test]
fn builder_settings_are_visible() {
    let cx = init(4);
    let queue = Arc::new(TaskQueue::new());
    let task = cx
        .build_task()
        .name("named")
        .sync_policy(SyncPolicy::Blocking)
        .inactive(queue.clone())
        .spawn(|cx| cx.sync_policy() as i32)
        .unwrap();

    let info = cx.info(task).unwrap();
    assert_eq!(info.name.as_deref(), Some("named"));
    assert_eq!(info.sync_policy, SyncPolicy::Blocking);
    assert_eq!(info.domain, task);

    cx.dequeue_and_resume(&queue, None).unwrap();
    assert_eq!(cx.wait(task).unwrap(), SyncPolicy::Blocking as i32);
}

#[test]
fn adopted_tasks_run_in_the_new_domain() {
    let cx = init(8);
    let queue = Arc::new(TaskQueue::new());
    let guests = (0..2)
        .map(|_| {
            cx.build_task()
                .inactive(queue.clone())
                .spawn(|cx| cx.domain().as_u32() as i32)
                .unwrap()
        })
        .collect::<Vec<_>>();

    let host = cx
        .build_task()
        .adopt(queue.clone())
        .spawn(|cx| cx.count_runnable() as i32)
        .unwrap();
    assert!(queue.is_empty());

    let host_id = host.as_u32() as i32;
    assert_eq!(wait_all(&cx, guests), [host_id, host_id]);
    assert_eq!(cx.wait(host).unwrap(), 2);
}

#[test]
fn domain_outlives_its_dependents() {
    let cx = init(8);
    let hold = Arc::new(TaskQueue::new());

    let domain = {
        let hold = hold.clone();
        cx.spawn(move |cx| {
            let start = Arc::new(TaskQueue::new());
            let hold = hold.clone();
            cx.build_task()
                .inactive(start.clone())
                .spawn(move |cx| {
                    cx.suspend_and_enqueue(&hold).unwrap();
                    0
                })
                .unwrap();
            cx.dequeue_and_resume(&start, Some(cx.id())).unwrap();
            // run the dependent until it suspends on `hold`
            assert!(cx.yield_now().is_interrupted());
            9
        })
        .unwrap()
    };

    // the domain asks to exit while its dependent is still suspended
    loop {
        let info = cx.info(domain).unwrap();
        if info.exit_requested && hold.len() == 1 {
            break;
        }
        thread::yield_now();
    }
    thread::sleep(Duration::from_millis(20));
    let info = cx.info(domain).unwrap();
    assert_eq!(info.refcount, 1);
    assert!(!info.exited, "a domain may not terminate with dependents");
    assert_eq!(cx.try_wait(domain).unwrap(), None);

    // nothing new may be sent to an exiting domain
    assert!(matches!(
        cx.dequeue_and_resume(&hold, Some(domain)),
        Err(Error::Busy)
    ));

    // a task that is already runnable is refused for that, whatever the
    // state of the domain it is offered to
    let local = spawn_local(&cx, 1, |_, _| 0);
    assert!(matches!(
        cx.resume(local[0], Some(domain)),
        Err(Error::PermissionDenied)
    ));

    let dependent = cx.dequeue_and_resume(&hold, None).unwrap();
    assert_eq!(cx.wait(dependent).unwrap(), 0);
    assert_eq!(cx.wait(domain).unwrap(), 9);
    assert_eq!(wait_all(&cx, local), [0]);
}

#[test]
fn many_tasks_many_domains() {
    let cx = init(64);
    let tasks = (0..48)
        .map(|i| {
            let policy = match i % 4 {
                0 => SyncPolicy::Auto,
                1 => SyncPolicy::BusyWait,
                2 => SyncPolicy::Yield,
                _ => SyncPolicy::Blocking,
            };
            cx.build_task()
                .sync_policy(policy)
                .spawn(move |cx| {
                    for _ in 0..10 {
                        let _ = cx.yield_now();
                    }
                    i
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    assert_eq!(wait_all(&cx, tasks), (0..48).collect::<Vec<_>>());
}

#[test]
fn wait_any_collects_each_task_once() {
    let cx = init(8);
    assert_eq!(cx.max_tasks(), 7);
    assert_eq!(cx.task_count(), 0);
    assert!(matches!(cx.try_wait_any(), Err(Error::NoChild)));
    assert!(matches!(cx.wait_any(), Err(Error::NoChild)));

    let tasks = (0..3)
        .map(|i| cx.spawn(move |_| 10 + i).unwrap())
        .collect::<Vec<_>>();
    assert_eq!(cx.task_count(), 3);

    let mut reaped = (0..3).map(|_| cx.wait_any().unwrap()).collect::<Vec<_>>();
    reaped.sort_unstable();
    let expected = tasks.iter().copied().zip(10..).collect::<Vec<_>>();
    assert_eq!(reaped, expected);
    assert_eq!(cx.task_count(), 0);
    assert!(matches!(cx.wait_any(), Err(Error::NoChild)));
}

#[test]
fn try_wait_any_does_not_block() {
    let cx = init(4);
    let queue = Arc::new(TaskQueue::new());
    let task = cx.build_task().inactive(queue.clone()).spawn(|_| 4).unwrap();
    assert_eq!(cx.try_wait_any().unwrap(), None);

    cx.dequeue_and_resume(&queue, None).unwrap();
    assert_eq!(cx.wait_any().unwrap(), (task, 4));
    assert!(matches!(cx.try_wait_any(), Err(Error::NoChild)));
}

#[test]
fn wait_any_skips_the_root_and_the_caller() {
    let cx = init(4);
    let waiter = cx
        .spawn(|cx| match cx.try_wait_any() {
            Err(Error::NoChild) => 0,
            _ => 1,
        })
        .unwrap();
    assert_eq!(cx.wait(waiter).unwrap(), 0);
}

#[test]
fn aux_values_are_per_task() {
    let cx = init(4);
    assert!(cx.aux::<u32>(None).unwrap().is_none());
    cx.set_aux(None, 7u32).unwrap();
    assert_eq!(cx.aux::<u32>(None).unwrap().as_deref(), Some(&7));
    // a value of another type reads as nothing
    assert!(cx.aux::<String>(None).unwrap().is_none());

    let queue = Arc::new(TaskQueue::new());
    let task = cx
        .build_task()
        .inactive(queue.clone())
        .spawn(|cx| {
            let root = cx.aux::<u32>(Some(TaskId::ROOT)).unwrap().map_or(0, |v| *v);
            let mine = cx.aux::<String>(None).unwrap().map_or(0, |s| s.len() as u32);
            (root * 100 + mine) as i32
        })
        .unwrap();
    cx.set_aux(Some(task), "hello".to_owned()).unwrap();
    assert!(cx.aux::<u32>(Some(task)).unwrap().is_none());

    cx.dequeue_and_resume(&queue, None).unwrap();
    assert_eq!(cx.wait(task).unwrap(), 705);
    assert!(matches!(cx.aux::<String>(Some(task)), Err(Error::InvalidArgument)));
    assert!(matches!(
        cx.set_aux(Some(TaskId::from(3)), 1u8),
        Err(Error::InvalidArgument)
    ));
}

#[test]
fn waiting_domain_still_runs_late_arrivals() {
    let cx = init(8);
    let root = cx.id();
    let queue = Arc::new(TaskQueue::new());
    let late = cx
        .build_task()
        .inactive(queue.clone())
        .spawn(|cx| cx.domain().as_u32() as i32)
        .unwrap();

    let waker = cx
        .spawn(move |cx| {
            // give the root time to run out of work and park in `wait`
            thread::sleep(Duration::from_millis(20));
            cx.dequeue_and_resume(&queue, Some(root)).unwrap();
            while !cx.info(late).unwrap().exited {
                thread::yield_now();
            }
            0
        })
        .unwrap();

    assert_eq!(cx.wait(waker).unwrap(), 0);
    assert_eq!(cx.wait(late).unwrap(), root.as_u32() as i32);
}
