//! Random scheduling sequences across two domains, checking the queue and
//! stack-protection invariants after every step.
use super::*;
use crate::test_util::trace_init;
use proptest::{collection::vec, num::usize::ANY, test_runner::Config as ProptestConfig};
use std::{collections::HashMap, sync::atomic::AtomicBool};

const WORKERS: usize = 6;

#[derive(Debug)]
enum Op {
    Yield,
    Resume { queue: usize, local: bool },
    ResumeN { queue: usize, local: bool, n: usize },
    DequeueThenResume { queue: usize, local: bool },
    EnqueueRunnable { queue: usize, n: usize },
}

impl Op {
    fn from_raw(raw: usize) -> Self {
        let queue = (raw >> 3) & 1;
        let local = (raw >> 4) & 1 == 0;
        let n = (raw >> 5) % 4;
        match raw % 5 {
            0 => Op::Yield,
            1 => Op::Resume { queue, local },
            2 => Op::ResumeN { queue, local, n },
            3 => Op::DequeueThenResume { queue, local },
            _ => Op::EnqueueRunnable { queue, n },
        }
    }
}

proptest::proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn random_scheduling(ops in vec(ANY, 1..40), seed in ANY) {
        let ops = ops.into_iter().map(Op::from_raw).collect::<Vec<_>>();
        let _trace = trace_init();
        let _span = tracing::info_span!("random_scheduling").entered();
        tracing::info!(?ops, seed);
        run_ops(ops, seed as u64);
    }
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Checks, from a running task, that the task's own stack was released by
/// whoever switched away from it last.
fn check_self(cx: &Cx) {
    let task = cx.task();
    assert!(task.state.is_running(), "{} runs while suspended", cx.id());
    assert!(!task.stack.is_protected(), "{} runs on a protected stack", cx.id());
}

fn check_runtime(cx: &Cx, queues: &[Arc<TaskQueue>; 2], remote: TaskId) {
    let rt = &*cx.rt;
    check_self(cx);

    // public queues first: a task only moves from an inbox onto a public
    // queue by running, and only we move tasks the other way
    let mut seen = HashMap::<TaskId, usize>::new();
    for queue in queues {
        for id in queue.snapshot(&rt.tasks) {
            assert!(!rt.task(id).state.is_running(), "{id} is queued but running");
            *seen.entry(id).or_default() += 1;
        }
    }
    for domain in [cx.id(), remote] {
        for id in rt.task(domain).inbox.snapshot(&rt.tasks) {
            *seen.entry(id).or_default() += 1;
        }
    }
    // Safety: we are running in our own domain, as its executor.
    for id in unsafe { rt.task(cx.id()).run_queue.snapshot(&rt.tasks) } {
        let task = rt.task(id);
        assert!(task.state.is_running(), "{id} is runnable but suspended");
        assert_eq!(task.sched(), cx.id());
        *seen.entry(id).or_default() += 1;
    }
    for (id, count) in seen {
        assert_eq!(count, 1, "{id} is on {count} queues at once");
    }

    for task in rt.tasks.live() {
        let refcount = task.refcount.load(SeqCst);
        assert!(refcount >= 0, "{} has refcount {refcount}", task.id);
    }
}

fn run_ops(ops: Vec<Op>, seed: u64) {
    let cx = crate::init(
        Config::new()
            .max_tasks(WORKERS + 3)
            .yield_iters(10)
            .stack_wait_rounds(1_000_000),
    )
    .unwrap();
    let root = cx.id();
    let queues = [Arc::new(TaskQueue::new()), Arc::new(TaskQueue::new())];
    let stop = Arc::new(AtomicBool::new(false));

    let remote = {
        let stop = stop.clone();
        cx.build_task()
            .name("remote")
            .spawn(move |cx| {
                while !stop.load(SeqCst) {
                    if cx.yield_now() == Yield::Idle {
                        thread::yield_now();
                    }
                }
                0
            })
            .unwrap()
    };

    let start = Arc::new(TaskQueue::new());
    let workers = (0..WORKERS)
        .map(|i| {
            let (queues, stop) = (queues.clone(), stop.clone());
            let mut rng = xorshift(seed ^ (i as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)) | 1;
            cx.build_task()
                .name(&format!("worker-{i}"))
                .inactive(start.clone())
                .spawn(move |cx| {
                    while !stop.load(SeqCst) {
                        check_self(cx);
                        rng = xorshift(rng);
                        if rng % 3 == 0 {
                            let queue = &queues[(rng >> 8) as usize & 1];
                            cx.suspend_and_enqueue(queue).unwrap();
                        } else if cx.yield_now() == Yield::Idle {
                            thread::yield_now();
                        }
                    }
                    check_self(cx);
                    0
                })
                .unwrap()
        })
        .collect::<Vec<_>>();
    assert_eq!(cx.dequeue_and_resume_n(&start, Some(root), Some(WORKERS / 2)).unwrap(), WORKERS / 2);
    assert_eq!(cx.dequeue_and_resume_n(&start, Some(remote), None).unwrap(), WORKERS - WORKERS / 2);
    check_runtime(&cx, &queues, remote);

    for (i, op) in ops.iter().enumerate() {
        let _span = tracing::info_span!("op", i, ?op).entered();
        let into = |local: bool| Some(if local { root } else { remote });
        match *op {
            Op::Yield => {
                let _ = cx.yield_now();
            }
            Op::Resume { queue, local } => match cx.dequeue_and_resume(&queues[queue], into(local)) {
                Ok(_) | Err(Error::NoEntry) => {}
                Err(error) => panic!("resume failed: {error}"),
            },
            Op::ResumeN { queue, local, n } => {
                cx.dequeue_and_resume_n(&queues[queue], into(local), Some(n)).unwrap();
            }
            Op::DequeueThenResume { queue, local } => {
                if let Some(id) = queues[queue].dequeue(&cx).unwrap() {
                    cx.resume(id, into(local)).unwrap();
                }
            }
            Op::EnqueueRunnable { queue, n } => {
                cx.enqueue_runnable_n(&queues[queue], Some(n)).unwrap();
            }
        }
        check_runtime(&cx, &queues, remote);
    }

    // let everyone run to completion, back in the domain each left
    stop.store(true, SeqCst);
    while workers.iter().any(|&id| !cx.rt.task(id).state.is_exited()) {
        for queue in &queues {
            cx.dequeue_and_resume_n(queue, None, None).unwrap();
        }
        if cx.yield_now() == Yield::Idle {
            thread::yield_now();
        }
    }
    for id in workers {
        assert_eq!(cx.wait(id).unwrap(), 0, "worker {id} failed");
    }
    assert_eq!(cx.wait(remote).unwrap(), 0);
    check_runtime(&cx, &queues, remote);
}
