#![allow(dead_code)]

use hyphae::{Config, Cx, TaskId, TaskQueue};
use std::sync::Arc;

pub fn trace_init() {
    use tracing_subscriber::{filter::LevelFilter, EnvFilter};
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}

/// Starts a runtime with a fixed spin calibration and a generous
/// stack-protection bound, so loaded test machines do not trip it.
pub fn init(max_tasks: usize) -> Cx {
    trace_init();
    let config = Config::new()
        .max_tasks(max_tasks)
        .yield_iters(100)
        .stack_wait_rounds(1_000_000);
    hyphae::init(config).expect("runtime should start")
}

/// Spawns `n` tasks suspended on a fresh queue, then resumes all of them
/// into the caller's own domain, where they wait to run in spawn order.
pub fn spawn_local<F>(cx: &Cx, n: usize, body: F) -> Vec<TaskId>
where
    F: Fn(&Cx, usize) -> i32 + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let queue = Arc::new(TaskQueue::new());
    let tasks = (0..n)
        .map(|i| {
            let body = body.clone();
            cx.build_task()
                .name(&format!("local-{i}"))
                .inactive(queue.clone())
                .spawn(move |cx| body(cx, i))
                .expect("spawn should succeed")
        })
        .collect::<Vec<_>>();
    let resumed = cx
        .dequeue_and_resume_n(&queue, Some(cx.id()), None)
        .expect("resume should succeed");
    assert_eq!(resumed, n);
    tasks
}

pub fn wait_all(cx: &Cx, tasks: impl IntoIterator<Item = TaskId>) -> Vec<i32> {
    tasks
        .into_iter()
        .map(|task| cx.wait(task).expect("wait should succeed"))
        .collect()
}
