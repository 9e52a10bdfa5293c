//! 周期任务调度（Scheduler）
//!
//! 以 `tokio::time::interval` 驱动的命名周期任务，多个任务之间互不阻塞：
//! - `spawn_periodic`：同一任务的相邻 tick 不重叠，错过的 tick 直接跳过；
//! - `spawn_detached_periodic`：每个 tick 独立 spawn，计时器不等待 tick 结束，
//!   一个卡住的 tick 不会阻止后续 tick；
//! - 取消只停止计时器，正在执行的 tick 总会跑完；
//! - 单个 tick panic 会被捕获并记录，任务在下一个 tick 继续运行。
//!
use futures_util::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, time::Duration};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

// tokio 的 interval 不接受零周期
const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct Scheduler {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: Vec::new(),
        }
    }

    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut f: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let period = period.max(MIN_PERIOD);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if AssertUnwindSafe(f()).catch_unwind().await.is_err() {
                            error!(task = name, "periodic task panicked");
                        }
                    }
                }
            }

            debug!(task = name, "periodic task stopped");
        }));
    }

    /// 计时器与 tick 解耦：到点即 spawn 新 tick，不等待上一个 tick 完成
    ///
    /// 调用方自行保证重叠的 tick 互不冲突。
    pub fn spawn_detached_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        period: Duration,
        mut f: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let period = period.max(MIN_PERIOD);

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut running = JoinSet::new();

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        while let Some(done) = running.try_join_next() {
                            if let Err(err) = done
                                && err.is_panic()
                            {
                                error!(task = name, "periodic task panicked");
                            }
                        }
                        if !running.is_empty() {
                            debug!(
                                task = name,
                                running = running.len(),
                                "previous ticks still running"
                            );
                        }
                        running.spawn(f());
                    }
                }
            }

            // 丢弃 JoinSet 会中止其中的任务，进行中的 tick 需要跑完
            running.detach_all();
            debug!(task = name, "periodic task stopped");
        }));
    }

    pub fn into_handle(self) -> SchedulerHandle {
        SchedulerHandle {
            token: self.token,
            tasks: self.tasks,
        }
    }
}

/// 调度句柄：用于停止与等待周期任务结束
pub struct SchedulerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread")]
    async fn periodic_task_ticks_until_shutdown() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(CancellationToken::new());
        {
            let ticks = ticks.clone();
            scheduler.spawn_periodic("counter", Duration::from_millis(10), move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let handle = scheduler.into_handle();

        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while ticks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        handle.shutdown();
        assert!(handle.is_shutdown());
        handle.join().await;

        let after = ticks.load(Ordering::SeqCst);
        assert!(after >= 3);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_tick_does_not_stop_the_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(CancellationToken::new());
        {
            let ticks = ticks.clone();
            scheduler.spawn_periodic("panicky", Duration::from_millis(10), move || {
                let ticks = ticks.clone();
                async move {
                    if ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first tick explodes");
                    }
                }
            });
        }
        let handle = scheduler.into_handle();

        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while ticks.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hung_detached_tick_does_not_block_later_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(CancellationToken::new());
        {
            let ticks = ticks.clone();
            let finished = finished.clone();
            scheduler.spawn_detached_periodic("hung", Duration::from_millis(10), move || {
                let ticks = ticks.clone();
                let finished = finished.clone();
                async move {
                    if ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                        std::future::pending::<()>().await;
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let handle = scheduler.into_handle();

        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while finished.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("timer stops even though one tick never returns");

        assert!(finished.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelling_parent_token_stops_tasks() {
        let parent = CancellationToken::new();
        let mut scheduler = Scheduler::new(parent.child_token());
        scheduler.spawn_periodic("idle", Duration::from_millis(10), || async {});
        let handle = scheduler.into_handle();

        parent.cancel();
        assert!(handle.is_shutdown());
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("tasks stop after parent cancellation");
    }
}
