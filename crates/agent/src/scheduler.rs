use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, info_span, Instrument};

use evalflow_core::AgentConfig;

use crate::dispatcher::TaskDispatcher;

/// 各 tick 的触发间隔
#[derive(Debug, Clone, Copy)]
pub struct TickIntervals {
    pub preparing: Duration,
    pub monitor: Duration,
    pub upload: Duration,
    pub report: Duration,
}

impl From<&AgentConfig> for TickIntervals {
    fn from(config: &AgentConfig) -> Self {
        Self {
            preparing: Duration::from_millis(config.preparing_interval_ms),
            monitor: Duration::from_millis(config.monitor_interval_ms),
            upload: Duration::from_millis(config.upload_interval_ms),
            report: Duration::from_millis(config.report_interval_ms),
        }
    }
}

/// 以独立定时器驱动派发循环的四个 tick
pub struct AgentScheduler;

impl AgentScheduler {
    pub fn start(
        dispatcher: Arc<TaskDispatcher>,
        intervals: TickIntervals,
        shutdown: &broadcast::Receiver<()>,
    ) -> Vec<JoinHandle<()>> {
        vec![
            Self::spawn_loop("preparing", intervals.preparing, shutdown.resubscribe(), {
                let dispatcher = dispatcher.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        dispatcher.deal_preparing_tasks().await;
                    }
                }
            }),
            Self::spawn_loop("monitor", intervals.monitor, shutdown.resubscribe(), {
                let dispatcher = dispatcher.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.monitor_running_tasks().await }
                }
            }),
            Self::spawn_loop("upload", intervals.upload, shutdown.resubscribe(), {
                let dispatcher = dispatcher.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    async move { dispatcher.upload_task_results().await }
                }
            }),
            Self::spawn_loop("report", intervals.report, shutdown.resubscribe(), {
                let dispatcher = dispatcher.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    async move {
                        dispatcher.report_tasks().await;
                    }
                }
            }),
        ]
    }

    fn spawn_loop<F, Fut>(
        name: &'static str,
        period: Duration,
        mut shutdown: broadcast::Receiver<()>,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().instrument(info_span!("agent_tick", tick = name)).await,
                    _ = shutdown.recv() => {
                        info!("{} tick 收到关闭信号", name);
                        break;
                    }
                }
            }
        })
    }
}
