use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use evalflow_core::ControllerConfig;
use evalflow_domain::{SchedulerResult, TaskRepository};

use crate::job_service::JobService;

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 10,
            max_interval_seconds: 600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn from_controller(config: &ControllerConfig) -> Self {
        Self {
            base_interval_seconds: config.retry_backoff_seconds,
            ..Self::default()
        }
    }
}

/// 需要重试的任务
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRequest {
    pub task_id: i64,
    /// 已累计的重试次数，从 1 开始
    pub retry_num: u32,
}

/// 延迟后为失败的任务创建新的运行实例
///
/// 等待期间任务保持失败前的状态，重试不会让任务状态回退。
pub struct TaskRetryService {
    task_repo: Arc<dyn TaskRepository>,
    job_service: Arc<JobService>,
    config: RetryConfig,
}

impl TaskRetryService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        job_service: Arc<JobService>,
        config: RetryConfig,
    ) -> Self {
        Self {
            task_repo,
            job_service,
            config,
        }
    }

    pub fn channel() -> (
        mpsc::UnboundedSender<RetryRequest>,
        mpsc::UnboundedReceiver<RetryRequest>,
    ) {
        mpsc::unbounded_channel()
    }

    /// 指数退避加随机抖动，结果不小于基础间隔
    pub fn calculate_backoff(&self, retry_num: u32) -> Duration {
        let base_interval = self.config.base_interval_seconds as f64;
        let max_interval = self.config.max_interval_seconds as f64;
        let exponent = retry_num.saturating_sub(1).min(16) as i32;

        let exponential_interval = base_interval * self.config.backoff_multiplier.powi(exponent);
        let capped_interval = exponential_interval.min(max_interval);

        // 添加随机抖动以避免雷群效应
        let jitter =
            capped_interval * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).max(base_interval);

        Duration::from_secs_f64(final_interval)
    }

    /// 重新调度等待重试的任务
    ///
    /// 任务已结束（例如在等待期间被取消）或已有新的运行实例时跳过，返回 `false`。
    pub async fn retry(&self, task_id: i64) -> SchedulerResult<bool> {
        let Some(task) = self.task_repo.find_by_id(task_id).await? else {
            warn!("待重试的任务 {} 不存在", task_id);
            return Ok(false);
        };
        if !task.is_awaiting_retry() {
            debug!(
                "任务 {} 状态为 {:?}，当前运行实例 {:?}，跳过重试",
                task_id, task.status, task.current_run
            );
            return Ok(false);
        }

        info!("任务 {} 开始第 {} 次重试", task_id, task.retry_num);
        self.job_service.retry_task(&task).await
    }

    pub fn spawn(
        self: Arc<Self>,
        mut requests: mpsc::UnboundedReceiver<RetryRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = requests.recv() => {
                        let Some(request) = request else { break };
                        let delay = self.calculate_backoff(request.retry_num);
                        info!(
                            "任务 {} 将在 {:?} 后进行第 {} 次重试",
                            request.task_id, delay, request.retry_num
                        );
                        let service = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = service.retry(request.task_id).await {
                                warn!("任务 {} 重试失败: {}", request.task_id, e);
                            }
                        });
                    }
                    _ = shutdown.recv() => {
                        info!("重试服务收到关闭信号");
                        break;
                    }
                }
            }
        })
    }
}
