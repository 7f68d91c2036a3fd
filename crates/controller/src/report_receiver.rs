//! 运行实例状态上报的对账
//!
//! 同一运行实例的上报通过行锁串行处理，不同运行实例之间可以并行。
//! 上报中的每个字段独立合并：状态需要经过状态机校验，非法转换只丢弃状态字段，
//! 其余非空字段照常写入。没有任何字段变化时既不写库也不通知监听器。

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, error, info_span, warn, Instrument};

use evalflow_domain::{
    ReceiveOutcome, ReportedRun, Run, RunReportReceiver, RunRepository, RunUpdateListener,
    SchedulerResult, StatusMachine,
};
use evalflow_infrastructure::{MetricsCollector, StructuredLogger};

/// 单次合并的结果
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct MergeResult {
    changed: bool,
    status_changed: bool,
    status_rejected: bool,
}

/// 按 开始时间 → 状态 → 结束时间 → 其余字段 的顺序合并上报
fn merge_report(run: &mut Run, report: &ReportedRun) -> MergeResult {
    let mut result = MergeResult::default();

    if let Some(start_time) = report.start_time {
        if run.start_time != Some(start_time) {
            run.start_time = Some(start_time);
            result.changed = true;
        }
    }

    if let Some(status) = report.status {
        if status != run.status {
            match run.status.next(status) {
                Some(next) => {
                    run.status = next;
                    result.changed = true;
                    result.status_changed = true;
                }
                None => {
                    result.status_rejected = true;
                    StructuredLogger::log_transition_rejected(
                        "run",
                        run.id,
                        &format!("{:?}", run.status),
                        &format!("{status:?}"),
                    );
                }
            }
        }
    }

    if let Some(finish_time) = report.finish_time {
        if run.finish_time != Some(finish_time) {
            run.finish_time = Some(finish_time);
            result.changed = true;
        }
    }

    if let Some(ip) = &report.ip {
        if run.ip.as_ref() != Some(ip) {
            run.ip = Some(ip.clone());
            result.changed = true;
        }
    }

    if let Some(reason) = &report.failed_reason {
        if run.failed_reason.as_ref() != Some(reason) {
            run.failed_reason = Some(reason.clone());
            result.changed = true;
        }
    }

    result
}

pub struct RunReportService {
    run_repo: Arc<dyn RunRepository>,
    listeners: RwLock<Vec<Arc<dyn RunUpdateListener>>>,
    metrics: Arc<MetricsCollector>,
}

impl RunReportService {
    pub fn new(run_repo: Arc<dyn RunRepository>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            run_repo,
            listeners: RwLock::new(Vec::new()),
            metrics,
        }
    }

    pub async fn register_listener(&self, listener: Arc<dyn RunUpdateListener>) {
        self.listeners.write().await.push(listener);
    }

    async fn notify(&self, run: &Run) -> SchedulerResult<()> {
        let listeners = self.listeners.read().await.clone();
        let mut first_error = None;
        for listener in listeners {
            if let Err(e) = listener.on_run_updated(run).await {
                error!("运行实例 {} 的更新通知处理失败: {}", run.id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn apply(&self, report: ReportedRun) -> SchedulerResult<ReceiveOutcome> {
        self.metrics.record_report_received();

        let Some(mut run) = self.run_repo.lock_for_update(report.id).await? else {
            warn!("收到未知运行实例 {} 的上报，已丢弃", report.id);
            self.metrics.record_report_unknown_run();
            return Ok(ReceiveOutcome::UnknownRun);
        };

        let merged = merge_report(&mut run, &report);
        if merged.status_rejected {
            self.metrics.record_transition_rejected("run");
        }
        if !merged.changed {
            debug!("运行实例 {} 的上报没有变化", report.id);
            self.metrics.record_report_unchanged();
            return Ok(ReceiveOutcome::Unchanged);
        }

        self.run_repo.update(&run).await?;
        StructuredLogger::log_run_report_applied(
            run.id,
            Some(format!("{:?}", run.status).as_str()),
            merged.status_changed,
            merged.status_rejected,
        );

        // 持有行锁通知，保证监听器按上报顺序观察到同一运行实例的变化
        self.notify(&run).await?;

        Ok(ReceiveOutcome::Applied {
            status_changed: merged.status_changed,
            status_rejected: merged.status_rejected,
        })
    }
}

#[async_trait]
impl RunReportReceiver for RunReportService {
    async fn receive(&self, report: ReportedRun) -> SchedulerResult<ReceiveOutcome> {
        let started = Instant::now();
        let span = info_span!("run_report", run.id = report.id);
        let outcome = self.apply(report).instrument(span).await;
        self.metrics
            .record_report_apply_duration(started.elapsed().as_secs_f64());
        outcome
    }
}
