use std::sync::Arc;

use tracing::{debug, info_span, warn, Instrument};

use evalflow_domain::{
    run_status_for_task, AgentReportRequest, AgentReportResponse, ReportedRun, RunReportReceiver,
    SchedulerResult, StatusMachine, TaskRepository, TaskSnapshot,
};
use evalflow_infrastructure::{MetricsCollector, StructuredLogger};

use crate::agent_executor::AgentRunExecutor;

/// 处理 Agent 的周期上报：把任务快照转换为运行实例上报，并回复待运行与待取消的任务
pub struct AgentReportService {
    task_repo: Arc<dyn TaskRepository>,
    receiver: Arc<dyn RunReportReceiver>,
    executor: Arc<AgentRunExecutor>,
    metrics: Arc<MetricsCollector>,
}

impl AgentReportService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        receiver: Arc<dyn RunReportReceiver>,
        executor: Arc<AgentRunExecutor>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            task_repo,
            receiver,
            executor,
            metrics,
        }
    }

    pub async fn handle(&self, request: AgentReportRequest) -> AgentReportResponse {
        let serial = request.node.serial_number.clone();
        let span = info_span!("agent_report", agent = %serial, tasks = request.tasks.len());

        async {
            for snapshot in &request.tasks {
                if let Err(e) = self.apply_snapshot(&serial, snapshot).await {
                    warn!("处理任务 {} 的快照失败: {}", snapshot.id, e);
                }
            }

            let (triggers, cancels) = self.executor.take_for_agent(&request.node).await;
            self.metrics.record_agent_report(true);
            StructuredLogger::log_report_sent(
                &serial,
                request.tasks.len(),
                triggers.len(),
                cancels.len(),
            );
            AgentReportResponse::success(triggers, cancels)
        }
        .instrument(span)
        .await
    }

    /// 快照只作用于它所属的运行实例
    ///
    /// 任务已经换了新的运行实例（例如失败后重试），旧运行实例的快照即使被 Agent 重发，
    /// 也不会落到新的运行实例上。
    async fn apply_snapshot(&self, serial: &str, snapshot: &TaskSnapshot) -> SchedulerResult<()> {
        let Some(task) = self.task_repo.find_by_id(snapshot.id).await? else {
            warn!("Agent {} 上报了未知任务 {}", serial, snapshot.id);
            return Ok(());
        };
        if task.current_run != Some(snapshot.run_id) {
            debug!(
                "任务 {} 的快照属于运行实例 {}，当前运行实例为 {:?}，忽略",
                task.id, snapshot.run_id, task.current_run
            );
            if snapshot.status.is_final() {
                self.executor.release(task.id, snapshot.run_id).await;
            }
            return Ok(());
        }

        let run_id = snapshot.run_id;
        if self.executor.is_pending(run_id).await {
            warn!(
                "Agent {} 上报了尚未下发的运行实例 {} (任务 {})，忽略",
                serial, run_id, task.id
            );
            return Ok(());
        }
        self.executor.bind(task.id, run_id, serial).await;

        let report = ReportedRun {
            id: run_id,
            status: run_status_for_task(snapshot.status),
            ip: snapshot.ip.clone(),
            start_time: snapshot.start_time,
            finish_time: snapshot.stop_time,
            failed_reason: snapshot.failed_reason.clone(),
        };
        if let Err(e) = self.receiver.receive(report).await {
            warn!("任务 {} 的运行实例 {} 上报处理失败: {}", task.id, run_id, e);
        }

        if snapshot.status.is_final() {
            self.executor.release(task.id, run_id).await;
        }
        Ok(())
    }
}
