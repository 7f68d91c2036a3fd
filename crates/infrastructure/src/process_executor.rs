//! 本地进程执行器
//!
//! 每个运行实例对应一个子进程，标准输出与标准错误写入 `log_dir`。
//! 子进程启动后先上报 RUNNING，退出后按退出码上报 FINISHED 或 FAILED，被停止时上报 CANCELED。

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};

use evalflow_domain::{
    ExecOutput, ReportedRun, Run, RunExecutor, RunReportReceiver, RunStatus, SchedulerError,
    SchedulerResult,
};

pub struct ProcessRunExecutor {
    host_ip: String,
    running: Arc<Mutex<HashMap<i64, oneshot::Sender<()>>>>,
}

impl ProcessRunExecutor {
    pub fn new(host_ip: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    async fn open_log(log_dir: &str, name: &str) -> SchedulerResult<Stdio> {
        let file = tokio::fs::File::create(Path::new(log_dir).join(name)).await?;
        Ok(Stdio::from(file.into_std().await))
    }

    async fn spawn(run: &Run) -> SchedulerResult<Child> {
        let (program, args) = run
            .run_spec
            .command
            .split_first()
            .ok_or_else(|| SchedulerError::executor(format!("运行实例 {} 没有启动命令", run.id)))?;

        tokio::fs::create_dir_all(&run.log_dir).await?;
        let stdout = Self::open_log(&run.log_dir, "stdout.log").await?;
        let stderr = Self::open_log(&run.log_dir, "stderr.log").await?;

        Command::new(program)
            .args(args)
            .envs(&run.run_spec.envs)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SchedulerError::executor(format!("启动运行实例 {} 失败: {e}", run.id)))
    }
}

async fn deliver(receiver: &Arc<dyn RunReportReceiver>, report: ReportedRun) {
    let run_id = report.id;
    if let Err(e) = receiver.receive(report).await {
        warn!("运行实例 {} 的状态上报处理失败: {}", run_id, e);
    }
}

#[async_trait]
impl RunExecutor for ProcessRunExecutor {
    async fn run(&self, run: &Run, receiver: Arc<dyn RunReportReceiver>) -> SchedulerResult<()> {
        let mut child = Self::spawn(run).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        self.running.lock().await.insert(run.id, stop_tx);

        let run_id = run.id;
        let host_ip = self.host_ip.clone();
        let running = self.running.clone();
        info!("运行实例 {} 已启动本地进程 {:?}", run_id, child.id());

        tokio::spawn(async move {
            deliver(
                &receiver,
                ReportedRun::status(run_id, RunStatus::Running)
                    .with_ip(host_ip)
                    .with_start_time(Utc::now()),
            )
            .await;

            let report = tokio::select! {
                exit = child.wait() => match exit {
                    Ok(status) if status.success() => ReportedRun::status(run_id, RunStatus::Finished),
                    Ok(status) => ReportedRun::status(run_id, RunStatus::Failed)
                        .with_failed_reason(format!("进程退出: {status}")),
                    Err(e) => ReportedRun::status(run_id, RunStatus::Failed)
                        .with_failed_reason(format!("等待进程失败: {e}")),
                },
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        warn!("终止运行实例 {} 的进程失败: {}", run_id, e);
                    }
                    ReportedRun::status(run_id, RunStatus::Canceled)
                }
            };

            running.lock().await.remove(&run_id);
            deliver(&receiver, report.with_finish_time(Utc::now())).await;
        });

        Ok(())
    }

    async fn stop(&self, run: &Run) -> SchedulerResult<()> {
        match self.running.lock().await.remove(&run.id) {
            Some(stop_tx) => {
                // 进程可能恰好已退出，此时接收端已被丢弃
                let _ = stop_tx.send(());
                info!("已请求停止运行实例 {}", run.id);
            }
            None => debug!("运行实例 {} 没有正在运行的进程", run.id),
        }
        Ok(())
    }

    async fn exec(&self, run: &Run, command: &[String]) -> SchedulerResult<ExecOutput> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SchedulerError::executor("exec 命令为空"))?;

        let output = Command::new(program)
            .args(args)
            .envs(&run.run_spec.envs)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SchedulerError::executor(format!("执行命令失败: {e}")))?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use evalflow_domain::{ReceiveOutcome, RunSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingReceiver {
        reports: Mutex<Vec<ReportedRun>>,
    }

    #[async_trait]
    impl RunReportReceiver for RecordingReceiver {
        async fn receive(&self, report: ReportedRun) -> SchedulerResult<ReceiveOutcome> {
            self.reports.lock().await.push(report);
            Ok(ReceiveOutcome::Applied {
                status_changed: true,
                status_rejected: false,
            })
        }
    }

    fn run(id: i64, log_dir: &Path, command: &[&str]) -> Run {
        let mut run = Run::new(
            1,
            log_dir.to_string_lossy().into_owned(),
            RunSpec {
                image: "local".to_string(),
                command: command.iter().map(|s| s.to_string()).collect(),
                envs: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
                resource_pool: "default".to_string(),
                requested_resources: vec![],
            },
        );
        run.id = id;
        run
    }

    async fn wait_for_reports(receiver: &RecordingReceiver, count: usize) -> Vec<ReportedRun> {
        for _ in 0..100 {
            let reports = receiver.reports.lock().await.clone();
            if reports.len() >= count {
                return reports;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        receiver.reports.lock().await.clone()
    }

    #[tokio::test]
    async fn test_successful_process_reports_running_then_finished() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessRunExecutor::new("127.0.0.1");
        let receiver = Arc::new(RecordingReceiver::default());

        executor
            .run(&run(1, dir.path(), &["true"]), receiver.clone())
            .await
            .unwrap();

        let reports = wait_for_reports(&receiver, 2).await;
        assert_eq!(reports[0].status, Some(RunStatus::Running));
        assert_eq!(reports[0].ip.as_deref(), Some("127.0.0.1"));
        assert!(reports[0].start_time.is_some());
        assert_eq!(reports[1].status, Some(RunStatus::Finished));
        assert!(reports[1].finish_time.is_some());
    }

    #[tokio::test]
    async fn test_failing_process_reports_failed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessRunExecutor::new("127.0.0.1");
        let receiver = Arc::new(RecordingReceiver::default());

        executor
            .run(&run(2, dir.path(), &["false"]), receiver.clone())
            .await
            .unwrap();

        let reports = wait_for_reports(&receiver, 2).await;
        assert_eq!(reports[1].status, Some(RunStatus::Failed));
        assert!(reports[1].failed_reason.is_some());
    }

    #[tokio::test]
    async fn test_stop_reports_canceled() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessRunExecutor::new("127.0.0.1");
        let receiver = Arc::new(RecordingReceiver::default());
        let run = run(3, dir.path(), &["sleep", "30"]);

        executor.run(&run, receiver.clone()).await.unwrap();
        wait_for_reports(&receiver, 1).await;
        executor.stop(&run).await.unwrap();

        let reports = wait_for_reports(&receiver, 2).await;
        assert_eq!(reports[1].status, Some(RunStatus::Canceled));
        assert_eq!(executor.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessRunExecutor::new("127.0.0.1");
        let receiver = Arc::new(RecordingReceiver::default());
        let result = executor.run(&run(4, dir.path(), &[]), receiver).await;
        assert!(matches!(result, Err(SchedulerError::Executor(_))));
    }

    #[tokio::test]
    async fn test_exec_uses_run_envs() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessRunExecutor::new("127.0.0.1");
        let output = executor
            .exec(
                &run(5, dir.path(), &["true"]),
                &["sh".to_string(), "-c".to_string(), "echo $GREETING".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout.trim(), "hello");
    }
}
