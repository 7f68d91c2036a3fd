use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use evalflow_controller::{
    AgentRunExecutor, ControllerServices, ExecutorChoice, JobRequest, Repositories, StepRequest,
};
use evalflow_core::{ControllerConfig, ExecutorKind};
use evalflow_domain::{
    AgentReportRequest, Device, DeviceClass, DeviceRequest, JobRuntime, JobStatus, NodeInfo,
    ResponseCode, RunRepository, RunStatus, TaskRepository, TaskSnapshot, TaskStatus,
};

async fn services() -> ControllerServices {
    services_with(ControllerConfig {
        executor: ExecutorKind::Agent,
        ..ControllerConfig::default()
    })
    .await
}

async fn services_with(config: ControllerConfig) -> ControllerServices {
    let repositories = Repositories::in_memory();
    let executor = Arc::new(AgentRunExecutor::new(
        repositories.tasks.clone(),
        repositories.jobs.clone(),
    ));
    ControllerServices::build_with(&config, repositories, ExecutorChoice::Agent(executor))
        .await
        .unwrap()
}

fn gpu_job() -> JobRequest {
    JobRequest {
        name: "gsm8k".to_string(),
        runtime: JobRuntime {
            image: "registry.local/eval:2.0".to_string(),
            command: vec!["python".to_string(), "run.py".to_string()],
            envs: BTreeMap::new(),
            device_class: DeviceClass::Gpu,
            device_amount: 1,
            dataset_uris: vec!["s3://datasets/gsm8k".to_string()],
            model_uri: Some("s3://models/qwen".to_string()),
        },
        steps: vec![StepRequest {
            name: "infer".to_string(),
            resource_pool: None,
            task_num: 1,
            concurrency: None,
            resources: vec![],
        }],
    }
}

fn report(tasks: Vec<TaskSnapshot>) -> AgentReportRequest {
    AgentReportRequest {
        node: NodeInfo {
            serial_number: "node-1".to_string(),
            host_address: "10.0.0.21".to_string(),
            memory_mb: 65_536,
            devices: vec![
                Device::cpu("cpu-0"),
                Device::cpu("cpu-1"),
                Device::gpu("0", "A100", "535.104"),
            ],
        },
        tasks,
    }
}

fn snapshot(id: i64, run_id: i64, status: TaskStatus) -> TaskSnapshot {
    TaskSnapshot {
        id,
        run_id,
        status,
        retry_num: 0,
        ip: Some("10.0.0.21".to_string()),
        start_time: Some(Utc::now()),
        stop_time: status_is_final(status).then(Utc::now),
        failed_reason: None,
    }
}

fn status_is_final(status: TaskStatus) -> bool {
    matches!(
        status,
        TaskStatus::Finished | TaskStatus::Canceled | TaskStatus::Error
    )
}

#[tokio::test]
async fn test_agent_receives_trigger_and_reports_completion() {
    let services = services().await;
    let reports = services.agent_reports.clone().unwrap();
    let job = services.job_service.create_job(gpu_job()).await.unwrap();

    let response = reports.handle(report(vec![])).await;
    assert_eq!(response.code, ResponseCode::Success);
    assert_eq!(response.tasks_to_run.len(), 1);
    let trigger = &response.tasks_to_run[0];
    assert_eq!(trigger.devices, DeviceRequest::new(1, 1));
    assert_eq!(trigger.model_uri.as_deref(), Some("s3://models/qwen"));

    // 已下发的任务不会重复下发
    let response = reports
        .handle(report(vec![snapshot(trigger.task_id, trigger.run_id, TaskStatus::Running)]))
        .await;
    assert!(response.tasks_to_run.is_empty());

    let detail = services.job_service.describe_job(job.id).await.unwrap();
    assert_eq!(detail.tasks[0].status, TaskStatus::Running);
    assert_eq!(detail.tasks[0].ip.as_deref(), Some("10.0.0.21"));

    reports
        .handle(report(vec![snapshot(trigger.task_id, trigger.run_id, TaskStatus::Finished)]))
        .await;
    let detail = services.job_service.describe_job(job.id).await.unwrap();
    assert_eq!(detail.tasks[0].status, TaskStatus::Finished);
    assert_eq!(detail.job.status, JobStatus::Finished);
}

#[tokio::test]
async fn test_cancel_is_delivered_on_next_report() {
    let services = services().await;
    let reports = services.agent_reports.clone().unwrap();
    let job = services.job_service.create_job(gpu_job()).await.unwrap();

    let response = reports.handle(report(vec![])).await;
    let task_id = response.tasks_to_run[0].task_id;
    let run_id = response.tasks_to_run[0].run_id;
    reports
        .handle(report(vec![snapshot(task_id, run_id, TaskStatus::Running)]))
        .await;

    services.job_service.cancel_job(job.id).await.unwrap();
    let response = reports
        .handle(report(vec![snapshot(task_id, run_id, TaskStatus::Running)]))
        .await;
    assert_eq!(response.task_ids_to_cancel, vec![task_id]);

    reports
        .handle(report(vec![snapshot(task_id, run_id, TaskStatus::Canceled)]))
        .await;
    let detail = services.job_service.describe_job(job.id).await.unwrap();
    assert_eq!(detail.tasks[0].status, TaskStatus::Canceled);
    assert_eq!(detail.job.status, JobStatus::Canceled);
}

#[tokio::test]
async fn test_unknown_task_snapshot_is_ignored() {
    let services = services().await;
    let reports = services.agent_reports.clone().unwrap();
    let response = reports
        .handle(report(vec![snapshot(9_999, 1, TaskStatus::Running)]))
        .await;
    assert_eq!(response.code, ResponseCode::Success);
    assert!(response.tasks_to_run.is_empty());
}

#[tokio::test]
async fn test_resent_error_of_previous_run_does_not_touch_retry() {
    let services = services_with(ControllerConfig {
        executor: ExecutorKind::Agent,
        max_task_retries: 1,
        retry_backoff_seconds: 0,
        ..ControllerConfig::default()
    })
    .await;
    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let _retry_loop = services.start_background(shutdown_rx).unwrap();
    let reports = services.agent_reports.clone().unwrap();
    let job = services.job_service.create_job(gpu_job()).await.unwrap();

    let response = reports.handle(report(vec![])).await;
    let first = response.tasks_to_run[0].clone();
    reports
        .handle(report(vec![snapshot(first.task_id, first.run_id, TaskStatus::Running)]))
        .await;
    let failed = snapshot(first.task_id, first.run_id, TaskStatus::Error);
    let mut handed_out = reports.handle(report(vec![failed.clone()])).await.tasks_to_run;

    let mut retried_run = None;
    for _ in 0..100 {
        let task = services
            .repositories
            .tasks
            .find_by_id(first.task_id)
            .await
            .unwrap()
            .unwrap();
        if let Some(run_id) = task.current_run {
            retried_run = Some(run_id);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let second_run = retried_run.expect("任务没有被重试");
    assert_ne!(second_run, first.run_id);

    // Agent 在收到响应前重发了上一次运行实例的失败快照
    handed_out.extend(reports.handle(report(vec![failed])).await.tasks_to_run);

    let run = services
        .repositories
        .runs
        .find_by_id(second_run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    let task = services
        .repositories
        .tasks
        .find_by_id(first.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.retry_num, 1);
    assert_eq!(task.current_run, Some(second_run));
    assert_eq!(task.status, TaskStatus::Running);
    let detail = services.job_service.describe_job(job.id).await.unwrap();
    assert!(!detail.job.is_final());

    // 新的运行实例照常下发并完成
    assert_eq!(handed_out.len(), 1);
    let second = &handed_out[0];
    assert_eq!(second.run_id, second_run);
    reports
        .handle(report(vec![snapshot(second.task_id, second.run_id, TaskStatus::Running)]))
        .await;
    reports
        .handle(report(vec![snapshot(second.task_id, second.run_id, TaskStatus::Finished)]))
        .await;
    let detail = services.job_service.describe_job(job.id).await.unwrap();
    assert_eq!(detail.tasks[0].status, TaskStatus::Finished);
    assert_eq!(detail.job.status, JobStatus::Finished);
}
