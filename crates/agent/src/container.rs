//! 容器运行时抽象与本地进程实现

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use evalflow_domain::{DeviceClass, SchedulerError, SchedulerResult};

use crate::task::AgentTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited { code: i32 },
    /// 运行时中找不到该容器，例如 Agent 重启后
    Missing,
}

#[async_trait]
pub trait ContainerClient: Send + Sync {
    /// 启动任务容器，任务的 `devices` 已经分配
    async fn start(&self, task: &AgentTask) -> SchedulerResult<ContainerHandle>;
    async fn inspect(&self, container_id: &str) -> SchedulerResult<ContainerState>;
    /// 停止容器，容器不存在时直接返回成功
    async fn stop(&self, container_id: &str) -> SchedulerResult<()>;
}

/// 以本地子进程代替容器运行任务命令
///
/// 标准输出与标准错误写入 `{result_root_path}/logs`。
pub struct ProcessContainerClient {
    host_ip: String,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessContainerClient {
    pub fn new(host_ip: impl Into<String>) -> Self {
        Self {
            host_ip: host_ip.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn device_ids(task: &AgentTask, class: DeviceClass) -> String {
        task.devices
            .iter()
            .filter(|d| d.class == class)
            .map(|d| d.id.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    async fn log_file(dir: &Path, name: &str) -> SchedulerResult<Stdio> {
        let file = tokio::fs::File::create(dir.join(name)).await?;
        Ok(Stdio::from(file.into_std().await))
    }
}

#[async_trait]
impl ContainerClient for ProcessContainerClient {
    async fn start(&self, task: &AgentTask) -> SchedulerResult<ContainerHandle> {
        let trigger = &task.trigger;
        let (program, args) = trigger.command.split_first().ok_or_else(|| {
            SchedulerError::invalid_request(format!("任务 {} 没有启动命令", task.id))
        })?;

        let result_dir = Path::new(&trigger.result_root_path);
        let log_dir = result_dir.join("logs");
        tokio::fs::create_dir_all(&log_dir).await?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&trigger.envs)
            .env("EVALFLOW_TASK_ID", task.id.to_string())
            .env("EVALFLOW_IMAGE", &trigger.image)
            .env("EVALFLOW_RESULT_DIR", &trigger.result_root_path)
            .env("EVALFLOW_DATASETS", trigger.dataset_uris.join(","))
            .env("CUDA_VISIBLE_DEVICES", Self::device_ids(task, DeviceClass::Gpu))
            .stdin(Stdio::null())
            .stdout(Self::log_file(&log_dir, "stdout.log").await?)
            .stderr(Self::log_file(&log_dir, "stderr.log").await?);
        if let Some(model) = &trigger.model_uri {
            command.env("EVALFLOW_MODEL", model);
        }

        let child = command.spawn().map_err(|e| {
            SchedulerError::executor(format!("启动任务 {} 的进程失败: {e}", task.id))
        })?;
        let id = format!("proc-{}-{}", task.id, child.id().unwrap_or_default());
        info!("任务 {} 已启动，容器 {}", task.id, id);

        self.children.lock().await.insert(id.clone(), child);
        Ok(ContainerHandle {
            id,
            ip: Some(self.host_ip.clone()),
        })
    }

    async fn inspect(&self, container_id: &str) -> SchedulerResult<ContainerState> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(container_id) else {
            return Ok(ContainerState::Missing);
        };
        match child.try_wait()? {
            Some(status) => {
                children.remove(container_id);
                let code = status.code().unwrap_or(-1);
                debug!("容器 {} 已退出，退出码 {}", container_id, code);
                Ok(ContainerState::Exited { code })
            }
            None => Ok(ContainerState::Running),
        }
    }

    async fn stop(&self, container_id: &str) -> SchedulerResult<()> {
        let child = self.children.lock().await.remove(container_id);
        let Some(mut child) = child else {
            debug!("容器 {} 不存在，无需停止", container_id);
            return Ok(());
        };
        if let Err(e) = child.kill().await {
            warn!("停止容器 {} 失败: {}", container_id, e);
            return Err(SchedulerError::executor(format!(
                "停止容器 {container_id} 失败: {e}"
            )));
        }
        info!("容器 {} 已停止", container_id);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::task::tests::trigger;
    use evalflow_domain::DeviceRequest;
    use std::time::Duration;

    fn task_in(dir: &tempfile::TempDir, command: &str) -> AgentTask {
        let mut trigger = trigger(11, DeviceRequest::new(1, 0));
        trigger.command = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        trigger.result_root_path = dir.path().to_string_lossy().to_string();
        AgentTask::from_trigger(trigger)
    }

    async fn wait_exit(client: &ProcessContainerClient, id: &str) -> ContainerState {
        for _ in 0..100 {
            let state = client.inspect(id).await.unwrap();
            if state != ContainerState::Running {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        ContainerState::Running
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = ProcessContainerClient::new("127.0.0.1");
        let handle = client.start(&task_in(&dir, "exit 3")).await.unwrap();
        assert_eq!(handle.ip.as_deref(), Some("127.0.0.1"));

        assert_eq!(wait_exit(&client, &handle.id).await, ContainerState::Exited { code: 3 });
        assert_eq!(client.inspect(&handle.id).await.unwrap(), ContainerState::Missing);
    }

    #[tokio::test]
    async fn test_stop_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let client = ProcessContainerClient::new("127.0.0.1");
        let handle = client.start(&task_in(&dir, "sleep 30")).await.unwrap();
        assert_eq!(client.inspect(&handle.id).await.unwrap(), ContainerState::Running);

        client.stop(&handle.id).await.unwrap();
        assert_eq!(client.inspect(&handle.id).await.unwrap(), ContainerState::Missing);
        // 重复停止
        client.stop(&handle.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_command_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let client = ProcessContainerClient::new("127.0.0.1");
        let mut task = task_in(&dir, "true");
        task.trigger.command.clear();
        let err = client.start(&task).await.unwrap_err();
        assert_eq!(err.kind(), evalflow_domain::ErrorKind::Validation);
    }
}
