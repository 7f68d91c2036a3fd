use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::warn;

use evalflow_domain::{SchedulerError, SchedulerResult};

use crate::task::AgentTask;

/// Agent 任务的本地持久化
#[async_trait]
pub trait AgentTaskStore: Send + Sync {
    async fn save_task(&self, task: &AgentTask) -> SchedulerResult<()>;
    /// 加载所有未归档的任务，按任务 id 排序
    async fn load_active_tasks(&self) -> SchedulerResult<Vec<AgentTask>>;
}

/// 每个任务一个 JSON 文件：`{data_dir}/tasks/{id}.json`
pub struct FileTaskStore {
    dir: PathBuf,
}

impl FileTaskStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            dir: data_dir.as_ref().join("tasks"),
        }
    }

    fn path_for(&self, task_id: i64) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }
}

#[async_trait]
impl AgentTaskStore for FileTaskStore {
    async fn save_task(&self, task: &AgentTask) -> SchedulerResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let content = serde_json::to_vec_pretty(task)?;
        // 先写临时文件再改名
        let path = self.path_for(task.id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_active_tasks(&self) -> SchedulerResult<Vec<AgentTask>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SchedulerError::Storage(e.to_string())),
        };

        let mut tasks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<AgentTask>(&content) {
                Ok(task) if !task.archived => tasks.push(task),
                Ok(_) => {}
                Err(e) => warn!("跳过无法解析的任务文件 {}: {}", path.display(), e),
            }
        }
        tasks.sort_by_key(|task| task.id);
        Ok(tasks)
    }
}
