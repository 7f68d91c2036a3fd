use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use evalflow_domain::SchedulerResult;

use crate::task::AgentTask;

/// 上传任务结果
#[async_trait]
pub trait ResultUploader: Send + Sync {
    async fn upload(&self, task: &AgentTask) -> SchedulerResult<()>;
}

#[derive(Debug, Serialize)]
struct ResultManifest<'a> {
    task_id: i64,
    retry_num: u32,
    image: &'a str,
    files: Vec<String>,
    uploaded_at: chrono::DateTime<Utc>,
}

/// 结果已经写在本地目录，只生成 `manifest.json`
pub struct LocalResultUploader;

pub const MANIFEST_FILE: &str = "manifest.json";

impl LocalResultUploader {
    async fn list_files(dir: &Path) -> SchedulerResult<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![dir.to_path_buf()];
        while let Some(current) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(dir) {
                    let relative = relative.to_string_lossy().to_string();
                    if relative != MANIFEST_FILE {
                        files.push(relative);
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl ResultUploader for LocalResultUploader {
    async fn upload(&self, task: &AgentTask) -> SchedulerResult<()> {
        let dir = Path::new(&task.trigger.result_root_path);
        tokio::fs::create_dir_all(dir).await?;

        let manifest = ResultManifest {
            task_id: task.id,
            retry_num: task.retry_num,
            image: &task.trigger.image,
            files: Self::list_files(dir).await?,
            uploaded_at: Utc::now(),
        };
        tokio::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?).await?;
        info!("任务 {} 的结果清单已生成，共 {} 个文件", task.id, manifest.files.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::tests::trigger;
    use evalflow_domain::DeviceRequest;

    #[tokio::test]
    async fn test_manifest_lists_result_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("logs")).await.unwrap();
        tokio::fs::write(dir.path().join("scores.json"), b"{}").await.unwrap();
        tokio::fs::write(dir.path().join("logs").join("stdout.log"), b"ok").await.unwrap();

        let mut trigger = trigger(21, DeviceRequest::new(1, 0));
        trigger.result_root_path = dir.path().to_string_lossy().to_string();
        let task = AgentTask::from_trigger(trigger);

        LocalResultUploader.upload(&task).await.unwrap();
        // 重复上传不会把清单自身计入
        LocalResultUploader.upload(&task).await.unwrap();

        let content = tokio::fs::read(dir.path().join(MANIFEST_FILE)).await.unwrap();
        let manifest: serde_json::Value = serde_json::from_slice(&content).unwrap();
        assert_eq!(manifest["task_id"], 21);
        let files: Vec<String> = serde_json::from_value(manifest["files"].clone()).unwrap();
        assert_eq!(files, vec!["logs/stdout.log".to_string(), "scores.json".to_string()]);
    }
}
