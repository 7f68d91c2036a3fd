//! 本地目录分配与容器规格查找

use std::sync::Arc;

use async_trait::async_trait;

use evalflow_domain::{
    ContainerSpecification, ContainerSpecificationFinder, Job, JobRepository, SchedulerError,
    SchedulerResult, Step, StepRepository, StoragePathAllocator, Task,
};

/// 以本地文件系统为根的路径分配
///
/// 结果目录：`{result_root}/{job_uuid}/{step_name}/{task_index}`；
/// 日志目录：`{log_root}/{job_id}/{task_id}/{attempt}`。
#[derive(Debug, Clone)]
pub struct LocalStoragePathAllocator {
    result_root: String,
    log_root: String,
}

impl LocalStoragePathAllocator {
    pub fn new(result_root: impl Into<String>, log_root: impl Into<String>) -> Self {
        Self {
            result_root: result_root.into().trim_end_matches('/').to_string(),
            log_root: log_root.into().trim_end_matches('/').to_string(),
        }
    }
}

impl StoragePathAllocator for LocalStoragePathAllocator {
    fn task_result_path(&self, job: &Job, step: &Step, task_index: u32) -> String {
        format!(
            "{}/{}/{}/{}",
            self.result_root, job.uuid, step.name, task_index
        )
    }

    fn run_log_dir(&self, task: &Task, attempt: u32) -> String {
        format!("{}/{}/{}/{}", self.log_root, task.job_id, task.id, attempt)
    }
}

/// 由任务所属作业的运行时配置生成容器规格
pub struct JobRuntimeSpecFinder {
    job_repo: Arc<dyn JobRepository>,
    step_repo: Arc<dyn StepRepository>,
}

impl JobRuntimeSpecFinder {
    pub fn new(job_repo: Arc<dyn JobRepository>, step_repo: Arc<dyn StepRepository>) -> Self {
        Self {
            job_repo,
            step_repo,
        }
    }
}

#[async_trait]
impl ContainerSpecificationFinder for JobRuntimeSpecFinder {
    async fn find_cs(&self, task: &Task) -> SchedulerResult<ContainerSpecification> {
        let job = self
            .job_repo
            .find_by_id(task.job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound { id: task.job_id })?;
        let step = self
            .step_repo
            .find_by_id(task.step_id)
            .await?
            .ok_or(SchedulerError::StepNotFound { id: task.step_id })?;

        let runtime = &job.runtime;
        if runtime.image.trim().is_empty() {
            return Err(SchedulerError::invalid_resource(format!(
                "作业 {} 未配置镜像",
                job.id
            )));
        }

        let mut envs = runtime.envs.clone();
        envs.insert("EVALFLOW_JOB_ID".to_string(), job.id.to_string());
        envs.insert("EVALFLOW_STEP".to_string(), step.name.clone());
        envs.insert("EVALFLOW_TASK_ID".to_string(), task.id.to_string());
        envs.insert("EVALFLOW_TASK_UUID".to_string(), task.uuid.to_string());
        envs.insert("EVALFLOW_TASK_INDEX".to_string(), task.index.to_string());
        envs.insert("EVALFLOW_TASK_NUM".to_string(), step.task_num.to_string());
        envs.insert(
            "EVALFLOW_RESULT_PATH".to_string(),
            task.result_root_path.clone(),
        );
        if !runtime.dataset_uris.is_empty() {
            envs.insert(
                "EVALFLOW_DATASETS".to_string(),
                runtime.dataset_uris.join(","),
            );
        }
        if let Some(model) = &runtime.model_uri {
            envs.insert("EVALFLOW_MODEL".to_string(), model.clone());
        }

        Ok(ContainerSpecification {
            image: runtime.image.clone(),
            cmd: runtime.command.clone(),
            envs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryJobRepository, InMemoryStepRepository};
    use evalflow_domain::{DeviceClass, JobRuntime, StepStatus};
    use std::collections::BTreeMap;

    fn runtime() -> JobRuntime {
        JobRuntime {
            image: "registry.local/eval:2".to_string(),
            command: vec!["python".to_string(), "-m".to_string(), "eval".to_string()],
            envs: BTreeMap::from([("HF_HOME".to_string(), "/cache".to_string())]),
            device_class: DeviceClass::Cpu,
            device_amount: 1,
            dataset_uris: vec!["s3://a".to_string(), "s3://b".to_string()],
            model_uri: Some("s3://models/llm".to_string()),
        }
    }

    fn step(job_id: i64) -> Step {
        Step {
            id: 0,
            job_id,
            index: 0,
            name: "inference".to_string(),
            status: StepStatus::Created,
            resource_pool: "default".to_string(),
            resources: vec![],
            task_num: 4,
            concurrency: 2,
            started_time: None,
            finished_time: None,
        }
    }

    #[test]
    fn test_local_paths() {
        let allocator = LocalStoragePathAllocator::new("/data/results/", "/data/logs");
        let job = Job::new("eval".to_string(), runtime());
        let path = allocator.task_result_path(&job, &step(1), 3);
        assert_eq!(path, format!("/data/results/{}/inference/3", job.uuid));

        let mut task = Task::new(5, 6, 0, path, vec![]);
        task.id = 11;
        assert_eq!(allocator.run_log_dir(&task, 2), "/data/logs/5/11/2");
    }

    #[tokio::test]
    async fn test_find_cs_merges_task_envs() {
        let jobs = Arc::new(InMemoryJobRepository::new());
        let steps = Arc::new(InMemoryStepRepository::new());
        let job = jobs.create(&Job::new("eval".to_string(), runtime())).await.unwrap();
        let step = steps.create(&step(job.id)).await.unwrap();

        let mut task = Task::new(job.id, step.id, 1, "/r/1".to_string(), vec![]);
        task.id = 42;

        let finder = JobRuntimeSpecFinder::new(jobs, steps);
        let cs = finder.find_cs(&task).await.unwrap();

        assert_eq!(cs.image, "registry.local/eval:2");
        assert_eq!(cs.cmd.len(), 3);
        assert_eq!(cs.envs["HF_HOME"], "/cache");
        assert_eq!(cs.envs["EVALFLOW_TASK_ID"], "42");
        assert_eq!(cs.envs["EVALFLOW_STEP"], "inference");
        assert_eq!(cs.envs["EVALFLOW_DATASETS"], "s3://a,s3://b");
    }

    #[tokio::test]
    async fn test_find_cs_unknown_job() {
        let finder = JobRuntimeSpecFinder::new(
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(InMemoryStepRepository::new()),
        );
        let task = Task::new(99, 1, 0, "/r".to_string(), vec![]);
        assert!(matches!(
            finder.find_cs(&task).await,
            Err(SchedulerError::JobNotFound { id: 99 })
        ));
    }
}
