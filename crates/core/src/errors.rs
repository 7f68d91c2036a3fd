use thiserror::Error;

/// 错误分类
///
/// 每个 [`SchedulerError`] 都归属于一个分类，调用方依据分类决定重试、丢弃还是直接失败。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 请求本身不合法，原样重试没有意义
    Validation,
    /// 资源暂时不足，下一个调度周期自动重试
    ResourceExhausted,
    /// 状态上报与当前状态冲突
    Conflict,
    /// 执行器、存储或网络故障，保持原状态等待下一轮
    Infrastructure,
    /// 引用的实体不存在
    NotFound,
    /// 启动期配置错误等致命问题
    Fatal,
}

/// 调度器错误类型定义
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("资源请求无效: {0}")]
    InvalidResource(String),

    #[error("请求参数无效: {0}")]
    InvalidRequest(String),

    #[error("资源不足: 需要 {requested} 个 {class}，当前空闲 {available} 个")]
    InsufficientResource {
        class: String,
        requested: usize,
        available: usize,
    },

    #[error("任务 {task_id} 没有正在进行的运行实例")]
    NoActiveRun { task_id: i64 },

    #[error("任务 {task_id} 已有未结束的运行实例 {run_id}")]
    ActiveRunExists { task_id: i64, run_id: i64 },

    #[error("非法的{entity}状态转换: {from} -> {to}")]
    IllegalTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("资源池不存在: {0}")]
    ResourcePoolNotFound(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("运行实例未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("步骤未找到: {id}")]
    StepNotFound { id: i64 },

    #[error("作业未找到: {id}")]
    JobNotFound { id: i64 },

    #[error("执行器错误: {0}")]
    Executor(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("持久化操作错误: {0}")]
    Persistence(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn invalid_resource<S: Into<String>>(msg: S) -> Self {
        Self::InvalidResource(msg.into())
    }

    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn executor<S: Into<String>>(msg: S) -> Self {
        Self::Executor(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn illegal_transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::IllegalTransition {
            entity,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::InvalidResource(_)
            | SchedulerError::InvalidRequest(_)
            | SchedulerError::NoActiveRun { .. }
            | SchedulerError::ActiveRunExists { .. } => ErrorKind::Validation,
            SchedulerError::InsufficientResource { .. } => ErrorKind::ResourceExhausted,
            SchedulerError::IllegalTransition { .. } => ErrorKind::Conflict,
            SchedulerError::TaskNotFound { .. }
            | SchedulerError::RunNotFound { .. }
            | SchedulerError::StepNotFound { .. }
            | SchedulerError::JobNotFound { .. }
            | SchedulerError::ResourcePoolNotFound(_) => ErrorKind::NotFound,
            SchedulerError::Executor(_)
            | SchedulerError::Storage(_)
            | SchedulerError::Network(_)
            | SchedulerError::Persistence(_) => ErrorKind::Infrastructure,
            SchedulerError::Serialization(_)
            | SchedulerError::Configuration(_)
            | SchedulerError::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// 下一轮调度是否可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ResourceExhausted | ErrorKind::Infrastructure
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
