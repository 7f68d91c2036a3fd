//! 控制器：作业拆分、运行实例调度、执行器上报处理与状态传播

pub mod agent_executor;
pub mod agent_report;
pub mod controller;
pub mod job_service;
pub mod report_receiver;
pub mod retry_service;
pub mod run_scheduler;
pub mod status_propagator;
pub mod step_trigger;

pub use agent_executor::AgentRunExecutor;
pub use agent_report::AgentReportService;
pub use controller::{ControllerServices, ExecutorChoice, Repositories};
pub use job_service::{JobDetail, JobRequest, JobService, StepRequest};
pub use report_receiver::RunReportService;
pub use retry_service::{RetryConfig, RetryRequest, TaskRetryService};
pub use run_scheduler::RunScheduler;
pub use status_propagator::TaskStatusPropagator;
pub use step_trigger::{StepTrigger, TriggerOutcome};
