//! Agent：在节点上按阶段推进控制器下发的任务，并周期性上报任务状态

pub mod action;
pub mod container;
pub mod controller_client;
pub mod device_allocator;
pub mod dispatcher;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod task;
pub mod task_pool;
pub mod transitions;
pub mod uploader;

pub use action::{failure_policy, run_action, select_one_of, Action, Branch, FailurePolicy};
pub use container::{ContainerClient, ContainerHandle, ContainerState, ProcessContainerClient};
pub use controller_client::{ControllerClient, HttpControllerClient};
pub use device_allocator::DeviceAllocator;
pub use dispatcher::{NodeIdentity, SingleFlight, TaskDispatcher};
pub use scheduler::{AgentScheduler, TickIntervals};
pub use service::AgentService;
pub use store::{AgentTaskStore, FileTaskStore};
pub use task::{AgentTask, Stage};
pub use task_pool::{AddOutcome, TaskPool};
pub use uploader::{LocalResultUploader, ResultUploader};
