pub mod memory;
pub mod observability;
pub mod process_executor;
pub mod storage;

pub use memory::{
    InMemoryJobRepository, InMemoryRunRepository, InMemoryStepRepository, InMemoryTaskRepository,
};
pub use observability::{init_metrics, MetricsCollector, StructuredLogger};
pub use process_executor::ProcessRunExecutor;
pub use storage::{JobRuntimeSpecFinder, LocalStoragePathAllocator};
