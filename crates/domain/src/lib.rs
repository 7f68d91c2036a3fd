pub mod entities;
pub mod messaging;
pub mod ports;
pub mod repositories;
pub mod status_machine;
pub mod value_objects;

pub use entities::*;
pub use evalflow_core::{ErrorKind, SchedulerError, SchedulerResult};
pub use messaging::*;
pub use ports::*;
pub use repositories::*;
pub use status_machine::*;
pub use value_objects::*;
