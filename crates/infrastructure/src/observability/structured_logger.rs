//! Structured logging helpers
//!
//! Event-named log lines shared by the controller and the agent so that the same
//! occurrence is always logged with the same field names.

use tracing::{debug, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_run_scheduled(run_id: i64, task_id: i64, image: &str, resource_pool: &str) {
        info!(
            event = "run_scheduled",
            run.id = run_id,
            task.id = task_id,
            run.image = image,
            run.resource_pool = resource_pool,
            "Run scheduled"
        );
    }

    pub fn log_run_report_applied(
        run_id: i64,
        status: Option<&str>,
        status_changed: bool,
        status_rejected: bool,
    ) {
        info!(
            event = "run_report_applied",
            run.id = run_id,
            run.status = status,
            status_changed = status_changed,
            status_rejected = status_rejected,
            "Run report applied"
        );
    }

    pub fn log_transition_rejected(entity: &str, id: i64, from: &str, to: &str) {
        warn!(
            event = "transition_rejected",
            entity = entity,
            id = id,
            from = from,
            to = to,
            "Illegal status transition rejected"
        );
    }

    pub fn log_task_moved(task_id: i64, from: &str, to: &str) {
        debug!(
            event = "task_moved",
            task.id = task_id,
            from = from,
            to = to,
            "Task moved between stages"
        );
    }

    pub fn log_report_sent(serial_number: &str, task_count: usize, triggers: usize, cancels: usize) {
        info!(
            event = "report_sent",
            agent.serial_number = serial_number,
            task_count = task_count,
            triggers = triggers,
            cancels = cancels,
            "Agent report sent"
        );
    }
}
