//! Metrics collector for the evalflow controller and agents
//!
//! Wraps the `metrics` facade. Without an installed recorder every call is a no-op,
//! so components can record unconditionally.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use tracing::debug;

pub struct MetricsCollector {
    // Controller side
    reports_received_total: Counter,
    reports_unchanged_total: Counter,
    reports_unknown_run_total: Counter,
    transitions_rejected_total: Counter,
    runs_scheduled_total: Counter,
    run_schedule_failures_total: Counter,
    task_retries_total: Counter,
    report_apply_duration: Histogram,

    // Agent side
    preparing_queue_depth: Gauge,
    idle_devices: Gauge,
    agent_reports_sent_total: Counter,
    agent_report_failures_total: Counter,
    tick_duration: Histogram,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            reports_received_total: counter!("evalflow_run_reports_received_total"),
            reports_unchanged_total: counter!("evalflow_run_reports_unchanged_total"),
            reports_unknown_run_total: counter!("evalflow_run_reports_unknown_run_total"),
            transitions_rejected_total: counter!("evalflow_transitions_rejected_total"),
            runs_scheduled_total: counter!("evalflow_runs_scheduled_total"),
            run_schedule_failures_total: counter!("evalflow_run_schedule_failures_total"),
            task_retries_total: counter!("evalflow_task_retries_total"),
            report_apply_duration: histogram!("evalflow_run_report_apply_duration_seconds"),
            preparing_queue_depth: gauge!("evalflow_agent_preparing_queue_depth"),
            idle_devices: gauge!("evalflow_agent_idle_devices"),
            agent_reports_sent_total: counter!("evalflow_agent_reports_sent_total"),
            agent_report_failures_total: counter!("evalflow_agent_report_failures_total"),
            tick_duration: histogram!("evalflow_agent_tick_duration_seconds"),
        }
    }

    // Controller metrics

    pub fn record_report_received(&self) {
        self.reports_received_total.increment(1);
    }

    pub fn record_report_unchanged(&self) {
        self.reports_unchanged_total.increment(1);
    }

    pub fn record_report_unknown_run(&self) {
        self.reports_unknown_run_total.increment(1);
    }

    pub fn record_transition_rejected(&self, entity: &str) {
        self.transitions_rejected_total.increment(1);
        debug!(entity = entity, "Transition rejection recorded");
    }

    pub fn record_report_apply_duration(&self, duration_seconds: f64) {
        self.report_apply_duration.record(duration_seconds);
    }

    pub fn record_run_scheduled(&self) {
        self.runs_scheduled_total.increment(1);
    }

    pub fn record_run_schedule_failure(&self) {
        self.run_schedule_failures_total.increment(1);
    }

    pub fn record_task_retry(&self) {
        self.task_retries_total.increment(1);
    }

    // Agent metrics

    pub fn update_preparing_queue_depth(&self, depth: usize) {
        self.preparing_queue_depth.set(depth as f64);
    }

    pub fn update_idle_devices(&self, idle: usize) {
        self.idle_devices.set(idle as f64);
    }

    pub fn record_agent_report(&self, success: bool) {
        if success {
            self.agent_reports_sent_total.increment(1);
        } else {
            self.agent_report_failures_total.increment(1);
        }
    }

    /// Record one tick duration; the stage name goes to the log only
    pub fn record_tick_duration(&self, stage: &str, duration_seconds: f64) {
        self.tick_duration.record(duration_seconds);
        debug!(
            stage = stage,
            duration_seconds = duration_seconds,
            "Tick finished"
        );
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_without_recorder() {
        let collector = MetricsCollector::new();
        collector.record_report_received();
        collector.record_transition_rejected("run");
        collector.update_preparing_queue_depth(3);
        collector.record_tick_duration("preparing", 0.01);
        collector.record_agent_report(false);
    }
}
