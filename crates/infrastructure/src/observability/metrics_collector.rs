//! Metrics collector for the task manager
//!
//! Counters are labelled by task name so a dashboard can split claim, success
//! and failure rates per definition.

use metrics::{counter, gauge, histogram, Gauge, Histogram};
use tracing::debug;

pub struct MetricsCollector {
    in_flight: Gauge,
    poll_cycle_duration: Histogram,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            in_flight: gauge!("taskman_instances_in_flight"),
            poll_cycle_duration: histogram!("taskman_poll_cycle_duration_seconds"),
        }
    }

    pub fn record_claimed(&self, count: usize) {
        counter!("taskman_instances_claimed_total").increment(count as u64);
    }

    pub fn record_scheduled(&self, task_name: &str) {
        counter!("taskman_instances_scheduled_total", "task" => task_name.to_string()).increment(1);
    }

    pub fn record_succeeded(&self, task_name: &str, duration_seconds: f64) {
        counter!("taskman_instances_succeeded_total", "task" => task_name.to_string()).increment(1);
        histogram!("taskman_handler_duration_seconds", "task" => task_name.to_string())
            .record(duration_seconds);
    }

    pub fn record_failed(&self, task_name: &str, reason: &str) {
        counter!(
            "taskman_instances_failed_total",
            "task" => task_name.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);
        debug!(task = task_name, reason = reason, "Task instance failed");
    }

    pub fn record_retry(&self, task_name: &str, attempt: u32) {
        counter!("taskman_instances_retried_total", "task" => task_name.to_string()).increment(1);
        debug!(task = task_name, attempt = attempt, "Task retry scheduled");
    }

    pub fn record_lease_lost(&self, task_name: &str) {
        counter!("taskman_lease_lost_total", "task" => task_name.to_string()).increment(1);
    }

    pub fn record_cancelled(&self, task_name: &str) {
        counter!("taskman_instances_cancelled_total", "task" => task_name.to_string()).increment(1);
    }

    pub fn record_lock_contention(&self) {
        counter!("taskman_lock_contention_total").increment(1);
    }

    pub fn record_cron_planned(&self, task_name: &str) {
        counter!("taskman_cron_instances_total", "task" => task_name.to_string()).increment(1);
    }

    pub fn record_poll_cycle(&self, duration_seconds: f64) {
        self.poll_cycle_duration.record(duration_seconds);
    }

    pub fn record_store_error(&self, operation: &str) {
        counter!("taskman_store_errors_total", "operation" => operation.to_string()).increment(1);
    }

    pub fn set_in_flight(&self, count: usize) {
        self.in_flight.set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder_are_noops() {
        let metrics = MetricsCollector::new();
        metrics.record_claimed(3);
        metrics.record_succeeded("send_email", 0.2);
        metrics.record_failed("send_email", "timeout");
        metrics.set_in_flight(2);
    }
}
