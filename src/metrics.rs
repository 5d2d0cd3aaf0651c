// SPDX-License-Identifier: MIT
//! In-process counters exposed as `GET /metrics` in Prometheus text format.
//!
//! No metrics library — counters and gauges are `AtomicU64` updated inline
//! by the engine, orchestrator, and bus; the step-duration histogram uses
//! fixed buckets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Histogram bucket upper bounds in seconds.
const DURATION_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

/// Cumulative histogram of step wall-clock durations.
#[derive(Debug)]
pub struct DurationHistogram {
    buckets: [AtomicU64; 9],
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl DurationHistogram {
    fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, seconds: f64) {
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            if seconds <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_micros
            .fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, name: &str, out: &mut String) {
        use std::fmt::Write as _;
        let _ = writeln!(out, "# HELP {name} Step execution duration.");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
            let _ = writeln!(
                out,
                "{name}_bucket{{le=\"{bound}\"}} {}",
                self.buckets[i].load(Ordering::Relaxed)
            );
        }
        let count = self.count.load(Ordering::Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(
            out,
            "{name}_sum {}",
            self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
        );
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Shared performance counters for the whole daemon.
#[derive(Debug)]
pub struct SwarmMetrics {
    pub tasks_created: AtomicU64,
    pub tasks_completed: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub tasks_cancelled: AtomicU64,
    /// Steps currently executing on a worker.
    pub steps_running: AtomicU64,
    /// Steps ready to run (queued or waiting on the worker pool).
    pub steps_ready: AtomicU64,
    /// Ready-queue depth.
    pub queue_size: AtomicU64,
    pub step_duration: DurationHistogram,
    /// Connected stream subscribers.
    pub stream_clients: AtomicU64,
    /// Bytes buffered across all subscriber send queues.
    pub stream_bytes_buffered: AtomicU64,
}

impl SwarmMetrics {
    pub fn new() -> Self {
        Self {
            tasks_created: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            steps_running: AtomicU64::new(0),
            steps_ready: AtomicU64::new(0),
            queue_size: AtomicU64::new(0),
            step_duration: DurationHistogram::new(),
            stream_clients: AtomicU64::new(0),
            stream_bytes_buffered: AtomicU64::new(0),
        }
    }

    /// Render all series in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let tasks_created = self.tasks_created.load(Ordering::Relaxed);
        let completed = self.tasks_completed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let cancelled = self.tasks_cancelled.load(Ordering::Relaxed);
        let steps_running = self.steps_running.load(Ordering::Relaxed);
        let steps_ready = self.steps_ready.load(Ordering::Relaxed);
        let queue_size = self.queue_size.load(Ordering::Relaxed);
        let stream_clients = self.stream_clients.load(Ordering::Relaxed);
        let stream_bytes = self.stream_bytes_buffered.load(Ordering::Relaxed);

        let mut out = format!(
            "# HELP swarmd_tasks_created_total Tasks accepted since start.\n\
             # TYPE swarmd_tasks_created_total counter\n\
             swarmd_tasks_created_total {tasks_created}\n\
             # HELP swarmd_tasks_completed_total Tasks reaching a terminal status.\n\
             # TYPE swarmd_tasks_completed_total counter\n\
             swarmd_tasks_completed_total{{status=\"completed\"}} {completed}\n\
             swarmd_tasks_completed_total{{status=\"failed\"}} {failed}\n\
             swarmd_tasks_completed_total{{status=\"cancelled\"}} {cancelled}\n\
             # HELP swarmd_steps_running Steps currently on a worker.\n\
             # TYPE swarmd_steps_running gauge\n\
             swarmd_steps_running {steps_running}\n\
             # HELP swarmd_steps_ready Steps ready for dispatch.\n\
             # TYPE swarmd_steps_ready gauge\n\
             swarmd_steps_ready {steps_ready}\n\
             # HELP swarmd_queue_size Ready-queue depth.\n\
             # TYPE swarmd_queue_size gauge\n\
             swarmd_queue_size {queue_size}\n\
             # HELP swarmd_stream_clients Connected stream subscribers.\n\
             # TYPE swarmd_stream_clients gauge\n\
             swarmd_stream_clients {stream_clients}\n\
             # HELP swarmd_stream_bytes_buffered Bytes queued across subscriber buffers.\n\
             # TYPE swarmd_stream_bytes_buffered gauge\n\
             swarmd_stream_bytes_buffered {stream_bytes}\n"
        );
        self.step_duration
            .render("swarmd_step_duration_seconds", &mut out);
        out
    }

    /// Snapshot for the bus's periodic metrics broadcast.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "tasksCreated": self.tasks_created.load(Ordering::Relaxed),
            "tasksCompleted": self.tasks_completed.load(Ordering::Relaxed),
            "tasksFailed": self.tasks_failed.load(Ordering::Relaxed),
            "tasksCancelled": self.tasks_cancelled.load(Ordering::Relaxed),
            "stepsRunning": self.steps_running.load(Ordering::Relaxed),
            "stepsReady": self.steps_ready.load(Ordering::Relaxed),
            "queueSize": self.queue_size.load(Ordering::Relaxed),
            "streamClients": self.stream_clients.load(Ordering::Relaxed),
            "streamBytesBuffered": self.stream_bytes_buffered.load(Ordering::Relaxed),
        })
    }
}

impl Default for SwarmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle — cheaply clonable.
pub type SharedMetrics = Arc<SwarmMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_required_series() {
        let m = SwarmMetrics::new();
        m.tasks_created.fetch_add(2, Ordering::Relaxed);
        m.step_duration.observe(0.3);
        let text = m.render_prometheus();
        for series in [
            "swarmd_tasks_created_total 2",
            "swarmd_tasks_completed_total{status=\"completed\"}",
            "swarmd_steps_running",
            "swarmd_steps_ready",
            "swarmd_queue_size",
            "swarmd_stream_clients",
            "swarmd_stream_bytes_buffered",
            "swarmd_step_duration_seconds_bucket{le=\"0.5\"} 1",
            "swarmd_step_duration_seconds_count 1",
        ] {
            assert!(text.contains(series), "missing series: {series}\n{text}");
        }
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = DurationHistogram::new();
        h.observe(0.02);
        h.observe(0.4);
        h.observe(45.0);
        // 0.02 lands in every bucket from 0.05 up; 0.4 from 0.5 up.
        assert_eq!(h.buckets[0].load(Ordering::Relaxed), 0); // le=0.01
        assert_eq!(h.buckets[1].load(Ordering::Relaxed), 1); // le=0.05
        assert_eq!(h.buckets[3].load(Ordering::Relaxed), 2); // le=0.5
        assert_eq!(h.buckets[8].load(Ordering::Relaxed), 3); // le=60
        assert_eq!(h.count.load(Ordering::Relaxed), 3);
    }
}
