use crate::collectors::CycleReport;
use crate::proxmox::{ErrorCategory, GuestKind};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub name: String,
    pub state: Option<String>,
    pub attributes: BTreeMap<u64, String>,
    pub guests: Vec<GuestSnapshot>,
    pub nodes: Vec<String>,
    pub last_collect_timestamp_seconds: i64,
    pub last_success_unix: Option<i64>,
    pub last_error: Option<LastError>,
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GuestSnapshot {
    pub vmid: u64,
    pub kind: GuestKind,
    pub node: String,
    pub name: String,
    pub status: String,
    pub uptime_seconds: u64,
    pub memory_used_bytes: u64,
    pub memory_max_bytes: u64,
    pub cpu_fraction: f64,
    pub cpus: f64,
    pub net_in_bytes: u64,
    pub net_out_bytes: u64,
    pub disk_max_bytes: u64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LastError {
    pub category: ErrorCategory,
    pub message: String,
    pub at_unix: i64,
}

impl GuestSnapshot {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

impl State {
    pub fn new(now_unix: i64, name: impl Into<String>) -> Self {
        Self {
            started_at_unix: now_unix,
            name: name.into(),
            ..Self::default()
        }
    }

    /// Replaces attributes and guests with a fully collected cycle.
    pub fn publish_success(&mut self, now_unix: i64, message: String, report: CycleReport) {
        self.last_collect_timestamp_seconds = now_unix;
        self.last_success_unix = Some(now_unix);
        self.cycles_total = self.cycles_total.saturating_add(1);
        self.consecutive_failures = 0;
        self.state = Some(message);
        self.attributes = report.attributes;
        self.guests = report.guests;
        self.nodes = report.nodes;
    }

    /// Publishes the error label and keeps the last good attributes.
    pub fn publish_failure(&mut self, now_unix: i64, category: ErrorCategory, message: String) {
        self.last_collect_timestamp_seconds = now_unix;
        self.cycles_total = self.cycles_total.saturating_add(1);
        self.cycles_failed = self.cycles_failed.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = Some(category.label().to_string());
        self.last_error = Some(LastError {
            category,
            message,
            at_unix: now_unix,
        });
    }

    pub fn last_cycle_ok(&self) -> bool {
        self.cycles_total > 0 && self.consecutive_failures == 0
    }

    pub fn guest_count(&self, kind: GuestKind) -> usize {
        self.guests.iter().filter(|g| g.kind == kind).count()
    }
}
