use crate::collectors::CycleReport;
use crate::config::ProxmoxConfig;
use crate::proxmox::{ApiError, ErrorCategory, GuestKind, ProxmoxClient};
use crate::state::{GuestSnapshot, State};
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Order of the fields inside a flattened attribute string.
pub const ATTR_KEYS: [&str; 10] = [
    "name", "status", "uptime", "mem", "maxmem", "cpu", "cpus", "netin", "netout", "maxdisk",
];

pub const UPDATED_PREFIX: &str = "Updated - ";
pub const TIMESTAMP_FORMAT: &str = "%d-%b-%y %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Updated { guests: usize },
    Failed(ErrorCategory),
}

pub struct GuestCollector {
    client: ProxmoxClient,
    separator: String,
    tz: Option<Tz>,
}

impl GuestCollector {
    pub fn new(client: ProxmoxClient, cfg: &ProxmoxConfig) -> Self {
        Self {
            client,
            separator: cfg.attribute_separator.clone(),
            tz: cfg.tz(),
        }
    }

    /// Walks nodes, then VMs and containers of each node, strictly in sequence.
    pub async fn collect(&self) -> Result<CycleReport, ApiError> {
        let nodes = self.client.list_nodes().await?;
        let mut attributes = BTreeMap::new();
        let mut guests: Vec<GuestSnapshot> = Vec::new();

        for node in &nodes {
            for kind in GuestKind::ALL {
                let records = self.client.list_guests(node, kind).await?;
                debug!(node = %node, kind = kind.as_str(), count = records.len(), "guests listed");
                for record in &records {
                    let vmid = add_attributes(&mut attributes, record, &self.separator)?;
                    let snapshot = snapshot_guest(vmid, kind, node, record);
                    match guests.iter_mut().find(|g| g.vmid == vmid) {
                        Some(existing) => *existing = snapshot,
                        None => guests.push(snapshot),
                    }
                }
            }
        }

        Ok(CycleReport {
            nodes,
            attributes,
            guests,
        })
    }

    /// Runs one cycle and publishes its outcome; errors never leave this function.
    pub async fn poll_cycle(&self, state: &RwLock<State>) -> CycleOutcome {
        let result = self.collect().await;
        let now = Utc::now();

        match result {
            Ok(report) => {
                let guests = report.guests.len();
                let message = format_updated(now, self.tz);
                info!(nodes = report.nodes.len(), guests, state = %message, "proxmox poll cycle done");
                state
                    .write()
                    .await
                    .publish_success(now.timestamp(), message, report);
                CycleOutcome::Updated { guests }
            }
            Err(err) => {
                let category = err.category();
                error!(category = category.as_str(), error = %err, "proxmox poll cycle failed");
                state
                    .write()
                    .await
                    .publish_failure(now.timestamp(), category, err.to_string());
                CycleOutcome::Failed(category)
            }
        }
    }
}

/// Flattens `guest` into `v1<sep>...<sep>vN<sep>` and stores it under its vmid.
pub fn add_attributes(
    attributes: &mut BTreeMap<u64, String>,
    guest: &Value,
    separator: &str,
) -> Result<u64, ApiError> {
    let vmid = guest_id(guest)?;
    let mut combined = String::new();
    for key in ATTR_KEYS {
        let value = guest.get(key).ok_or_else(|| ApiError::MissingKey {
            key: key.to_string(),
        })?;
        combined.push_str(&render_value(value));
        combined.push_str(separator);
    }

    if attributes.insert(vmid, combined).is_some() {
        warn!(vmid, "duplicate vmid in one cycle, later record wins");
    }
    Ok(vmid)
}

pub fn format_updated(now: DateTime<Utc>, tz: Option<Tz>) -> String {
    let stamp = match tz {
        Some(tz) => now.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string(),
        None => now.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string(),
    };
    format!("{UPDATED_PREFIX}{stamp}")
}

fn guest_id(guest: &Value) -> Result<u64, ApiError> {
    let malformed = |raw: &Value| ApiError::Malformed {
        path: "guest record".to_string(),
        reason: format!("vmid {raw} is not a guest id"),
    };
    let raw = guest.get("vmid").ok_or_else(|| ApiError::MissingKey {
        key: "vmid".to_string(),
    })?;
    match raw {
        Value::Number(n) => n.as_u64().ok_or_else(|| malformed(raw)),
        Value::String(s) => s.trim().parse().map_err(|_| malformed(raw)),
        _ => Err(malformed(raw)),
    }
}

/// Strings go in unquoted, `null` is written as `None`, anything else as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

fn number(guest: &Value, key: &str) -> f64 {
    match guest.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn bytes(guest: &Value, key: &str) -> u64 {
    guest
        .get(key)
        .and_then(Value::as_u64)
        .unwrap_or_else(|| number(guest, key).max(0.0) as u64)
}

fn snapshot_guest(vmid: u64, kind: GuestKind, node: &str, guest: &Value) -> GuestSnapshot {
    GuestSnapshot {
        vmid,
        kind,
        node: node.to_string(),
        name: guest.get("name").map(render_value).unwrap_or_default(),
        status: guest.get("status").map(render_value).unwrap_or_default(),
        uptime_seconds: bytes(guest, "uptime"),
        memory_used_bytes: bytes(guest, "mem"),
        memory_max_bytes: bytes(guest, "maxmem"),
        cpu_fraction: number(guest, "cpu"),
        cpus: number(guest, "cpus"),
        net_in_bytes: bytes(guest, "netin"),
        net_out_bytes: bytes(guest, "netout"),
        disk_max_bytes: bytes(guest, "maxdisk"),
    }
}
